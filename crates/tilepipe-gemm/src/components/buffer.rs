use tilepipe_runtime::arch::{ArchSpec, BYTE_PER_BLK, TierKind, round_up};
use tilepipe_runtime::sync::{EventId, HardEvent, StageSlot};
use bytemuck::Pod;
use tilepipe_runtime::{CoreContext, DeviceResult, Fault, LocalTensor};

/// Bump allocator over the on-chip tiers of one core.
///
/// Regions are carved once at kernel entry and live until the kernel exits, so there is no free.
#[derive(Debug, Clone)]
pub struct TierAllocator {
    cursors: [usize; 5],
    capacities: [usize; 5],
}

const TIERS: [TierKind; 5] = [
    TierKind::L1,
    TierKind::L0A,
    TierKind::L0B,
    TierKind::L0C,
    TierKind::Ub,
];

fn slot(tier: TierKind) -> usize {
    match tier {
        TierKind::L1 => 0,
        TierKind::L0A => 1,
        TierKind::L0B => 2,
        TierKind::L0C => 3,
        TierKind::Ub => 4,
    }
}

impl TierAllocator {
    pub fn new(ctx: &CoreContext<'_>) -> Self {
        let mut capacities = [0; 5];
        for tier in TIERS {
            capacities[slot(tier)] = ctx.resource().capacity(tier);
        }
        Self {
            cursors: [0; 5],
            capacities,
        }
    }

    /// Allocator with the full tiers of `arch`, regardless of which engine will use it.
    pub fn for_arch(arch: &ArchSpec) -> Self {
        Self {
            cursors: [0; 5],
            capacities: TIERS.map(|tier| arch.capacity(tier)),
        }
    }

    /// Starts allocating `tier` at `byte_offset`, leaving the bytes before it to someone else.
    pub fn skip_to(&mut self, tier: TierKind, byte_offset: usize) {
        let cursor = &mut self.cursors[slot(tier)];
        *cursor = (*cursor).max(byte_offset);
    }

    pub fn used(&self, tier: TierKind) -> usize {
        self.cursors[slot(tier)]
    }

    pub fn remaining(&self, tier: TierKind) -> usize {
        self.capacities[slot(tier)] - self.used(tier)
    }

    /// Carves `len` elements out of `tier`, 32 byte aligned.
    pub fn alloc<E: Pod>(&mut self, tier: TierKind, len: usize) -> DeviceResult<LocalTensor<E>> {
        let index = slot(tier);
        let offset = round_up(self.cursors[index], BYTE_PER_BLK);
        let bytes = len * size_of::<E>();

        if offset + bytes > self.capacities[index] {
            return Err(Fault::TierExhausted {
                tier,
                requested: bytes,
                available: self.capacities[index].saturating_sub(offset),
            });
        }
        self.cursors[index] = offset + bytes;
        Ok(LocalTensor::new(tier, offset, len))
    }

    /// `stages` slots of `len` elements sharing one event pair. Slot `i` uses event id
    /// `first_id + i`.
    pub fn stages<E: Pod>(
        &mut self,
        tier: TierKind,
        len: usize,
        stages: usize,
        refill: HardEvent,
        consume: HardEvent,
        first_id: EventId,
    ) -> DeviceResult<Vec<StageSlot<E>>> {
        (0..stages)
            .map(|i| {
                let tensor = self.alloc::<E>(tier, len)?;
                Ok(StageSlot::new(tensor, refill, consume, first_id + i as EventId))
            })
            .collect()
    }
}

/// Arms every slot so the first producer does not block.
pub fn prime_all<E: Pod>(ctx: &CoreContext<'_>, slots: &[StageSlot<E>]) -> DeviceResult {
    slots.iter().try_for_each(|slot| slot.prime(ctx.events()))
}

/// Takes back every refill token at kernel exit.
pub fn drain_all<E: Pod>(ctx: &CoreContext<'_>, slots: &[StageSlot<E>]) -> DeviceResult {
    slots.iter().try_for_each(|slot| slot.drain(ctx.events()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tilepipe_runtime::arch::{ArchTag, AtlasA2};

    #[test_log::test]
    fn slots_do_not_overlap_and_take_consecutive_ids() {
        let mut allocator = TierAllocator::for_arch(&AtlasA2::spec());
        let a = allocator
            .stages::<f32>(TierKind::L1, 100, 2, HardEvent::Mte1Mte2, HardEvent::Mte2Mte1, 0)
            .unwrap();
        let b = allocator
            .stages::<f32>(TierKind::L1, 64, 2, HardEvent::Mte1Mte2, HardEvent::Mte2Mte1, 2)
            .unwrap();

        assert_eq!(a[1].tensor().byte_offset(), 416);
        assert_eq!(b[0].tensor().byte_offset(), 832);
        assert_eq!(b[1].id(), 3);
        assert_eq!(allocator.used(TierKind::L1), 832 + 2 * 256);
    }

    #[test_log::test]
    fn exhausting_a_tier_fails() {
        let mut allocator = TierAllocator::for_arch(&AtlasA2::spec());
        allocator
            .alloc::<f32>(TierKind::L0A, AtlasA2::L0A_SIZE / 4)
            .unwrap();

        assert!(matches!(
            allocator.alloc::<u8>(TierKind::L0A, 1),
            Err(Fault::TierExhausted { available: 0, .. })
        ));
    }
}
