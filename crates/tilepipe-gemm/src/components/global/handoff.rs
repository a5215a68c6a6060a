use bytemuck::Pod;
use tilepipe_runtime::sync::CrossCoreFlagWithReverse;
use tilepipe_runtime::{CoreContext, DeviceResult, GlobalTensor};

/// Cross flag ids used by a [`WorkspaceRing`]: `ready` goes from producer to consumer,
/// `consumed` back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingFlags {
    pub ready: (u8, u8),
    pub consumed: (u8, u8),
}

impl Default for RingFlags {
    fn default() -> Self {
        Self {
            ready: (0, 1),
            consumed: (2, 3),
        }
    }
}

/// Rotating global memory slots handing tiles from one engine class to the other.
///
/// The producer fills slot `i % slots` and sets `ready`; the consumer waits `ready`, reads the
/// slot and sets `consumed`. Once every slot has been used the producer waits `consumed` before
/// overwriting one. Both flags are with-reverse so the ring can turn any number of times.
#[derive(Debug)]
pub struct WorkspaceRing<E> {
    base: GlobalTensor<E>,
    slot_len: usize,
    slots: usize,
    ready: CrossCoreFlagWithReverse,
    consumed: CrossCoreFlagWithReverse,
    produced: usize,
    taken: usize,
}

impl<E: Pod> WorkspaceRing<E> {
    pub fn new(base: GlobalTensor<E>, slot_len: usize, slots: usize, flags: RingFlags) -> Self {
        Self {
            base,
            slot_len,
            slots,
            ready: CrossCoreFlagWithReverse::new(flags.ready.0, flags.ready.1),
            consumed: CrossCoreFlagWithReverse::new(flags.consumed.0, flags.consumed.1),
            produced: 0,
            taken: 0,
        }
    }

    /// Ring of matrix engine `aic_idx` inside a workspace holding one ring per matrix engine.
    pub fn for_core(
        workspace: GlobalTensor<E>,
        aic_idx: usize,
        slot_len: usize,
        slots: usize,
        flags: RingFlags,
    ) -> Self {
        let base = workspace.offset(aic_idx * Self::len(slot_len, slots));
        Self::new(base, slot_len, slots, flags)
    }

    /// Elements of one ring.
    pub fn len(slot_len: usize, slots: usize) -> usize {
        slot_len * slots
    }

    fn slot(&self, index: usize) -> GlobalTensor<E> {
        self.base.offset((index % self.slots) * self.slot_len)
    }

    /// Producer side: the next slot to fill, once it is free.
    pub fn acquire_produce(&mut self, ctx: &mut CoreContext<'_>) -> DeviceResult<GlobalTensor<E>> {
        if self.produced >= self.slots {
            ctx.cross_core_wait_flag_with_reverse(&mut self.consumed)?;
        }
        Ok(self.slot(self.produced))
    }

    pub fn commit_produce(&mut self, ctx: &mut CoreContext<'_>) -> DeviceResult {
        ctx.cross_core_set_flag_with_reverse(&mut self.ready)?;
        self.produced += 1;
        Ok(())
    }

    /// Consumer side: the next filled slot.
    pub fn acquire_consume(&mut self, ctx: &mut CoreContext<'_>) -> DeviceResult<GlobalTensor<E>> {
        ctx.cross_core_wait_flag_with_reverse(&mut self.ready)?;
        Ok(self.slot(self.taken))
    }

    pub fn release_consume(&mut self, ctx: &mut CoreContext<'_>) -> DeviceResult {
        ctx.cross_core_set_flag_with_reverse(&mut self.consumed)?;
        self.taken += 1;
        Ok(())
    }

    /// Producer side exit: waits until the consumer released every slot still in flight.
    pub fn finish_producer(&mut self, ctx: &mut CoreContext<'_>) -> DeviceResult {
        for _ in 0..self.produced.min(self.slots) {
            ctx.cross_core_wait_flag_with_reverse(&mut self.consumed)?;
        }
        Ok(())
    }

    pub fn produced(&self) -> usize {
        self.produced
    }
}
