use crate::arch::{ArchSpec, TierKind};
use crate::device::CoreType;
use crate::error::{DeviceResult, Fault};
use crate::memory::LocalTensor;
use bytemuck::Pod;
use core::ops::Range;

const TIER_ORDER: [TierKind; 5] = [
    TierKind::L1,
    TierKind::L0A,
    TierKind::L0B,
    TierKind::L0C,
    TierKind::Ub,
];

/// On-chip memory owned by one core for the whole launch.
///
/// A matrix engine owns the staging, operand and accumulator tiers. A vector engine owns the
/// scratch tier only. Tiers a core does not own have zero capacity.
pub struct CoreResource {
    tiers: [Vec<u64>; 5],
}

impl core::fmt::Debug for CoreResource {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut debug = f.debug_struct("CoreResource");
        for kind in TIER_ORDER {
            debug.field(&kind.to_string(), &self.capacity(kind));
        }
        debug.finish()
    }
}

impl CoreResource {
    pub(crate) fn new(spec: &ArchSpec, core_type: CoreType) -> Self {
        let owned: &[TierKind] = match core_type {
            CoreType::Aic => &TierKind::AIC,
            CoreType::Aiv => &TierKind::AIV,
        };
        let tiers = TIER_ORDER.map(|kind| {
            if owned.contains(&kind) {
                vec![0u64; spec.capacity(kind).div_ceil(size_of::<u64>())]
            } else {
                Vec::new()
            }
        });
        Self { tiers }
    }

    pub fn capacity(&self, tier: TierKind) -> usize {
        self.tiers[tier.index()].len() * size_of::<u64>()
    }

    /// Typed window of `len` elements starting at `byte_offset`.
    pub fn tensor<E: Pod>(
        &self,
        tier: TierKind,
        byte_offset: usize,
        len: usize,
    ) -> DeviceResult<LocalTensor<E>> {
        self.range(tier, byte_offset, len * size_of::<E>())?;
        if byte_offset % size_of::<E>() != 0 {
            return Err(Fault::Misaligned {
                tier,
                offset: byte_offset,
                dtype_size: size_of::<E>(),
            });
        }
        Ok(LocalTensor::new(tier, byte_offset, len))
    }

    /// The whole tier viewed as elements of `E`.
    pub fn whole<E: Pod>(&self, tier: TierKind) -> LocalTensor<E> {
        LocalTensor::new(tier, 0, self.capacity(tier) / size_of::<E>())
    }

    fn range(&self, tier: TierKind, offset: usize, len: usize) -> DeviceResult<Range<usize>> {
        let capacity = self.capacity(tier);
        if offset + len > capacity {
            return Err(Fault::TierOutOfBounds {
                tier,
                offset,
                len,
                capacity,
            });
        }
        Ok(offset..offset + len)
    }

    fn typed<'a, E: Pod>(bytes: &'a [u8], tensor: &LocalTensor<E>) -> DeviceResult<&'a [E]> {
        bytemuck::try_cast_slice(bytes).map_err(|_| Fault::Misaligned {
            tier: tensor.tier(),
            offset: tensor.byte_offset(),
            dtype_size: size_of::<E>(),
        })
    }

    fn typed_mut<'a, E: Pod>(
        bytes: &'a mut [u8],
        tensor: &LocalTensor<E>,
    ) -> DeviceResult<&'a mut [E]> {
        bytemuck::try_cast_slice_mut(bytes).map_err(|_| Fault::Misaligned {
            tier: tensor.tier(),
            offset: tensor.byte_offset(),
            dtype_size: size_of::<E>(),
        })
    }

    pub fn slice<E: Pod>(&self, tensor: LocalTensor<E>) -> DeviceResult<&[E]> {
        let range = self.range(tensor.tier(), tensor.byte_offset(), tensor.byte_len())?;
        let bytes: &[u8] = bytemuck::cast_slice(&self.tiers[tensor.tier().index()]);
        Self::typed(&bytes[range], &tensor)
    }

    pub fn slice_mut<E: Pod>(&mut self, tensor: LocalTensor<E>) -> DeviceResult<&mut [E]> {
        let range = self.range(tensor.tier(), tensor.byte_offset(), tensor.byte_len())?;
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut self.tiers[tensor.tier().index()]);
        Self::typed_mut(&mut bytes[range], &tensor)
    }

    /// Two read views and one write view, as used by the matrix engine. The written tensor must
    /// live in a tier distinct from both inputs.
    pub fn mmad_views<A: Pod, B: Pod, C: Pod>(
        &mut self,
        a: LocalTensor<A>,
        b: LocalTensor<B>,
        c: LocalTensor<C>,
    ) -> DeviceResult<(&[A], &[B], &mut [C])> {
        let range_a = self.range(a.tier(), a.byte_offset(), a.byte_len())?;
        let range_b = self.range(b.tier(), b.byte_offset(), b.byte_len())?;
        let range_c = self.range(c.tier(), c.byte_offset(), c.byte_len())?;
        if c.tier() == a.tier() || c.tier() == b.tier() {
            return Err(Fault::TierAliasing { tier: c.tier() });
        }

        let mut view_a: &[u8] = &[];
        let mut view_b: &[u8] = &[];
        let mut view_c: &mut [u8] = &mut [];
        for (kind, storage) in TIER_ORDER.iter().zip(self.tiers.iter_mut()) {
            if *kind == c.tier() {
                view_c = &mut bytemuck::cast_slice_mut(storage.as_mut_slice())[range_c.clone()];
                continue;
            }
            let storage: &Vec<u64> = storage;
            let bytes: &[u8] = bytemuck::cast_slice(storage.as_slice());
            if *kind == a.tier() {
                view_a = &bytes[range_a.clone()];
            }
            if *kind == b.tier() {
                view_b = &bytes[range_b.clone()];
            }
        }

        Ok((
            Self::typed(view_a, &a)?,
            Self::typed(view_b, &b)?,
            Self::typed_mut(view_c, &c)?,
        ))
    }

    /// Byte copies between two tiers, or inside one tier.
    pub(crate) fn copy_bytes(
        &mut self,
        src: TierKind,
        dst: TierKind,
        runs: impl IntoIterator<Item = (usize, usize, usize)>,
    ) -> DeviceResult<usize> {
        let mut moved = 0;

        if src == dst {
            for (src_offset, dst_offset, len) in runs {
                self.range(src, src_offset, len)?;
                self.range(dst, dst_offset, len)?;
                let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut self.tiers[src.index()]);
                bytes.copy_within(src_offset..src_offset + len, dst_offset);
                moved += len;
            }
            return Ok(moved);
        }

        let capacity_src = self.capacity(src);
        let capacity_dst = self.capacity(dst);
        let (src_bytes, dst_bytes) = {
            let (low, high) = self.tiers.split_at_mut(src.index().max(dst.index()));
            let (first, second) = (&mut low[src.index().min(dst.index())], &mut high[0]);
            if src.index() < dst.index() {
                (&*first, second)
            } else {
                (&*second, first)
            }
        };
        let src_bytes: &[u8] = bytemuck::cast_slice(src_bytes.as_slice());
        let dst_bytes: &mut [u8] = bytemuck::cast_slice_mut(dst_bytes.as_mut_slice());

        for (src_offset, dst_offset, len) in runs {
            if src_offset + len > capacity_src {
                return Err(Fault::TierOutOfBounds {
                    tier: src,
                    offset: src_offset,
                    len,
                    capacity: capacity_src,
                });
            }
            if dst_offset + len > capacity_dst {
                return Err(Fault::TierOutOfBounds {
                    tier: dst,
                    offset: dst_offset,
                    len,
                    capacity: capacity_dst,
                });
            }
            dst_bytes[dst_offset..dst_offset + len]
                .copy_from_slice(&src_bytes[src_offset..src_offset + len]);
            moved += len;
        }
        Ok(moved)
    }

    /// Raw bytes of a tier, used by DMA bursts from and to global memory.
    pub(crate) fn bytes(&self, tier: TierKind) -> &[u8] {
        bytemuck::cast_slice(self.tiers[tier.index()].as_slice())
    }

    pub(crate) fn bytes_mut(&mut self, tier: TierKind) -> &mut [u8] {
        bytemuck::cast_slice_mut(self.tiers[tier.index()].as_mut_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::{ArchTag, AtlasA2};

    #[test_log::test]
    fn matrix_engine_owns_cube_tiers_only() {
        let resource = CoreResource::new(&AtlasA2::spec(), CoreType::Aic);

        assert_eq!(resource.capacity(TierKind::L1), AtlasA2::L1_SIZE);
        assert_eq!(resource.capacity(TierKind::L0C), AtlasA2::L0C_SIZE);
        assert_eq!(resource.capacity(TierKind::Ub), 0);
    }

    #[test_log::test]
    fn tensors_are_bounds_checked() {
        let resource = CoreResource::new(&AtlasA2::spec(), CoreType::Aiv);

        assert!(resource.tensor::<f32>(TierKind::Ub, 0, 1024).is_ok());
        assert!(matches!(
            resource.tensor::<f32>(TierKind::Ub, AtlasA2::UB_SIZE - 4, 2),
            Err(Fault::TierOutOfBounds { .. })
        ));
        assert!(matches!(
            resource.tensor::<f32>(TierKind::Ub, 2, 2),
            Err(Fault::Misaligned { .. })
        ));
        assert!(resource.tensor::<u8>(TierKind::L1, 0, 1).is_err());
    }

    #[test_log::test]
    fn mmad_views_are_disjoint() {
        let mut resource = CoreResource::new(&AtlasA2::spec(), CoreType::Aic);
        let a = resource.tensor::<f32>(TierKind::L0A, 0, 4).unwrap();
        let b = resource.tensor::<f32>(TierKind::L0B, 0, 4).unwrap();
        let c = resource.tensor::<f32>(TierKind::L0C, 0, 4).unwrap();
        resource.slice_mut(a).unwrap().copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);
        resource.slice_mut(b).unwrap().copy_from_slice(&[2.0; 4]);

        let (va, vb, vc) = resource.mmad_views(a, b, c).unwrap();
        for i in 0..4 {
            vc[i] = va[i] * vb[i];
        }

        assert_eq!(resource.slice(c).unwrap(), &[2.0, 4.0, 6.0, 8.0]);
        assert!(matches!(
            resource.mmad_views(a, b, a),
            Err(Fault::TierAliasing { .. })
        ));
    }

    #[test_log::test]
    fn copies_between_and_within_tiers() {
        let mut resource = CoreResource::new(&AtlasA2::spec(), CoreType::Aic);
        let l1 = resource.tensor::<u8>(TierKind::L1, 0, 8).unwrap();
        resource
            .slice_mut(l1)
            .unwrap()
            .copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);

        let moved = resource
            .copy_bytes(TierKind::L1, TierKind::L0A, [(2, 0, 4)])
            .unwrap();
        resource
            .copy_bytes(TierKind::L1, TierKind::L1, [(0, 4, 4)])
            .unwrap();

        assert_eq!(moved, 4);
        assert_eq!(&resource.bytes(TierKind::L0A)[..4], &[3, 4, 5, 6]);
        assert_eq!(&resource.bytes(TierKind::L1)[..8], &[1, 2, 3, 4, 1, 2, 3, 4]);
    }
}
