use core::marker::PhantomData;
use tilepipe_runtime::arch::ArchTag;
use tilepipe_runtime::{CoreContext, DeviceResult, Element, GlobalTensor, Kernel, KernelMode};

use super::{MatmulParams, run_block_tasks};
use crate::components::batch::{BlockSwizzle, CoreTasks};
use crate::components::block::{BlockMmad, BlockMmadSparse, SparseParams, SparseTypes};
use crate::components::{BlockTiling, MatrixLayout, TierAllocator};

/// Int8 matmul with a 2:4 structured sparse right operand, on the matrix engines only.
///
/// `params.b` points at the compressed `K/2 x N` values and `params.layout_b` describes them;
/// `index` is laid out like the values.
pub struct SparseMatmul<Arch: ArchTag, LA: MatrixLayout, C: Element, Til: BlockTiling, S: BlockSwizzle> {
    params: MatmulParams<SparseTypes<LA, C>>,
    index: GlobalTensor<u8>,
    swizzle: S,
    _block: PhantomData<fn() -> (Arch, Til)>,
}

impl<Arch, LA, C, Til, S> SparseMatmul<Arch, LA, C, Til, S>
where
    Arch: ArchTag,
    LA: MatrixLayout,
    C: Element,
    Til: BlockTiling,
    S: BlockSwizzle,
{
    pub fn new(params: MatmulParams<SparseTypes<LA, C>>, index: GlobalTensor<u8>, swizzle: S) -> Self {
        Self {
            params,
            index,
            swizzle,
            _block: PhantomData,
        }
    }
}

impl<Arch, LA, C, Til, S> Kernel for SparseMatmul<Arch, LA, C, Til, S>
where
    Arch: ArchTag,
    LA: MatrixLayout,
    C: Element,
    Til: BlockTiling,
    S: BlockSwizzle + Sync,
{
    fn arch(&self) -> &'static str {
        Arch::NAME
    }

    fn mode(&self) -> KernelMode {
        KernelMode::AicOnly
    }

    fn name(&self) -> String {
        "sparse_matmul".to_string()
    }

    fn run_aic(&self, ctx: &mut CoreContext<'_>) -> DeviceResult {
        let mut allocator = TierAllocator::new(ctx);
        let params = SparseParams::new(self.params.b, self.index);
        let mut block = BlockMmadSparse::<Arch, LA, C, Til>::new(ctx, &mut allocator, params)?;

        let tasks = CoreTasks::new(ctx.block_idx(), self.swizzle.core_loops(), ctx.block_num());
        run_block_tasks(ctx, &mut block, &self.params, &self.swizzle, tasks)?;

        block.finish(ctx)
    }
}
