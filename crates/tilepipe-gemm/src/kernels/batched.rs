use core::marker::PhantomData;
use tilepipe_runtime::arch::ArchTag;
use tilepipe_runtime::{CoreContext, DeviceResult, Kernel, KernelMode};

use super::MatmulParams;
use crate::components::batch::{BlockSwizzle, CoreTasks};
use crate::components::block::{BlockMmad, BlockOutput, BlockTask};
use crate::components::{BlockTiling, GemmTypes, TierAllocator};

/// Element distance between two consecutive problems of a batch, per operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, new)]
pub struct BatchStrides {
    pub a: usize,
    pub b: usize,
    pub c: usize,
}

/// `batch` problems of the same shape, flattened into `batch x core_loops` tasks.
///
/// `params` describes problem 0; problem `i` sits `i` batch strides further in each operand.
#[derive(new)]
pub struct BatchedMatmul<BM: BlockMmad, S: BlockSwizzle> {
    params: MatmulParams<BM::Types>,
    batch: usize,
    strides: BatchStrides,
    block: BM::Params,
    swizzle: S,
    _block: PhantomData<fn() -> BM>,
}

impl<BM: BlockMmad, S: BlockSwizzle> BatchedMatmul<BM, S> {
    fn problem(&self, index: usize) -> MatmulParams<BM::Types> {
        let mut params = self.params;
        params.a = params.a.offset(index * self.strides.a);
        params.b = params.b.offset(index * self.strides.b);
        params.c = params.c.offset(index * self.strides.c);
        params
    }

    fn task(&self, task: usize) -> (BlockTask<BM::Types>, BlockOutput<<BM::Types as GemmTypes>::C>) {
        let tile = <BM::Tiling as BlockTiling>::L1;
        let params = self.problem(self.swizzle.batch_idx(task));
        let coord = self.swizzle.block_coord(task);
        let actual = self.swizzle.actual_block_shape(coord);
        (params.block_task(tile, coord, actual), params.block_output(tile, coord))
    }
}

impl<BM, S> Kernel for BatchedMatmul<BM, S>
where
    BM: BlockMmad,
    BM::Params: Sync,
    S: BlockSwizzle + Sync,
{
    fn arch(&self) -> &'static str {
        <BM::Arch as ArchTag>::NAME
    }

    fn mode(&self) -> KernelMode {
        KernelMode::AicOnly
    }

    fn name(&self) -> String {
        "batched_matmul".to_string()
    }

    fn run_aic(&self, ctx: &mut CoreContext<'_>) -> DeviceResult {
        let mut allocator = TierAllocator::new(ctx);
        let mut block = BM::new(ctx, &mut allocator, self.block)?;

        let core_loops = self.batch * self.swizzle.core_loops();
        let mut tasks = CoreTasks::new(ctx.block_idx(), core_loops, ctx.block_num());
        while let Some(task) = tasks.next() {
            let (current, out) = self.task(task);
            let next = tasks.peek().map(|task| self.task(task).0);
            block.compute(ctx, &current, out, next.as_ref())?;
        }

        block.finish(ctx)
    }
}
