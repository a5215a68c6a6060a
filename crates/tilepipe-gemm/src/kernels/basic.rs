use core::marker::PhantomData;
use tilepipe_runtime::arch::ArchTag;
use tilepipe_runtime::{CoreContext, DeviceResult, Kernel, KernelMode};

use super::{MatmulParams, run_block_tasks};
use crate::components::TierAllocator;
use crate::components::batch::{BlockSwizzle, CoreTasks};
use crate::components::block::BlockMmad;

/// Matrix engine only matmul: every core walks its share of the output tiles in swizzle order.
#[derive(new)]
pub struct BasicMatmul<BM: BlockMmad, S: BlockSwizzle> {
    params: MatmulParams<BM::Types>,
    block: BM::Params,
    swizzle: S,
    _block: PhantomData<fn() -> BM>,
}

impl<BM, S> Kernel for BasicMatmul<BM, S>
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
        "basic_matmul".to_string()
    }

    fn run_aic(&self, ctx: &mut CoreContext<'_>) -> DeviceResult {
        let mut allocator = TierAllocator::new(ctx);
        let mut block = BM::new(ctx, &mut allocator, self.block)?;

        let tasks = CoreTasks::new(ctx.block_idx(), self.swizzle.core_loops(), ctx.block_num());
        ctx.log_phase(format_args!("{} tiles", tasks.count()));
        run_block_tasks(ctx, &mut block, &self.params, &self.swizzle, tasks)?;

        block.finish(ctx)
    }
}
