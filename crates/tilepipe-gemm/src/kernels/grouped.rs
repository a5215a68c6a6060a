use core::marker::PhantomData;
use tilepipe_runtime::arch::ArchTag;
use tilepipe_runtime::{CoreContext, DeviceResult, GlobalTensor, Kernel, KernelMode};

use super::{MatmulParams, run_block_tasks};
use crate::components::batch::{
    BlockSwizzle, GemmIdentityBlockSwizzle, GroupList, GroupSchedule, SWIZZLE_ZN,
};
use crate::components::block::BlockMmad;
use crate::components::{BlockTiling, GemmTypes, TierAllocator};

/// Shared operand arenas of a grouped matmul.
pub struct GroupArenas<T: GemmTypes> {
    pub a: GlobalTensor<T::A>,
    pub b: GlobalTensor<T::B>,
    pub c: GlobalTensor<T::C>,
}

impl<T: GemmTypes> Clone for GroupArenas<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: GemmTypes> Copy for GroupArenas<T> {}

impl<T: GemmTypes> GroupArenas<T> {
    pub fn new(a: GlobalTensor<T::A>, b: GlobalTensor<T::B>, c: GlobalTensor<T::C>) -> Self {
        Self { a, b, c }
    }

    /// Densely packed operands of group `group`.
    pub fn params(&self, groups: &GroupList, group: usize) -> MatmulParams<T> {
        let offsets = groups.offsets(group);
        MatmulParams::packed(
            groups.problem(group),
            self.a.offset(offsets.a),
            self.b.offset(offsets.b),
            self.c.offset(offsets.c),
        )
    }
}

/// Swizzle of group `group`, or `None` for a group without work.
pub(crate) fn group_swizzle<Til: BlockTiling, const OFFSET: usize, const DIRECTION: usize>(
    groups: &GroupList,
    group: usize,
) -> Option<GemmIdentityBlockSwizzle<OFFSET, DIRECTION>> {
    let problem = groups.problem(group);
    (problem.volume() > 0).then(|| GemmIdentityBlockSwizzle::new(problem, Til::L1.mn()))
}

/// Independently shaped matmuls in one launch, on the matrix engines only.
///
/// Groups are walked in order; each one starts at the core after the one that took the last
/// tile of the previous group, so no core idles at group boundaries. The block strategy is built
/// once and keeps its stage slots across groups.
pub struct GroupedMatmul<BM: BlockMmad, const OFFSET: usize = 1, const DIRECTION: usize = SWIZZLE_ZN> {
    groups: GroupList,
    arenas: GroupArenas<BM::Types>,
    block: BM::Params,
    _block: PhantomData<fn() -> BM>,
}

impl<BM: BlockMmad, const OFFSET: usize, const DIRECTION: usize> GroupedMatmul<BM, OFFSET, DIRECTION> {
    pub fn new(groups: GroupList, arenas: GroupArenas<BM::Types>, block: BM::Params) -> Self {
        Self {
            groups,
            arenas,
            block,
            _block: PhantomData,
        }
    }
}

impl<BM, const OFFSET: usize, const DIRECTION: usize> Kernel for GroupedMatmul<BM, OFFSET, DIRECTION>
where
    BM: BlockMmad,
    BM::Params: Sync,
{
    fn arch(&self) -> &'static str {
        <BM::Arch as ArchTag>::NAME
    }

    fn mode(&self) -> KernelMode {
        KernelMode::AicOnly
    }

    fn name(&self) -> String {
        format!("grouped_matmul[{}]", self.groups.len())
    }

    fn run_aic(&self, ctx: &mut CoreContext<'_>) -> DeviceResult {
        let mut allocator = TierAllocator::new(ctx);
        let mut block = BM::new(ctx, &mut allocator, self.block)?;
        let mut schedule = GroupSchedule::new(ctx.block_idx(), ctx.block_num());

        for group in 0..self.groups.len() {
            let Some(swizzle) = group_swizzle::<BM::Tiling, OFFSET, DIRECTION>(&self.groups, group)
            else {
                continue;
            };
            log::trace!("{}: group {group} from core {}", ctx.id(), schedule.start_core_idx());
            let tasks = schedule.next_group(swizzle.core_loops());
            let params = self.arenas.params(&self.groups, group);
            run_block_tasks(ctx, &mut block, &params, &swizzle, tasks)?;
        }

        block.finish(ctx)
    }
}
