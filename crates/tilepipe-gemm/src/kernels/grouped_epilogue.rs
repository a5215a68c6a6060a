use core::marker::PhantomData;
use tilepipe_runtime::arch::ArchTag;
use tilepipe_runtime::{CoreContext, DeviceResult, GlobalTensor, GmBuffer, Kernel};

use super::grouped::group_swizzle;
use super::matmul_epilogue::{
    AccumulatorConsumer, AccumulatorProducer, epilogue_workspace, epilogue_workspace_size,
};
use super::GroupArenas;
use crate::components::batch::{BlockSwizzle, GroupList, GroupSchedule, SWIZZLE_ZN};
use crate::components::block::BlockMmad;
use crate::components::global::TileEpilogue;
use crate::components::{AccG, BlockTiling, GemmTypes, MatmulSetupError, TileLayout};

/// Grouped matmul followed by an epilogue: `D_g = epilogue(A_g x B_g, C_g)` for every group.
///
/// Matrix engines produce accumulator tiles in grouped rotation order; their vector engines
/// replay the same rotation to consume them. `D` is an arena laid out like `C`.
pub struct GroupedMatmulEpilogue<BM: BlockMmad, Ep, const OFFSET: usize = 1, const DIRECTION: usize = SWIZZLE_ZN> {
    groups: GroupList,
    arenas: GroupArenas<BM::Types>,
    d: GlobalTensor<<BM::Types as GemmTypes>::C>,
    workspace: GlobalTensor<AccG<BM::Types>>,
    block: BM::Params,
    epilogue: Ep,
    _block: PhantomData<fn() -> BM>,
}

impl<BM, Ep, const OFFSET: usize, const DIRECTION: usize> GroupedMatmulEpilogue<BM, Ep, OFFSET, DIRECTION>
where
    BM: BlockMmad,
    Ep: TileEpilogue<AccG<BM::Types>, <BM::Types as GemmTypes>::C>,
{
    pub fn new(
        groups: GroupList,
        arenas: GroupArenas<BM::Types>,
        d: GlobalTensor<<BM::Types as GemmTypes>::C>,
        workspace: Option<GmBuffer>,
        aic_num: usize,
        block: BM::Params,
        epilogue: Ep,
    ) -> Result<Self, MatmulSetupError> {
        let required = epilogue_workspace_size::<BM::Types, BM::Tiling>(aic_num);
        Ok(Self {
            groups,
            arenas,
            d,
            workspace: epilogue_workspace(required, workspace)?,
            block,
            epilogue,
            _block: PhantomData,
        })
    }
}

impl<BM, Ep, const OFFSET: usize, const DIRECTION: usize> Kernel
    for GroupedMatmulEpilogue<BM, Ep, OFFSET, DIRECTION>
where
    BM: BlockMmad,
    BM::Params: Sync,
    Ep: TileEpilogue<AccG<BM::Types>, <BM::Types as GemmTypes>::C>,
{
    fn arch(&self) -> &'static str {
        <BM::Arch as ArchTag>::NAME
    }

    fn name(&self) -> String {
        format!("grouped_matmul_epilogue[{}]", self.groups.len())
    }

    fn run_aic(&self, ctx: &mut CoreContext<'_>) -> DeviceResult {
        let mut producer = AccumulatorProducer::<BM>::new(ctx, self.block, self.workspace)?;
        let mut schedule = GroupSchedule::new(ctx.block_idx(), ctx.block_num());
        let tile = <BM::Tiling as BlockTiling>::L1;

        for group in 0..self.groups.len() {
            let Some(swizzle) = group_swizzle::<BM::Tiling, OFFSET, DIRECTION>(&self.groups, group)
            else {
                continue;
            };
            let params = self.arenas.params(&self.groups, group);
            let task_of = |task: usize| {
                let coord = swizzle.block_coord(task);
                params.block_task(tile, coord, swizzle.actual_block_shape(coord))
            };

            let mut tasks = schedule.next_group(swizzle.core_loops());
            while let Some(task) = tasks.next() {
                let next = tasks.peek().map(task_of);
                producer.compute(ctx, &task_of(task), next.as_ref())?;
            }
        }
        producer.finish(ctx)
    }

    fn run_aiv(&self, ctx: &mut CoreContext<'_>) -> DeviceResult {
        let mut consumer = AccumulatorConsumer::<
            AccG<BM::Types>,
            <BM::Types as GemmTypes>::C,
            Ep,
            BM::Tiling,
        >::new(ctx, self.epilogue, self.workspace)?;
        let mut schedule = GroupSchedule::new(ctx.aic_idx(), ctx.block_num());
        let tile = <BM::Tiling as BlockTiling>::L1;

        for group in 0..self.groups.len() {
            let Some(swizzle) = group_swizzle::<BM::Tiling, OFFSET, DIRECTION>(&self.groups, group)
            else {
                continue;
            };
            let params = self.arenas.params(&self.groups, group);
            let d = self.d.offset(self.groups.offsets(group).c);

            for task in schedule.next_group(swizzle.core_loops()) {
                let coord = swizzle.block_coord(task);
                let actual = swizzle.actual_block_shape(coord);
                let origin = params.layout_c.offset(coord.m * tile.m, coord.n * tile.n);
                consumer.consume(
                    ctx,
                    params.c.offset(origin),
                    d.offset(origin),
                    params.layout_c,
                    actual.mn(),
                )?;
            }
        }
        consumer.finish(ctx)
    }
}
