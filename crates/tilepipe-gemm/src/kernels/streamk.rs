use core::marker::PhantomData;
use tilepipe_runtime::arch::ArchTag;
use tilepipe_runtime::sync::CrossCoreFlag;
use tilepipe_runtime::{CoreContext, DeviceResult, Element, GlobalTensor, GmBuffer, Kernel};

use super::MatmulParams;
use crate::components::batch::{
    CoreTasks, SWIZZLE_ZN, StreamkGemmIdentityBlockSwizzle, StreamkSegment,
};
use crate::components::block::{BlockMmad, BlockOutput, BlockTask};
use crate::components::global::ReduceAdd;
use crate::components::{
    AccG, BlockTiling, GemmCoord, GemmTypes, MatmulSetupError, MatrixLayout, RowMajor,
    TierAllocator, TileLayout,
};

/// Set by a matrix engine once all of its partial tiles are in the workspace.
const PARTIALS_READY: CrossCoreFlag = CrossCoreFlag { id: 0 };

/// Accumulator slots per stream-K task: the tile it starts in and the one it may run into.
pub const STREAMK_SLOTS_PER_TASK: usize = 2;

/// Workspace bytes [`StreamkMatmul`] needs for `problem` on `block_dim` matrix engines.
pub fn streamk_workspace_size<T: GemmTypes, Til: BlockTiling>(
    problem: GemmCoord,
    block_dim: usize,
) -> usize {
    let swizzle = StreamkGemmIdentityBlockSwizzle::<1, SWIZZLE_ZN>::new(problem, Til::L1, block_dim);
    swizzle.streamk_tasks() * STREAMK_SLOTS_PER_TASK * Til::L1.m * Til::L1.n * size_of::<AccG<T>>()
}

enum Destination<C: Element, Acc: Element> {
    Output(BlockOutput<C>),
    Partial(BlockOutput<Acc>),
}

/// Matmul balancing the last wave of output tiles over every matrix engine.
///
/// Whole tiles are written to `C` directly. The K iterations of the remaining tiles are spread
/// evenly over the tasks; each such task writes the accumulator of every tile part it covers to
/// its own workspace slot. After all matrix engines are done the vector engines sum the parts of
/// each shared tile into `C`.
pub struct StreamkMatmul<BM: BlockMmad, const OFFSET: usize = 1, const DIRECTION: usize = SWIZZLE_ZN> {
    params: MatmulParams<BM::Types>,
    partials: GlobalTensor<AccG<BM::Types>>,
    block: BM::Params,
    swizzle: StreamkGemmIdentityBlockSwizzle<OFFSET, DIRECTION>,
    _block: PhantomData<fn() -> BM>,
}

impl<BM: BlockMmad, const OFFSET: usize, const DIRECTION: usize> StreamkMatmul<BM, OFFSET, DIRECTION> {
    /// `block_dim` must be the number of matrix engines the kernel is launched on.
    pub fn new(
        params: MatmulParams<BM::Types>,
        block_dim: usize,
        workspace: Option<GmBuffer>,
        block: BM::Params,
    ) -> Result<Self, MatmulSetupError> {
        let tile = <BM::Tiling as BlockTiling>::L1;
        let swizzle = StreamkGemmIdentityBlockSwizzle::new(params.problem, tile, block_dim);
        let required = streamk_workspace_size::<BM::Types, BM::Tiling>(params.problem, block_dim);
        let actual = workspace.map_or(0, |workspace| workspace.len);
        if required > actual {
            return Err(MatmulSetupError::WorkspaceTooSmall { required, actual });
        }

        Ok(Self {
            params,
            partials: GlobalTensor::new(workspace.map_or(0, |workspace| workspace.addr)),
            block,
            swizzle,
            _block: PhantomData,
        })
    }

    pub fn swizzle(&self) -> &StreamkGemmIdentityBlockSwizzle<OFFSET, DIRECTION> {
        &self.swizzle
    }

    fn slot_len() -> usize {
        let tile = <BM::Tiling as BlockTiling>::L1;
        tile.m * tile.n
    }

    fn slot_layout() -> RowMajor {
        let tile = <BM::Tiling as BlockTiling>::L1;
        RowMajor::with_stride(tile.m, tile.n, tile.n)
    }

    /// Workspace slot of part `part` of stream-K task `task`.
    fn slot(&self, task: usize, part: usize) -> GlobalTensor<AccG<BM::Types>> {
        let index = (task - self.swizzle.normal_blocks()) * STREAMK_SLOTS_PER_TASK + part;
        self.partials.offset(index * Self::slot_len())
    }

    fn segment_task(&self, segment: &StreamkSegment) -> BlockTask<BM::Types> {
        let tile = <BM::Tiling as BlockTiling>::L1;
        self.params.block_task(tile, segment.coord, segment.actual)
    }

    /// Block calls of `task`, in order.
    fn segments(
        &self,
        task: usize,
    ) -> Vec<(
        BlockTask<BM::Types>,
        Destination<<BM::Types as GemmTypes>::C, AccG<BM::Types>>,
    )> {
        let tile = <BM::Tiling as BlockTiling>::L1;
        let dec = self.swizzle.streamk_block_dec(task);
        if !dec.streamk {
            let out = self.params.block_output(tile, dec.first.coord);
            return vec![(self.segment_task(&dec.first), Destination::Output(out))];
        }

        [Some(dec.first), dec.cross]
            .into_iter()
            .enumerate()
            .filter_map(|(part, segment)| {
                let segment = segment?;
                let out = BlockOutput::cast(self.slot(task, part), Self::slot_layout());
                Some((self.segment_task(&segment), Destination::Partial(out)))
            })
            .collect()
    }
}

impl<BM, const OFFSET: usize, const DIRECTION: usize> Kernel for StreamkMatmul<BM, OFFSET, DIRECTION>
where
    BM: BlockMmad,
    BM::Params: Sync,
{
    fn arch(&self) -> &'static str {
        <BM::Arch as ArchTag>::NAME
    }

    fn name(&self) -> String {
        "streamk_matmul".to_string()
    }

    fn run_aic(&self, ctx: &mut CoreContext<'_>) -> DeviceResult {
        let mut allocator = TierAllocator::new(ctx);
        let mut block = BM::new(ctx, &mut allocator, self.block)?;

        let calls: Vec<_> = CoreTasks::new(ctx.block_idx(), self.swizzle.core_loops(), ctx.block_num())
            .flat_map(|task| self.segments(task))
            .collect();
        ctx.log_phase(format_args!("{} block calls", calls.len()));

        for (index, (task, destination)) in calls.iter().enumerate() {
            let next = calls.get(index + 1).map(|(next, _)| next);
            match destination {
                Destination::Output(out) => block.compute(ctx, task, *out, next)?,
                Destination::Partial(out) => block.compute(ctx, task, *out, next)?,
            }
        }

        block.finish(ctx)?;
        if self.swizzle.streamk_tasks() > 0 {
            ctx.cross_core_set_flag(PARTIALS_READY)?;
        }
        Ok(())
    }

    fn run_aiv(&self, ctx: &mut CoreContext<'_>) -> DeviceResult {
        if self.swizzle.streamk_tasks() == 0 {
            return Ok(());
        }
        ctx.cross_core_wait_flag(PARTIALS_READY)?;
        ctx.cross_core_barrier_aiv()?;

        let tile = <BM::Tiling as BlockTiling>::L1;
        let lanes = ctx.block_num() * ctx.sub_block_num();
        let first = self.swizzle.normal_blocks();
        let shared = first..first + self.swizzle.streamk_blocks();

        let mut allocator = TierAllocator::new(ctx);
        let mut reduce =
            ReduceAdd::<AccG<BM::Types>, <BM::Types as GemmTypes>::C>::new(&mut allocator)?;
        for index in shared.skip(ctx.block_idx()).step_by(lanes) {
            let coord = self.swizzle.block_coord(index);
            let actual = self.swizzle.actual_block_shape(coord);
            let sources: Vec<_> = self
                .swizzle
                .streamk_partials(index)
                .into_iter()
                .map(|(task, part)| self.slot(task, part))
                .collect();
            log::trace!("{}: fixing tile {coord} from {} parts", ctx.id(), sources.len());

            let origin = self.params.layout_c.offset(coord.m * tile.m, coord.n * tile.n);
            reduce.run_tiles(
                ctx,
                self.params.c.offset(origin),
                &self.params.layout_c,
                &sources,
                &Self::slot_layout(),
                actual.mn(),
            )?;
        }
        Ok(())
    }
}
