use core::marker::PhantomData;
use tilepipe_runtime::arch::ArchTag;
use tilepipe_runtime::{CoreContext, DeviceResult, Element, GlobalTensor, GmBuffer, Kernel};

use super::MatmulParams;
use crate::components::batch::{BlockSwizzle, CoreTasks};
use crate::components::block::{BlockMmad, BlockOutput, BlockTask};
use crate::components::global::{
    BlockEpilogue, EpilogueTile, RingFlags, TileEpilogue, WorkspaceRing,
};
use crate::components::{
    AccG, BlockTiling, GemmTypes, MatmulSetupError, MatrixCoord, MatrixLayout, RowMajor,
    TierAllocator, TileLayout,
};

/// Accumulator tiles in flight between a matrix engine and its vector engines.
pub const EPILOGUE_WORKSPACE_SLOTS: usize = 2;

/// Workspace bytes of the accumulator rings of `aic_num` matrix engines.
pub fn epilogue_workspace_size<T: GemmTypes, Til: BlockTiling>(aic_num: usize) -> usize {
    WorkspaceRing::<AccG<T>>::len(Til::L1.m * Til::L1.n, EPILOGUE_WORKSPACE_SLOTS)
        * aic_num
        * size_of::<AccG<T>>()
}

pub(crate) fn epilogue_workspace<Acc: Element>(
    required: usize,
    workspace: Option<GmBuffer>,
) -> Result<GlobalTensor<Acc>, MatmulSetupError> {
    match workspace {
        Some(workspace) if workspace.len >= required => Ok(workspace.tensor()),
        other => Err(MatmulSetupError::WorkspaceTooSmall {
            required,
            actual: other.map_or(0, |workspace| workspace.len),
        }),
    }
}

fn slot_layout<Til: BlockTiling>() -> RowMajor {
    RowMajor::with_stride(Til::L1.m, Til::L1.n, Til::L1.n)
}

fn ring<Acc: Element, Til: BlockTiling>(
    workspace: GlobalTensor<Acc>,
    aic_idx: usize,
) -> WorkspaceRing<Acc> {
    WorkspaceRing::for_core(
        workspace,
        aic_idx,
        Til::L1.m * Til::L1.n,
        EPILOGUE_WORKSPACE_SLOTS,
        RingFlags::default(),
    )
}

/// Matrix engine side of an epilogue kernel: finished accumulators go to the ring instead of
/// the output.
pub(crate) struct AccumulatorProducer<BM: BlockMmad> {
    block: BM,
    ring: WorkspaceRing<AccG<BM::Types>>,
}

impl<BM: BlockMmad> AccumulatorProducer<BM> {
    pub fn new(
        ctx: &mut CoreContext<'_>,
        params: BM::Params,
        workspace: GlobalTensor<AccG<BM::Types>>,
    ) -> DeviceResult<Self> {
        let mut allocator = TierAllocator::new(ctx);
        Ok(Self {
            block: BM::new(ctx, &mut allocator, params)?,
            ring: ring::<_, BM::Tiling>(workspace, ctx.aic_idx()),
        })
    }

    pub fn compute(
        &mut self,
        ctx: &mut CoreContext<'_>,
        task: &BlockTask<BM::Types>,
        next: Option<&BlockTask<BM::Types>>,
    ) -> DeviceResult {
        let slot = self.ring.acquire_produce(ctx)?;
        let out = BlockOutput::cast(slot, slot_layout::<BM::Tiling>());
        self.block.compute(ctx, task, out, next)?;
        self.ring.commit_produce(ctx)
    }

    pub fn finish(mut self, ctx: &mut CoreContext<'_>) -> DeviceResult {
        self.block.finish(ctx)?;
        self.ring.finish_producer(ctx)
    }
}

/// Vector engine side of an epilogue kernel: takes the accumulators in production order and
/// applies the epilogue to this engine's rows.
pub(crate) struct AccumulatorConsumer<Acc: Element, C: Element, Ep: TileEpilogue<Acc, C>, Til> {
    epilogue: BlockEpilogue<Acc, C, Ep>,
    ring: WorkspaceRing<Acc>,
    _tiling: PhantomData<Til>,
}

impl<Acc: Element, C: Element, Ep: TileEpilogue<Acc, C>, Til: BlockTiling>
    AccumulatorConsumer<Acc, C, Ep, Til>
{
    pub fn new(
        ctx: &mut CoreContext<'_>,
        epilogue: Ep,
        workspace: GlobalTensor<Acc>,
    ) -> DeviceResult<Self> {
        let mut allocator = TierAllocator::new(ctx);
        Ok(Self {
            epilogue: BlockEpilogue::new(ctx, &mut allocator, epilogue)?,
            ring: ring::<_, Til>(workspace, ctx.aic_idx()),
            _tiling: PhantomData,
        })
    }

    /// Applies the epilogue to the next accumulator, a `shape` tile whose source and destination
    /// start at `source` and `dst`.
    pub fn consume(
        &mut self,
        ctx: &mut CoreContext<'_>,
        source: GlobalTensor<C>,
        dst: GlobalTensor<C>,
        layout: RowMajor,
        shape: MatrixCoord,
    ) -> DeviceResult {
        let x = self.ring.acquire_consume(ctx)?;
        let tile = EpilogueTile::new(x, slot_layout::<Til>(), source, layout, dst, layout);
        self.epilogue.run(ctx, &tile, shape)?;
        self.ring.release_consume(ctx)
    }

    pub fn finish(self, ctx: &mut CoreContext<'_>) -> DeviceResult {
        self.epilogue.finish(ctx)
    }
}

/// Matmul followed by an element-wise epilogue on the vector engines:
/// `D = epilogue(A x B, C)`.
///
/// The matrix engine writes each accumulator tile to its workspace ring; each vector engine of
/// the pair waits for it, processes half of the tile rows and hands the slot back. `C` and `D`
/// share the output layout and may alias.
pub struct MatmulEpilogue<BM: BlockMmad, S: BlockSwizzle, Ep> {
    params: MatmulParams<BM::Types>,
    d: GlobalTensor<<BM::Types as GemmTypes>::C>,
    workspace: GlobalTensor<AccG<BM::Types>>,
    block: BM::Params,
    swizzle: S,
    epilogue: Ep,
    _block: PhantomData<fn() -> BM>,
}

impl<BM, S, Ep> MatmulEpilogue<BM, S, Ep>
where
    BM: BlockMmad,
    S: BlockSwizzle,
    Ep: TileEpilogue<AccG<BM::Types>, <BM::Types as GemmTypes>::C>,
{
    /// `params.c` is the epilogue source, `d` the destination, laid out like `params.c`.
    pub fn new(
        params: MatmulParams<BM::Types>,
        d: GlobalTensor<<BM::Types as GemmTypes>::C>,
        workspace: Option<GmBuffer>,
        aic_num: usize,
        block: BM::Params,
        swizzle: S,
        epilogue: Ep,
    ) -> Result<Self, MatmulSetupError> {
        let required = epilogue_workspace_size::<BM::Types, BM::Tiling>(aic_num);
        Ok(Self {
            params,
            d,
            workspace: epilogue_workspace(required, workspace)?,
            block,
            swizzle,
            epilogue,
            _block: PhantomData,
        })
    }
}

impl<BM, S, Ep> Kernel for MatmulEpilogue<BM, S, Ep>
where
    BM: BlockMmad,
    BM::Params: Sync,
    S: BlockSwizzle + Sync,
    Ep: TileEpilogue<AccG<BM::Types>, <BM::Types as GemmTypes>::C>,
{
    fn arch(&self) -> &'static str {
        <BM::Arch as ArchTag>::NAME
    }

    fn name(&self) -> String {
        "matmul_epilogue".to_string()
    }

    fn run_aic(&self, ctx: &mut CoreContext<'_>) -> DeviceResult {
        let mut producer = AccumulatorProducer::<BM>::new(ctx, self.block, self.workspace)?;
        let tile = <BM::Tiling as BlockTiling>::L1;
        let task_of = |task: usize| {
            let coord = self.swizzle.block_coord(task);
            self.params
                .block_task(tile, coord, self.swizzle.actual_block_shape(coord))
        };

        let mut tasks = CoreTasks::new(ctx.block_idx(), self.swizzle.core_loops(), ctx.block_num());
        while let Some(task) = tasks.next() {
            let next = tasks.peek().map(task_of);
            producer.compute(ctx, &task_of(task), next.as_ref())?;
        }
        producer.finish(ctx)
    }

    fn run_aiv(&self, ctx: &mut CoreContext<'_>) -> DeviceResult {
        let mut consumer = AccumulatorConsumer::<
            AccG<BM::Types>,
            <BM::Types as GemmTypes>::C,
            Ep,
            BM::Tiling,
        >::new(
            ctx,
            self.epilogue,
            self.workspace,
        )?;
        let tile = <BM::Tiling as BlockTiling>::L1;
        let layout = self.params.layout_c;

        for task in CoreTasks::new(ctx.aic_idx(), self.swizzle.core_loops(), ctx.block_num()) {
            let coord = self.swizzle.block_coord(task);
            let actual = self.swizzle.actual_block_shape(coord);
            let origin = layout.offset(coord.m * tile.m, coord.n * tile.n);
            consumer.consume(
                ctx,
                self.params.c.offset(origin),
                self.d.offset(origin),
                layout,
                actual.mn(),
            )?;
        }
        consumer.finish(ctx)
    }
}
