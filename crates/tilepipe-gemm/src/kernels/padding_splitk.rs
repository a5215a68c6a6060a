use core::marker::PhantomData;
use tilepipe_runtime::arch::ArchTag;
use tilepipe_runtime::sync::CrossCoreFlag;
use tilepipe_runtime::{CoreContext, DeviceResult, GlobalTensor, GmBuffer, Kernel};

use super::padding::{PADDING_READY, PaddedOperands, PaddingPlan};
use super::{MatmulParams, workspace_region};
use crate::components::batch::{CoreTasks, SWIZZLE_ZN, SplitkGemmIdentityBlockSwizzle};
use crate::components::block::{BlockMmad, BlockOutput};
use crate::components::global::ReduceAdd;
use crate::components::{
    AccG, BlockTiling, GemmCoord, GemmTypes, MatmulSetupError, RowMajor, TierAllocator,
    TileLayout,
};

/// Set by a matrix engine once all of its K slices are in the workspace.
const PARTIALS_READY: CrossCoreFlag = CrossCoreFlag { id: 1 };

/// Workspace regions of [`PaddingSplitkMatmul`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitkPlan {
    pub padding: PaddingPlan,
    /// Byte offset of the `splitk_factor` accumulator partials of `M x N` each.
    pub partials: usize,
}

impl SplitkPlan {
    pub fn new<T: GemmTypes>(
        layout_a: &T::LayoutA,
        layout_b: &T::LayoutB,
        problem: GemmCoord,
        splitk_factor: usize,
    ) -> Self {
        let mut padding = PaddingPlan::new::<T>(layout_a, layout_b);
        let partials = padding
            .workspace
            .reserve::<AccG<T>>(problem.m * problem.n * splitk_factor);
        Self { padding, partials }
    }
}

/// Workspace bytes [`PaddingSplitkMatmul`] needs.
pub fn padding_splitk_workspace_size<T: GemmTypes>(
    layout_a: &T::LayoutA,
    layout_b: &T::LayoutB,
    problem: GemmCoord,
    splitk_factor: usize,
) -> usize {
    SplitkPlan::new::<T>(layout_a, layout_b, problem, splitk_factor)
        .padding
        .workspace
        .size()
}

/// Split-K matmul with optional operand padding.
///
/// 1. The vector engines pad the operands that need it and release the matrix engines.
/// 2. Every matrix engine task accumulates one K slice of one tile into its own dense `M x N`
///    accumulator partial in the workspace.
/// 3. Once all matrix engines are done the vector engines sum the partials into `C`.
pub struct PaddingSplitkMatmul<BM: BlockMmad, const OFFSET: usize = 1, const DIRECTION: usize = SWIZZLE_ZN> {
    params: MatmulParams<BM::Types>,
    padded: PaddedOperands<BM::Types>,
    partials: GlobalTensor<AccG<BM::Types>>,
    block: BM::Params,
    swizzle: SplitkGemmIdentityBlockSwizzle<OFFSET, DIRECTION>,
    _block: PhantomData<fn() -> BM>,
}

impl<BM: BlockMmad, const OFFSET: usize, const DIRECTION: usize>
    PaddingSplitkMatmul<BM, OFFSET, DIRECTION>
{
    pub fn new(
        params: MatmulParams<BM::Types>,
        splitk_factor: usize,
        workspace: Option<GmBuffer>,
        block: BM::Params,
    ) -> Result<Self, MatmulSetupError> {
        let tile = <BM::Tiling as BlockTiling>::L1;
        let swizzle = SplitkGemmIdentityBlockSwizzle::new(params.problem, tile, splitk_factor);
        let plan = SplitkPlan::new::<BM::Types>(
            &params.layout_a,
            &params.layout_b,
            params.problem,
            swizzle.splitk_factor,
        );
        let required = plan.padding.workspace.size();
        let workspace = match workspace {
            Some(workspace) if workspace.len >= required => workspace,
            other => {
                return Err(MatmulSetupError::WorkspaceTooSmall {
                    required,
                    actual: other.map_or(0, |workspace| workspace.len),
                });
            }
        };

        Ok(Self {
            padded: PaddedOperands::new(&plan.padding, &params, Some(workspace)),
            partials: workspace_region(workspace, plan.partials),
            params,
            block,
            swizzle,
            _block: PhantomData,
        })
    }

    pub fn splitk_factor(&self) -> usize {
        self.swizzle.splitk_factor
    }

    fn partial_layout(&self) -> RowMajor {
        RowMajor::new(self.params.problem.m, self.params.problem.n)
    }
}

impl<BM, const OFFSET: usize, const DIRECTION: usize> Kernel
    for PaddingSplitkMatmul<BM, OFFSET, DIRECTION>
where
    BM: BlockMmad,
    BM::Params: Sync,
{
    fn arch(&self) -> &'static str {
        <BM::Arch as ArchTag>::NAME
    }

    fn name(&self) -> String {
        format!("padding_splitk_matmul[{}]", self.swizzle.splitk_factor)
    }

    fn run_aic(&self, ctx: &mut CoreContext<'_>) -> DeviceResult {
        let mut allocator = TierAllocator::new(ctx);
        let mut block = BM::new(ctx, &mut allocator, self.block)?;

        if self.padded.any() {
            ctx.cross_core_wait_flag(PADDING_READY)?;
        }
        let params = self.padded.apply(&self.params);
        let tile = <BM::Tiling as BlockTiling>::L1;
        let layout = self.partial_layout();
        let slice_len = self.params.problem.m * self.params.problem.n;

        let task_of = |task: usize| {
            let slice = self.swizzle.splitk_slice_idx(task);
            let coord = self.swizzle.block_coord(task);
            let actual = self.swizzle.actual_block_shape(coord, slice);
            (slice, coord, params.block_task(tile, coord, actual))
        };

        let mut tasks =
            CoreTasks::new(ctx.block_idx(), self.swizzle.core_loops(), ctx.block_num());
        while let Some(task) = tasks.next() {
            let (slice, coord, current) = task_of(task);
            let next = tasks.peek().map(|task| task_of(task).2);
            let origin = slice * slice_len + layout.offset(coord.m * tile.m, coord.n * tile.n);
            let out = BlockOutput::cast(self.partials.offset(origin), layout);
            block.compute(ctx, &current, out, next.as_ref())?;
        }

        block.finish(ctx)?;
        ctx.cross_core_set_flag(PARTIALS_READY)
    }

    fn run_aiv(&self, ctx: &mut CoreContext<'_>) -> DeviceResult {
        self.padded.pad(ctx, &self.params)?;
        if self.padded.any() {
            ctx.cross_core_set_flag(PADDING_READY)?;
        }

        ctx.cross_core_wait_flag(PARTIALS_READY)?;
        ctx.cross_core_barrier_aiv()?;
        ctx.log_phase(format_args!("reducing {} K slices", self.swizzle.splitk_factor));

        let mut allocator = TierAllocator::new(ctx);
        let mut reduce =
            ReduceAdd::<AccG<BM::Types>, <BM::Types as GemmTypes>::C>::new(&mut allocator)?;
        reduce.run(
            ctx,
            self.params.c,
            &self.params.layout_c,
            self.partials,
            self.params.problem.mn(),
            self.swizzle.splitk_factor,
        )
    }
}
