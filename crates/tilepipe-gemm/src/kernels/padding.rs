use core::marker::PhantomData;
use tilepipe_runtime::arch::ArchTag;
use tilepipe_runtime::sync::CrossCoreFlag;
use tilepipe_runtime::{CoreContext, DeviceResult, GlobalTensor, GmBuffer, Kernel};

use super::{MatmulParams, WorkspaceLayout, run_block_tasks, workspace_region};
use crate::components::batch::{BlockSwizzle, CoreTasks};
use crate::components::block::BlockMmad;
use crate::components::global::{PaddingMatrix, padded_layout};
use crate::components::{GemmTypes, MatmulSetupError, MatrixLayout, TierAllocator};

/// Set by every vector engine once all operands are padded.
pub(crate) const PADDING_READY: CrossCoreFlag = CrossCoreFlag { id: 0 };

/// Aligned copy of an operand in the workspace.
#[derive(Debug, Clone, Copy, new)]
pub struct PaddedOperand<E, L> {
    pub workspace: GlobalTensor<E>,
    pub layout: L,
}

/// Where the padded operands of a matmul go.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PaddingPlan {
    /// Byte offset of the padded `A`, when `A` needs padding.
    pub a: Option<usize>,
    pub b: Option<usize>,
    pub workspace: WorkspaceLayout,
}

impl PaddingPlan {
    pub fn new<T: GemmTypes>(layout_a: &T::LayoutA, layout_b: &T::LayoutB) -> Self {
        let mut workspace = WorkspaceLayout::new();
        let a = padded_layout::<T::A, _>(layout_a)
            .map(|layout| workspace.reserve::<T::A>(layout.workspace_len()));
        let b = padded_layout::<T::B, _>(layout_b)
            .map(|layout| workspace.reserve::<T::B>(layout.workspace_len()));
        Self { a, b, workspace }
    }

    pub fn is_empty(&self) -> bool {
        self.a.is_none() && self.b.is_none()
    }
}

/// Workspace bytes [`PaddingMatmul`] needs for these operands.
pub fn padding_workspace_size<T: GemmTypes>(layout_a: &T::LayoutA, layout_b: &T::LayoutB) -> usize {
    PaddingPlan::new::<T>(layout_a, layout_b).workspace.size()
}

pub(crate) fn check_workspace(
    required: usize,
    workspace: Option<GmBuffer>,
) -> Result<(), MatmulSetupError> {
    let actual = workspace.map_or(0, |workspace| workspace.len);
    if required > actual {
        return Err(MatmulSetupError::WorkspaceTooSmall { required, actual });
    }
    Ok(())
}

/// Padded operands of a matmul, resolved against a workspace.
pub(crate) struct PaddedOperands<T: GemmTypes> {
    pub a: Option<PaddedOperand<T::A, T::LayoutA>>,
    pub b: Option<PaddedOperand<T::B, T::LayoutB>>,
}

impl<T: GemmTypes> PaddedOperands<T> {
    pub fn new(plan: &PaddingPlan, params: &MatmulParams<T>, workspace: Option<GmBuffer>) -> Self {
        let resolve = |offset: Option<usize>| offset.zip(workspace);
        Self {
            a: resolve(plan.a).zip(padded_layout::<T::A, _>(&params.layout_a)).map(
                |((offset, workspace), layout)| {
                    PaddedOperand::new(workspace_region(workspace, offset), layout)
                },
            ),
            b: resolve(plan.b).zip(padded_layout::<T::B, _>(&params.layout_b)).map(
                |((offset, workspace), layout)| {
                    PaddedOperand::new(workspace_region(workspace, offset), layout)
                },
            ),
        }
    }

    pub fn any(&self) -> bool {
        self.a.is_some() || self.b.is_some()
    }

    /// `params` reading the padded copies instead of the originals.
    pub fn apply(&self, params: &MatmulParams<T>) -> MatmulParams<T> {
        let mut padded = *params;
        if let Some(a) = self.a {
            padded.a = a.workspace;
            padded.layout_a = a.layout;
        }
        if let Some(b) = self.b {
            padded.b = b.workspace;
            padded.layout_b = b.layout;
        }
        padded
    }

    /// Vector engine pass: copies every operand that needs it, then waits for the other vector
    /// engines. Each operand gets the whole scratch tier.
    pub fn pad(&self, ctx: &mut CoreContext<'_>, params: &MatmulParams<T>) -> DeviceResult {
        if let Some(a) = self.a {
            let mut allocator = TierAllocator::new(ctx);
            let mut padding = PaddingMatrix::<T::A, T::LayoutA>::new(ctx, &mut allocator)?;
            padding.run(ctx, a.workspace, &a.layout, params.a, &params.layout_a)?;
            padding.finish(ctx)?;
        }
        if let Some(b) = self.b {
            let mut allocator = TierAllocator::new(ctx);
            let mut padding = PaddingMatrix::<T::B, T::LayoutB>::new(ctx, &mut allocator)?;
            padding.run(ctx, b.workspace, &b.layout, params.b, &params.layout_b)?;
            padding.finish(ctx)?;
        }
        if self.any() {
            ctx.log_phase("operands padded");
            ctx.cross_core_barrier_aiv()?;
        }
        Ok(())
    }
}

/// Matmul whose operands are first copied to an aligned workspace when their stride is not
/// aligned, or too large for a DMA burst.
///
/// The vector engines pad, meet at a barrier and release their matrix engine with
/// [`PADDING_READY`]. Without any operand to pad both sides skip the hand-off.
pub struct PaddingMatmul<BM: BlockMmad, S: BlockSwizzle> {
    params: MatmulParams<BM::Types>,
    padded: PaddedOperands<BM::Types>,
    block: BM::Params,
    swizzle: S,
    _block: PhantomData<fn() -> BM>,
}

impl<BM: BlockMmad, S: BlockSwizzle> PaddingMatmul<BM, S> {
    pub fn new(
        params: MatmulParams<BM::Types>,
        workspace: Option<GmBuffer>,
        block: BM::Params,
        swizzle: S,
    ) -> Result<Self, MatmulSetupError> {
        let plan = PaddingPlan::new::<BM::Types>(&params.layout_a, &params.layout_b);
        check_workspace(plan.workspace.size(), workspace)?;

        Ok(Self {
            padded: PaddedOperands::new(&plan, &params, workspace),
            params,
            block,
            swizzle,
            _block: PhantomData,
        })
    }
}

impl<BM, S> Kernel for PaddingMatmul<BM, S>
where
    BM: BlockMmad,
    BM::Params: Sync,
    S: BlockSwizzle + Sync,
{
    fn arch(&self) -> &'static str {
        <BM::Arch as ArchTag>::NAME
    }

    fn name(&self) -> String {
        "padding_matmul".to_string()
    }

    fn run_aic(&self, ctx: &mut CoreContext<'_>) -> DeviceResult {
        let mut allocator = TierAllocator::new(ctx);
        let mut block = BM::new(ctx, &mut allocator, self.block)?;

        if self.padded.any() {
            ctx.cross_core_wait_flag(PADDING_READY)?;
        }
        let params = self.padded.apply(&self.params);
        let tasks = CoreTasks::new(ctx.block_idx(), self.swizzle.core_loops(), ctx.block_num());
        run_block_tasks(ctx, &mut block, &params, &self.swizzle, tasks)?;

        block.finish(ctx)
    }

    fn run_aiv(&self, ctx: &mut CoreContext<'_>) -> DeviceResult {
        self.padded.pad(ctx, &self.params)?;
        if self.padded.any() {
            ctx.cross_core_set_flag(PADDING_READY)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::{ColumnMajor, MatmulTypes, RowMajor};
    use half::f16;
    use pretty_assertions::assert_eq;

    type Types = MatmulTypes<f16, RowMajor, f16, ColumnMajor, f16>;

    #[test_log::test]
    fn only_misaligned_operands_take_workspace() {
        let aligned = RowMajor::new(64, 512);
        let misaligned = ColumnMajor::new(300, 40);
        let plan = PaddingPlan::new::<Types>(&aligned, &misaligned);

        assert_eq!(plan.a, None);
        assert_eq!(plan.b, Some(0));
        // 40 columns of 512 halves.
        assert_eq!(plan.workspace.size(), 40 * 512 * 2);
        assert!(PaddingPlan::new::<Types>(&aligned, &ColumnMajor::new(256, 40)).is_empty());
    }

    #[test_log::test]
    fn missing_workspace_is_reported() {
        assert!(matches!(
            check_workspace(1024, None),
            Err(MatmulSetupError::WorkspaceTooSmall {
                required: 1024,
                actual: 0
            })
        ));
        assert!(check_workspace(0, None).is_ok());
    }
}
