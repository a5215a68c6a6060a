use half::{bf16, f16};
use tilepipe_runtime::arch::AtlasA2;
use tilepipe_runtime::{AccumulatorSelector, Device, Element, GmBuffer, Kernel, LaunchReport};

use crate::components::batch::{
    BlockSwizzle, GemmIdentityBlockSwizzle, GroupList, SWIZZLE_ZN, splitk_factor_heuristic,
};
use crate::components::block::{BlockMmad, BlockMmadPingpong, BlockMmadPreload};
use crate::components::{
    BlockTiling, ColumnMajor, GemmProblem, LayoutKind, MatmulLaunchError, MatmulSetupError,
    MatmulTypes, MatrixLayout, RowMajor, TilingF16, TilingF32, TilingI8,
};
use crate::kernels::{
    BasicMatmul, GroupArenas, GroupedMatmul, MatmulParams, PaddingMatmul, PaddingSplitkMatmul,
    StreamkMatmul, padding_splitk_workspace_size, padding_workspace_size, streamk_workspace_size,
};

/// Swizzle of the single problem kernels launched from the host.
pub type DefaultSwizzle = GemmIdentityBlockSwizzle<3, SWIZZLE_ZN>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
/// The matmul kernel to launch
pub enum Strategy {
    /// Matrix engines only, double buffered block pipeline.
    #[default]
    Pingpong,
    /// Matrix engines only, prefetching the first K tile of the next block. With `shuffle_k`
    /// every core starts its K loop at a different tile.
    Preload { shuffle_k: bool },
    /// Operands with an unaligned or oversized stride are first copied to the workspace.
    Padding,
    /// Padding, then K split over several tasks and summed on the vector engines.
    PaddingSplitk,
    /// The last wave of tiles is balanced over every core by K iteration.
    Streamk,
}

impl Strategy {
    /// Whether operands are copied to an aligned workspace before the matmul.
    pub fn pads_operands(&self) -> bool {
        matches!(self, Strategy::Padding | Strategy::PaddingSplitk)
    }

    /// Whether the kernel reads or writes a workspace.
    pub fn uses_workspace(&self) -> bool {
        matches!(
            self,
            Strategy::Padding | Strategy::PaddingSplitk | Strategy::Streamk
        )
    }
}

/// Element type with pre-instantiated block strategies on the default architecture.
pub trait GemmElement: Element + AccumulatorSelector<Self> {
    /// Element the output is written in.
    type Output: Element;
    type Tiling: BlockTiling;

    type Pingpong<LA: MatrixLayout, LB: MatrixLayout>: BlockMmad<
            Arch = AtlasA2,
            Types = MatmulTypes<Self, LA, Self, LB, Self::Output>,
            Tiling = Self::Tiling,
            Params = (),
        >;
    type Preload<LA: MatrixLayout, LB: MatrixLayout, const SHUFFLE_K: bool>: BlockMmad<
            Arch = AtlasA2,
            Types = MatmulTypes<Self, LA, Self, LB, Self::Output>,
            Tiling = Self::Tiling,
            Params = (),
        >;
    /// Strategy of kernels writing accumulator partials, which keep the unit flag off.
    type Partial<LA: MatrixLayout, LB: MatrixLayout>: BlockMmad<
            Arch = AtlasA2,
            Types = MatmulTypes<Self, LA, Self, LB, Self::Output>,
            Tiling = Self::Tiling,
            Params = (),
        >;
}

macro_rules! impl_gemm_element {
    ($elem:ty, $output:ty, $tiling:ty, $unit_flag:expr) => {
        impl GemmElement for $elem {
            type Output = $output;
            type Tiling = $tiling;

            type Pingpong<LA: MatrixLayout, LB: MatrixLayout> = BlockMmadPingpong<
                AtlasA2,
                MatmulTypes<$elem, LA, $elem, LB, $output>,
                $tiling,
                $unit_flag,
            >;
            type Preload<LA: MatrixLayout, LB: MatrixLayout, const SHUFFLE_K: bool> =
                BlockMmadPreload<
                    AtlasA2,
                    MatmulTypes<$elem, LA, $elem, LB, $output>,
                    $tiling,
                    $unit_flag,
                    SHUFFLE_K,
                >;
            type Partial<LA: MatrixLayout, LB: MatrixLayout> = BlockMmadPingpong<
                AtlasA2,
                MatmulTypes<$elem, LA, $elem, LB, $output>,
                $tiling,
                false,
            >;
        }
    };
}

impl_gemm_element!(f16, f16, TilingF16, true);
impl_gemm_element!(bf16, bf16, TilingF16, true);
impl_gemm_element!(f32, f32, TilingF32, true);
impl_gemm_element!(i8, i32, TilingI8, false);

type Types<E, LA, LB> = MatmulTypes<E, LA, E, LB, <E as GemmElement>::Output>;

/// Global memory buffers of a launch.
#[derive(Debug, Clone, Copy, new)]
pub struct GemmBuffers {
    pub a: GmBuffer,
    pub b: GmBuffer,
    pub c: GmBuffer,
    /// Allocated by [`launch`] when the strategy needs one and none is given.
    pub workspace: Option<GmBuffer>,
}

/// Workspace bytes `strategy` needs to run `problem` on `aic_core_num` matrix engines.
pub fn workspace_size<E: GemmElement>(
    problem: &GemmProblem,
    strategy: &Strategy,
    aic_core_num: usize,
) -> usize {
    match (problem.layout_a, problem.layout_b) {
        (LayoutKind::RowMajor, LayoutKind::RowMajor) => {
            workspace_size_with::<E, RowMajor, RowMajor>(problem, strategy, aic_core_num)
        }
        (LayoutKind::RowMajor, LayoutKind::ColumnMajor) => {
            workspace_size_with::<E, RowMajor, ColumnMajor>(problem, strategy, aic_core_num)
        }
        (LayoutKind::ColumnMajor, LayoutKind::RowMajor) => {
            workspace_size_with::<E, ColumnMajor, RowMajor>(problem, strategy, aic_core_num)
        }
        (LayoutKind::ColumnMajor, LayoutKind::ColumnMajor) => {
            workspace_size_with::<E, ColumnMajor, ColumnMajor>(problem, strategy, aic_core_num)
        }
    }
}

fn workspace_size_with<E: GemmElement, LA: MatrixLayout, LB: MatrixLayout>(
    problem: &GemmProblem,
    strategy: &Strategy,
    aic_core_num: usize,
) -> usize {
    let (layout_a, layout_b) = (problem.layout_a::<LA>(), problem.layout_b::<LB>());
    match strategy {
        Strategy::Pingpong | Strategy::Preload { .. } => 0,
        Strategy::Padding => padding_workspace_size::<Types<E, LA, LB>>(&layout_a, &layout_b),
        Strategy::PaddingSplitk => {
            let factor =
                splitk_factor_heuristic(problem.shape, <E::Tiling as BlockTiling>::L1, aic_core_num);
            padding_splitk_workspace_size::<Types<E, LA, LB>>(
                &layout_a,
                &layout_b,
                problem.shape,
                factor,
            )
        }
        Strategy::Streamk => {
            streamk_workspace_size::<Types<E, LA, LB>, E::Tiling>(problem.shape, aic_core_num)
        }
    }
}

fn check_buffer(operand: &'static str, buffer: GmBuffer, required: usize) -> Result<(), MatmulSetupError> {
    if buffer.len < required {
        return Err(MatmulSetupError::BufferTooSmall {
            operand,
            required,
            actual: buffer.len,
        });
    }
    Ok(())
}

/// Launches `problem` with `strategy` on `device`.
///
/// The problem's element types must be `E` for both operands and `E::Output` for the result.
pub fn launch<E: GemmElement>(
    device: &Device,
    strategy: &Strategy,
    problem: &GemmProblem,
    buffers: &GemmBuffers,
) -> Result<LaunchReport, MatmulLaunchError> {
    problem.validate(strategy)?;
    problem.check_types::<E, E, E::Output>()?;
    check_buffer("a", buffers.a, problem.storage_a() * size_of::<E>())?;
    check_buffer("b", buffers.b, problem.storage_b() * size_of::<E>())?;
    check_buffer("c", buffers.c, problem.storage_c() * size_of::<E::Output>())?;

    let aic_core_num = device.properties().aic_core_num;
    let mut buffers = *buffers;
    if buffers.workspace.is_none() {
        let size = workspace_size::<E>(problem, strategy, aic_core_num);
        if size > 0 {
            buffers.workspace = Some(device.empty::<u8>(size)?);
        }
    }

    match (problem.layout_a, problem.layout_b) {
        (LayoutKind::RowMajor, LayoutKind::RowMajor) => {
            launch_with::<E, RowMajor, RowMajor>(device, strategy, problem, &buffers)
        }
        (LayoutKind::RowMajor, LayoutKind::ColumnMajor) => {
            launch_with::<E, RowMajor, ColumnMajor>(device, strategy, problem, &buffers)
        }
        (LayoutKind::ColumnMajor, LayoutKind::RowMajor) => {
            launch_with::<E, ColumnMajor, RowMajor>(device, strategy, problem, &buffers)
        }
        (LayoutKind::ColumnMajor, LayoutKind::ColumnMajor) => {
            launch_with::<E, ColumnMajor, ColumnMajor>(device, strategy, problem, &buffers)
        }
    }
}

fn launch_with<E: GemmElement, LA: MatrixLayout, LB: MatrixLayout>(
    device: &Device,
    strategy: &Strategy,
    problem: &GemmProblem,
    buffers: &GemmBuffers,
) -> Result<LaunchReport, MatmulLaunchError> {
    let aic_core_num = device.properties().aic_core_num;
    let params = MatmulParams::<Types<E, LA, LB>>::new(
        problem.shape,
        buffers.a.tensor(),
        problem.layout_a::<LA>(),
        buffers.b.tensor(),
        problem.layout_b::<LB>(),
        buffers.c.tensor(),
        problem.layout_c(),
    );
    let swizzle = DefaultSwizzle::new(problem.shape, <E::Tiling as BlockTiling>::L1.mn());
    let block_dim = aic_core_num.min(swizzle.core_loops()).max(1);

    match strategy {
        Strategy::Pingpong => {
            let kernel =
                BasicMatmul::<E::Pingpong<LA, LB>, DefaultSwizzle>::new(params, (), swizzle);
            run(device, &kernel, block_dim, problem)
        }
        Strategy::Preload { shuffle_k: true } => {
            let kernel =
                BasicMatmul::<E::Preload<LA, LB, true>, DefaultSwizzle>::new(params, (), swizzle);
            run(device, &kernel, block_dim, problem)
        }
        Strategy::Preload { shuffle_k: false } => {
            let kernel =
                BasicMatmul::<E::Preload<LA, LB, false>, DefaultSwizzle>::new(params, (), swizzle);
            run(device, &kernel, block_dim, problem)
        }
        Strategy::Padding => {
            let kernel = PaddingMatmul::<E::Pingpong<LA, LB>, DefaultSwizzle>::new(
                params,
                buffers.workspace,
                (),
                swizzle,
            )?;
            run(device, &kernel, block_dim, problem)
        }
        Strategy::PaddingSplitk => {
            let factor = splitk_factor_heuristic(problem.shape, <E::Tiling as BlockTiling>::L1, aic_core_num);
            let kernel = PaddingSplitkMatmul::<E::Partial<LA, LB>>::new(
                params,
                factor,
                buffers.workspace,
                (),
            )?;
            let block_dim = aic_core_num.min(swizzle.core_loops() * factor).max(1);
            run(device, &kernel, block_dim, problem)
        }
        Strategy::Streamk => {
            let kernel =
                StreamkMatmul::<E::Partial<LA, LB>>::new(params, aic_core_num, buffers.workspace, ())?;
            run(device, &kernel, aic_core_num, problem)
        }
    }
}

fn run<K: Kernel>(
    device: &Device,
    kernel: &K,
    block_dim: usize,
    problem: &GemmProblem,
) -> Result<LaunchReport, MatmulLaunchError> {
    log::info!(
        "Launching {} for {} on {block_dim} matrix engines",
        kernel.name(),
        problem.shape
    );
    let report = device.launch(kernel, block_dim)?;
    log::debug!("{} finished in {:?}", report.kernel, report.elapsed);
    Ok(report)
}

/// Launches a grouped matmul over densely packed operand arenas, with the layouts `LA` and `LB`
/// for every group.
pub fn launch_grouped<E: GemmElement, LA: MatrixLayout, LB: MatrixLayout>(
    device: &Device,
    groups: GroupList,
    a: GmBuffer,
    b: GmBuffer,
    c: GmBuffer,
) -> Result<LaunchReport, MatmulLaunchError> {
    let totals = groups.totals();
    check_buffer("a", a, totals.a * size_of::<E>())?;
    check_buffer("b", b, totals.b * size_of::<E>())?;
    check_buffer("c", c, totals.c * size_of::<E::Output>())?;

    let block_dim = device.properties().aic_core_num;
    let arenas = GroupArenas::<Types<E, LA, LB>>::new(a.tensor(), b.tensor(), c.tensor());
    let kernel = GroupedMatmul::<E::Pingpong<LA, LB>>::new(groups, arenas, ());

    log::info!("Launching {} on {block_dim} matrix engines", kernel.name());
    Ok(device.launch(&kernel, block_dim)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::GemmCoord;
    use pretty_assertions::assert_eq;

    #[test_log::test]
    fn only_padding_strategies_pad() {
        assert!(Strategy::Padding.pads_operands());
        assert!(Strategy::PaddingSplitk.pads_operands());
        assert!(!Strategy::Streamk.pads_operands());
        assert!(Strategy::Streamk.uses_workspace());
        assert_eq!(Strategy::default(), Strategy::Pingpong);
    }

    #[test_log::test]
    fn aligned_operands_need_no_padding_workspace() {
        let problem = GemmProblem::packed::<f16, f16, f16>(
            GemmCoord::new(256, 512, 1024),
            LayoutKind::RowMajor,
            LayoutKind::RowMajor,
        );

        assert_eq!(workspace_size::<f16>(&problem, &Strategy::Pingpong, 20), 0);
        assert_eq!(workspace_size::<f16>(&problem, &Strategy::Padding, 20), 0);
    }

    #[test_log::test]
    fn unaligned_strides_reserve_padded_copies() {
        let problem = GemmProblem::packed::<f16, f16, f16>(
            GemmCoord::new(100, 512, 300),
            LayoutKind::RowMajor,
            LayoutKind::RowMajor,
        );

        assert!(workspace_size::<f16>(&problem, &Strategy::Padding, 20) > 0);
    }
}
