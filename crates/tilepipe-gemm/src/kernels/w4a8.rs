use core::marker::PhantomData;
use tilepipe_runtime::arch::ArchTag;
use tilepipe_runtime::{CoreContext, DeviceResult, GmBuffer, Int4x2, Kernel};

use super::MatmulParams;
use crate::components::batch::{BlockSwizzle, CoreTasks};
use crate::components::block::{
    BlockMmad, BlockMmadW4A8, BlockOutput, Int4Unpacker, W4A8Params, W4A8Types,
    w4a8_workspace_len,
};
use crate::components::{BlockTiling, MatmulSetupError, MatrixLayout, TierAllocator, TileLayout};

/// Workspace bytes of the unpacked weight rings of `aic_num` matrix engines.
pub fn w4a8_workspace_size<Til: BlockTiling>(aic_num: usize) -> usize {
    w4a8_workspace_len::<Til>(aic_num) * size_of::<i8>()
}

/// Int8 activations times packed int4 weights, dequantized to half precision by a per tensor
/// scale.
///
/// `params.b` points at the packed weights and `params.layout_b` addresses them in nibbles. The
/// vector engines of each pair widen the weights of every K tile into the workspace ring, in the
/// order their matrix engine consumes them.
pub struct W4A8Matmul<
    Arch: ArchTag,
    LA: MatrixLayout,
    LB: MatrixLayout,
    Til: BlockTiling,
    S: BlockSwizzle,
    const SHUFFLE_K: bool,
> {
    params: MatmulParams<W4A8Types<LA, LB>>,
    scale: f64,
    workspace: W4A8Params,
    swizzle: S,
    _block: PhantomData<fn() -> (Arch, Til)>,
}

impl<Arch, LA, LB, Til, S, const SHUFFLE_K: bool> W4A8Matmul<Arch, LA, LB, Til, S, SHUFFLE_K>
where
    Arch: ArchTag,
    LA: MatrixLayout,
    LB: MatrixLayout,
    Til: BlockTiling,
    S: BlockSwizzle,
{
    pub fn new(
        params: MatmulParams<W4A8Types<LA, LB>>,
        scale: f64,
        workspace: Option<GmBuffer>,
        aic_num: usize,
        swizzle: S,
    ) -> Result<Self, MatmulSetupError> {
        let required = w4a8_workspace_size::<Til>(aic_num);
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
            params,
            scale,
            workspace: W4A8Params::new(workspace.tensor()),
            swizzle,
            _block: PhantomData,
        })
    }
}

impl<Arch, LA, LB, Til, S, const SHUFFLE_K: bool> Kernel for W4A8Matmul<Arch, LA, LB, Til, S, SHUFFLE_K>
where
    Arch: ArchTag,
    LA: MatrixLayout,
    LB: MatrixLayout,
    Til: BlockTiling,
    S: BlockSwizzle + Sync,
{
    fn arch(&self) -> &'static str {
        Arch::NAME
    }

    fn name(&self) -> String {
        "w4a8_matmul".to_string()
    }

    fn run_aic(&self, ctx: &mut CoreContext<'_>) -> DeviceResult {
        let mut allocator = TierAllocator::new(ctx);
        let mut block =
            BlockMmadW4A8::<Arch, LA, LB, Til, SHUFFLE_K>::new(ctx, &mut allocator, self.workspace)?;

        for task in CoreTasks::new(ctx.block_idx(), self.swizzle.core_loops(), ctx.block_num()) {
            let coord = self.swizzle.block_coord(task);
            let actual = self.swizzle.actual_block_shape(coord);
            let current = self.params.block_task(Til::L1, coord, actual);
            let c = self
                .params
                .c
                .offset(self.params.layout_c.offset(coord.m * Til::L1.m, coord.n * Til::L1.n));
            let out = BlockOutput::new(c, self.params.layout_c, self.scale);
            block.compute(ctx, &current, out, None)?;
        }

        block.finish(ctx)
    }

    fn run_aiv(&self, ctx: &mut CoreContext<'_>) -> DeviceResult {
        let mut allocator = TierAllocator::new(ctx);
        let mut unpacker =
            Int4Unpacker::<LB, Til, SHUFFLE_K>::new(ctx, &mut allocator, self.workspace)?;
        let packed = self.params.b.reinterpret::<Int4x2>();

        for task in CoreTasks::new(ctx.aic_idx(), self.swizzle.core_loops(), ctx.block_num()) {
            let coord = self.swizzle.block_coord(task);
            let actual = self.swizzle.actual_block_shape(coord);
            unpacker.run(ctx, packed, &self.params.layout_b, coord.n * Til::L1.n, actual)?;
        }

        unpacker.finish(ctx)
    }
}
