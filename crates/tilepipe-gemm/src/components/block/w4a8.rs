use core::marker::PhantomData;
use half::f16;
use tilepipe_runtime::arch::{ArchTag, TierKind};
use tilepipe_runtime::sync::HardEvent;
use tilepipe_runtime::{CopyRun, CoreContext, DeviceResult, Element, GlobalTensor, Int4x2, LocalTensor};

use super::{BlockMmad, BlockOutput, BlockTask, KLoad, MmadStages, k_loop_order, k_loop_start};
use crate::components::global::{RingFlags, WorkspaceRing};
use crate::components::tile::vec_unpack_int4;
use crate::components::{
    BlockTiling, GemmCoord, LayoutKind, MatmulTypes, MatrixCoord, MatrixLayout, TierAllocator,
    TierCaps, TileRequest, is_valid,
};

/// Operand types seen by the matrix engine: int8 activations, int4 weights already widened to
/// int8, half precision output.
pub type W4A8Types<LA, LB> = MatmulTypes<i8, LA, i8, LB, f16>;

/// Unpacked right operand slots between the vector and matrix engines of one pair.
pub const W4A8_WORKSPACE_SLOTS: usize = 2;

/// Elements of one unpacked right operand tile.
pub const fn w4a8_slot_len<Til: BlockTiling>() -> usize {
    Til::L1.k * Til::L1.n
}

/// Workspace elements needed by `aic_num` matrix engines.
pub const fn w4a8_workspace_len<Til: BlockTiling>(aic_num: usize) -> usize {
    w4a8_slot_len::<Til>() * W4A8_WORKSPACE_SLOTS * aic_num
}

/// Layout of an unpacked `rows x columns` tile inside a workspace slot.
fn slot_layout<L: MatrixLayout, Til: BlockTiling>(rows: usize, columns: usize) -> L {
    let stride = match L::KIND {
        LayoutKind::RowMajor => Til::L1.n,
        LayoutKind::ColumnMajor => Til::L1.k,
    };
    L::with_stride(rows, columns, stride)
}

fn ring<Til: BlockTiling>(workspace: GlobalTensor<i8>, aic_idx: usize) -> WorkspaceRing<i8> {
    WorkspaceRing::for_core(
        workspace,
        aic_idx,
        w4a8_slot_len::<Til>(),
        W4A8_WORKSPACE_SLOTS,
        RingFlags::default(),
    )
}

#[derive(Debug, Clone, Copy, new)]
pub struct W4A8Params {
    /// Unpacked tile ring of every matrix engine, see [`w4a8_workspace_len`].
    pub workspace: GlobalTensor<i8>,
}

/// Matrix engine half of the int8 x int4 block matmul.
///
/// The right operand of each K tile is taken from the workspace ring filled by
/// [`Int4Unpacker`]; `task.b` is not read. The output is dequantized by `out.scale`.
pub struct BlockMmadW4A8<Arch: ArchTag, LA: MatrixLayout, LB: MatrixLayout, Til: BlockTiling, const SHUFFLE_K: bool>
{
    stages: MmadStages<i8, i8, i32>,
    ring: WorkspaceRing<i8>,
    _phantom: PhantomData<(Arch, LA, LB, Til)>,
}

impl<Arch: ArchTag, LA: MatrixLayout, LB: MatrixLayout, Til: BlockTiling, const SHUFFLE_K: bool>
    BlockMmadW4A8<Arch, LA, LB, Til, SHUFFLE_K>
{
    const CHECK: () = {
        assert!(Til::STAGES >= 2, "the int4 pipeline needs two staging slots");
        assert!(
            is_valid(
                TileRequest::of::<W4A8Types<LA, LB>, Til>(false),
                TierCaps::of::<Arch>()
            ),
            "tile shape does not fit the on-chip tiers"
        );
    };
}

impl<Arch: ArchTag, LA: MatrixLayout, LB: MatrixLayout, Til: BlockTiling, const SHUFFLE_K: bool>
    BlockMmad for BlockMmadW4A8<Arch, LA, LB, Til, SHUFFLE_K>
{
    type Arch = Arch;
    type Types = W4A8Types<LA, LB>;
    type Tiling = Til;
    type Params = W4A8Params;

    const UNIT_FLAG: bool = false;

    fn new(
        ctx: &mut CoreContext<'_>,
        allocator: &mut TierAllocator,
        params: W4A8Params,
    ) -> DeviceResult<Self> {
        #[allow(clippy::let_unit_value)]
        let () = Self::CHECK;

        let stages =
            MmadStages::new::<LA, LB>(ctx, allocator, Til::L1, Til::L0, Til::STAGES, false)?;
        Ok(Self {
            stages,
            ring: ring::<Til>(params.workspace, ctx.aic_idx()),
            _phantom: PhantomData,
        })
    }

    fn compute<D: Element>(
        &mut self,
        ctx: &mut CoreContext<'_>,
        task: &BlockTask<Self::Types>,
        out: BlockOutput<D>,
        _next: Option<&BlockTask<Self::Types>>,
    ) -> DeviceResult {
        let actual = task.actual;
        let start = k_loop_start(ctx.aic_idx(), actual.k.div_ceil(Til::L1.k), SHUFFLE_K);
        let ring = &mut self.ring;

        self.stages.run_loading(ctx, actual, start, false, false, |stages, ctx, stage, load| {
            let KLoad::Tile(k_tile) = load else {
                return Ok(());
            };
            let k_offset = k_tile * Til::L1.k;
            let k_len = stages.k_tile_len(actual.k, k_tile);
            let a = task.a.offset(task.layout_a.offset(0, k_offset));
            stages.load_a(ctx, stage, a, &task.layout_a, MatrixCoord::new(actual.m, k_len))?;

            let slot = ring.acquire_consume(ctx)?;
            let layout = slot_layout::<LB, Til>(k_len, actual.n);
            stages.load_b(ctx, stage, slot, &layout, MatrixCoord::new(k_len, actual.n))?;
            ring.release_consume(ctx)
        })?;
        self.stages.store(ctx, out, actual.mn())
    }

    fn finish(self, ctx: &mut CoreContext<'_>) -> DeviceResult {
        self.stages.finish(ctx)
    }
}

/// Vector engine half of the int8 x int4 block matmul.
///
/// For every K tile the matrix engine will consume, in the same order, each vector engine of the
/// pair widens its share of the tile's lines from packed int4 to int8 and publishes the tile in
/// the workspace ring.
pub struct Int4Unpacker<LB: MatrixLayout, Til: BlockTiling, const SHUFFLE_K: bool> {
    packed: LocalTensor<Int4x2>,
    unpacked: LocalTensor<i8>,
    ring: WorkspaceRing<i8>,
    _phantom: PhantomData<(LB, Til)>,
}

impl<LB: MatrixLayout, Til: BlockTiling, const SHUFFLE_K: bool> Int4Unpacker<LB, Til, SHUFFLE_K> {
    /// Longest line of an unpacked tile.
    const LINE_CAP: usize = match LB::KIND {
        LayoutKind::RowMajor => Til::L1.n,
        LayoutKind::ColumnMajor => Til::L1.k,
    };
    /// Bytes reserved per packed line, one extra for lines starting on an odd nibble.
    const PACKED_LINE: usize = Self::LINE_CAP / 2 + 1;

    pub fn new(
        ctx: &mut CoreContext<'_>,
        allocator: &mut TierAllocator,
        params: W4A8Params,
    ) -> DeviceResult<Self> {
        let lines = Self::max_lines(ctx.sub_block_num());
        let packed = allocator.alloc::<Int4x2>(TierKind::Ub, lines * Self::PACKED_LINE)?;
        let unpacked = allocator.alloc::<i8>(TierKind::Ub, lines * Self::LINE_CAP)?;

        Ok(Self {
            packed,
            unpacked,
            ring: ring::<Til>(params.workspace, ctx.aic_idx()),
            _phantom: PhantomData,
        })
    }

    fn max_lines(sub_block_num: usize) -> usize {
        let lines = match LB::KIND {
            LayoutKind::RowMajor => Til::L1.k,
            LayoutKind::ColumnMajor => Til::L1.n,
        };
        lines.div_ceil(sub_block_num)
    }

    /// Unpacks every K tile of the block whose right operand is the `k x n` region at
    /// `(0, n_origin)` of `b`. `layout` addresses `b` in nibbles.
    pub fn run(
        &mut self,
        ctx: &mut CoreContext<'_>,
        b: GlobalTensor<Int4x2>,
        layout: &LB,
        n_origin: usize,
        actual: GemmCoord,
    ) -> DeviceResult {
        let k_tiles = actual.k.div_ceil(Til::L1.k);
        let start = k_loop_start(ctx.aic_idx(), k_tiles, SHUFFLE_K);

        for k_tile in k_loop_order(k_tiles, start) {
            let k_offset = k_tile * Til::L1.k;
            let k_len = (actual.k - k_offset).min(Til::L1.k);
            let origin = MatrixCoord::new(k_offset, n_origin);
            self.unpack_tile(ctx, b, layout, origin, MatrixCoord::new(k_len, actual.n))?;
        }
        Ok(())
    }

    fn unpack_tile(
        &mut self,
        ctx: &mut CoreContext<'_>,
        b: GlobalTensor<Int4x2>,
        layout: &LB,
        origin: MatrixCoord,
        shape: MatrixCoord,
    ) -> DeviceResult {
        let slot = self.ring.acquire_produce(ctx)?;
        let target = slot_layout::<LB, Til>(shape.row, shape.column);
        let tile = layout.tile_layout(shape);

        let per_sub = tile.lines().div_ceil(ctx.sub_block_num());
        let first = ctx.sub_block_idx() * per_sub;
        let last = (first + per_sub).min(tile.lines());
        let line_len = tile.line_len();

        if first < last {
            let mut loads = Vec::with_capacity(last - first);
            let mut stores = Vec::with_capacity(last - first);
            let mut nibbles = Vec::with_capacity(last - first);
            for (i, line) in (first..last).enumerate() {
                let start = line_origin::<LB>(origin, line);
                let nibble = layout.offset(start.row, start.column);
                let bytes = (nibble + line_len).div_ceil(2) - nibble / 2;
                loads.push(CopyRun::new(nibble / 2, i * Self::PACKED_LINE, bytes));
                stores.push(CopyRun::new(i * Self::LINE_CAP, line * target.stride(), line_len));
                nibbles.push(nibble % 2);
            }

            ctx.copy_gm_to_local(self.packed, b, loads)?;
            ctx.events().sync(HardEvent::Mte2V, 0)?;
            for (i, first_nibble) in nibbles.into_iter().enumerate() {
                let src = self.packed.slice(i * Self::PACKED_LINE, Self::PACKED_LINE);
                let dst = self.unpacked.slice(i * Self::LINE_CAP, line_len);
                vec_unpack_int4(ctx, dst, src, first_nibble)?;
            }
            ctx.events().sync(HardEvent::VMte3, 0)?;
            ctx.copy_local_to_gm(slot, self.unpacked, stores)?;
            ctx.events().sync(HardEvent::Mte3Mte2, 0)?;
        }

        self.ring.commit_produce(ctx)
    }

    /// Waits until the matrix engine consumed every published tile.
    pub fn finish(mut self, ctx: &mut CoreContext<'_>) -> DeviceResult {
        self.ring.finish_producer(ctx)
    }
}

/// Matrix position where line `line` of a tile at `origin` starts.
fn line_origin<L: MatrixLayout>(origin: MatrixCoord, line: usize) -> MatrixCoord {
    match L::KIND {
        LayoutKind::RowMajor => MatrixCoord::new(origin.row + line, origin.column),
        LayoutKind::ColumnMajor => MatrixCoord::new(origin.row, origin.column + line),
    }
}
