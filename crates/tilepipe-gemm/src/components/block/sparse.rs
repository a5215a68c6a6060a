use core::marker::PhantomData;
use tilepipe_runtime::arch::ArchTag;
use tilepipe_runtime::{CoreContext, DeviceResult, Element, GlobalTensor, LocalTensor};

use super::{BlockMmad, BlockOutput, BlockTask, KLoad, MmadStages};
use crate::components::{
    BlockTiling, FractalLayout, MatmulTypes, MatrixCoord, MatrixLayout, RowMajor, TierAllocator,
    TierCaps, TileLayout, TileRequest, copy_runs, is_valid,
};

/// Elements of K kept out of every group.
pub const SPARSE_KEPT: usize = 2;
/// Size of a K group.
pub const SPARSE_GROUP: usize = 4;

/// Operand types of the 2:4 sparse block: int8 activations and a row-major compressed int8
/// right operand.
pub type SparseTypes<LA, C> = MatmulTypes<i8, LA, i8, RowMajor, C>;

#[derive(Debug, Clone, Copy, new)]
pub struct SparseParams {
    /// Origin of the compressed `K/2 x N` values.
    pub values: GlobalTensor<i8>,
    /// Origin of the position index, laid out like the values. Each entry is the position
    /// (`0..=3`) of its value inside its group of four K elements.
    pub index: GlobalTensor<u8>,
}

/// Compresses a dense row-major `k x n` matrix with at most two non-zeros in every group of
/// four K elements. Returns the `k/2 x n` values and their index.
pub fn compress_2_4(dense: &[i8], k: usize, n: usize) -> Option<(Vec<i8>, Vec<u8>)> {
    if k % SPARSE_GROUP != 0 || dense.len() < k * n {
        return None;
    }
    let rows = k / SPARSE_GROUP * SPARSE_KEPT;
    let mut values = vec![0i8; rows * n];
    let mut index = vec![0u8; rows * n];

    for group in 0..k / SPARSE_GROUP {
        for column in 0..n {
            let mut kept = 0;
            for position in 0..SPARSE_GROUP {
                let value = dense[(group * SPARSE_GROUP + position) * n + column];
                if value == 0 {
                    continue;
                }
                if kept == SPARSE_KEPT {
                    return None;
                }
                let row = group * SPARSE_KEPT + kept;
                values[row * n + column] = value;
                index[row * n + column] = position as u8;
                kept += 1;
            }
            // Unused slots point at distinct positions holding zero.
            let mut position = 0u8;
            while kept < SPARSE_KEPT {
                let row = group * SPARSE_KEPT + kept;
                let taken = (0..kept).any(|i| index[(group * SPARSE_KEPT + i) * n + column] == position);
                if !taken {
                    index[row * n + column] = position;
                    kept += 1;
                }
                position += 1;
            }
        }
    }
    Some((values, index))
}

/// Block matmul with a 2:4 structured sparse right operand.
///
/// The staging slot of the right operand holds the compressed values in its first half and the
/// index in its second half. Moving a K part to the operand tier expands it back to dense.
/// `task.b` points at the compressed values of the tile and `task.layout_b` describes the
/// compressed matrix.
pub struct BlockMmadSparse<Arch: ArchTag, LA: MatrixLayout, C: Element, Til: BlockTiling> {
    stages: MmadStages<i8, i8, i32>,
    params: SparseParams,
    _phantom: PhantomData<(Arch, LA, C, Til)>,
}

impl<Arch: ArchTag, LA: MatrixLayout, C: Element, Til: BlockTiling> BlockMmadSparse<Arch, LA, C, Til> {
    const CHECK: () = {
        assert!(Til::STAGES >= 2, "sparse pipeline needs two staging slots");
        assert!(
            Til::L0.k % SPARSE_GROUP == 0,
            "operand tier K must hold whole sparse groups"
        );
        assert!(
            is_valid(
                TileRequest::of::<SparseTypes<LA, C>, Til>(false),
                TierCaps::of::<Arch>()
            ),
            "tile shape does not fit the on-chip tiers"
        );
    };

    /// Compressed staging rows of one K tile.
    const HALF: usize = Til::L1.k / SPARSE_GROUP * SPARSE_KEPT * Til::L1.n;

    fn staged() -> RowMajor {
        RowMajor::with_stride(Til::L1.k / 2, Til::L1.n, Til::L1.n)
    }

    fn load_compressed(
        ctx: &mut CoreContext<'_>,
        dst: LocalTensor<i8>,
        values: GlobalTensor<i8>,
        index: GlobalTensor<u8>,
        layout: &RowMajor,
        shape: MatrixCoord,
    ) -> DeviceResult {
        let runs = copy_runs(layout, &Self::staged(), shape.row, shape.column);
        ctx.copy_gm_to_local(dst.slice(0, Self::HALF), values, runs.iter().copied())?;
        ctx.copy_gm_to_local(dst.tail(Self::HALF).reinterpret::<u8>(), index, runs)
    }

    /// Expands the compressed rows covering `k_origin..k_origin + part.row` into a dense operand
    /// tier tile.
    fn expand(
        ctx: &mut CoreContext<'_>,
        dst: LocalTensor<i8>,
        operand: &FractalLayout,
        src: LocalTensor<i8>,
        k_origin: usize,
        part: MatrixCoord,
    ) -> DeviceResult {
        let staged = Self::staged();
        let first = k_origin / SPARSE_GROUP * SPARSE_KEPT;
        let rows = part.row.div_ceil(SPARSE_GROUP) * SPARSE_KEPT;

        let values = ctx.resource().slice(src.slice(0, Self::HALF))?.to_vec();
        let index = ctx
            .resource()
            .slice(src.tail(Self::HALF).reinterpret::<u8>())?
            .to_vec();
        let out = ctx.resource_mut().slice_mut(dst)?;
        out.fill(0);

        for row in first..first + rows {
            let group = row / SPARSE_KEPT - first / SPARSE_KEPT;
            for column in 0..part.column {
                let at = staged.offset(row, column);
                let k = group * SPARSE_GROUP + (index[at] as usize & (SPARSE_GROUP - 1));
                if k < part.row {
                    out[operand.offset(k, column)] = values[at];
                }
            }
        }
        ctx.stats_mut().local_copy_bytes += (part.row * part.column) as u64;
        Ok(())
    }
}

impl<Arch: ArchTag, LA: MatrixLayout, C: Element, Til: BlockTiling> BlockMmad
    for BlockMmadSparse<Arch, LA, C, Til>
{
    type Arch = Arch;
    type Types = SparseTypes<LA, C>;
    type Tiling = Til;
    type Params = SparseParams;

    const UNIT_FLAG: bool = false;

    fn new(
        ctx: &mut CoreContext<'_>,
        allocator: &mut TierAllocator,
        params: SparseParams,
    ) -> DeviceResult<Self> {
        #[allow(clippy::let_unit_value)]
        let () = Self::CHECK;

        let stages =
            MmadStages::new::<LA, RowMajor>(ctx, allocator, Til::L1, Til::L0, Til::STAGES, false)?;
        Ok(Self {
            stages,
            params,
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
        let index_base = self
            .params
            .index
            .offset(task.b.addr() - self.params.values.addr());
        let operand = FractalLayout::l0b::<i8>(Til::L0.k, Til::L0.n);

        let load = |stages: &MmadStages<i8, i8, i32>, ctx: &mut CoreContext<'_>, stage, load| {
            let KLoad::Tile(k_tile) = load else {
                return Ok(());
            };
            let k_offset = k_tile * Til::L1.k;
            let k_len = stages.k_tile_len(actual.k, k_tile);
            let a = task.a.offset(task.layout_a.offset(0, k_offset));
            stages.load_a(ctx, stage, a, &task.layout_a, MatrixCoord::new(actual.m, k_len))?;

            let row = k_offset / SPARSE_GROUP * SPARSE_KEPT;
            let offset = task.layout_b.offset(row, 0);
            let shape = MatrixCoord::new(k_len / SPARSE_GROUP * SPARSE_KEPT, actual.n);
            stages.load_b_with(ctx, stage, |ctx, dst| {
                Self::load_compressed(
                    ctx,
                    dst,
                    task.b.offset(offset),
                    index_base.offset(offset),
                    &task.layout_b,
                    shape,
                )
            })
        };
        let fill = move |ctx: &mut CoreContext<'_>, dst, src, k_origin, part| {
            Self::expand(ctx, dst, &operand, src, k_origin, part)
        };

        self.stages.run_with(ctx, actual, 0, false, false, load, fill)?;
        self.stages.store(ctx, out, actual.mn())
    }

    fn finish(self, ctx: &mut CoreContext<'_>) -> DeviceResult {
        self.stages.finish(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test_log::test]
    fn compress_keeps_positions() {
        // k = 4, n = 2: column 0 keeps rows 1 and 3, column 1 keeps only row 2.
        let dense = [0, 0, 5, 0, 0, 7, -2, 0];
        let (values, index) = compress_2_4(&dense, 4, 2).unwrap();

        assert_eq!(values, vec![5, 7, -2, 0]);
        assert_eq!(index, vec![1, 2, 3, 0]);
    }

    #[test_log::test]
    fn compress_rejects_dense_groups() {
        let dense = [1, 1, 1, 0];

        assert_eq!(compress_2_4(&dense, 4, 1), None);
        assert_eq!(compress_2_4(&dense[..3], 3, 1), None);
    }
}
