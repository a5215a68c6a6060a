use tilepipe_runtime::{CopyRun, CoreContext, DeviceResult, Element, GlobalTensor, LocalTensor};

use crate::components::{FractalLayout, MatrixCoord, RowMajor, TileLayout, copy_runs};

/// View of a layout starting at `(row, column)` of its parent.
#[derive(Debug, Clone, Copy, new)]
pub struct Shifted<'a, L: ?Sized> {
    inner: &'a L,
    row: usize,
    column: usize,
}

impl<L: TileLayout + ?Sized> TileLayout for Shifted<'_, L> {
    fn offset(&self, row: usize, column: usize) -> usize {
        self.inner.offset(row + self.row, column + self.column)
    }

    fn row_contiguous(&self) -> bool {
        self.inner.row_contiguous()
    }
}

/// Global memory to staging tier. `src` points at the tile origin and `layout` carries the
/// stride of the whole matrix.
pub fn copy_gm_to_l1<E: Element, L: TileLayout>(
    ctx: &mut CoreContext<'_>,
    dst: LocalTensor<E>,
    staging: &FractalLayout,
    src: GlobalTensor<E>,
    layout: &L,
    shape: MatrixCoord,
) -> DeviceResult {
    let runs = copy_runs(layout, staging, shape.row, shape.column);
    ctx.copy_gm_to_local(dst, src, runs)
}

/// Staging tier to an operand tier, taking the `shape` region at `origin` of the staged tile.
pub fn copy_l1_to_l0<E: Element>(
    ctx: &mut CoreContext<'_>,
    dst: LocalTensor<E>,
    operand: &FractalLayout,
    src: LocalTensor<E>,
    staging: &FractalLayout,
    origin: MatrixCoord,
    shape: MatrixCoord,
) -> DeviceResult {
    let shifted = Shifted::new(staging, origin.row, origin.column);
    let runs = copy_runs(&shifted, operand, shape.row, shape.column);
    ctx.copy_local(dst, src, runs)
}

/// Accumulator write-back into a row-major destination, converting to `D` and multiplying by
/// `scale` on the way.
pub fn copy_l0c_to_gm<Acc: Element, D: Element>(
    ctx: &mut CoreContext<'_>,
    dst: GlobalTensor<D>,
    layout: &RowMajor,
    src: LocalTensor<Acc>,
    accumulator: &FractalLayout,
    shape: MatrixCoord,
    scale: f64,
) -> DeviceResult {
    let runs = copy_runs(accumulator, layout, shape.row, shape.column);
    ctx.fixpipe_scaled(dst, src, runs, scale)
}

/// `lines` runs of `line_len` elements between two strided buffers.
pub fn strided_runs(
    lines: usize,
    line_len: usize,
    src_stride: usize,
    dst_stride: usize,
) -> impl Iterator<Item = CopyRun> {
    let contiguous = line_len == src_stride && line_len == dst_stride;
    let (lines, line_len) = if contiguous {
        (lines.min(1), lines * line_len)
    } else {
        (lines, line_len)
    };
    (0..lines).map(move |line| CopyRun::new(line * src_stride, line * dst_stride, line_len))
}

/// One contiguous run of `len` elements.
pub fn contiguous(len: usize) -> [CopyRun; 1] {
    [CopyRun::new(0, 0, len)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::{FractalOrder, MatrixLayout};
    use pretty_assertions::assert_eq;

    #[test_log::test]
    fn shifted_layout_offsets_into_the_parent() {
        let parent = RowMajor::new(4, 8);
        let shifted = Shifted::new(&parent, 1, 2);

        assert_eq!(shifted.offset(0, 0), 10);
        assert_eq!(shifted.offset(2, 3), 29);
    }

    #[test_log::test]
    fn staging_to_l0_reorders_fractals() {
        let staging = FractalLayout::new(FractalOrder::zN, MatrixCoord::new(16, 16), 32, 32);
        let l0a = FractalLayout::new(FractalOrder::zZ, MatrixCoord::new(16, 16), 32, 16);
        let shifted = Shifted::new(&staging, 0, 16);
        let runs = copy_runs(&shifted, &l0a, 32, 16);

        // The second fractal column of the staged tile is one contiguous block of 512.
        assert_eq!(runs, vec![CopyRun::new(512, 0, 512)]);
    }

    #[test_log::test]
    fn strided_runs_merge_when_dense() {
        assert_eq!(strided_runs(4, 8, 8, 8).collect::<Vec<_>>(), vec![CopyRun::new(0, 0, 32)]);
        assert_eq!(
            strided_runs(2, 8, 10, 16).collect::<Vec<_>>(),
            vec![CopyRun::new(0, 0, 8), CopyRun::new(10, 16, 8)]
        );
        assert_eq!(strided_runs(0, 8, 8, 8).count(), 0);
    }

    #[test_log::test]
    fn row_major_tile_layout_keeps_stride() {
        let parent = RowMajor::new(300, 300);
        let tile = parent.tile_layout(MatrixCoord::new(16, 16));

        assert_eq!(tile.offset(1, 0), 300);
    }
}
