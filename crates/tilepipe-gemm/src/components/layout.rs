use super::MatrixCoord;
use core::fmt::Debug;
use tilepipe_runtime::arch::{C0_NUM_PER_FRACTAL, L0C_FRACTAL, round_up};
use tilepipe_runtime::{CopyRun, Element};

/// Largest leading stride, in elements, a single DMA burst descriptor can express.
pub const MAX_DMA_STRIDE: usize = 65536;

/// Stride alignment of padded workspaces, in elements.
pub const fn padding_align<E>() -> usize {
    if size_of::<E>() >= 4 { 128 } else { 256 }
}

/// Memory order of a matrix in global memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum LayoutKind {
    RowMajor,
    ColumnMajor,
}

/// Maps a (row, column) position to an element offset.
pub trait TileLayout {
    fn offset(&self, row: usize, column: usize) -> usize;

    /// Whether two horizontally adjacent elements are adjacent in memory.
    fn row_contiguous(&self) -> bool;
}

/// Addressing of a matrix in global memory.
///
/// A matrix is a sequence of `lines` (rows for row-major, columns for column-major) of
/// `line_len` elements, consecutive lines being `stride` elements apart.
pub trait MatrixLayout:
    TileLayout + Copy + Debug + PartialEq + Eq + Send + Sync + 'static
{
    const KIND: LayoutKind;

    fn with_stride(rows: usize, columns: usize, stride: usize) -> Self;

    fn rows(&self) -> usize;
    fn columns(&self) -> usize;
    fn stride(&self) -> usize;

    /// Densely packed layout.
    fn packed(rows: usize, columns: usize) -> Self {
        let line_len = match Self::KIND {
            LayoutKind::RowMajor => columns,
            LayoutKind::ColumnMajor => rows,
        };
        Self::with_stride(rows, columns, line_len)
    }

    fn shape(&self) -> MatrixCoord {
        MatrixCoord::new(self.rows(), self.columns())
    }

    fn lines(&self) -> usize {
        match Self::KIND {
            LayoutKind::RowMajor => self.rows(),
            LayoutKind::ColumnMajor => self.columns(),
        }
    }

    fn line_len(&self) -> usize {
        match Self::KIND {
            LayoutKind::RowMajor => self.columns(),
            LayoutKind::ColumnMajor => self.rows(),
        }
    }

    fn offset_of(&self, coord: MatrixCoord) -> usize {
        self.offset(coord.row, coord.column)
    }

    /// Layout of a sub matrix of `shape`, sharing the parent stride.
    fn tile_layout(&self, shape: MatrixCoord) -> Self {
        Self::with_stride(shape.row, shape.column, self.stride())
    }

    /// Same logical shape with the stride rounded up to `align` elements. `align == 0` leaves the
    /// layout unchanged.
    fn padded(&self, align: usize) -> Self {
        if align == 0 {
            return *self;
        }
        Self::with_stride(self.rows(), self.columns(), round_up(self.line_len(), align))
    }

    /// Whether the matrix must go through a padded workspace before the block pipeline reads it.
    fn needs_padding(&self, align: usize) -> bool {
        if self.stride() >= MAX_DMA_STRIDE {
            return true;
        }
        align != 0 && self.stride() % align != 0
    }

    /// Elements reserved by a workspace with this layout.
    fn workspace_len(&self) -> usize {
        self.lines() * self.stride()
    }

    /// Elements spanned from the first to the last addressed element.
    fn storage_len(&self) -> usize {
        match self.lines() {
            0 => 0,
            lines => (lines - 1) * self.stride() + self.line_len(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct RowMajor {
    rows: usize,
    columns: usize,
    stride: usize,
}

impl RowMajor {
    pub fn new(rows: usize, columns: usize) -> Self {
        Self::packed(rows, columns)
    }
}

impl TileLayout for RowMajor {
    fn offset(&self, row: usize, column: usize) -> usize {
        row * self.stride + column
    }

    fn row_contiguous(&self) -> bool {
        true
    }
}

impl MatrixLayout for RowMajor {
    const KIND: LayoutKind = LayoutKind::RowMajor;

    fn with_stride(rows: usize, columns: usize, stride: usize) -> Self {
        Self {
            rows,
            columns,
            stride,
        }
    }

    fn rows(&self) -> usize {
        self.rows
    }

    fn columns(&self) -> usize {
        self.columns
    }

    fn stride(&self) -> usize {
        self.stride
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct ColumnMajor {
    rows: usize,
    columns: usize,
    stride: usize,
}

impl ColumnMajor {
    pub fn new(rows: usize, columns: usize) -> Self {
        Self::packed(rows, columns)
    }
}

impl TileLayout for ColumnMajor {
    fn offset(&self, row: usize, column: usize) -> usize {
        column * self.stride + row
    }

    fn row_contiguous(&self) -> bool {
        false
    }
}

impl MatrixLayout for ColumnMajor {
    const KIND: LayoutKind = LayoutKind::ColumnMajor;

    fn with_stride(rows: usize, columns: usize, stride: usize) -> Self {
        Self {
            rows,
            columns,
            stride,
        }
    }

    fn rows(&self) -> usize {
        self.rows
    }

    fn columns(&self) -> usize {
        self.columns
    }

    fn stride(&self) -> usize {
        self.stride
    }
}

/// Order of the fractals of an on-chip tile, and of the elements inside one fractal.
///
/// The first letter is the order inside a fractal (`z` row-major, `n` column-major), the second
/// the order of the fractals themselves (`Z` row-major, `N` column-major).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FractalOrder {
    #[allow(non_camel_case_types)]
    zN,
    #[allow(non_camel_case_types)]
    zZ,
    #[allow(non_camel_case_types)]
    nZ,
}

/// Fractal addressing of an on-chip tile.
///
/// `rows` and `columns` are rounded up to the fractal shape, so a tile always holds whole
/// fractals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FractalLayout {
    pub order: FractalOrder,
    pub fractal_rows: usize,
    pub fractal_columns: usize,
    pub rows: usize,
    pub columns: usize,
}

impl FractalLayout {
    pub fn new(
        order: FractalOrder,
        fractal: MatrixCoord,
        rows: usize,
        columns: usize,
    ) -> Self {
        Self {
            order,
            fractal_rows: fractal.row,
            fractal_columns: fractal.column,
            rows: round_up(rows, fractal.row),
            columns: round_up(columns, fractal.column),
        }
    }

    /// Staging tier layout of an operand read from global memory with layout `L`.
    ///
    /// Row-major operands keep 16 rows of one 32 byte block per fractal. Column-major operands use
    /// the transposed fractal, one 32 byte block of rows per column.
    pub fn staging<E: Element, L: MatrixLayout>(rows: usize, columns: usize) -> Self {
        match L::KIND {
            LayoutKind::RowMajor => Self::new(
                FractalOrder::zN,
                MatrixCoord::new(C0_NUM_PER_FRACTAL, E::PER_C0),
                rows,
                columns,
            ),
            LayoutKind::ColumnMajor => Self::new(
                FractalOrder::nZ,
                MatrixCoord::new(E::PER_C0, C0_NUM_PER_FRACTAL),
                rows,
                columns,
            ),
        }
    }

    /// Left operand tier layout of an `m x k` tile.
    pub fn l0a<E: Element>(m: usize, k: usize) -> Self {
        Self::new(
            FractalOrder::zZ,
            MatrixCoord::new(C0_NUM_PER_FRACTAL, E::PER_C0),
            m,
            k,
        )
    }

    /// Right operand tier layout of a `k x n` tile.
    pub fn l0b<E: Element>(k: usize, n: usize) -> Self {
        Self::new(
            FractalOrder::nZ,
            MatrixCoord::new(E::PER_C0, C0_NUM_PER_FRACTAL),
            k,
            n,
        )
    }

    /// Accumulator tier layout of an `m x n` tile.
    pub fn l0c(m: usize, n: usize) -> Self {
        Self::new(
            FractalOrder::zN,
            MatrixCoord::new(L0C_FRACTAL, L0C_FRACTAL),
            m,
            n,
        )
    }

    /// Elements covered by the tile, padding included.
    pub fn len(&self) -> usize {
        self.rows * self.columns
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TileLayout for FractalLayout {
    fn offset(&self, row: usize, column: usize) -> usize {
        let (fr, fc) = (self.fractal_rows, self.fractal_columns);
        let fractal = fr * fc;
        match self.order {
            FractalOrder::zN => (column / fc) * (self.rows * fc) + row * fc + column % fc,
            FractalOrder::zZ => {
                (row / fr) * (fr * self.columns) + (column / fc) * fractal + (row % fr) * fc + column % fc
            }
            FractalOrder::nZ => {
                (row / fr) * (fr * self.columns) + (column / fc) * fractal + (column % fc) * fr + row % fr
            }
        }
    }

    fn row_contiguous(&self) -> bool {
        !matches!(self.order, FractalOrder::nZ)
    }
}

/// Contiguous runs moving a `rows x columns` region from `src` addressing to `dst` addressing.
///
/// Elements are visited in the destination's natural order and merged while both sides stay
/// contiguous.
pub fn copy_runs<S: TileLayout + ?Sized, D: TileLayout + ?Sized>(
    src: &S,
    dst: &D,
    rows: usize,
    columns: usize,
) -> Vec<CopyRun> {
    let mut runs: Vec<CopyRun> = Vec::new();
    let mut push = |row: usize, column: usize| {
        let (from, to) = (src.offset(row, column), dst.offset(row, column));
        if let Some(last) = runs.last_mut()
            && last.src + last.len == from
            && last.dst + last.len == to
        {
            last.len += 1;
            return;
        }
        runs.push(CopyRun::new(from, to, 1));
    };

    if dst.row_contiguous() {
        for row in 0..rows {
            for column in 0..columns {
                push(row, column);
            }
        }
    } else {
        for column in 0..columns {
            for row in 0..rows {
                push(row, column);
            }
        }
    }
    runs
}

#[cfg(test)]
mod tests {
    use super::*;
    use half::f16;

    #[test_log::test]
    fn row_and_column_major_offsets_mirror() {
        let row = RowMajor::with_stride(4, 6, 8);
        let column = ColumnMajor::with_stride(6, 4, 8);

        assert_eq!(row.offset(2, 5), 21);
        assert_eq!(column.offset(5, 2), 21);
        assert_eq!(row.storage_len(), 30);
        assert_eq!(row.workspace_len(), 32);
    }

    #[test_log::test]
    fn padding_rounds_the_line_length() {
        let layout = RowMajor::new(100, 300);
        let padded = layout.padded(256);

        assert!(layout.needs_padding(256));
        assert_eq!(padded.stride(), 512);
        assert_eq!(padded.shape(), layout.shape());
        assert!(!padded.needs_padding(256));
        assert_eq!(layout.padded(0), layout);
        assert_eq!(ColumnMajor::new(300, 7).padded(128).stride(), 384);
    }

    #[test_log::test]
    fn huge_strides_always_pad() {
        let layout = RowMajor::with_stride(2, 70_000, 70_144);

        assert!(layout.needs_padding(128));
        assert!(!RowMajor::new(8, 512).needs_padding(256));
    }

    #[test_log::test]
    fn fractal_orders() {
        let zn = FractalLayout::new(FractalOrder::zN, MatrixCoord::new(16, 16), 32, 32);
        let zz = FractalLayout::new(FractalOrder::zZ, MatrixCoord::new(16, 16), 32, 32);
        let nz = FractalLayout::new(FractalOrder::nZ, MatrixCoord::new(16, 16), 32, 32);

        // Second fractal of the first fractal row.
        assert_eq!(zn.offset(0, 16), 512);
        assert_eq!(zz.offset(0, 16), 256);
        assert_eq!(nz.offset(0, 16), 256);
        // Inside a fractal.
        assert_eq!(zz.offset(1, 2), 18);
        assert_eq!(nz.offset(1, 2), 33);
        assert_eq!(zn.offset(17, 0), 272);
    }

    #[test_log::test]
    fn fractal_shape_is_byte_driven() {
        let a16 = FractalLayout::l0a::<f16>(20, 20);
        let a8 = FractalLayout::l0a::<i8>(20, 20);

        assert_eq!((a16.fractal_rows, a16.fractal_columns), (16, 16));
        assert_eq!((a8.fractal_rows, a8.fractal_columns), (16, 32));
        assert_eq!((a8.rows, a8.columns), (32, 32));
        assert_eq!(FractalLayout::l0b::<i8>(20, 20).fractal_rows, 32);
    }

    #[test_log::test]
    fn runs_merge_contiguous_elements() {
        let src = RowMajor::new(2, 32);
        let dst = FractalLayout::staging::<f16, RowMajor>(2, 32);
        let runs = copy_runs(&src, &dst, 2, 32);

        // One run per row and per fractal column.
        assert_eq!(runs.len(), 4);
        assert!(runs.iter().all(|run| run.len == 16));
    }

    #[test_log::test]
    fn transposing_runs_are_single_elements() {
        let src = RowMajor::new(4, 4);
        let dst = ColumnMajor::new(4, 4);

        assert_eq!(copy_runs(&src, &dst, 4, 4).len(), 16);
    }
}
