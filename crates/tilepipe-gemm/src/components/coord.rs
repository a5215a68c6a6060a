use core::fmt::Display;
use core::ops::{Add, Mul};

/// Position or extent in the (M, N, K) iteration space of a matmul.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct GemmCoord {
    pub m: usize,
    pub n: usize,
    pub k: usize,
}

impl GemmCoord {
    pub const fn new(m: usize, n: usize, k: usize) -> Self {
        Self { m, n, k }
    }

    pub const fn mn(&self) -> MatrixCoord {
        MatrixCoord::new(self.m, self.n)
    }

    pub const fn mk(&self) -> MatrixCoord {
        MatrixCoord::new(self.m, self.k)
    }

    pub const fn kn(&self) -> MatrixCoord {
        MatrixCoord::new(self.k, self.n)
    }

    /// Number of tiles of `tile` needed to cover `self` along each axis.
    pub const fn ceil_div(&self, tile: GemmCoord) -> GemmCoord {
        GemmCoord::new(
            self.m.div_ceil(tile.m),
            self.n.div_ceil(tile.n),
            self.k.div_ceil(tile.k),
        )
    }

    pub const fn volume(&self) -> usize {
        self.m * self.n * self.k
    }
}

impl Display for GemmCoord {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}x{}x{}", self.m, self.n, self.k)
    }
}

/// Row and column of a matrix element or tile.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct MatrixCoord {
    pub row: usize,
    pub column: usize,
}

impl MatrixCoord {
    pub const fn new(row: usize, column: usize) -> Self {
        Self { row, column }
    }

    pub const fn ceil_div(&self, tile: MatrixCoord) -> MatrixCoord {
        MatrixCoord::new(self.row.div_ceil(tile.row), self.column.div_ceil(tile.column))
    }

    pub const fn count(&self) -> usize {
        self.row * self.column
    }
}

impl Add for MatrixCoord {
    type Output = MatrixCoord;

    fn add(self, rhs: Self) -> Self::Output {
        MatrixCoord::new(self.row + rhs.row, self.column + rhs.column)
    }
}

impl Mul for MatrixCoord {
    type Output = MatrixCoord;

    fn mul(self, rhs: Self) -> Self::Output {
        MatrixCoord::new(self.row * rhs.row, self.column * rhs.column)
    }
}

impl Display for MatrixCoord {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "({}, {})", self.row, self.column)
    }
}
