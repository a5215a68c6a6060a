use serde::{Deserialize, Serialize};
use tilepipe_runtime::{DType, Element};

use super::{
    ColumnMajor, FormattedConfigError, GemmCoord, LayoutKind, MAX_DMA_STRIDE,
    MatmulAvailabilityError, MatmulSetupError, MatrixLayout, RowMajor,
};
use crate::Strategy;

/// One `C = A x B` as the host describes it: shape, global memory layouts and element types.
///
/// Strides are leading dimensions in elements. The output is always row-major.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GemmProblem {
    pub shape: GemmCoord,
    pub layout_a: LayoutKind,
    pub stride_a: usize,
    pub layout_b: LayoutKind,
    pub stride_b: usize,
    pub stride_c: usize,
    pub a: DType,
    pub b: DType,
    pub c: DType,
}

fn line_len(kind: LayoutKind, rows: usize, columns: usize) -> usize {
    match kind {
        LayoutKind::RowMajor => columns,
        LayoutKind::ColumnMajor => rows,
    }
}

impl GemmProblem {
    /// Densely packed operands of element types `A`, `B` and output `C`.
    pub fn packed<A: Element, B: Element, C: Element>(
        shape: GemmCoord,
        layout_a: LayoutKind,
        layout_b: LayoutKind,
    ) -> Self {
        Self {
            shape,
            layout_a,
            stride_a: line_len(layout_a, shape.m, shape.k),
            layout_b,
            stride_b: line_len(layout_b, shape.k, shape.n),
            stride_c: shape.n,
            a: A::DTYPE,
            b: B::DTYPE,
            c: C::DTYPE,
        }
    }

    pub fn with_strides(mut self, stride_a: usize, stride_b: usize, stride_c: usize) -> Self {
        self.stride_a = stride_a;
        self.stride_b = stride_b;
        self.stride_c = stride_c;
        self
    }

    /// Layout of `A` when it is stored as `L`.
    pub fn layout_a<L: MatrixLayout>(&self) -> L {
        L::with_stride(self.shape.m, self.shape.k, self.stride_a)
    }

    /// Layout of `B` when it is stored as `L`.
    pub fn layout_b<L: MatrixLayout>(&self) -> L {
        L::with_stride(self.shape.k, self.shape.n, self.stride_b)
    }

    pub fn layout_c(&self) -> RowMajor {
        RowMajor::with_stride(self.shape.m, self.shape.n, self.stride_c)
    }

    /// Elements of `A` addressed by its layout.
    pub fn storage_a(&self) -> usize {
        match self.layout_a {
            LayoutKind::RowMajor => self.layout_a::<RowMajor>().storage_len(),
            LayoutKind::ColumnMajor => self.layout_a::<ColumnMajor>().storage_len(),
        }
    }

    /// Elements of `B` addressed by its layout.
    pub fn storage_b(&self) -> usize {
        match self.layout_b {
            LayoutKind::RowMajor => self.layout_b::<RowMajor>().storage_len(),
            LayoutKind::ColumnMajor => self.layout_b::<ColumnMajor>().storage_len(),
        }
    }

    pub fn storage_c(&self) -> usize {
        self.layout_c().storage_len()
    }

    /// Checks that the problem is well formed and that `strategy` can run it.
    pub fn validate(&self, strategy: &Strategy) -> Result<(), MatmulSetupError> {
        let shape = self.shape;
        if shape.m == 0 || shape.n == 0 || shape.k == 0 {
            return Err(MatmulSetupError::InvalidConfig(FormattedConfigError::new(
                move || format!("Empty problem {shape}"),
            )));
        }

        let strides = [
            ("a", self.stride_a, line_len(self.layout_a, shape.m, shape.k)),
            ("b", self.stride_b, line_len(self.layout_b, shape.k, shape.n)),
            ("c", self.stride_c, shape.n),
        ];
        for (operand, stride, line) in strides {
            if stride < line {
                return Err(MatmulSetupError::InvalidConfig(FormattedConfigError::new(
                    move || {
                        format!("Stride {stride} of operand {operand} is shorter than its lines of {line} elements")
                    },
                )));
            }
        }

        if !strategy.pads_operands()
            && (self.stride_a >= MAX_DMA_STRIDE || self.stride_b >= MAX_DMA_STRIDE)
        {
            return Err(MatmulAvailabilityError::Strategy {
                strategy: format!("{strategy:?}"),
                reason: "an operand stride exceeds the DMA stride limit, use a padding strategy",
            }
            .into());
        }
        Ok(())
    }

    /// Checks the element types against the kernel's `A`, `B` and `C`.
    pub fn check_types<A: Element, B: Element, C: Element>(&self) -> Result<(), MatmulSetupError> {
        if (self.a, self.b, self.c) != (A::DTYPE, B::DTYPE, C::DTYPE) {
            return Err(MatmulAvailabilityError::Types {
                a: self.a,
                b: self.b,
                c: self.c,
            }
            .into());
        }
        Ok(())
    }
}
