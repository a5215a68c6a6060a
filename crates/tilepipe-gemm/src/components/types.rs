use core::marker::PhantomData;
use tilepipe_runtime::{Accumulator, AccumulatorSelector, Element};

use super::MatrixLayout;

/// Element types and global memory layouts of one matmul.
pub trait GemmTypes: Send + Sync + 'static {
    /// Left operand.
    type A: Element;
    type LayoutA: MatrixLayout;
    /// Right operand.
    type B: Element;
    type LayoutB: MatrixLayout;
    /// Output.
    type C: Element;
    /// What the matrix engine accumulates into.
    type Acc: Accumulator;
}

/// [`GemmTypes`] with the accumulator picked from the operand types.
pub struct MatmulTypes<A, LA, B, LB, C> {
    _phantom: PhantomData<fn() -> (A, LA, B, LB, C)>,
}

impl<A, LA, B, LB, C> GemmTypes for MatmulTypes<A, LA, B, LB, C>
where
    A: AccumulatorSelector<B>,
    LA: MatrixLayout,
    B: Element,
    LB: MatrixLayout,
    C: Element,
{
    type A = A;
    type LayoutA = LA;
    type B = B;
    type LayoutB = LB;
    type C = C;
    type Acc = <A as AccumulatorSelector<B>>::Accumulator;
}

pub type AccG<T> = <T as GemmTypes>::Acc;
