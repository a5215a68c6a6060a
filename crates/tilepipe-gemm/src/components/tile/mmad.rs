use tilepipe_runtime::arch::{C0_NUM_PER_FRACTAL, round_up};
use tilepipe_runtime::sync::Pipe;
use tilepipe_runtime::{Accumulator, CoreContext, DeviceResult, Element, LocalTensor};

use crate::components::{FractalLayout, GemmCoord, TileLayout};

/// Below this many 16x16 output fractals the matrix pipe is drained after the instruction.
pub const PIPE_M_BARRIER_THRESHOLD: usize = 10;

/// Operand tiles of one matrix engine instruction together with their on-chip layouts.
#[derive(Debug, Clone, Copy, new)]
pub struct MmadOperands<A: Element, B: Element, Acc: Element> {
    pub a: LocalTensor<A>,
    pub layout_a: FractalLayout,
    pub b: LocalTensor<B>,
    pub layout_b: FractalLayout,
    pub c: LocalTensor<Acc>,
    pub layout_c: FractalLayout,
}

/// `C (+)= A x B` over the `shape` region of the operand tiers.
///
/// With `init` the accumulator is overwritten instead of accumulated into.
pub fn tile_mmad<A: Element, B: Element, Acc: Accumulator>(
    ctx: &mut CoreContext<'_>,
    operands: &MmadOperands<A, B, Acc>,
    shape: GemmCoord,
    init: bool,
) -> DeviceResult {
    let MmadOperands {
        a,
        layout_a,
        b,
        layout_b,
        c,
        layout_c,
    } = operands;
    let (lhs, rhs, acc) = ctx.resource_mut().mmad_views(*a, *b, *c)?;

    let mut row = vec![Acc::default(); shape.k];
    let mut column = vec![vec![Acc::default(); shape.k]; shape.n];
    for (j, column) in column.iter_mut().enumerate() {
        for (p, value) in column.iter_mut().enumerate() {
            *value = Acc::widen(rhs[layout_b.offset(p, j)]);
        }
    }

    for i in 0..shape.m {
        for (p, value) in row.iter_mut().enumerate() {
            *value = Acc::widen(lhs[layout_a.offset(i, p)]);
        }
        for (j, column) in column.iter().enumerate() {
            let sum = row
                .iter()
                .zip(column)
                .fold(Acc::default(), |sum, (l, r)| sum.mac(*l, *r));
            let out = &mut acc[layout_c.offset(i, j)];
            *out = if init { sum } else { out.accumulate(sum) };
        }
    }

    ctx.stats_mut().mmad += 1;
    let fractals = (round_up(shape.m, C0_NUM_PER_FRACTAL) / C0_NUM_PER_FRACTAL)
        * (round_up(shape.n, C0_NUM_PER_FRACTAL) / C0_NUM_PER_FRACTAL);
    if fractals < PIPE_M_BARRIER_THRESHOLD {
        ctx.pipe_barrier(Pipe::M);
    }
    Ok(())
}
