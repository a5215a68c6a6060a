use tilepipe_runtime::arch::TierKind;
use tilepipe_runtime::sync::HardEvent;
use tilepipe_runtime::{
    Accumulator, CopyRun, CoreContext, DeviceResult, Element, GlobalTensor, LocalTensor,
};

use crate::components::tile::{strided_runs, vec_cast, vec_zip};
use crate::components::{MatrixCoord, MatrixLayout, RowMajor, TierAllocator, TileLayout};

/// Elements summed per vector instruction.
pub const REDUCE_COMPUTE_LENGTH: usize = 8192;

/// Runs moving the flat range `start..start + len` of a dense `columns` wide matrix to a
/// destination with row stride `stride`.
pub fn flat_runs(start: usize, len: usize, columns: usize, stride: usize) -> Vec<CopyRun> {
    let mut runs = Vec::new();
    let end = start + len;
    let mut at = start;
    while at < end {
        let (row, column) = (at / columns, at % columns);
        let take = (columns - column).min(end - at);
        runs.push(CopyRun::new(at - start, row * stride + column, take));
        at += take;
    }
    runs
}

/// Vector engine sum of accumulator partials, cast to the output type.
///
/// Used to finish split-K, where every K slice wrote a full `m x n` partial, and the stream-K
/// fixup, where a tile was accumulated piecewise by several cores.
pub struct ReduceAdd<Acc: Accumulator, C: Element> {
    acc: LocalTensor<Acc>,
    add: LocalTensor<Acc>,
    out: LocalTensor<C>,
}

impl<Acc: Accumulator, C: Element> ReduceAdd<Acc, C> {
    pub fn new(allocator: &mut TierAllocator) -> DeviceResult<Self> {
        Ok(Self {
            acc: allocator.alloc(TierKind::Ub, REDUCE_COMPUTE_LENGTH)?,
            add: allocator.alloc(TierKind::Ub, REDUCE_COMPUTE_LENGTH)?,
            out: allocator.alloc(TierKind::Ub, REDUCE_COMPUTE_LENGTH)?,
        })
    }

    /// Sums `slices` dense partials of `shape`, laid out back to back from `src`, into `dst`.
    ///
    /// Elements are split in chunks handed out round-robin to every vector engine of the launch.
    pub fn run(
        &mut self,
        ctx: &mut CoreContext<'_>,
        dst: GlobalTensor<C>,
        layout: &RowMajor,
        src: GlobalTensor<Acc>,
        shape: MatrixCoord,
        slices: usize,
    ) -> DeviceResult {
        let lanes = ctx.block_num() * ctx.sub_block_num();
        let total = shape.count();
        let chunks = total.div_ceil(REDUCE_COMPUTE_LENGTH);

        for chunk in (ctx.block_idx()..chunks).step_by(lanes) {
            let start = chunk * REDUCE_COMPUTE_LENGTH;
            let len = REDUCE_COMPUTE_LENGTH.min(total - start);
            let sources: Vec<_> = (0..slices)
                .map(|slice| (src.offset(slice * total + start), vec![CopyRun::new(0, 0, len)]))
                .collect();
            let store = flat_runs(start, len, shape.column, layout.stride());
            self.reduce_chunk(ctx, &sources, len, dst, store)?;
        }
        Ok(())
    }

    /// Sums the `shape` region of every tile in `sources`, each laid out as `src_layout`, into
    /// `dst`. The whole tile is handled by the calling core.
    pub fn run_tiles(
        &mut self,
        ctx: &mut CoreContext<'_>,
        dst: GlobalTensor<C>,
        layout: &RowMajor,
        sources: &[GlobalTensor<Acc>],
        src_layout: &RowMajor,
        shape: MatrixCoord,
    ) -> DeviceResult {
        if shape.column == 0 {
            return Ok(());
        }
        let chunk_rows = (REDUCE_COMPUTE_LENGTH / shape.column).max(1);

        for first in (0..shape.row).step_by(chunk_rows) {
            let rows = chunk_rows.min(shape.row - first);
            let loads: Vec<_> = sources
                .iter()
                .map(|src| {
                    let runs = strided_runs(rows, shape.column, src_layout.stride(), shape.column);
                    (src.offset(src_layout.offset(first, 0)), runs.collect())
                })
                .collect();
            let store = strided_runs(rows, shape.column, shape.column, layout.stride()).collect();
            let target = dst.offset(layout.offset(first, 0));
            self.reduce_chunk(ctx, &loads, rows * shape.column, target, store)?;
        }
        Ok(())
    }

    fn reduce_chunk(
        &mut self,
        ctx: &mut CoreContext<'_>,
        sources: &[(GlobalTensor<Acc>, Vec<CopyRun>)],
        len: usize,
        dst: GlobalTensor<C>,
        store: Vec<CopyRun>,
    ) -> DeviceResult {
        let Some(((first, runs), rest)) = sources.split_first() else {
            return Ok(());
        };
        let (acc, add, out) = (self.acc.slice(0, len), self.add.slice(0, len), self.out.slice(0, len));

        ctx.copy_gm_to_local(acc, *first, runs.iter().copied())?;
        ctx.events().sync(HardEvent::Mte2V, 0)?;
        for (src, runs) in rest {
            ctx.copy_gm_to_local(add, *src, runs.iter().copied())?;
            ctx.events().sync(HardEvent::Mte2V, 0)?;
            vec_zip(ctx, acc, acc, add, Acc::accumulate)?;
            ctx.events().sync(HardEvent::VMte2, 0)?;
        }

        vec_cast(ctx, out, acc)?;
        ctx.events().sync(HardEvent::VMte3, 0)?;
        ctx.copy_local_to_gm(dst, out, store)?;
        ctx.events().sync(HardEvent::Mte3V, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test_log::test]
    fn flat_ranges_split_at_row_ends() {
        let runs = flat_runs(6, 7, 4, 10);

        assert_eq!(
            runs,
            vec![
                CopyRun::new(0, 12, 2),
                CopyRun::new(2, 20, 4),
                CopyRun::new(6, 30, 1),
            ]
        );
    }

    #[test_log::test]
    fn flat_ranges_inside_one_row() {
        assert_eq!(flat_runs(1, 2, 8, 8), vec![CopyRun::new(0, 1, 2)]);
        assert!(flat_runs(0, 0, 8, 8).is_empty());
    }
}
