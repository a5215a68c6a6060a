use tilepipe_runtime::arch::TierKind;
use tilepipe_runtime::sync::{HardEvent, StageSlot};
use tilepipe_runtime::{CoreContext, DeviceResult, Element, GlobalTensor};

use crate::components::tile::{strided_runs, vec_map, vec_zip};
use crate::components::{
    MatrixCoord, MatrixLayout, RowMajor, TierAllocator, TileLayout, drain_all, prime_all,
};

/// Elements of one epilogue chunk.
pub const EPILOGUE_COMPUTE_LENGTH: usize = 8192;
/// Rotating chunk buffers per operand.
pub const EPILOGUE_BUFFER_NUM: usize = 2;

/// Element-wise step applied by the vector engines to a finished accumulator tile.
pub trait TileEpilogue<Acc: Element, C: Element>: Copy + Send + Sync + 'static {
    /// Whether [`apply`](Self::apply) needs the source matrix.
    fn reads_source(&self) -> bool;

    fn apply(&self, x: Acc, source: C) -> C;
}

/// `D = alpha * X + beta * C`.
#[derive(Debug, Clone, Copy, PartialEq, new)]
pub struct LinearCombination {
    pub alpha: f64,
    pub beta: f64,
}

impl<Acc: Element, C: Element> TileEpilogue<Acc, C> for LinearCombination {
    fn reads_source(&self) -> bool {
        self.beta != 0.0
    }

    fn apply(&self, x: Acc, source: C) -> C {
        C::from_f64(self.alpha * x.to_f64() + self.beta * source.to_f64())
    }
}

/// Plain cast to the output type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Identity;

impl<Acc: Element, C: Element> TileEpilogue<Acc, C> for Identity {
    fn reads_source(&self) -> bool {
        false
    }

    fn apply(&self, x: Acc, _source: C) -> C {
        x.cast()
    }
}

/// Where an epilogue reads and writes one output tile. Every tensor points at the tile origin.
#[derive(Debug, Clone, Copy, new)]
pub struct EpilogueTile<Acc: Element, C: Element> {
    /// Accumulator tile written by the matrix engine.
    pub x: GlobalTensor<Acc>,
    pub x_layout: RowMajor,
    pub source: GlobalTensor<C>,
    pub source_layout: RowMajor,
    pub dst: GlobalTensor<C>,
    pub dst_layout: RowMajor,
}

/// Vector engine half of a matmul with an epilogue.
///
/// Each vector engine of a pair takes its share of the tile rows and streams them through the
/// scratch tier in chunks, double buffered: chunk `i + 1` loads while chunk `i` computes.
pub struct BlockEpilogue<Acc: Element, C: Element, Ep: TileEpilogue<Acc, C>> {
    x: Vec<StageSlot<Acc>>,
    source: Vec<StageSlot<C>>,
    out: Vec<StageSlot<C>>,
    cursor: usize,
    epilogue: Ep,
}

impl<Acc: Element, C: Element, Ep: TileEpilogue<Acc, C>> BlockEpilogue<Acc, C, Ep> {
    pub fn new(
        ctx: &mut CoreContext<'_>,
        allocator: &mut TierAllocator,
        epilogue: Ep,
    ) -> DeviceResult<Self> {
        let (len, num) = (EPILOGUE_COMPUTE_LENGTH, EPILOGUE_BUFFER_NUM);
        let second = num as u8;
        let x = allocator.stages(TierKind::Ub, len, num, HardEvent::VMte2, HardEvent::Mte2V, 0)?;
        let source =
            allocator.stages(TierKind::Ub, len, num, HardEvent::VMte2, HardEvent::Mte2V, second)?;
        let out = allocator.stages(TierKind::Ub, len, num, HardEvent::Mte3V, HardEvent::VMte3, 0)?;
        prime_all(ctx, &x)?;
        prime_all(ctx, &source)?;
        prime_all(ctx, &out)?;

        Ok(Self {
            x,
            source,
            out,
            cursor: 0,
            epilogue,
        })
    }

    /// Applies the epilogue to this core's rows of a `shape` tile.
    pub fn run(
        &mut self,
        ctx: &mut CoreContext<'_>,
        tile: &EpilogueTile<Acc, C>,
        shape: MatrixCoord,
    ) -> DeviceResult {
        let per_sub = shape.row.div_ceil(ctx.sub_block_num());
        let first = ctx.sub_block_idx() * per_sub;
        let last = (first + per_sub).min(shape.row);
        if first >= last || shape.column == 0 {
            return Ok(());
        }

        let chunk_rows = (EPILOGUE_COMPUTE_LENGTH / shape.column).max(1);
        for row in (first..last).step_by(chunk_rows) {
            let rows = chunk_rows.min(last - row);
            self.chunk(ctx, tile, row, MatrixCoord::new(rows, shape.column))?;
        }
        Ok(())
    }

    fn chunk(
        &mut self,
        ctx: &mut CoreContext<'_>,
        tile: &EpilogueTile<Acc, C>,
        row: usize,
        shape: MatrixCoord,
    ) -> DeviceResult {
        let slot = self.cursor % EPILOGUE_BUFFER_NUM;
        self.cursor += 1;
        let (rows, columns) = (shape.row, shape.column);
        let epilogue = self.epilogue;

        let write = self.x[slot].acquire_write(ctx.events())?;
        let x = tile.x.offset(tile.x_layout.offset(row, 0));
        let runs = strided_runs(rows, columns, tile.x_layout.stride(), columns);
        ctx.copy_gm_to_local(write.tensor(), x, runs)?;
        write.commit()?;

        let source = if epilogue.reads_source() {
            let write = self.source[slot].acquire_write(ctx.events())?;
            let src = tile.source.offset(tile.source_layout.offset(row, 0));
            let runs = strided_runs(rows, columns, tile.source_layout.stride(), columns);
            ctx.copy_gm_to_local(write.tensor(), src, runs)?;
            write.commit()?;
            Some(self.source[slot].acquire_read(ctx.events())?)
        } else {
            None
        };

        let read = self.x[slot].acquire_read(ctx.events())?;
        let out = self.out[slot].acquire_write(ctx.events())?;
        let dst = out.tensor().slice(0, shape.count());
        match &source {
            Some(source) => vec_zip(ctx, dst, read.tensor(), source.tensor(), |x, c| {
                epilogue.apply(x, c)
            })?,
            None => vec_map(ctx, dst, read.tensor(), |x| epilogue.apply(x, C::default()))?,
        }
        read.release()?;
        if let Some(source) = source {
            source.release()?;
        }
        out.commit()?;

        let read = self.out[slot].acquire_read(ctx.events())?;
        let dst = tile.dst.offset(tile.dst_layout.offset(row, 0));
        let runs = strided_runs(rows, columns, columns, tile.dst_layout.stride());
        ctx.copy_local_to_gm(dst, read.tensor(), runs)?;
        read.release()
    }

    pub fn finish(self, ctx: &mut CoreContext<'_>) -> DeviceResult {
        drain_all(ctx, &self.x)?;
        drain_all(ctx, &self.source)?;
        drain_all(ctx, &self.out)
    }
}
