use tilepipe_runtime::arch::TierKind;
use tilepipe_runtime::sync::{EventId, HardEvent, StageSlot, StageWrite};
use tilepipe_runtime::{
    Accumulator, CoreContext, DeviceResult, Element, GlobalTensor, LocalTensor,
};

use super::{BlockOutput, BlockTask};
use crate::components::tile::{MmadOperands, copy_gm_to_l1, copy_l0c_to_gm, copy_l1_to_l0, tile_mmad};
use crate::components::{
    FractalLayout, GemmCoord, GemmTypes, MatrixCoord, MatrixLayout, TierAllocator, TileLayout,
    drain_all, prime_all,
};

/// What a K loop asks its loader for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum KLoad {
    /// A K tile of the current task.
    Tile(usize),
    /// The first K tile of the next task.
    Next,
}

/// Default right operand move: a plain staging to operand tier copy.
fn operand_copy<B: Element>(
    staging: FractalLayout,
    operand: FractalLayout,
) -> impl FnMut(&mut CoreContext<'_>, LocalTensor<B>, LocalTensor<B>, usize, MatrixCoord) -> DeviceResult
{
    move |ctx, dst, src, k, part| {
        copy_l1_to_l0(ctx, dst, &operand, src, &staging, MatrixCoord::new(k, 0), part)
    }
}

/// Stage slots and cursors shared by the block strategies of the matrix engine.
///
/// Staging tier slots are guarded by `Mte1Mte2` (refill) and `Mte2Mte1` (consume), operand tier
/// slots by `MMte1` and `Mte1M`, the accumulator by `FixM` and `MFix`. Left operand slots take
/// event ids `0..S`, right operand slots `S..2S`.
pub(crate) struct MmadStages<A: Element, B: Element, Acc: Accumulator> {
    l1_a: Vec<StageSlot<A>>,
    l1_b: Vec<StageSlot<B>>,
    l0_a: Vec<StageSlot<A>>,
    l0_b: Vec<StageSlot<B>>,
    l0_c: StageSlot<Acc>,
    staging_a: FractalLayout,
    staging_b: FractalLayout,
    operand_a: FractalLayout,
    operand_b: FractalLayout,
    accumulator: FractalLayout,
    l1: GemmCoord,
    l0: GemmCoord,
    l1_cursor: usize,
    l0_cursor: usize,
    unit_flag: bool,
    acc: Option<StageWrite<Acc>>,
}

impl<A: Element, B: Element, Acc: Accumulator> MmadStages<A, B, Acc> {
    pub fn new<LA: MatrixLayout, LB: MatrixLayout>(
        ctx: &mut CoreContext<'_>,
        allocator: &mut TierAllocator,
        l1: GemmCoord,
        l0: GemmCoord,
        stages: usize,
        unit_flag: bool,
    ) -> DeviceResult<Self> {
        let staging_a = FractalLayout::staging::<A, LA>(l1.m, l1.k);
        let staging_b = FractalLayout::staging::<B, LB>(l1.k, l1.n);
        let operand_a = FractalLayout::l0a::<A>(l0.m, l0.k);
        let operand_b = FractalLayout::l0b::<B>(l0.k, l0.n);
        let accumulator = FractalLayout::l0c(l0.m, l0.n);
        let second = stages as EventId;

        let (l1_refill, l1_consume) = (HardEvent::Mte1Mte2, HardEvent::Mte2Mte1);
        let (l0_refill, l0_consume) = (HardEvent::MMte1, HardEvent::Mte1M);
        let l1_a = allocator.stages(TierKind::L1, staging_a.len(), stages, l1_refill, l1_consume, 0)?;
        let l1_b =
            allocator.stages(TierKind::L1, staging_b.len(), stages, l1_refill, l1_consume, second)?;
        let l0_a = allocator.stages(TierKind::L0A, operand_a.len(), stages, l0_refill, l0_consume, 0)?;
        let l0_b =
            allocator.stages(TierKind::L0B, operand_b.len(), stages, l0_refill, l0_consume, second)?;
        let l0_c = allocator.alloc::<Acc>(TierKind::L0C, accumulator.len())?;
        let l0_c = StageSlot::new(l0_c, HardEvent::FixM, HardEvent::MFix, 0);

        prime_all(ctx, &l1_a)?;
        prime_all(ctx, &l1_b)?;
        prime_all(ctx, &l0_a)?;
        prime_all(ctx, &l0_b)?;
        if !unit_flag {
            l0_c.prime(ctx.events())?;
        }

        Ok(Self {
            l1_a,
            l1_b,
            l0_a,
            l0_b,
            l0_c,
            staging_a,
            staging_b,
            operand_a,
            operand_b,
            accumulator,
            l1,
            l0,
            l1_cursor: 0,
            l0_cursor: 0,
            unit_flag,
            acc: None,
        })
    }

    pub fn l1(&self) -> GemmCoord {
        self.l1
    }

    pub fn stages(&self) -> usize {
        self.l1_a.len()
    }

    /// Number of staging tiles along K of `task`.
    pub fn k_tiles<T: GemmTypes<A = A, B = B>>(&self, task: &BlockTask<T>) -> usize {
        task.actual.k.div_ceil(self.l1.k)
    }

    pub fn k_tile_len(&self, k: usize, k_tile: usize) -> usize {
        (k - k_tile * self.l1.k).min(self.l1.k)
    }

    pub fn load_a<L: TileLayout>(
        &self,
        ctx: &mut CoreContext<'_>,
        stage: usize,
        src: GlobalTensor<A>,
        layout: &L,
        shape: MatrixCoord,
    ) -> DeviceResult {
        let write = self.l1_a[stage].acquire_write(ctx.events())?;
        copy_gm_to_l1(ctx, write.tensor(), &self.staging_a, src, layout, shape)?;
        write.commit()
    }

    pub fn load_b<L: TileLayout>(
        &self,
        ctx: &mut CoreContext<'_>,
        stage: usize,
        src: GlobalTensor<B>,
        layout: &L,
        shape: MatrixCoord,
    ) -> DeviceResult {
        let write = self.l1_b[stage].acquire_write(ctx.events())?;
        copy_gm_to_l1(ctx, write.tensor(), &self.staging_b, src, layout, shape)?;
        write.commit()
    }

    /// Fills the right operand staging slot with a custom copy.
    pub fn load_b_with(
        &self,
        ctx: &mut CoreContext<'_>,
        stage: usize,
        fill: impl FnOnce(&mut CoreContext<'_>, LocalTensor<B>) -> DeviceResult,
    ) -> DeviceResult {
        let write = self.l1_b[stage].acquire_write(ctx.events())?;
        fill(ctx, write.tensor())?;
        write.commit()
    }

    /// Loads K tile `k_tile` of both operands of `task` into staging slot `stage`.
    pub fn load_k_tile<T: GemmTypes<A = A, B = B>>(
        &self,
        ctx: &mut CoreContext<'_>,
        stage: usize,
        task: &BlockTask<T>,
        k_tile: usize,
    ) -> DeviceResult {
        let k_offset = k_tile * self.l1.k;
        let k_len = self.k_tile_len(task.actual.k, k_tile);
        let a = task.a.offset(task.layout_a.offset(0, k_offset));
        let b = task.b.offset(task.layout_b.offset(k_offset, 0));

        self.load_a(ctx, stage, a, &task.layout_a, MatrixCoord::new(task.actual.m, k_len))?;
        self.load_b(ctx, stage, b, &task.layout_b, MatrixCoord::new(k_len, task.actual.n))
    }

    /// Runs the K loop of `task` starting at K tile `start` and wrapping around.
    ///
    /// When `preloaded` the first K tile is already in the current staging slot. When `next` is
    /// given, its first K tile is loaded while the last K tile of `task` computes; the return
    /// value tells whether that happened.
    pub fn run<T: GemmTypes<A = A, B = B>>(
        &mut self,
        ctx: &mut CoreContext<'_>,
        task: &BlockTask<T>,
        start: usize,
        preloaded: bool,
        next: Option<(&BlockTask<T>, usize)>,
    ) -> DeviceResult<bool> {
        self.run_loading(
            ctx,
            task.actual,
            start,
            preloaded,
            next.is_some(),
            |stages, ctx, stage, load| match (load, next) {
                (KLoad::Tile(k_tile), _) => stages.load_k_tile(ctx, stage, task, k_tile),
                (KLoad::Next, Some((next, k_tile))) => stages.load_k_tile(ctx, stage, next, k_tile),
                (KLoad::Next, None) => Ok(()),
            },
        )
    }

    /// [`run_with`](Self::run_with) with the plain right operand copy.
    pub fn run_loading<L>(
        &mut self,
        ctx: &mut CoreContext<'_>,
        actual: GemmCoord,
        start: usize,
        preloaded: bool,
        has_next: bool,
        load: L,
    ) -> DeviceResult<bool>
    where
        L: FnMut(&Self, &mut CoreContext<'_>, usize, KLoad) -> DeviceResult,
    {
        let fill_b = operand_copy(self.staging_b, self.operand_b);
        self.run_with(ctx, actual, start, preloaded, has_next, load, fill_b)
    }

    /// K loop over a tile of shape `actual` with caller provided loads.
    ///
    /// `load` fills a staging slot with either a K tile of the current task or the first K tile
    /// of the next one. `fill_b` moves the right operand from the staging tier to its operand
    /// tier.
    #[allow(clippy::too_many_arguments)]
    pub fn run_with<L, F>(
        &mut self,
        ctx: &mut CoreContext<'_>,
        actual: GemmCoord,
        start: usize,
        preloaded: bool,
        has_next: bool,
        mut load: L,
        mut fill_b: F,
    ) -> DeviceResult<bool>
    where
        L: FnMut(&Self, &mut CoreContext<'_>, usize, KLoad) -> DeviceResult,
        F: FnMut(&mut CoreContext<'_>, LocalTensor<B>, LocalTensor<B>, usize, MatrixCoord) -> DeviceResult,
    {
        let k_tiles = actual.k.div_ceil(self.l1.k);
        let stages = self.stages();
        if !preloaded {
            load(self, ctx, self.l1_cursor % stages, KLoad::Tile(start))?;
        }

        let mut next_loaded = false;
        for i in 0..k_tiles {
            let stage = self.l1_cursor % stages;
            let upcoming = (self.l1_cursor + 1) % stages;
            if i + 1 < k_tiles {
                load(self, ctx, upcoming, KLoad::Tile((start + i + 1) % k_tiles))?;
            } else if has_next {
                load(self, ctx, upcoming, KLoad::Next)?;
                next_loaded = true;
            }

            let k_len = self.k_tile_len(actual.k, (start + i) % k_tiles);
            let shape = GemmCoord::new(actual.m, actual.n, k_len);
            self.mma_stage_with(ctx, stage, shape, i == 0, &mut fill_b)?;
            self.l1_cursor += 1;
        }
        Ok(next_loaded)
    }

    /// Consumes staging slot `stage`: one matrix instruction per operand tier tile along K.
    pub fn mma_stage(
        &mut self,
        ctx: &mut CoreContext<'_>,
        stage: usize,
        shape: GemmCoord,
        init: bool,
    ) -> DeviceResult {
        let fill_b = operand_copy(self.staging_b, self.operand_b);
        self.mma_stage_with(ctx, stage, shape, init, fill_b)
    }

    /// [`mma_stage`](Self::mma_stage) with a custom staging to operand tier copy of the right
    /// operand, called with the K origin and the shape of each part.
    pub fn mma_stage_with(
        &mut self,
        ctx: &mut CoreContext<'_>,
        stage: usize,
        shape: GemmCoord,
        init: bool,
        mut fill_b: impl FnMut(
            &mut CoreContext<'_>,
            LocalTensor<B>,
            LocalTensor<B>,
            usize,
            MatrixCoord,
        ) -> DeviceResult,
    ) -> DeviceResult {
        let read_a = self.l1_a[stage].acquire_read(ctx.events())?;
        let read_b = self.l1_b[stage].acquire_read(ctx.events())?;
        let stages = self.l0_a.len();

        for part in 0..shape.k.div_ceil(self.l0.k) {
            let k_origin = part * self.l0.k;
            let k_len = (shape.k - k_origin).min(self.l0.k);
            let slot = self.l0_cursor % stages;

            let write_a = self.l0_a[slot].acquire_write(ctx.events())?;
            copy_l1_to_l0(
                ctx,
                write_a.tensor(),
                &self.operand_a,
                read_a.tensor(),
                &self.staging_a,
                MatrixCoord::new(0, k_origin),
                MatrixCoord::new(shape.m, k_len),
            )?;
            write_a.commit()?;

            let write_b = self.l0_b[slot].acquire_write(ctx.events())?;
            fill_b(
                ctx,
                write_b.tensor(),
                read_b.tensor(),
                k_origin,
                MatrixCoord::new(k_len, shape.n),
            )?;
            write_b.commit()?;

            let first = init && part == 0;
            if first && !self.unit_flag {
                self.acc = Some(self.l0_c.acquire_write(ctx.events())?);
            }

            let op_a = self.l0_a[slot].acquire_read(ctx.events())?;
            let op_b = self.l0_b[slot].acquire_read(ctx.events())?;
            let operands = MmadOperands::new(
                op_a.tensor(),
                self.operand_a,
                op_b.tensor(),
                self.operand_b,
                self.l0_c.tensor(),
                self.accumulator,
            );
            tile_mmad(ctx, &operands, GemmCoord::new(shape.m, shape.n, k_len), first)?;
            op_a.release()?;
            op_b.release()?;
            self.l0_cursor += 1;
        }

        read_a.release()?;
        read_b.release()
    }

    /// Writes the `shape` region of the accumulator to `out`.
    pub fn store<D: Element>(
        &mut self,
        ctx: &mut CoreContext<'_>,
        out: BlockOutput<D>,
        shape: MatrixCoord,
    ) -> DeviceResult {
        if self.unit_flag {
            ctx.stats_mut().unit_flag_skips += 1;
            return copy_l0c_to_gm(
                ctx,
                out.c,
                &out.layout,
                self.l0_c.tensor(),
                &self.accumulator,
                shape,
                out.scale,
            );
        }

        if let Some(write) = self.acc.take() {
            write.commit()?;
        }
        let read = self.l0_c.acquire_read(ctx.events())?;
        copy_l0c_to_gm(ctx, out.c, &out.layout, read.tensor(), &self.accumulator, shape, out.scale)?;
        read.release()
    }

    /// Hands a loaded but never computed staging slot back to the loader.
    pub fn discard(&mut self, ctx: &mut CoreContext<'_>) -> DeviceResult {
        let stage = self.l1_cursor % self.stages();
        self.l1_a[stage].acquire_read(ctx.events())?.release()?;
        self.l1_b[stage].acquire_read(ctx.events())?.release()
    }

    pub fn finish(self, ctx: &mut CoreContext<'_>) -> DeviceResult {
        drain_all(ctx, &self.l1_a)?;
        drain_all(ctx, &self.l1_b)?;
        drain_all(ctx, &self.l0_a)?;
        drain_all(ctx, &self.l0_b)?;
        if !self.unit_flag {
            self.l0_c.drain(ctx.events())?;
        }
        Ok(())
    }
}
