use bytemuck::Pod;
use core::marker::PhantomData;
use tilepipe_runtime::arch::TierKind;
use tilepipe_runtime::sync::{HardEvent, StageSlot};
use tilepipe_runtime::{CopyRun, CoreContext, DeviceResult, GlobalTensor};

use crate::components::tile::strided_runs;
use crate::components::{MatrixLayout, TierAllocator, drain_all, padding_align, prime_all};

/// Rotating scratch buffers of the padding copy.
pub const PADDING_BUFFER_NUM: usize = 2;

/// Padded layout of `layout`, or `None` when the block pipeline can read it directly.
pub fn padded_layout<E, L: MatrixLayout>(layout: &L) -> Option<L> {
    let align = padding_align::<E>();
    layout.needs_padding(align).then(|| layout.padded(align))
}

/// Vector engine copy of a matrix into a workspace whose stride is rounded up to the alignment
/// the block pipeline expects.
///
/// The matrix is cut into tiles of whole lines (rows for row-major, columns for column-major)
/// that fit one scratch buffer, handed out round-robin to every vector engine of the launch.
/// Lines longer than a buffer are copied in chunks instead.
pub struct PaddingMatrix<E: Pod, L: MatrixLayout> {
    slots: Vec<StageSlot<E>>,
    cursor: usize,
    _layout: PhantomData<L>,
}

impl<E: Pod, L: MatrixLayout> PaddingMatrix<E, L> {
    /// Elements of one scratch buffer.
    pub const COMPUTE_LENGTH: usize = 96 * 1024 / size_of::<E>();

    pub fn new(ctx: &mut CoreContext<'_>, allocator: &mut TierAllocator) -> DeviceResult<Self> {
        let slots = allocator.stages::<E>(
            TierKind::Ub,
            Self::COMPUTE_LENGTH,
            PADDING_BUFFER_NUM,
            HardEvent::Mte3Mte2,
            HardEvent::Mte2Mte3,
            0,
        )?;
        prime_all(ctx, &slots)?;

        Ok(Self {
            slots,
            cursor: 0,
            _layout: PhantomData,
        })
    }

    /// Copies `src` into `dst`. Both layouts describe the same logical matrix.
    pub fn run(
        &mut self,
        ctx: &mut CoreContext<'_>,
        dst: GlobalTensor<E>,
        dst_layout: &L,
        src: GlobalTensor<E>,
        src_layout: &L,
    ) -> DeviceResult {
        let lanes = ctx.block_num() * ctx.sub_block_num();
        let lane = ctx.block_idx();
        let lines = src_layout.lines();
        let line_len = src_layout.line_len();
        let (src_stride, dst_stride) = (src_layout.stride(), dst_layout.stride());

        if dst_stride <= Self::COMPUTE_LENGTH {
            let tile_lines = Self::COMPUTE_LENGTH / dst_stride.max(1);
            let tiles = lines.div_ceil(tile_lines);
            log::trace!("Padding {lines} lines in {tiles} tiles of {tile_lines} lines");

            for tile in (lane..tiles).step_by(lanes) {
                let first = tile * tile_lines;
                let count = tile_lines.min(lines - first);
                let load = strided_runs(count, line_len, src_stride, dst_stride);
                let store = strided_runs(count, line_len, dst_stride, dst_stride);
                self.copy(
                    ctx,
                    dst.offset(first * dst_stride),
                    src.offset(first * src_stride),
                    load,
                    store,
                )?;
            }
        } else {
            let chunks = line_len.div_ceil(Self::COMPUTE_LENGTH);
            log::trace!("Padding {lines} lines in {chunks} chunks each");

            for task in (lane..lines * chunks).step_by(lanes) {
                let (line, chunk) = (task / chunks, task % chunks);
                let start = chunk * Self::COMPUTE_LENGTH;
                let len = Self::COMPUTE_LENGTH.min(line_len - start);
                self.copy(
                    ctx,
                    dst.offset(line * dst_stride + start),
                    src.offset(line * src_stride + start),
                    [CopyRun::new(0, 0, len)],
                    [CopyRun::new(0, 0, len)],
                )?;
            }
        }
        Ok(())
    }

    fn copy(
        &mut self,
        ctx: &mut CoreContext<'_>,
        dst: GlobalTensor<E>,
        src: GlobalTensor<E>,
        load: impl IntoIterator<Item = CopyRun>,
        store: impl IntoIterator<Item = CopyRun>,
    ) -> DeviceResult {
        let slot = self.slots[self.cursor % PADDING_BUFFER_NUM];
        self.cursor += 1;

        let write = slot.acquire_write(ctx.events())?;
        ctx.copy_gm_to_local(write.tensor(), src, load)?;
        write.commit()?;

        let read = slot.acquire_read(ctx.events())?;
        ctx.copy_local_to_gm(dst, read.tensor(), store)?;
        read.release()
    }

    pub fn finish(self, ctx: &mut CoreContext<'_>) -> DeviceResult {
        drain_all(ctx, &self.slots)
    }
}
