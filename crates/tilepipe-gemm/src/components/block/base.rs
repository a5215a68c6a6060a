use tilepipe_runtime::arch::ArchTag;
use tilepipe_runtime::{CoreContext, DeviceResult, Element, GlobalTensor};

use crate::components::{BlockTiling, GemmCoord, GemmTypes, RowMajor, TierAllocator};

/// Operands of one output tile.
///
/// `a` and `b` point at the tile origin; the layouts keep the stride of the full matrices.
pub struct BlockTask<T: GemmTypes> {
    pub a: GlobalTensor<T::A>,
    pub layout_a: T::LayoutA,
    pub b: GlobalTensor<T::B>,
    pub layout_b: T::LayoutB,
    /// Clipped tile shape. `k` is the K extent this task accumulates over.
    pub actual: GemmCoord,
}

impl<T: GemmTypes> Clone for BlockTask<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: GemmTypes> Copy for BlockTask<T> {}

impl<T: GemmTypes> core::fmt::Debug for BlockTask<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BlockTask")
            .field("a", &self.a)
            .field("b", &self.b)
            .field("actual", &self.actual)
            .finish()
    }
}

impl<T: GemmTypes> BlockTask<T> {
    pub fn new(
        a: GlobalTensor<T::A>,
        layout_a: T::LayoutA,
        b: GlobalTensor<T::B>,
        layout_b: T::LayoutB,
        actual: GemmCoord,
    ) -> Self {
        Self {
            a,
            layout_a,
            b,
            layout_b,
            actual,
        }
    }
}

/// Where the accumulator of a finished tile goes.
#[derive(Debug, Clone, Copy, new)]
pub struct BlockOutput<D: Element> {
    pub c: GlobalTensor<D>,
    pub layout: RowMajor,
    /// Multiplier applied on write-back, `1.0` for a plain cast.
    pub scale: f64,
}

impl<D: Element> BlockOutput<D> {
    pub fn cast(c: GlobalTensor<D>, layout: RowMajor) -> Self {
        Self::new(c, layout, 1.0)
    }
}

/// A block matmul strategy running on the matrix engine.
///
/// A strategy owns its stage slots for the whole kernel: it is built once at kernel entry, fed
/// every output tile of the core in order, then finished to drain its events.
pub trait BlockMmad: Sized {
    type Arch: ArchTag;
    type Types: GemmTypes;
    type Tiling: BlockTiling;
    /// Extra construction input, such as a workspace.
    type Params: Copy;

    /// Lets the hardware clear and flush the accumulator, skipping its event round-trip.
    const UNIT_FLAG: bool;

    fn new(
        ctx: &mut CoreContext<'_>,
        allocator: &mut TierAllocator,
        params: Self::Params,
    ) -> DeviceResult<Self>;

    /// Computes `task` and writes it to `out`. `next` is the task this core runs afterwards,
    /// which strategies may start loading early.
    fn compute<D: Element>(
        &mut self,
        ctx: &mut CoreContext<'_>,
        task: &BlockTask<Self::Types>,
        out: BlockOutput<D>,
        next: Option<&BlockTask<Self::Types>>,
    ) -> DeviceResult;

    /// Drains every event at kernel exit.
    fn finish(self, ctx: &mut CoreContext<'_>) -> DeviceResult;
}

/// First K tile of a block's K loop. With `shuffle_k`, matrix engine `aic_idx` starts at
/// `aic_idx % k_tiles` and wraps around.
pub fn k_loop_start(aic_idx: usize, k_tiles: usize, shuffle_k: bool) -> usize {
    if shuffle_k && k_tiles > 0 {
        aic_idx % k_tiles
    } else {
        0
    }
}

/// K tiles in the order a block visits them.
pub fn k_loop_order(k_tiles: usize, start: usize) -> impl Iterator<Item = usize> {
    (0..k_tiles).map(move |i| (start + i) % k_tiles)
}
