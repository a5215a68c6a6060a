//! Kernel orchestrators: device programs combining a block strategy, a swizzle and, for mixed
//! kernels, the vector engine passes around it.

mod basic;
mod batched;
mod grouped;
mod grouped_epilogue;
mod matmul_epilogue;
mod padding;
mod padding_splitk;
mod sparse;
mod streamk;
mod w4a8;

pub use basic::*;
pub use batched::*;
pub use grouped::*;
pub use grouped_epilogue::*;
pub use matmul_epilogue::*;
pub use padding::*;
pub use padding_splitk::*;
pub use sparse::*;
pub use streamk::*;
pub use w4a8::*;

use bytemuck::Pod;
use tilepipe_runtime::arch::round_up;
use tilepipe_runtime::{CoreContext, DeviceResult, GM_ALIGN, GlobalTensor, GmBuffer};

use crate::components::batch::{BlockSwizzle, CoreTasks};
use crate::components::block::{BlockMmad, BlockOutput, BlockTask};
use crate::components::{BlockTiling, GemmCoord, GemmTypes, MatrixLayout, RowMajor, TileLayout};

/// Global memory operands of one matmul, each tensor pointing at its matrix origin.
pub struct MatmulParams<T: GemmTypes> {
    pub problem: GemmCoord,
    pub a: GlobalTensor<T::A>,
    pub layout_a: T::LayoutA,
    pub b: GlobalTensor<T::B>,
    pub layout_b: T::LayoutB,
    pub c: GlobalTensor<T::C>,
    pub layout_c: RowMajor,
}

impl<T: GemmTypes> Clone for MatmulParams<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: GemmTypes> Copy for MatmulParams<T> {}

impl<T: GemmTypes> core::fmt::Debug for MatmulParams<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MatmulParams")
            .field("problem", &self.problem)
            .field("a", &self.a)
            .field("b", &self.b)
            .field("c", &self.c)
            .finish()
    }
}

impl<T: GemmTypes> MatmulParams<T> {
    pub fn new(
        problem: GemmCoord,
        a: GlobalTensor<T::A>,
        layout_a: T::LayoutA,
        b: GlobalTensor<T::B>,
        layout_b: T::LayoutB,
        c: GlobalTensor<T::C>,
        layout_c: RowMajor,
    ) -> Self {
        Self {
            problem,
            a,
            layout_a,
            b,
            layout_b,
            c,
            layout_c,
        }
    }

    /// Densely packed operands at the start of `a`, `b` and `c`.
    pub fn packed(
        problem: GemmCoord,
        a: GlobalTensor<T::A>,
        b: GlobalTensor<T::B>,
        c: GlobalTensor<T::C>,
    ) -> Self {
        Self::new(
            problem,
            a,
            T::LayoutA::packed(problem.m, problem.k),
            b,
            T::LayoutB::packed(problem.k, problem.n),
            c,
            RowMajor::new(problem.m, problem.n),
        )
    }

    /// Operands of the tile at `coord`, whose K range starts at K tile `coord.k`.
    pub fn block_task(&self, tile: GemmCoord, coord: GemmCoord, actual: GemmCoord) -> BlockTask<T> {
        let (row, column, k) = (coord.m * tile.m, coord.n * tile.n, coord.k * tile.k);
        BlockTask::new(
            self.a.offset(self.layout_a.offset(row, k)),
            self.layout_a,
            self.b.offset(self.layout_b.offset(k, column)),
            self.layout_b,
            actual,
        )
    }

    /// Output origin of the tile at `coord`.
    pub fn block_output(&self, tile: GemmCoord, coord: GemmCoord) -> BlockOutput<T::C> {
        let c = self.c.offset(self.layout_c.offset(coord.m * tile.m, coord.n * tile.n));
        BlockOutput::cast(c, self.layout_c)
    }
}

/// Runs `tasks` of one problem through `block`, handing each call the task that follows.
pub(crate) fn run_block_tasks<BM: BlockMmad, S: BlockSwizzle>(
    ctx: &mut CoreContext<'_>,
    block: &mut BM,
    params: &MatmulParams<BM::Types>,
    swizzle: &S,
    mut tasks: CoreTasks,
) -> DeviceResult {
    let tile = <BM::Tiling as BlockTiling>::L1;
    let task_of = |task: usize| {
        let coord = swizzle.block_coord(task);
        (coord, params.block_task(tile, coord, swizzle.actual_block_shape(coord)))
    };

    while let Some(task) = tasks.next() {
        let (coord, current) = task_of(task);
        let next = tasks.peek().map(|task| task_of(task).1);
        log::trace!("{}: tile {coord}", ctx.id());
        block.compute(ctx, &current, params.block_output(tile, coord), next.as_ref())?;
    }
    Ok(())
}

/// Byte offsets of the typed regions a kernel carves out of its workspace.
///
/// Every region starts on a [`GM_ALIGN`] boundary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkspaceLayout {
    size: usize,
}

impl WorkspaceLayout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves `len` elements of `E`, returning the byte offset of the region.
    pub fn reserve<E: Pod>(&mut self, len: usize) -> usize {
        let offset = self.size;
        self.size = round_up(offset + len * size_of::<E>(), GM_ALIGN);
        offset
    }

    /// Bytes spanned by every region.
    pub fn size(&self) -> usize {
        self.size
    }
}

/// Region of `workspace` at byte `offset`.
pub(crate) fn workspace_region<E: Pod>(workspace: GmBuffer, offset: usize) -> GlobalTensor<E> {
    GlobalTensor::new(workspace.addr + offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test_log::test]
    fn workspace_regions_are_aligned() {
        let mut layout = WorkspaceLayout::new();

        assert_eq!(layout.reserve::<u16>(100), 0);
        assert_eq!(layout.reserve::<f32>(1000), 512);
        assert_eq!(layout.reserve::<i8>(1), 4608);
        assert_eq!(layout.size(), 5120);
    }
}
