use crate::components::{GemmCoord, MatrixCoord};

/// Strips of `OFFSET` tile rows, walked column by column.
pub const SWIZZLE_ZN: usize = 0;
/// Strips of `OFFSET` tile columns, walked row by row.
pub const SWIZZLE_NZ: usize = 1;

/// Maps the task counter of a core to an output tile.
pub trait BlockSwizzle {
    /// Tasks in one problem.
    fn core_loops(&self) -> usize;

    /// Tile coordinate of `task`. `k` is the first K tile the task accumulates from.
    fn block_coord(&self, task: usize) -> GemmCoord;

    /// Shape of the tile at `coord`, clipped at the problem edges.
    fn actual_block_shape(&self, coord: GemmCoord) -> GemmCoord;

    /// Problem a task belongs to when several problems of the same shape are flattened.
    fn batch_idx(&self, task: usize) -> usize {
        task / self.core_loops()
    }
}

/// Tasks of core `core` out of `core_num`: `core`, `core + core_num`, ...
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoreTasks {
    next: usize,
    end: usize,
    step: usize,
}

impl CoreTasks {
    pub fn new(core: usize, core_loops: usize, core_num: usize) -> Self {
        Self {
            next: core,
            end: core_loops,
            step: core_num.max(1),
        }
    }

    /// Task `next` will return.
    pub fn peek(&self) -> Option<usize> {
        (self.next < self.end).then_some(self.next)
    }
}

impl Iterator for CoreTasks {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        let task = self.peek()?;
        self.next += self.step;
        Some(task)
    }
}

/// Tile `(m, n)` of the `inner`-th task in an `OFFSET` wide zig-zag walk of a `loops` grid.
pub(crate) fn swizzle_coord<const OFFSET: usize, const DIRECTION: usize>(
    loops: MatrixCoord,
    inner: usize,
) -> MatrixCoord {
    let (major, minor) = match DIRECTION {
        SWIZZLE_ZN => (loops.row, loops.column),
        _ => (loops.column, loops.row),
    };
    let strip = inner / (OFFSET * minor);
    let in_strip = inner % (OFFSET * minor);
    let width = OFFSET.min(major - OFFSET * strip);

    let along = strip * OFFSET + in_strip % width;
    let mut across = in_strip / width;
    if strip % 2 == 1 {
        across = minor - across - 1;
    }

    match DIRECTION {
        SWIZZLE_ZN => MatrixCoord::new(along, across),
        _ => MatrixCoord::new(across, along),
    }
}

/// Clips a tile extent at the problem edge.
pub(crate) fn clip(index: usize, tile: usize, extent: usize) -> usize {
    tile.min(extent - index * tile)
}

/// Zig-zag swizzle over the output tiles of one problem.
///
/// The grid is cut in strips of `OFFSET` tile rows (`DIRECTION` = [`SWIZZLE_ZN`]) or columns
/// ([`SWIZZLE_NZ`]). A strip is walked across its short side first, and every other strip is
/// walked backward, so that consecutive tasks stay close in both dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GemmIdentityBlockSwizzle<const OFFSET: usize = 1, const DIRECTION: usize = SWIZZLE_ZN> {
    pub problem: GemmCoord,
    pub tile: MatrixCoord,
    pub loops: MatrixCoord,
}

impl<const OFFSET: usize, const DIRECTION: usize> GemmIdentityBlockSwizzle<OFFSET, DIRECTION> {
    const CHECK: () = {
        assert!(OFFSET > 0, "swizzle offset must be positive");
        assert!(
            DIRECTION == SWIZZLE_ZN || DIRECTION == SWIZZLE_NZ,
            "swizzle direction is either Zn or Nz"
        );
    };

    pub fn new(problem: GemmCoord, tile: MatrixCoord) -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::CHECK;

        Self {
            problem,
            tile,
            loops: problem.mn().ceil_div(tile),
        }
    }
}

impl<const OFFSET: usize, const DIRECTION: usize> BlockSwizzle
    for GemmIdentityBlockSwizzle<OFFSET, DIRECTION>
{
    fn core_loops(&self) -> usize {
        self.loops.count()
    }

    fn block_coord(&self, task: usize) -> GemmCoord {
        let coord = swizzle_coord::<OFFSET, DIRECTION>(self.loops, task % self.core_loops());
        GemmCoord::new(coord.row, coord.column, 0)
    }

    fn actual_block_shape(&self, coord: GemmCoord) -> GemmCoord {
        GemmCoord::new(
            clip(coord.m, self.tile.row, self.problem.m),
            clip(coord.n, self.tile.column, self.problem.n),
            self.problem.k,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashSet;

    fn assert_bijection<S: BlockSwizzle>(swizzle: &S, loops: MatrixCoord) {
        let coords: HashSet<_> = (0..swizzle.core_loops())
            .map(|task| {
                let coord = swizzle.block_coord(task);
                assert!(coord.m < loops.row && coord.n < loops.column, "{coord} out of grid");
                (coord.m, coord.n)
            })
            .collect();
        assert_eq!(coords.len(), loops.count());
    }

    #[test_log::test]
    fn every_tile_is_visited_once() {
        for (m, n) in [(1, 1), (5, 7), (8, 3), (13, 13), (2, 40)] {
            let problem = GemmCoord::new(m * 16, n * 16, 64);
            let tile = MatrixCoord::new(16, 16);
            let loops = MatrixCoord::new(m, n);

            assert_bijection(&GemmIdentityBlockSwizzle::<1, SWIZZLE_ZN>::new(problem, tile), loops);
            assert_bijection(&GemmIdentityBlockSwizzle::<3, SWIZZLE_ZN>::new(problem, tile), loops);
            assert_bijection(&GemmIdentityBlockSwizzle::<4, SWIZZLE_NZ>::new(problem, tile), loops);
        }
    }

    #[test_log::test]
    fn odd_strips_walk_backward() {
        let swizzle = GemmIdentityBlockSwizzle::<2, SWIZZLE_ZN>::new(
            GemmCoord::new(64, 48, 16),
            MatrixCoord::new(16, 16),
        );
        let walk: Vec<_> = (0..swizzle.core_loops())
            .map(|task| {
                let coord = swizzle.block_coord(task);
                (coord.m, coord.n)
            })
            .collect();

        assert_eq!(
            walk,
            vec![
                (0, 0), (1, 0), (0, 1), (1, 1), (0, 2), (1, 2),
                (2, 2), (3, 2), (2, 1), (3, 1), (2, 0), (3, 0),
            ]
        );
    }

    #[test_log::test]
    fn last_strip_takes_the_remainder() {
        let swizzle = GemmIdentityBlockSwizzle::<2, SWIZZLE_NZ>::new(
            GemmCoord::new(32, 48, 16),
            MatrixCoord::new(16, 16),
        );
        let last: Vec<_> = (4..6)
            .map(|task| {
                let coord = swizzle.block_coord(task);
                (coord.m, coord.n)
            })
            .collect();

        // Strip 1 holds the single remaining column and is walked backward.
        assert_eq!(last, vec![(1, 2), (0, 2)]);
    }

    #[test_log::test]
    fn edge_tiles_are_clipped() {
        let swizzle = GemmIdentityBlockSwizzle::<1, SWIZZLE_ZN>::new(
            GemmCoord::new(200, 300, 64),
            MatrixCoord::new(128, 256),
        );

        assert_eq!(
            swizzle.actual_block_shape(GemmCoord::new(1, 0, 0)),
            GemmCoord::new(72, 256, 64)
        );
        assert_eq!(
            swizzle.actual_block_shape(GemmCoord::new(0, 1, 0)),
            GemmCoord::new(128, 44, 64)
        );
    }

    #[test_log::test]
    fn core_tasks_stride_by_core_count() {
        let tasks = CoreTasks::new(1, 10, 4);

        assert_eq!(tasks.peek(), Some(1));
        assert_eq!(tasks.collect::<Vec<_>>(), vec![1, 5, 9]);
        assert_eq!(CoreTasks::new(5, 3, 4).count(), 0);
    }
}
