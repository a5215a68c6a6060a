use super::{SWIZZLE_NZ, SWIZZLE_ZN, clip, swizzle_coord};
use crate::components::{GemmCoord, MatrixCoord};

/// Part of one output tile accumulated by a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamkSegment {
    /// Index of the tile in swizzle order.
    pub tile: usize,
    /// Tile coordinate, `k` being the first K tile of the segment.
    pub coord: GemmCoord,
    /// Clipped tile shape, `k` being the K extent of the segment in elements.
    pub actual: GemmCoord,
}

/// What one task of a stream-K launch computes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamkBlockDec {
    /// Whether the task computes part of a tile shared with other tasks.
    pub streamk: bool,
    pub first: StreamkSegment,
    /// Head of the following tile, when the K range of the task runs past the end of `first`.
    pub cross: Option<StreamkSegment>,
}

/// Output tile swizzle balancing the last, incomplete wave of tiles over every core.
///
/// The first `mnBlocks - mnBlocks % blockDim` tiles are ordinary tasks. The K tiles of the
/// remaining tiles are pooled and split evenly over `blockDim` stream-K tasks, the first
/// `remainder` of them taking one extra K tile. A stream-K task may end inside the next tile, so
/// it covers at most two tiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamkGemmIdentityBlockSwizzle<
    const OFFSET: usize = 1,
    const DIRECTION: usize = SWIZZLE_ZN,
> {
    pub problem: GemmCoord,
    pub tile: GemmCoord,
    pub loops: GemmCoord,
    pub block_dim: usize,
    normal_blocks: usize,
    streamk_blocks: usize,
    k_tiles_per_core: usize,
    k_tile_remain: usize,
}

impl<const OFFSET: usize, const DIRECTION: usize> StreamkGemmIdentityBlockSwizzle<OFFSET, DIRECTION> {
    const CHECK: () = {
        assert!(OFFSET > 0, "swizzle offset must be positive");
        assert!(
            DIRECTION == SWIZZLE_ZN || DIRECTION == SWIZZLE_NZ,
            "swizzle direction is either Zn or Nz"
        );
    };

    pub fn new(problem: GemmCoord, tile: GemmCoord, block_dim: usize) -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::CHECK;

        let block_dim = block_dim.max(1);
        let loops = problem.ceil_div(tile);
        let blocks = loops.m * loops.n;
        let streamk_blocks = blocks % block_dim;
        let pooled = streamk_blocks * loops.k;

        Self {
            problem,
            tile,
            loops,
            block_dim,
            normal_blocks: blocks - streamk_blocks,
            streamk_blocks,
            k_tiles_per_core: pooled / block_dim,
            k_tile_remain: pooled % block_dim,
        }
    }

    pub fn core_loops(&self) -> usize {
        self.normal_blocks + (self.streamk_blocks * self.loops.k).min(self.block_dim)
    }

    /// Tiles computed whole by a single task.
    pub fn normal_blocks(&self) -> usize {
        self.normal_blocks
    }

    /// Tiles shared by stream-K tasks.
    pub fn streamk_blocks(&self) -> usize {
        self.streamk_blocks
    }

    /// Tasks that compute part of a shared tile.
    pub fn streamk_tasks(&self) -> usize {
        self.core_loops() - self.normal_blocks
    }

    /// Coordinate of the tile with swizzle index `tile`.
    pub fn block_coord(&self, tile: usize) -> GemmCoord {
        let coord =
            swizzle_coord::<OFFSET, DIRECTION>(MatrixCoord::new(self.loops.m, self.loops.n), tile);
        GemmCoord::new(coord.row, coord.column, 0)
    }

    /// Full K shape of the tile at `coord`.
    pub fn actual_block_shape(&self, coord: GemmCoord) -> GemmCoord {
        GemmCoord::new(
            clip(coord.m, self.tile.m, self.problem.m),
            clip(coord.n, self.tile.n, self.problem.n),
            self.problem.k,
        )
    }

    fn segment(&self, tile: usize, k_tile: usize, k_tiles: usize) -> StreamkSegment {
        let mut coord = self.block_coord(tile);
        coord.k = k_tile;
        let mut actual = self.actual_block_shape(coord);
        actual.k = (k_tiles * self.tile.k).min(self.problem.k - k_tile * self.tile.k);
        StreamkSegment {
            tile,
            coord,
            actual,
        }
    }

    pub fn streamk_block_dec(&self, task: usize) -> StreamkBlockDec {
        if task < self.normal_blocks {
            return StreamkBlockDec {
                streamk: false,
                first: self.segment(task, 0, self.loops.k),
                cross: None,
            };
        }

        let part = task - self.normal_blocks;
        let (count, k_tile) = if part < self.k_tile_remain {
            let count = self.k_tiles_per_core + 1;
            (count, part * count)
        } else {
            let count = self.k_tiles_per_core;
            (count, part * count + self.k_tile_remain)
        };

        let tile = self.normal_blocks + k_tile / self.loops.k;
        let start = k_tile % self.loops.k;
        let first = self.segment(tile, start, count.min(self.loops.k - start));
        let cross = (start + count > self.loops.k)
            .then(|| self.segment(tile + 1, 0, start + count - self.loops.k));

        StreamkBlockDec {
            streamk: true,
            first,
            cross,
        }
    }

    /// Stream-K tasks contributing to shared tile `tile`, each with the segment index (`0` for
    /// `first`, `1` for `cross`) holding its part.
    pub fn streamk_partials(&self, tile: usize) -> Vec<(usize, usize)> {
        (self.normal_blocks..self.core_loops())
            .filter_map(|task| {
                let dec = self.streamk_block_dec(task);
                if dec.first.tile == tile {
                    Some((task, 0))
                } else if dec.cross.is_some_and(|cross| cross.tile == tile) {
                    Some((task, 1))
                } else {
                    None
                }
            })
            .collect()
    }
}
