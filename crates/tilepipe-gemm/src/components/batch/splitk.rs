use super::{SWIZZLE_NZ, SWIZZLE_ZN, clip, swizzle_coord};
use crate::components::{GemmCoord, MatrixCoord};

/// Output tile swizzle with the K dimension cut in `splitk_factor` slices.
///
/// Task `t` computes slice `t / (loopsM * loopsN)` of tile `t % (loopsM * loopsN)`, so all the
/// tiles of one slice come before the next slice. When the K tiles do not split evenly the first
/// slices take one extra K tile each.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitkGemmIdentityBlockSwizzle<
    const OFFSET: usize = 1,
    const DIRECTION: usize = SWIZZLE_ZN,
> {
    pub problem: GemmCoord,
    pub tile: GemmCoord,
    pub loops: GemmCoord,
    pub splitk_factor: usize,
}

impl<const OFFSET: usize, const DIRECTION: usize> SplitkGemmIdentityBlockSwizzle<OFFSET, DIRECTION> {
    const CHECK: () = {
        assert!(OFFSET > 0, "swizzle offset must be positive");
        assert!(
            DIRECTION == SWIZZLE_ZN || DIRECTION == SWIZZLE_NZ,
            "swizzle direction is either Zn or Nz"
        );
    };

    /// `splitk_factor` is clamped to `1..=` the number of K tiles.
    pub fn new(problem: GemmCoord, tile: GemmCoord, splitk_factor: usize) -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::CHECK;

        let loops = problem.ceil_div(tile);
        Self {
            problem,
            tile,
            loops,
            splitk_factor: splitk_factor.clamp(1, loops.k.max(1)),
        }
    }

    pub fn core_loops(&self) -> usize {
        self.loops.m * self.loops.n * self.splitk_factor
    }

    pub fn splitk_slice_idx(&self, task: usize) -> usize {
        task % self.core_loops() / (self.loops.m * self.loops.n)
    }

    /// First K tile of slice `slice`.
    pub fn k_idx_by_splitk_slice_idx(&self, slice: usize) -> usize {
        let (per, remain) = (self.loops.k / self.splitk_factor, self.loops.k % self.splitk_factor);
        if slice < remain {
            (per + 1) * slice
        } else {
            slice * per + remain
        }
    }

    /// Tile of `task`, `k` being the first K tile of its slice.
    pub fn block_coord(&self, task: usize) -> GemmCoord {
        let slice = self.splitk_slice_idx(task);
        let inner = task % (self.loops.m * self.loops.n);
        let coord =
            swizzle_coord::<OFFSET, DIRECTION>(MatrixCoord::new(self.loops.m, self.loops.n), inner);
        GemmCoord::new(coord.row, coord.column, self.k_idx_by_splitk_slice_idx(slice))
    }

    /// Shape of the tile at `coord` in slice `slice`. The last slice runs to the end of K.
    pub fn actual_block_shape(&self, coord: GemmCoord, slice: usize) -> GemmCoord {
        let (per, remain) = (self.loops.k / self.splitk_factor, self.loops.k % self.splitk_factor);
        let k = if slice + 1 == self.splitk_factor {
            self.problem.k - coord.k * self.tile.k
        } else if slice < remain {
            (per + 1) * self.tile.k
        } else {
            per * self.tile.k
        };
        GemmCoord::new(
            clip(coord.m, self.tile.m, self.problem.m),
            clip(coord.n, self.tile.n, self.problem.n),
            k,
        )
    }
}

/// Number of K slices worth running for `problem` on `aic_core_num` matrix engines.
///
/// Small output grids are split along K until the cores are busy, at most 2, 4, 8 or 16 ways
/// depending on K and never more than the number of K tiles. Very long K is split at least 2 ways
/// above 8192 and 4 ways above 32768 for locality.
pub fn splitk_factor_heuristic(problem: GemmCoord, l1_tile: GemmCoord, aic_core_num: usize) -> usize {
    let max_factor = match problem.k {
        0..=1024 => 2,
        1025..=2048 => 4,
        2049..=4096 => 8,
        _ => 16,
    };
    let base_tiles = (problem.m.div_ceil(l1_tile.m) * problem.n.div_ceil(l1_tile.n)).max(1);
    let mut factor = (aic_core_num / base_tiles).min(max_factor).max(1);

    if base_tiles < aic_core_num {
        while factor < max_factor
            && (base_tiles * factor).div_ceil(aic_core_num)
                >= base_tiles.div_ceil(aic_core_num) * factor
        {
            factor += 1;
        }
    }
    factor = factor.min(problem.k.div_ceil(l1_tile.k));

    if problem.k > 8192 {
        factor = factor.max(2);
    }
    if problem.k > 32768 {
        factor = factor.max(4);
    }
    factor
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    type Swizzle = SplitkGemmIdentityBlockSwizzle<3, SWIZZLE_ZN>;

    fn slice_lengths(swizzle: &Swizzle) -> Vec<usize> {
        (0..swizzle.splitk_factor)
            .map(|slice| {
                let coord = GemmCoord::new(0, 0, swizzle.k_idx_by_splitk_slice_idx(slice));
                swizzle.actual_block_shape(coord, slice).k
            })
            .collect()
    }

    #[test_log::test]
    fn slices_cover_k_with_the_remainder_first() {
        let swizzle = Swizzle::new(GemmCoord::new(128, 128, 7 * 64), GemmCoord::new(128, 128, 64), 3);

        assert_eq!(
            (0..3).map(|s| swizzle.k_idx_by_splitk_slice_idx(s)).collect::<Vec<_>>(),
            vec![0, 3, 5]
        );
        assert_eq!(slice_lengths(&swizzle), vec![192, 128, 128]);
    }

    #[test_log::test]
    fn slice_lengths_sum_to_k() {
        let tile = GemmCoord::new(128, 256, 256);
        for k in [256, 1000, 4096, 5000, 12_345] {
            for factor in 1..=8 {
                let swizzle = Swizzle::new(GemmCoord::new(300, 300, k), tile, factor);
                let lengths = slice_lengths(&swizzle);

                assert_eq!(lengths.iter().sum::<usize>(), k, "k={k} factor={factor}");
                if k % tile.k == 0 {
                    let spread = lengths.iter().max().unwrap() - lengths.iter().min().unwrap();
                    assert!(spread <= tile.k, "k={k} factor={factor}: {lengths:?}");
                }
            }
        }
    }

    #[test_log::test]
    fn every_tile_and_slice_is_visited_once() {
        let swizzle = Swizzle::new(GemmCoord::new(500, 700, 1024), GemmCoord::new(128, 256, 256), 3);
        let mut seen: Vec<_> = (0..swizzle.core_loops())
            .map(|task| {
                let coord = swizzle.block_coord(task);
                (coord.m, coord.n, coord.k)
            })
            .collect();
        seen.sort();
        seen.dedup();

        assert_eq!(swizzle.core_loops(), 4 * 3 * 3);
        assert_eq!(seen.len(), swizzle.core_loops());
        assert_eq!(swizzle.splitk_slice_idx(12), 1);
    }

    #[test_log::test]
    fn factor_is_clamped_to_the_k_tiles() {
        let swizzle = Swizzle::new(GemmCoord::new(64, 64, 300), GemmCoord::new(128, 256, 256), 8);

        assert_eq!(swizzle.splitk_factor, 2);
        assert_eq!(Swizzle::new(GemmCoord::new(64, 64, 300), GemmCoord::new(128, 256, 256), 0).splitk_factor, 1);
    }

    #[test_log::test]
    fn heuristic_fills_idle_cores() {
        let tile = GemmCoord::new(128, 256, 256);

        assert_eq!(splitk_factor_heuristic(GemmCoord::new(256, 256, 1024), tile, 20), 2);
        assert_eq!(splitk_factor_heuristic(GemmCoord::new(256, 256, 4096), tile, 20), 8);
        assert_eq!(splitk_factor_heuristic(GemmCoord::new(128, 128, 128), tile, 20), 1);
    }

    #[test_log::test]
    fn heuristic_splits_long_k() {
        let tile = GemmCoord::new(128, 256, 256);

        assert_eq!(splitk_factor_heuristic(GemmCoord::new(2048, 2048, 4096), tile, 20), 1);
        assert_eq!(splitk_factor_heuristic(GemmCoord::new(2048, 2048, 16_384), tile, 20), 2);
        assert_eq!(splitk_factor_heuristic(GemmCoord::new(2048, 2048, 40_000), tile, 20), 4);
    }
}
