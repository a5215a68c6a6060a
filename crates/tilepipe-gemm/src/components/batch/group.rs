use super::CoreTasks;
use crate::components::{GemmCoord, MatmulSetupError};

/// Largest number of problems one grouped launch accepts.
pub const MAX_GROUP_COUNT: usize = 256;

/// Element offsets of one group inside the shared operand arenas.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, new)]
pub struct GroupOffsets {
    pub a: usize,
    pub b: usize,
    pub c: usize,
}

/// Independent problems packed back to back in shared arenas.
///
/// Group `g` reads its densely packed `M x K` and `K x N` operands at the cumulative element
/// offsets of the groups before it, and writes its `M x N` output the same way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupList {
    problems: Vec<GemmCoord>,
    offsets: Vec<GroupOffsets>,
    totals: GroupOffsets,
}

impl GroupList {
    pub fn new(problems: Vec<GemmCoord>) -> Result<Self, MatmulSetupError> {
        if problems.len() > MAX_GROUP_COUNT {
            return Err(MatmulSetupError::TooManyGroups {
                count: problems.len(),
                max: MAX_GROUP_COUNT,
            });
        }

        let mut offsets = Vec::with_capacity(problems.len());
        let mut totals = GroupOffsets::default();
        for problem in problems.iter() {
            offsets.push(totals);
            totals.a += problem.m * problem.k;
            totals.b += problem.k * problem.n;
            totals.c += problem.m * problem.n;
        }

        Ok(Self {
            problems,
            offsets,
            totals,
        })
    }

    pub fn len(&self) -> usize {
        self.problems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.problems.is_empty()
    }

    pub fn problem(&self, group: usize) -> GemmCoord {
        self.problems[group]
    }

    pub fn offsets(&self, group: usize) -> GroupOffsets {
        self.offsets[group]
    }

    pub fn problems(&self) -> &[GemmCoord] {
        &self.problems
    }

    /// Elements of every arena.
    pub fn totals(&self) -> GroupOffsets {
        self.totals
    }
}

/// Rotation handing the tiles of consecutive groups to the cores of a launch.
///
/// Each group starts at the core right after the one that took the last tile of the previous
/// group, so the tiles of all groups, taken in order, are dealt round-robin and no core sits idle
/// at a group boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupSchedule {
    core: usize,
    core_num: usize,
    start_core_idx: usize,
}

impl GroupSchedule {
    pub fn new(core: usize, core_num: usize) -> Self {
        Self {
            core,
            core_num: core_num.max(1),
            start_core_idx: 0,
        }
    }

    /// Core that takes the first tile of the next group.
    pub fn start_core_idx(&self) -> usize {
        self.start_core_idx
    }

    /// First task of this core in a group starting at core `start_core_idx`.
    pub fn start_loop_idx(&self) -> usize {
        if self.core < self.start_core_idx {
            self.core + self.core_num - self.start_core_idx
        } else {
            self.core - self.start_core_idx
        }
    }

    /// Tasks of this core in the next group, which has `core_loops` tiles.
    pub fn next_group(&mut self, core_loops: usize) -> CoreTasks {
        let tasks = CoreTasks::new(self.start_loop_idx(), core_loops, self.core_num);
        self.start_core_idx = (self.start_core_idx + core_loops) % self.core_num;
        tasks
    }
}

/// `(group, task)` pairs of every core, for groups of `core_loops` tiles each.
pub fn group_assignments(core_loops: &[usize], core_num: usize) -> Vec<Vec<(usize, usize)>> {
    (0..core_num)
        .map(|core| {
            let mut schedule = GroupSchedule::new(core, core_num);
            core_loops
                .iter()
                .enumerate()
                .flat_map(|(group, &loops)| schedule.next_group(loops).map(move |task| (group, task)))
                .collect()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashSet;

    #[test_log::test]
    fn offsets_accumulate() {
        let groups = GroupList::new(vec![
            GemmCoord::new(64, 64, 64),
            GemmCoord::new(128, 32, 256),
            GemmCoord::new(32, 256, 32),
        ])
        .unwrap();

        assert_eq!(groups.offsets(0), GroupOffsets::new(0, 0, 0));
        assert_eq!(groups.offsets(1), GroupOffsets::new(4096, 4096, 4096));
        assert_eq!(
            groups.offsets(2),
            GroupOffsets::new(4096 + 32768, 4096 + 8192, 4096 + 4096)
        );
        assert_eq!(groups.totals().c, 4096 + 4096 + 8192);
    }

    #[test_log::test]
    fn too_many_groups_are_rejected() {
        let problems = vec![GemmCoord::new(16, 16, 16); MAX_GROUP_COUNT + 1];

        assert!(matches!(
            GroupList::new(problems),
            Err(MatmulSetupError::TooManyGroups { count: 257, max: 256 })
        ));
    }

    #[test_log::test]
    fn rotation_carries_across_groups() {
        let mut schedule = GroupSchedule::new(1, 4);

        assert_eq!(schedule.next_group(3).collect::<Vec<_>>(), vec![1]);
        assert_eq!(schedule.start_core_idx(), 3);
        // Core 3 starts group 1, so core 1 takes its third tile.
        assert_eq!(schedule.next_group(6).collect::<Vec<_>>(), vec![2]);
        assert_eq!(schedule.start_core_idx(), 1);
    }

    #[test_log::test]
    fn every_tile_once_and_balanced() {
        for (loops, cores) in [
            (vec![1, 1, 1], 4),
            (vec![3, 7, 2, 9], 4),
            (vec![20, 1, 5], 20),
            (vec![0, 5, 0, 3], 3),
        ] {
            let assignments = group_assignments(&loops, cores);

            let seen: HashSet<_> = assignments.iter().flatten().copied().collect();
            let total: usize = loops.iter().sum();
            assert_eq!(seen.len(), total);
            assert_eq!(assignments.iter().map(Vec::len).sum::<usize>(), total);

            let counts: Vec<_> = assignments.iter().map(Vec::len).collect();
            let spread = counts.iter().max().unwrap() - counts.iter().min().unwrap();
            assert!(spread <= 1, "{loops:?} on {cores} cores: {counts:?}");
        }
    }
}
