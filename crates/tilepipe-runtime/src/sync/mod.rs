//! Ordering primitives: per-core hardware events, stage tokens built on them, and counted flags
//! shared between the two engine classes.

mod cross_core;
mod event;
mod stage;

pub(crate) use cross_core::{Direction, SyncBoard};
pub use cross_core::{
    CROSS_FLAG_NUM, CrossCoreFlag, CrossCoreFlagWithReverse, FLAG_COUNTER_MAX, REVERSE_DEPTH,
};
pub use event::*;
pub use stage::*;
