//! Mapping of output tiles to cores: swizzled traversals, split-K and stream-K decompositions,
//! and the rotation that spreads grouped problems over the cores of a launch.

mod group;
mod splitk;
mod streamk;
mod swizzle;

pub use group::*;
pub use splitk::*;
pub use streamk::*;
pub use swizzle::*;
