//! Block level matmul: one output tile of at most `L1.M x L1.N`, streamed over K through the
//! staging and operand tiers.

mod base;
mod pingpong;
mod preload;
mod sparse;
mod stages;
mod w4a8;

pub use base::*;
pub use pingpong::*;
pub use preload::*;
pub use sparse::*;
pub use w4a8::*;

pub(crate) use stages::*;
