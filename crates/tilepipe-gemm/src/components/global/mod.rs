//! Work spanning both engine classes or the whole matrix: hand-offs through global memory,
//! workspace padding, split-K reduction and epilogues.

mod epilogue;
mod handoff;
mod padding;
mod reduce;

pub use epilogue::*;
pub use handoff::*;
pub use padding::*;
pub use reduce::*;
