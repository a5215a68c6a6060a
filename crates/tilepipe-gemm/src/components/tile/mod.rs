//! Single tile primitives: DMA between tiers, the matrix engine instruction and vector engine
//! element-wise operations.

mod copy;
mod mmad;
mod vector;

pub use copy::*;
pub use mmad::*;
pub use vector::*;
