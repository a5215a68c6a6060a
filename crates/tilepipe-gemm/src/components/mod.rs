pub mod batch;
pub mod block;
pub mod global;
pub mod tile;

mod buffer;
mod coord;
mod error;
mod layout;
mod problem;
mod tiling;
mod types;

pub use buffer::*;
pub use coord::*;
pub use error::*;
pub use layout::*;
pub use problem::*;
pub use tiling::*;
pub use types::*;
