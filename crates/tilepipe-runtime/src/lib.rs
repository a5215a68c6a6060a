//! Execution model of a dual-engine tiled accelerator.
//!
//! A launch runs one kernel on a number of matrix engines (AIC), each paired with vector engines
//! (AIV). Every core owns a fixed set of on-chip tiers, orders its pipes with hardware events and
//! talks to the other engine class through counted cross core flags. Protocol mistakes that would
//! corrupt data or deadlock real hardware are reported as [`Fault`]s.

#[macro_use]
extern crate derive_new;

/// Architecture tags and on-chip capacities.
pub mod arch;

/// Global configuration and log sinks.
pub mod config;

mod device;
mod element;
mod error;
mod memory;
mod resource;
mod stats;

/// Hardware events, stage tokens and cross core flags.
pub mod sync;

pub use device::*;
pub use element::*;
pub use error::*;
pub use memory::*;
pub use resource::*;
pub use stats::*;
