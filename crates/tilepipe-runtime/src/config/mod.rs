/// Device configuration module.
pub mod device;
/// Launch reporting configuration module.
pub mod launch;
/// Logging configuration module.
pub mod logger;
/// Pipeline tracing configuration module.
pub mod pipeline;

mod base;
pub use base::*;
