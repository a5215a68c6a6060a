//! Tiled GEMM templates for dual-engine accelerators.
//!
//! Kernels are assembled from layers: tile copies and multiply-accumulate, block strategies
//! pipelining one output tile over K, swizzles handing tiles to cores, and vector engine passes
//! (padding, split-K reduction, epilogues) around the matrix engine pipeline.

#[macro_use]
extern crate derive_new;

/// Building blocks of the matmul kernels.
pub mod components;

/// Kernel orchestrators.
pub mod kernels;

mod base;

pub use base::*;
