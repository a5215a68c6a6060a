#![allow(dead_code)]

use std::path::Path;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tilepipe_gemm::components::{GemmProblem, LayoutKind};
use tilepipe_runtime::arch::{ArchTag, AtlasA2};
use tilepipe_runtime::config::GlobalConfig;
use tilepipe_runtime::config::pipeline::PipelineLogLevel;
use tilepipe_runtime::{Device, DeviceProperties, Element, GmBuffer};

pub const AIC_CORES: usize = 4;

fn properties() -> DeviceProperties {
    DeviceProperties {
        arch: AtlasA2::spec(),
        aic_core_num: AIC_CORES,
        global_memory_size: 64 * 1024 * 1024,
        watchdog: Duration::from_secs(60),
    }
}

/// A small device, so that tests spawn few threads while still spreading tiles over cores.
pub fn device() -> Device {
    Device::with_properties(properties())
}

/// Same device, with kernel phases written to `path`.
pub fn phase_logging_device(path: &Path) -> Device {
    let mut config = GlobalConfig::default();
    config.pipeline.logger.level = PipelineLogLevel::Phases;
    config.pipeline.logger.file = Some(path.to_path_buf());
    config.pipeline.logger.append = false;
    Device::with_config(properties(), config)
}

/// Phase lines of `path` containing `pattern`, sorted. Removes the file.
pub fn phase_lines(path: &Path, pattern: &str) -> Vec<String> {
    let content = std::fs::read_to_string(path).unwrap_or_default();
    let _ = std::fs::remove_file(path);
    let mut lines = content
        .lines()
        .filter(|line| line.contains(pattern))
        .map(str::to_owned)
        .collect::<Vec<_>>();
    lines.sort();
    lines
}

pub fn rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

pub fn random_floats<E: Element>(rng: &mut StdRng, len: usize) -> Vec<E> {
    (0..len)
        .map(|_| E::from_f64(rng.random_range(-1.0..1.0)))
        .collect()
}

pub fn random_i8(rng: &mut StdRng, len: usize, bound: i8) -> Vec<i8> {
    (0..len).map(|_| rng.random_range(-bound..=bound)).collect()
}

pub fn upload<E: Element>(device: &Device, values: &[E]) -> GmBuffer {
    device.create(values).expect("device memory")
}

pub fn download<E: Element>(device: &Device, buffer: GmBuffer) -> Vec<E> {
    device.read(buffer).expect("device memory")
}

/// Offset of `(row, column)` in a matrix stored as `kind` with leading dimension `stride`.
pub fn index(kind: LayoutKind, stride: usize, row: usize, column: usize) -> usize {
    match kind {
        LayoutKind::RowMajor => row * stride + column,
        LayoutKind::ColumnMajor => column * stride + row,
    }
}

/// Plain triple loop in `f64`, returning a dense row-major `M x N` result.
pub fn reference<A: Element, B: Element>(problem: &GemmProblem, a: &[A], b: &[B]) -> Vec<f64> {
    let shape = problem.shape;
    let mut out = vec![0.0; shape.m * shape.n];
    for i in 0..shape.m {
        for j in 0..shape.n {
            out[i * shape.n + j] = (0..shape.k)
                .map(|k| {
                    a[index(problem.layout_a, problem.stride_a, i, k)].to_f64()
                        * b[index(problem.layout_b, problem.stride_b, k, j)].to_f64()
                })
                .sum();
        }
    }
    out
}

/// Relative tolerance of a floating point result, which widens for long K.
pub fn tolerance(k: usize) -> f64 {
    if k > 2048 { 2f64.powi(-7) } else { 2f64.powi(-8) }
}

/// Checks the `M x N` output stored with row stride `stride_c` against a dense reference.
pub fn assert_close<C: Element>(
    problem: &GemmProblem,
    actual: &[C],
    stride_c: usize,
    expected: &[f64],
) {
    let (m, n) = (problem.shape.m, problem.shape.n);
    let tolerance = tolerance(problem.shape.k);
    let mismatches = (0..m * n)
        .filter(|&idx| {
            let (row, column) = (idx / n, idx % n);
            let got = actual[row * stride_c + column].to_f64();
            let want = expected[idx];
            (got - want).abs() > tolerance * want.abs().max(1.0)
        })
        .collect::<Vec<_>>();

    assert!(
        mismatches.is_empty(),
        "{} of {} elements out of tolerance, first at {:?}",
        mismatches.len(),
        m * n,
        &mismatches[..mismatches.len().min(8)]
    );
}
