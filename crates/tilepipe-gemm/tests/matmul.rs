mod common;

use common::*;
use half::{bf16, f16};
use pretty_assertions::assert_eq;
use tilepipe_gemm::components::batch::BlockSwizzle;
use tilepipe_gemm::components::{
    BlockTiling, GemmCoord, GemmProblem, LayoutKind, MatmulAvailabilityError, MatmulLaunchError,
    MatmulSetupError, TilingF16,
};
use tilepipe_gemm::{DefaultSwizzle, GemmBuffers, GemmElement, Strategy, launch};

struct Run<C> {
    output: Vec<C>,
    expected: Vec<f64>,
    gm_write_bytes: u64,
}

fn launch_random<E: GemmElement>(problem: GemmProblem, strategy: Strategy, seed: u64) -> Run<E::Output> {
    let device = device();
    let mut rng = rng(seed);
    let a = random_floats::<E>(&mut rng, problem.storage_a());
    let b = random_floats::<E>(&mut rng, problem.storage_b());
    let c = device.empty::<E::Output>(problem.storage_c()).unwrap();
    let buffers = GemmBuffers::new(upload(&device, &a), upload(&device, &b), c, None);

    let report = launch::<E>(&device, &strategy, &problem, &buffers).unwrap();

    Run {
        output: download(&device, c),
        expected: reference(&problem, &a, &b),
        gm_write_bytes: report.aic.gm_write_bytes + report.aiv.gm_write_bytes,
    }
}

fn packed<E: GemmElement>(m: usize, n: usize, k: usize, a: LayoutKind, b: LayoutKind) -> GemmProblem {
    GemmProblem::packed::<E, E, E::Output>(GemmCoord::new(m, n, k), a, b)
}

#[test_log::test]
fn square_half_precision_matches_reference() {
    let problem = packed::<f16>(128, 128, 128, LayoutKind::RowMajor, LayoutKind::RowMajor);

    let run = launch_random::<f16>(problem, Strategy::Pingpong, 1);

    assert_close(&problem, &run.output, 128, &run.expected);
}

#[test_log::test]
fn several_k_tiles_accumulate_like_a_single_pass() {
    let problem = packed::<f16>(256, 128, 384, LayoutKind::RowMajor, LayoutKind::RowMajor);

    let run = launch_random::<f16>(problem, Strategy::Pingpong, 2);

    assert_close(&problem, &run.output, 128, &run.expected);
}

#[test_log::test]
fn column_major_tail_tile_copies_only_its_rows() {
    let problem = packed::<f16>(200, 64, 96, LayoutKind::ColumnMajor, LayoutKind::ColumnMajor);
    let swizzle = DefaultSwizzle::new(problem.shape, TilingF16::L1.mn());

    assert_eq!(swizzle.actual_block_shape(GemmCoord::new(1, 0, 0)).m, 72);

    let run = launch_random::<f16>(problem, Strategy::Pingpong, 3);

    assert_close(&problem, &run.output, 64, &run.expected);
    assert_eq!(run.gm_write_bytes, (200 * 64 * size_of::<f16>()) as u64);
}

#[test_log::test]
fn preload_with_and_without_shuffled_k() {
    let problem = packed::<f16>(160, 300, 600, LayoutKind::RowMajor, LayoutKind::ColumnMajor);

    for shuffle_k in [false, true] {
        let run = launch_random::<f16>(problem, Strategy::Preload { shuffle_k }, 4);

        assert_close(&problem, &run.output, 300, &run.expected);
    }
}

#[test_log::test]
fn single_and_brain_float_inputs() {
    let problem = packed::<f32>(96, 80, 200, LayoutKind::ColumnMajor, LayoutKind::RowMajor);
    let run = launch_random::<f32>(problem, Strategy::Pingpong, 5);
    assert_close(&problem, &run.output, 80, &run.expected);

    let problem = packed::<bf16>(64, 128, 64, LayoutKind::RowMajor, LayoutKind::RowMajor);
    let run = launch_random::<bf16>(problem, Strategy::Preload { shuffle_k: true }, 6);
    // bf16 output keeps 8 mantissa bits.
    for (got, want) in run.output.iter().zip(&run.expected) {
        assert!((got.to_f64() - want).abs() <= 2f64.powi(-7) * want.abs().max(1.0));
    }
}

#[test_log::test]
fn int8_accumulates_exactly() {
    let problem = packed::<i8>(64, 96, 160, LayoutKind::RowMajor, LayoutKind::ColumnMajor);
    let device = device();
    let mut rng = rng(7);
    let a = random_i8(&mut rng, problem.storage_a(), 8);
    let b = random_i8(&mut rng, problem.storage_b(), 8);
    let c = device.empty::<i32>(problem.storage_c()).unwrap();
    let buffers = GemmBuffers::new(upload(&device, &a), upload(&device, &b), c, None);

    launch::<i8>(&device, &Strategy::Preload { shuffle_k: false }, &problem, &buffers).unwrap();

    let expected = reference(&problem, &a, &b)
        .into_iter()
        .map(|value| value as i32)
        .collect::<Vec<_>>();
    assert_eq!(download::<i32>(&device, c), expected);
}

#[test_log::test]
fn strided_output_leaves_the_gaps_alone() {
    let problem = packed::<f16>(40, 48, 64, LayoutKind::RowMajor, LayoutKind::RowMajor)
        .with_strides(64, 48, 56);
    let device = device();
    let mut rng = rng(8);
    let a = random_floats::<f16>(&mut rng, problem.storage_a());
    let b = random_floats::<f16>(&mut rng, problem.storage_b());
    let sentinel = f16::from_f64(7.0);
    let c = upload(&device, &vec![sentinel; 40 * 56]);
    let buffers = GemmBuffers::new(upload(&device, &a), upload(&device, &b), c, None);

    launch::<f16>(&device, &Strategy::Pingpong, &problem, &buffers).unwrap();

    let output = download::<f16>(&device, c);
    assert_close(&problem, &output, 56, &reference(&problem, &a, &b));
    assert!((0..39).all(|row| output[row * 56 + 48..row * 56 + 56].iter().all(|v| *v == sentinel)));
}

#[test_log::test]
fn undersized_buffers_and_wrong_types_are_rejected() {
    let device = device();
    let problem = packed::<f16>(64, 64, 64, LayoutKind::RowMajor, LayoutKind::RowMajor);
    let small = device.empty::<f16>(64).unwrap();
    let full = device.empty::<f16>(64 * 64).unwrap();

    let result = launch::<f16>(
        &device,
        &Strategy::Pingpong,
        &problem,
        &GemmBuffers::new(full, small, full, None),
    );
    assert!(matches!(
        result,
        Err(MatmulLaunchError::Setup(MatmulSetupError::BufferTooSmall { operand: "b", .. }))
    ));

    let result = launch::<f32>(
        &device,
        &Strategy::Pingpong,
        &problem,
        &GemmBuffers::new(full, full, full, None),
    );
    assert!(matches!(
        result,
        Err(MatmulLaunchError::Setup(MatmulSetupError::Unsupported(
            MatmulAvailabilityError::Types { .. }
        )))
    ));
}

#[test_log::test]
fn small_tiles_drain_the_matrix_pipe() {
    // 2x2 output fractals sit below the threshold, 8x16 above it.
    let small = packed::<f16>(32, 32, 64, LayoutKind::RowMajor, LayoutKind::RowMajor);
    let large = packed::<f16>(128, 256, 64, LayoutKind::RowMajor, LayoutKind::RowMajor);
    let device = device();

    let mut barriers = Vec::new();
    for problem in [small, large] {
        let mut rng = rng(9);
        let a = random_floats::<f16>(&mut rng, problem.storage_a());
        let b = random_floats::<f16>(&mut rng, problem.storage_b());
        let c = device.empty::<f16>(problem.storage_c()).unwrap();
        let buffers = GemmBuffers::new(upload(&device, &a), upload(&device, &b), c, None);

        let report = launch::<f16>(&device, &Strategy::Pingpong, &problem, &buffers).unwrap();

        assert_eq!(report.aic.mmad, 1);
        barriers.push(report.aic.barriers);
    }

    assert_eq!(barriers, vec![1, 0]);
}

#[test_log::test]
fn unit_flag_only_for_whole_k_accumulation() {
    let device = device();
    let mut skips = Vec::new();
    for (strategy, k) in [
        (Strategy::Pingpong, 64),
        (Strategy::Preload { shuffle_k: true }, 64),
        (Strategy::PaddingSplitk, 2000),
        (Strategy::Streamk, 512),
    ] {
        let problem = packed::<f16>(128, 256, k, LayoutKind::RowMajor, LayoutKind::RowMajor);
        let mut rng = rng(10);
        let a = random_floats::<f16>(&mut rng, problem.storage_a());
        let b = random_floats::<f16>(&mut rng, problem.storage_b());
        let c = device.empty::<f16>(problem.storage_c()).unwrap();
        let buffers = GemmBuffers::new(upload(&device, &a), upload(&device, &b), c, None);

        let report = launch::<f16>(&device, &strategy, &problem, &buffers).unwrap();

        assert_close(&problem, &download::<f16>(&device, c), 256, &reference(&problem, &a, &b));
        skips.push(report.aic.unit_flag_skips);
    }

    assert_eq!(skips, vec![1, 1, 0, 0]);
}

#[test_log::test]
fn int8_never_uses_the_unit_flag() {
    let problem = packed::<i8>(64, 64, 64, LayoutKind::RowMajor, LayoutKind::RowMajor);
    let device = device();
    let a = device.empty::<i8>(problem.storage_a()).unwrap();
    let b = device.empty::<i8>(problem.storage_b()).unwrap();
    let c = device.empty::<i32>(problem.storage_c()).unwrap();

    let report = launch::<i8>(&device, &Strategy::Pingpong, &problem, &GemmBuffers::new(a, b, c, None))
        .unwrap();

    assert_eq!(report.aic.unit_flag_skips, 0);
}

#[test_log::test]
fn shuffled_cores_start_on_different_k_tiles() {
    // Four full tiles of four K tiles each, one tile per matrix engine.
    let problem = packed::<f16>(512, 256, 1024, LayoutKind::RowMajor, LayoutKind::RowMajor);

    for shuffle_k in [false, true] {
        let path = std::env::temp_dir()
            .join(format!("tilepipe-shuffle-{shuffle_k}-{}.log", std::process::id()));
        let device = phase_logging_device(&path);
        let mut rng = rng(11);
        let a = random_floats::<f16>(&mut rng, problem.storage_a());
        let b = random_floats::<f16>(&mut rng, problem.storage_b());
        let c = device.empty::<f16>(problem.storage_c()).unwrap();
        let buffers = GemmBuffers::new(upload(&device, &a), upload(&device, &b), c, None);

        launch::<f16>(&device, &Strategy::Preload { shuffle_k }, &problem, &buffers).unwrap();

        assert_close(&problem, &download::<f16>(&device, c), 256, &reference(&problem, &a, &b));
        let expected = (0..AIC_CORES)
            .map(|core| {
                let start = if shuffle_k { core } else { 0 };
                format!("aic[{core}]: K loop from tile {start} of 4")
            })
            .collect::<Vec<_>>();
        assert_eq!(phase_lines(&path, "K loop"), expected);
    }
}
