mod common;

use common::*;
use half::f16;
use pretty_assertions::assert_eq;
use rand::Rng;
use tilepipe_gemm::components::batch::BlockSwizzle;
use tilepipe_gemm::components::block::{BlockMmad, W4A8Types, compress_2_4};
use tilepipe_gemm::components::global::{Identity, LinearCombination};
use tilepipe_gemm::components::{
    BlockTiling, GemmCoord, GemmProblem, LayoutKind, MatmulTypes, RowMajor, TilingF16, TilingI8,
};
use tilepipe_gemm::kernels::{
    MatmulEpilogue, MatmulParams, SparseMatmul, W4A8Matmul, epilogue_workspace_size,
    w4a8_workspace_size,
};
use tilepipe_gemm::{DefaultSwizzle, GemmElement};
use tilepipe_runtime::arch::AtlasA2;
use tilepipe_runtime::Int4x2;

type Half = MatmulTypes<f16, RowMajor, f16, RowMajor, f16>;
type HalfBlock = <f16 as GemmElement>::Pingpong<RowMajor, RowMajor>;
type HalfPreload = <f16 as GemmElement>::Preload<RowMajor, RowMajor, true>;

fn row_major(shape: GemmCoord) -> GemmProblem {
    GemmProblem::packed::<f16, f16, f16>(shape, LayoutKind::RowMajor, LayoutKind::RowMajor)
}

#[test_log::test]
fn epilogue_combines_the_product_with_the_source() {
    let device = device();
    let shape = GemmCoord::new(192, 320, 96);
    let problem = row_major(shape);
    let mut rng = rng(31);
    let a = random_floats::<f16>(&mut rng, shape.m * shape.k);
    let b = random_floats::<f16>(&mut rng, shape.k * shape.n);
    let source = random_floats::<f16>(&mut rng, shape.m * shape.n);
    let d = device.empty::<f16>(shape.m * shape.n).unwrap();
    let workspace = device
        .empty::<u8>(epilogue_workspace_size::<Half, TilingF16>(AIC_CORES))
        .unwrap();

    let params = MatmulParams::<Half>::packed(
        shape,
        upload(&device, &a).tensor(),
        upload(&device, &b).tensor(),
        upload(&device, &source).tensor(),
    );
    let swizzle = DefaultSwizzle::new(shape, TilingF16::L1.mn());
    let kernel = MatmulEpilogue::<HalfBlock, DefaultSwizzle, LinearCombination>::new(
        params,
        d.tensor(),
        Some(workspace),
        AIC_CORES,
        (),
        swizzle,
        LinearCombination::new(2.0, 0.5),
    )
    .unwrap();
    let report = device.launch(&kernel, AIC_CORES).unwrap();

    let expected = reference(&problem, &a, &b)
        .into_iter()
        .zip(&source)
        .map(|(x, c)| 2.0 * x + 0.5 * f64::from(*c))
        .collect::<Vec<_>>();
    assert_close(&problem, &download::<f16>(&device, d), shape.n, &expected);
    assert!(report.aiv.vector_ops > 0);
}

#[test_log::test]
fn identity_epilogue_is_a_plain_matmul() {
    let device = device();
    let shape = GemmCoord::new(130, 64, 64);
    let problem = row_major(shape);
    let mut rng = rng(32);
    let a = random_floats::<f16>(&mut rng, shape.m * shape.k);
    let b = random_floats::<f16>(&mut rng, shape.k * shape.n);
    let d = device.empty::<f16>(shape.m * shape.n).unwrap();
    let workspace = device
        .empty::<u8>(epilogue_workspace_size::<Half, TilingF16>(AIC_CORES))
        .unwrap();

    let params = MatmulParams::<Half>::packed(
        shape,
        upload(&device, &a).tensor(),
        upload(&device, &b).tensor(),
        d.tensor(),
    );
    let swizzle = DefaultSwizzle::new(shape, TilingF16::L1.mn());
    let kernel = MatmulEpilogue::<HalfBlock, DefaultSwizzle, Identity>::new(
        params,
        d.tensor(),
        Some(workspace),
        AIC_CORES,
        (),
        swizzle,
        Identity,
    )
    .unwrap();
    device.launch(&kernel, swizzle.core_loops()).unwrap();

    assert_close(
        &problem,
        &download::<f16>(&device, d),
        shape.n,
        &reference(&problem, &a, &b),
    );
}

/// Runs every tile on one matrix engine, so the workspace ring and its flags turn many times.
fn epilogue_on_one_core<BM>(seed: u64)
where
    BM: BlockMmad<Types = Half, Tiling = TilingF16, Params = ()>,
{
    // 6 x 3 tiles, more than the 15 sets a with-reverse flag holds.
    let shape = GemmCoord::new(768, 768, 64);
    let tiles = 18;
    let problem = row_major(shape);
    let device = device();
    let mut rng = rng(seed);
    let a = random_floats::<f16>(&mut rng, shape.m * shape.k);
    let b = random_floats::<f16>(&mut rng, shape.k * shape.n);
    let source = random_floats::<f16>(&mut rng, shape.m * shape.n);
    let d = device.empty::<f16>(shape.m * shape.n).unwrap();
    let workspace = device
        .empty::<u8>(epilogue_workspace_size::<Half, TilingF16>(1))
        .unwrap();

    let params = MatmulParams::<Half>::packed(
        shape,
        upload(&device, &a).tensor(),
        upload(&device, &b).tensor(),
        upload(&device, &source).tensor(),
    );
    let swizzle = DefaultSwizzle::new(shape, TilingF16::L1.mn());
    assert_eq!(swizzle.core_loops(), tiles);
    let kernel = MatmulEpilogue::<BM, DefaultSwizzle, LinearCombination>::new(
        params,
        d.tensor(),
        Some(workspace),
        1,
        (),
        swizzle,
        LinearCombination::new(1.0, -0.5),
    )
    .unwrap();
    let report = device.launch(&kernel, 1).unwrap();

    let expected = reference(&problem, &a, &b)
        .into_iter()
        .zip(&source)
        .map(|(x, c)| x - 0.5 * f64::from(*c))
        .collect::<Vec<_>>();
    assert_close(&problem, &download::<f16>(&device, d), shape.n, &expected);
    assert!(report.aic.cross_sets >= tiles as u64);
    assert!(report.aiv.cross_waits >= 2 * tiles as u64);
}

#[test_log::test]
fn epilogue_ring_wraps_on_a_busy_core() {
    epilogue_on_one_core::<HalfBlock>(35);
    epilogue_on_one_core::<HalfPreload>(36);
}

#[test_log::test]
fn int4_weights_are_widened_and_dequantized() {
    const SCALE: f64 = 0.0625;
    let device = device();
    let shape = GemmCoord::new(64, 96, 640);
    let mut rng = rng(33);
    let a = random_i8(&mut rng, shape.m * shape.k, 8);
    let weights = (0..shape.k * shape.n)
        .map(|_| rng.random_range(Int4x2::MIN..=7))
        .collect::<Vec<i8>>();
    let packed = device.create(&Int4x2::pack_slice(&weights)).unwrap();
    let c = device.empty::<f16>(shape.m * shape.n).unwrap();
    let workspace = device
        .empty::<u8>(w4a8_workspace_size::<TilingI8>(AIC_CORES))
        .unwrap();

    let params = MatmulParams::<W4A8Types<RowMajor, RowMajor>>::packed(
        shape,
        upload(&device, &a).tensor(),
        packed.tensor(),
        c.tensor(),
    );
    let swizzle = DefaultSwizzle::new(shape, TilingI8::L1.mn());
    let kernel = W4A8Matmul::<AtlasA2, RowMajor, RowMajor, TilingI8, DefaultSwizzle, true>::new(
        params,
        SCALE,
        Some(workspace),
        AIC_CORES,
        swizzle,
    )
    .unwrap();
    device.launch(&kernel, swizzle.core_loops()).unwrap();

    let problem =
        GemmProblem::packed::<i8, i8, f16>(shape, LayoutKind::RowMajor, LayoutKind::RowMajor);
    let expected = reference(&problem, &a, &weights)
        .into_iter()
        .map(|value| value * SCALE)
        .collect::<Vec<_>>();
    assert_close(&problem, &download::<f16>(&device, c), shape.n, &expected);
}

#[test_log::test]
fn structured_sparse_weights_match_their_dense_product() {
    let device = device();
    let shape = GemmCoord::new(96, 64, 256);
    let mut rng = rng(34);
    let a = random_i8(&mut rng, shape.m * shape.k, 8);
    let mut dense = vec![0i8; shape.k * shape.n];
    for group in 0..shape.k / 4 {
        for column in 0..shape.n {
            let first = rng.random_range(0..4);
            let second = (first + rng.random_range(1..4)) % 4;
            for position in [first, second] {
                dense[(group * 4 + position) * shape.n + column] = rng.random_range(-8..=8);
            }
        }
    }
    let (values, index) = compress_2_4(&dense, shape.k, shape.n).unwrap();
    let c = device.empty::<i32>(shape.m * shape.n).unwrap();

    let params = MatmulParams::new(
        shape,
        upload(&device, &a).tensor(),
        RowMajor::new(shape.m, shape.k),
        upload(&device, &values).tensor(),
        RowMajor::new(shape.k / 2, shape.n),
        c.tensor(),
        RowMajor::new(shape.m, shape.n),
    );
    let swizzle = DefaultSwizzle::new(shape, TilingI8::L1.mn());
    let kernel = SparseMatmul::<AtlasA2, RowMajor, i32, TilingI8, DefaultSwizzle>::new(
        params,
        upload(&device, &index).tensor(),
        swizzle,
    );
    device.launch(&kernel, AIC_CORES).unwrap();

    let problem =
        GemmProblem::packed::<i8, i8, i32>(shape, LayoutKind::RowMajor, LayoutKind::RowMajor);
    let expected = reference(&problem, &a, &dense)
        .into_iter()
        .map(|value| value as i32)
        .collect::<Vec<_>>();
    assert_eq!(download::<i32>(&device, c), expected);
}
