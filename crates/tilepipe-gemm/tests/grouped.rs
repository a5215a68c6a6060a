mod common;

use common::*;
use half::f16;
use pretty_assertions::assert_eq;
use tilepipe_gemm::components::batch::{GroupList, GroupSchedule, MAX_GROUP_COUNT, group_assignments};
use tilepipe_gemm::components::global::LinearCombination;
use tilepipe_gemm::components::{
    BlockTiling, GemmCoord, GemmProblem, LayoutKind, MatmulSetupError, MatmulTypes, RowMajor,
    TilingF16,
};
use tilepipe_gemm::kernels::{
    BatchStrides, BatchedMatmul, GroupArenas, GroupedMatmulEpilogue, MatmulParams,
    epilogue_workspace_size,
};
use tilepipe_gemm::{DefaultSwizzle, GemmBuffers, GemmElement, Strategy, launch, launch_grouped};

type Half = MatmulTypes<f16, RowMajor, f16, RowMajor, f16>;
type HalfBlock = <f16 as GemmElement>::Pingpong<RowMajor, RowMajor>;

fn shapes() -> Vec<GemmCoord> {
    vec![
        GemmCoord::new(64, 64, 64),
        GemmCoord::new(128, 32, 256),
        GemmCoord::new(32, 256, 32),
    ]
}

#[test_log::test]
fn every_group_matches_its_own_launch() {
    let device = device();
    let groups = GroupList::new(shapes()).unwrap();
    let totals = groups.totals();
    let mut rng = rng(11);
    let a = random_floats::<f16>(&mut rng, totals.a);
    let b = random_floats::<f16>(&mut rng, totals.b);
    let c = device.empty::<f16>(totals.c).unwrap();

    launch_grouped::<f16, RowMajor, RowMajor>(
        &device,
        groups.clone(),
        upload(&device, &a),
        upload(&device, &b),
        c,
    )
    .unwrap();
    let grouped = download::<f16>(&device, c);

    for group in 0..groups.len() {
        let shape = groups.problem(group);
        let offsets = groups.offsets(group);
        let problem = GemmProblem::packed::<f16, f16, f16>(
            shape,
            LayoutKind::RowMajor,
            LayoutKind::RowMajor,
        );
        let own_c = device.empty::<f16>(shape.m * shape.n).unwrap();
        let buffers = GemmBuffers::new(
            upload(&device, &a[offsets.a..offsets.a + shape.m * shape.k]),
            upload(&device, &b[offsets.b..offsets.b + shape.k * shape.n]),
            own_c,
            None,
        );
        launch::<f16>(&device, &Strategy::Pingpong, &problem, &buffers).unwrap();

        assert_eq!(
            &grouped[offsets.c..offsets.c + shape.m * shape.n],
            download::<f16>(&device, own_c).as_slice(),
            "group {group}"
        );
    }
}

#[test_log::test]
fn group_tiles_stay_balanced_over_cores() {
    let groups = GroupList::new(shapes()).unwrap();
    let tile = TilingF16::L1.mn();
    let loops = groups
        .problems()
        .iter()
        .map(|problem| problem.mn().ceil_div(tile).count())
        .collect::<Vec<_>>();

    let per_core = (0..AIC_CORES)
        .map(|core| {
            let mut schedule = GroupSchedule::new(core, AIC_CORES);
            loops
                .iter()
                .map(|&loops| schedule.next_group(loops).count())
                .sum::<usize>()
        })
        .collect::<Vec<_>>();

    assert_eq!(per_core.iter().sum::<usize>(), loops.iter().sum::<usize>());
    assert!(per_core.iter().max().unwrap() - per_core.iter().min().unwrap() <= 1);
    assert_eq!(
        group_assignments(&loops, AIC_CORES).iter().map(Vec::len).sum::<usize>(),
        loops.iter().sum::<usize>()
    );
}

#[test_log::test]
fn too_many_groups_are_rejected() {
    let problems = vec![GemmCoord::new(16, 16, 16); MAX_GROUP_COUNT + 1];

    assert!(matches!(
        GroupList::new(problems),
        Err(MatmulSetupError::TooManyGroups { count: 257, max: 256 })
    ));
}

#[test_log::test]
fn grouped_epilogue_scales_each_group() {
    let device = device();
    let groups = GroupList::new(shapes()).unwrap();
    let totals = groups.totals();
    let mut rng = rng(12);
    let a = random_floats::<f16>(&mut rng, totals.a);
    let b = random_floats::<f16>(&mut rng, totals.b);
    let source = random_floats::<f16>(&mut rng, totals.c);
    let d = device.empty::<f16>(totals.c).unwrap();
    let workspace = device
        .empty::<u8>(epilogue_workspace_size::<Half, TilingF16>(AIC_CORES))
        .unwrap();

    let arenas = GroupArenas::<Half>::new(
        upload(&device, &a).tensor(),
        upload(&device, &b).tensor(),
        upload(&device, &source).tensor(),
    );
    let kernel = GroupedMatmulEpilogue::<HalfBlock, LinearCombination>::new(
        groups.clone(),
        arenas,
        d.tensor(),
        Some(workspace),
        AIC_CORES,
        (),
        LinearCombination::new(0.5, -1.0),
    )
    .unwrap();
    device.launch(&kernel, AIC_CORES).unwrap();
    let output = download::<f16>(&device, d);

    for group in 0..groups.len() {
        let shape = groups.problem(group);
        let offsets = groups.offsets(group);
        let problem = GemmProblem::packed::<f16, f16, f16>(
            shape,
            LayoutKind::RowMajor,
            LayoutKind::RowMajor,
        );
        let expected = reference(&problem, &a[offsets.a..], &b[offsets.b..])
            .into_iter()
            .zip(&source[offsets.c..])
            .map(|(x, c)| 0.5 * x - f64::from(*c))
            .collect::<Vec<_>>();

        assert_close(&problem, &output[offsets.c..], shape.n, &expected);
    }
}

#[test_log::test]
fn batched_problems_follow_their_strides() {
    let device = device();
    let shape = GemmCoord::new(96, 64, 128);
    let batch = 3;
    let strides = BatchStrides::new(shape.m * shape.k, shape.k * shape.n, shape.m * shape.n);
    let mut rng = rng(13);
    let a = random_floats::<f16>(&mut rng, strides.a * batch);
    let b = random_floats::<f16>(&mut rng, strides.b * batch);
    let c = device.empty::<f16>(strides.c * batch).unwrap();

    let params = MatmulParams::<Half>::packed(
        shape,
        upload(&device, &a).tensor(),
        upload(&device, &b).tensor(),
        c.tensor(),
    );
    let swizzle = DefaultSwizzle::new(shape, TilingF16::L1.mn());
    let kernel = BatchedMatmul::<HalfBlock, DefaultSwizzle>::new(params, batch, strides, (), swizzle);
    device.launch(&kernel, AIC_CORES).unwrap();
    let output = download::<f16>(&device, c);

    let problem =
        GemmProblem::packed::<f16, f16, f16>(shape, LayoutKind::RowMajor, LayoutKind::RowMajor);
    for index in 0..batch {
        let expected = reference(&problem, &a[index * strides.a..], &b[index * strides.b..]);
        assert_close(&problem, &output[index * strides.c..], shape.n, &expected);
    }
}
