use std::time::Duration;

use pretty_assertions::assert_eq;
use tilepipe_runtime::arch::{ArchTag, AtlasA2};
use tilepipe_runtime::config::GlobalConfig;
use tilepipe_runtime::config::pipeline::PipelineLogLevel;
use tilepipe_runtime::sync::{CrossCoreFlag, CrossCoreFlagWithReverse};
use tilepipe_runtime::{
    CoreContext, CoreType, Device, DeviceProperties, DeviceResult, Fault, Kernel, KernelMode,
    LaunchError, ProtocolViolation,
};

const READY: CrossCoreFlag = CrossCoreFlag { id: 1 };
const DONE: CrossCoreFlag = CrossCoreFlag { id: 2 };

fn properties(aic_core_num: usize, watchdog: Duration) -> DeviceProperties {
    DeviceProperties {
        arch: AtlasA2::spec(),
        aic_core_num,
        global_memory_size: 1024 * 1024,
        watchdog,
    }
}

fn device(aic_core_num: usize, watchdog: Duration) -> Device {
    Device::with_properties(properties(aic_core_num, watchdog))
}

/// The matrix engine releases its vector engines, then waits for both of them.
struct Handshake;

impl Kernel for Handshake {
    fn arch(&self) -> &'static str {
        AtlasA2::NAME
    }

    fn run_aic(&self, ctx: &mut CoreContext<'_>) -> DeviceResult {
        ctx.cross_core_set_flag(READY)?;
        ctx.cross_core_wait_flag(DONE)
    }

    fn run_aiv(&self, ctx: &mut CoreContext<'_>) -> DeviceResult {
        ctx.cross_core_wait_flag(READY)?;
        ctx.cross_core_barrier_aiv()?;
        ctx.cross_core_set_flag(DONE)
    }
}

#[test_log::test]
fn handshake_counts_every_flag() {
    let device = device(3, Duration::from_secs(10));

    let report = device.launch(&Handshake, 3).unwrap();

    assert_eq!(report.block_dim, 3);
    assert_eq!(report.aic.cross_sets, 3);
    assert_eq!(report.aic.cross_waits, 3);
    assert_eq!(report.aiv.cross_sets, 6);
    assert_eq!(report.aiv.cross_waits, 6);
    assert_eq!(report.per_core.len(), 9);
    assert_eq!(
        report
            .per_core
            .iter()
            .filter(|(id, _)| id.core_type == CoreType::Aic)
            .count(),
        3
    );
}

/// Streams more sets than a plain flag holds through a with-reverse pair.
struct Stream {
    rounds: u32,
}

impl Kernel for Stream {
    fn arch(&self) -> &'static str {
        AtlasA2::NAME
    }

    fn run_aic(&self, ctx: &mut CoreContext<'_>) -> DeviceResult {
        let mut flag = CrossCoreFlagWithReverse::new(3, 4);
        for _ in 0..self.rounds {
            ctx.cross_core_set_flag_with_reverse(&mut flag)?;
        }
        Ok(())
    }

    fn run_aiv(&self, ctx: &mut CoreContext<'_>) -> DeviceResult {
        let mut flag = CrossCoreFlagWithReverse::new(3, 4);
        for _ in 0..self.rounds {
            ctx.cross_core_wait_flag_with_reverse(&mut flag)?;
        }
        Ok(())
    }
}

#[test_log::test]
fn with_reverse_flags_survive_long_loops() {
    let device = device(2, Duration::from_secs(10));

    let report = device.launch(&Stream { rounds: 40 }, 2).unwrap();

    assert_eq!(report.aiv.cross_waits, 2 * 2 * 40);
}

/// Waits on a flag nobody sets.
struct Stuck;

impl Kernel for Stuck {
    fn arch(&self) -> &'static str {
        AtlasA2::NAME
    }

    fn mode(&self) -> KernelMode {
        KernelMode::Mix
    }

    fn run_aic(&self, ctx: &mut CoreContext<'_>) -> DeviceResult {
        ctx.cross_core_wait_flag(DONE)
    }
}

#[test_log::test]
fn a_missing_set_becomes_a_hang() {
    let device = device(1, Duration::from_millis(100));

    let err = device.launch(&Stuck, 1).unwrap_err();

    assert!(matches!(
        err,
        LaunchError::Fault {
            fault: Fault::Hang { .. },
            ..
        }
    ));
}

/// Sets a plain flag twice before anyone waits.
struct Overflow;

impl Kernel for Overflow {
    fn arch(&self) -> &'static str {
        AtlasA2::NAME
    }

    fn mode(&self) -> KernelMode {
        KernelMode::Mix
    }

    fn run_aic(&self, ctx: &mut CoreContext<'_>) -> DeviceResult {
        ctx.cross_core_set_flag(READY)?;
        ctx.cross_core_set_flag(READY)
    }
}

#[test_log::test]
fn a_plain_flag_holds_one_pending_set() {
    let device = device(1, Duration::from_secs(10));

    let err = device.launch(&Overflow, 1).unwrap_err();

    match err {
        LaunchError::Fault {
            fault: Fault::Protocol(violation),
            ..
        } => assert!(matches!(
            violation,
            ProtocolViolation::CrossFlagOverflow { id: 1, .. }
        )),
        other => panic!("unexpected error {other}"),
    }
}

struct Foreign;

impl Kernel for Foreign {
    fn arch(&self) -> &'static str {
        "other-arch"
    }
}

#[test_log::test]
fn launches_are_checked_against_the_device() {
    let device = device(2, Duration::from_secs(10));

    assert!(matches!(
        device.launch(&Handshake, 3),
        Err(LaunchError::InvalidBlockDim {
            block_dim: 3,
            available: 2
        })
    ));
    assert!(matches!(
        device.launch(&Handshake, 0),
        Err(LaunchError::InvalidBlockDim { .. })
    ));
    assert!(matches!(
        device.launch(&Foreign, 1),
        Err(LaunchError::ArchMismatch { .. })
    ));
}

/// Reports one phase per core.
struct Phases;

impl Kernel for Phases {
    fn arch(&self) -> &'static str {
        AtlasA2::NAME
    }

    fn run_aic(&self, ctx: &mut CoreContext<'_>) -> DeviceResult {
        ctx.log_phase("tiles stored");
        Ok(())
    }

    fn run_aiv(&self, ctx: &mut CoreContext<'_>) -> DeviceResult {
        ctx.log_phase(format_args!("lane {} done", ctx.sub_block_idx()));
        Ok(())
    }
}

fn phase_lines(level: PipelineLogLevel, name: &str) -> Vec<String> {
    let path = std::env::temp_dir().join(format!("tilepipe-{name}-{}.log", std::process::id()));
    let mut config = GlobalConfig::default();
    config.pipeline.logger.level = level;
    config.pipeline.logger.file = Some(path.clone());
    config.pipeline.logger.append = false;

    let device = Device::with_config(properties(2, Duration::from_secs(10)), config);
    device.launch(&Phases, 2).unwrap();
    drop(device);

    let content = std::fs::read_to_string(&path).unwrap_or_default();
    let _ = std::fs::remove_file(&path);
    let mut lines = content.lines().map(str::to_owned).collect::<Vec<_>>();
    lines.sort();
    lines
}

#[test_log::test]
fn kernel_phases_reach_the_pipeline_sinks() {
    let lines = phase_lines(PipelineLogLevel::Phases, "phases");

    assert_eq!(
        lines,
        vec![
            "aic[0]: tiles stored",
            "aic[1]: tiles stored",
            "aiv[0]: lane 0 done",
            "aiv[1]: lane 1 done",
            "aiv[2]: lane 0 done",
            "aiv[3]: lane 1 done",
        ]
    );
}

#[test_log::test]
fn disabled_pipeline_logging_writes_nothing() {
    assert!(phase_lines(PipelineLogLevel::Disabled, "disabled").is_empty());
}
