use crate::arch::{ArchSpec, ArchTag, TierKind};
use crate::config::launch::LaunchLogLevel;
use crate::config::logger::Logger;
use crate::config::pipeline::PipelineLogLevel;
use crate::config::GlobalConfig;
use crate::element::Element;
use crate::error::{AllocationError, DeviceResult, Fault, LaunchError, ProtocolViolation};
use crate::memory::{CopyRun, GlobalMemory, GlobalTensor, GmBuffer, LocalTensor, check_global};
use crate::resource::CoreResource;
use crate::stats::PipeStats;
use crate::sync::{
    CrossCoreFlag, CrossCoreFlagWithReverse, Direction, EventId, EventTable, HardEvent, Pipe,
    REVERSE_DEPTH, SyncBoard,
};
use bytemuck::Pod;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// The two engine classes of the accelerator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CoreType {
    /// Matrix engine.
    Aic,
    /// Vector engine.
    Aiv,
}

/// Identity of one simulated core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, new)]
pub struct CoreId {
    pub core_type: CoreType,
    pub index: usize,
}

impl core::fmt::Display for CoreId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.core_type {
            CoreType::Aic => write!(f, "aic[{}]", self.index),
            CoreType::Aiv => write!(f, "aiv[{}]", self.index),
        }
    }
}

/// Which engine classes a kernel occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelMode {
    Mix,
    AicOnly,
    AivOnly,
}

/// A device program.
///
/// Every core of a class runs the same entry point and tells itself apart through
/// [`CoreContext::block_idx`]. The two classes only communicate through cross core flags and
/// global memory.
pub trait Kernel: Sync {
    /// Architecture the kernel was built for.
    fn arch(&self) -> &'static str;

    fn mode(&self) -> KernelMode {
        KernelMode::Mix
    }

    fn name(&self) -> String {
        core::any::type_name::<Self>().to_string()
    }

    fn run_aic(&self, _ctx: &mut CoreContext<'_>) -> DeviceResult {
        Ok(())
    }

    fn run_aiv(&self, _ctx: &mut CoreContext<'_>) -> DeviceResult {
        Ok(())
    }
}

/// Runtime description of a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceProperties {
    pub arch: ArchSpec,
    /// Matrix engines available to launches.
    pub aic_core_num: usize,
    pub global_memory_size: usize,
    pub watchdog: Duration,
}

impl DeviceProperties {
    pub fn from_config<A: ArchTag>(config: &GlobalConfig) -> Self {
        let arch = A::spec();
        let aic_core_num = config
            .device
            .aic_core_num
            .unwrap_or(arch.max_aic_cores)
            .clamp(1, arch.max_aic_cores);

        Self {
            arch,
            aic_core_num,
            global_memory_size: config.device.global_memory_mib * 1024 * 1024,
            watchdog: Duration::from_millis(config.device.watchdog_ms),
        }
    }

    pub fn aiv_core_num(&self) -> usize {
        self.aic_core_num * self.arch.aiv_per_aic
    }
}

/// Counters of one launch.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchReport {
    pub kernel: String,
    pub block_dim: usize,
    /// Sum over matrix engines.
    pub aic: PipeStats,
    /// Sum over vector engines.
    pub aiv: PipeStats,
    pub per_core: Vec<(CoreId, PipeStats)>,
    pub elapsed: Duration,
}

impl LaunchReport {
    pub fn total(&self) -> PipeStats {
        let mut total = self.aic;
        total += self.aiv;
        total
    }

    pub fn core(&self, id: CoreId) -> Option<&PipeStats> {
        self.per_core
            .iter()
            .find(|(core, _)| *core == id)
            .map(|(_, stats)| stats)
    }
}

impl core::fmt::Display for LaunchReport {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{} block_dim={} elapsed={:?}\n  aic: {}\n  aiv: {}",
            self.kernel, self.block_dim, self.elapsed, self.aic, self.aiv
        )
    }
}

/// Simulated accelerator: global memory plus the SPMD launcher.
pub struct Device {
    properties: DeviceProperties,
    memory: GlobalMemory,
    logger: spin::Mutex<Logger>,
}

impl core::fmt::Debug for Device {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Device")
            .field("properties", &self.properties)
            .field("memory", &self.memory)
            .finish()
    }
}

impl Device {
    /// Creates a device of the given architecture from the global configuration.
    pub fn new<A: ArchTag>() -> Self {
        let config = GlobalConfig::get();
        let properties = DeviceProperties::from_config::<A>(&config);
        Self::with_logger(properties, Logger::from_config(config))
    }

    pub fn with_properties(properties: DeviceProperties) -> Self {
        Self::with_logger(properties, Logger::new())
    }

    /// Creates a device logging to the sinks of `config` instead of the global ones.
    pub fn with_config(properties: DeviceProperties, config: GlobalConfig) -> Self {
        Self::with_logger(properties, Logger::from_config(std::sync::Arc::new(config)))
    }

    fn with_logger(properties: DeviceProperties, logger: Logger) -> Self {
        log::info!(
            "Device {} with {} matrix engines, {} vector engines, {} MiB global memory",
            properties.arch.name,
            properties.aic_core_num,
            properties.aiv_core_num(),
            properties.global_memory_size / (1024 * 1024)
        );
        Self {
            memory: GlobalMemory::new(properties.global_memory_size),
            properties,
            logger: spin::Mutex::new(logger),
        }
    }

    pub fn properties(&self) -> &DeviceProperties {
        &self.properties
    }

    pub fn memory(&self) -> &GlobalMemory {
        &self.memory
    }

    pub fn create<E: Pod>(&self, values: &[E]) -> Result<GmBuffer, AllocationError> {
        self.memory.create(values)
    }

    pub fn empty<E: Pod>(&self, count: usize) -> Result<GmBuffer, AllocationError> {
        self.memory.alloc_zeroed::<E>(count)
    }

    pub fn read<E: Pod>(&self, buffer: GmBuffer) -> Result<Vec<E>, AllocationError> {
        self.memory.read(buffer)
    }

    /// Runs `kernel` on `block_dim` matrix engines and their vector engines, returning once every
    /// core has exited.
    pub fn launch<K: Kernel>(&self, kernel: &K, block_dim: usize) -> Result<LaunchReport, LaunchError> {
        let name = kernel.name();
        if block_dim == 0 || block_dim > self.properties.aic_core_num {
            return Err(LaunchError::InvalidBlockDim {
                block_dim,
                available: self.properties.aic_core_num,
            });
        }
        if kernel.arch() != self.properties.arch.name {
            return Err(LaunchError::ArchMismatch {
                expected: kernel.arch(),
                actual: self.properties.arch.name.clone(),
            });
        }

        let aiv_per_aic = self.properties.arch.aiv_per_aic;
        let mut cores = Vec::new();
        if kernel.mode() != KernelMode::AivOnly {
            cores.extend((0..block_dim).map(|i| CoreId::new(CoreType::Aic, i)));
        }
        if kernel.mode() != KernelMode::AicOnly {
            cores.extend((0..block_dim * aiv_per_aic).map(|i| CoreId::new(CoreType::Aiv, i)));
        }

        let level = self.logger.lock().log_level_pipeline();
        let trace = level == PipelineLogLevel::Flags;
        let phases = (level != PipelineLogLevel::Disabled).then_some(&self.logger);
        let board = SyncBoard::new(block_dim, aiv_per_aic, self.properties.watchdog);
        let start = Instant::now();
        log::debug!("Launching {name} on {block_dim} blocks ({} cores)", cores.len());

        let outcomes = std::thread::scope(|scope| {
            let handles: Vec<_> = cores
                .iter()
                .map(|&id| {
                    let board = &board;
                    let properties = &self.properties;
                    let memory = &self.memory;
                    let handle = std::thread::Builder::new()
                        .name(id.to_string())
                        .spawn_scoped(scope, move || {
                            let _guard = AbortOnUnwind(board);
                            let mut ctx =
                                CoreContext::new(
                                    id, block_dim, properties, memory, board, phases, trace,
                                );
                            let result = match id.core_type {
                                CoreType::Aic => kernel.run_aic(&mut ctx),
                                CoreType::Aiv => kernel.run_aiv(&mut ctx),
                            };
                            let result = result.and_then(|_| ctx.events.finish());
                            if result.is_err() {
                                board.abort();
                            }
                            (result, ctx.into_stats())
                        });
                    (id, handle)
                })
                .collect();

            handles
                .into_iter()
                .map(|(id, handle)| match handle {
                    Ok(handle) => (id, handle.join().map_err(panic_message)),
                    Err(err) => {
                        board.abort();
                        (id, Err(err.to_string()))
                    }
                })
                .collect::<Vec<_>>()
        });

        let mut report = LaunchReport {
            kernel: name.clone(),
            block_dim,
            aic: PipeStats::default(),
            aiv: PipeStats::default(),
            per_core: Vec::with_capacity(outcomes.len()),
            elapsed: start.elapsed(),
        };
        let mut root_cause: Option<LaunchError> = None;
        let mut aborted: Option<LaunchError> = None;

        for (id, outcome) in outcomes {
            match outcome {
                Ok((result, stats)) => {
                    match id.core_type {
                        CoreType::Aic => report.aic += stats,
                        CoreType::Aiv => report.aiv += stats,
                    }
                    report.per_core.push((id, stats));

                    if let Err(fault) = result {
                        let slot = match fault {
                            Fault::Aborted => &mut aborted,
                            _ => &mut root_cause,
                        };
                        if slot.is_none() {
                            *slot = Some(LaunchError::Fault {
                                kernel: name.clone(),
                                core: id,
                                fault,
                            });
                        }
                    }
                }
                Err(message) => {
                    if root_cause.is_none() {
                        root_cause = Some(LaunchError::Panic {
                            kernel: name.clone(),
                            core: id,
                            message,
                        });
                    }
                }
            }
        }

        if let Some(err) = root_cause.or(aborted) {
            log::error!("{err}");
            return Err(err);
        }

        self.log_report(&report);
        Ok(report)
    }

    fn log_report(&self, report: &LaunchReport) {
        log::debug!("{report}");
        let mut logger = self.logger.lock();
        match logger.log_level_launch() {
            LaunchLogLevel::Disabled => {}
            LaunchLogLevel::Basic => logger.log_launch(report),
            LaunchLogLevel::Full => {
                logger.log_launch(report);
                for (id, stats) in report.per_core.iter() {
                    logger.log_launch(&format!("  {id}: {stats}"));
                }
            }
        }
    }
}

struct AbortOnUnwind<'a>(&'a SyncBoard);

impl Drop for AbortOnUnwind<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.0.abort();
        }
    }
}

fn panic_message(payload: Box<dyn core::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Everything a core can touch while running a kernel.
pub struct CoreContext<'d> {
    id: CoreId,
    block_num: usize,
    properties: &'d DeviceProperties,
    memory: &'d GlobalMemory,
    board: &'d SyncBoard,
    phases: Option<&'d spin::Mutex<Logger>>,
    resource: CoreResource,
    events: Rc<EventTable>,
    stats: PipeStats,
}

impl<'d> CoreContext<'d> {
    fn new(
        id: CoreId,
        block_num: usize,
        properties: &'d DeviceProperties,
        memory: &'d GlobalMemory,
        board: &'d SyncBoard,
        phases: Option<&'d spin::Mutex<Logger>>,
        trace: bool,
    ) -> Self {
        Self {
            id,
            block_num,
            properties,
            memory,
            board,
            phases,
            resource: CoreResource::new(&properties.arch, id.core_type),
            events: Rc::new(EventTable::new(trace)),
            stats: PipeStats::default(),
        }
    }

    fn into_stats(self) -> PipeStats {
        let mut stats = self.stats;
        stats.event_sets = self.events.sets();
        stats.event_waits = self.events.waits();
        stats
    }

    pub fn id(&self) -> CoreId {
        self.id
    }

    pub fn core_type(&self) -> CoreType {
        self.id.core_type
    }

    /// Reports a kernel phase to the pipeline sinks when pipeline logging is enabled.
    pub fn log_phase<S: core::fmt::Display>(&self, msg: S) {
        log::debug!("{}: {msg}", self.id);
        if let Some(logger) = self.phases {
            logger.lock().log_pipeline(&format!("{}: {msg}", self.id));
        }
    }

    /// Index among the cores of the same class.
    pub fn block_idx(&self) -> usize {
        self.id.index
    }

    /// Number of matrix engine blocks of the launch.
    pub fn block_num(&self) -> usize {
        self.block_num
    }

    /// Vector engines paired with one matrix engine.
    pub fn sub_block_num(&self) -> usize {
        self.properties.arch.aiv_per_aic
    }

    /// Position of a vector engine inside its pair. Always zero on a matrix engine.
    pub fn sub_block_idx(&self) -> usize {
        match self.id.core_type {
            CoreType::Aic => 0,
            CoreType::Aiv => self.id.index % self.sub_block_num(),
        }
    }

    /// Matrix engine this core belongs to.
    pub fn aic_idx(&self) -> usize {
        match self.id.core_type {
            CoreType::Aic => self.id.index,
            CoreType::Aiv => self.id.index / self.sub_block_num(),
        }
    }

    pub fn arch(&self) -> &ArchSpec {
        &self.properties.arch
    }

    pub fn resource(&self) -> &CoreResource {
        &self.resource
    }

    pub fn resource_mut(&mut self) -> &mut CoreResource {
        &mut self.resource
    }

    pub fn events(&self) -> &Rc<EventTable> {
        &self.events
    }

    pub fn stats_mut(&mut self) -> &mut PipeStats {
        &mut self.stats
    }

    pub fn set_flag(&self, event: HardEvent, id: EventId) -> DeviceResult {
        self.events.set_flag(event, id)
    }

    pub fn wait_flag(&self, event: HardEvent, id: EventId) -> DeviceResult {
        self.events.wait_flag(event, id)
    }

    /// Drains `pipe` before the next instruction issues.
    pub fn pipe_barrier(&mut self, pipe: Pipe) {
        if self.events.is_tracing() {
            log::trace!("{}: pipe_barrier {pipe:?}", self.id);
        }
        self.stats.barriers += 1;
    }

    /// Moves `runs` of elements from global memory into a local tensor.
    pub fn copy_gm_to_local<E: Pod>(
        &mut self,
        dst: LocalTensor<E>,
        src: GlobalTensor<E>,
        runs: impl IntoIterator<Item = CopyRun>,
    ) -> DeviceResult {
        let size = size_of::<E>();
        let tier = dst.tier();
        let dst_base = dst.byte_offset();
        let dst_len = dst.len();
        let resource = &mut self.resource;

        let moved = self.memory.with_bytes(|arena| -> DeviceResult<usize> {
            let local = resource.bytes_mut(tier);
            let capacity = local.len();
            let mut moved = 0;
            for run in runs {
                let to = dst_base + run.dst * size;
                let bytes = run.len * size;
                if run.dst + run.len > dst_len || to + bytes > capacity {
                    return Err(local_out_of_bounds(tier, dst_base, run.dst, run.len, size, capacity));
                }
                let from = src.addr() + run.src * size;
                check_global(from, bytes, arena.len())?;
                local[to..to + bytes].copy_from_slice(&arena[from..from + bytes]);
                moved += bytes;
            }
            Ok(moved)
        })?;

        self.stats.gm_read_bytes += moved as u64;
        Ok(())
    }

    /// Moves `runs` of elements from a local tensor to global memory.
    pub fn copy_local_to_gm<E: Pod>(
        &mut self,
        dst: GlobalTensor<E>,
        src: LocalTensor<E>,
        runs: impl IntoIterator<Item = CopyRun>,
    ) -> DeviceResult {
        let size = size_of::<E>();
        let tier = src.tier();
        let src_base = src.byte_offset();
        let src_len = src.len();
        let local = self.resource.bytes(tier);

        let moved = self.memory.with_bytes_mut(|arena| -> DeviceResult<usize> {
            let capacity = local.len();
            let mut moved = 0;
            for run in runs {
                let from = src_base + run.src * size;
                let bytes = run.len * size;
                if run.src + run.len > src_len || from + bytes > capacity {
                    return Err(local_out_of_bounds(tier, src_base, run.src, run.len, size, capacity));
                }
                let to = dst.addr() + run.dst * size;
                check_global(to, bytes, arena.len())?;
                arena[to..to + bytes].copy_from_slice(&local[from..from + bytes]);
                moved += bytes;
            }
            Ok(moved)
        })?;

        self.stats.gm_write_bytes += moved as u64;
        Ok(())
    }

    /// Moves `runs` of elements between two local tensors of the same element type.
    pub fn copy_local<E: Pod>(
        &mut self,
        dst: LocalTensor<E>,
        src: LocalTensor<E>,
        runs: impl IntoIterator<Item = CopyRun>,
    ) -> DeviceResult {
        let size = size_of::<E>();
        let (src_base, src_len, dst_base, dst_len) =
            (src.byte_offset(), src.len(), dst.byte_offset(), dst.len());
        let mut checked = Vec::new();

        for run in runs {
            if run.src + run.len > src_len {
                return Err(local_out_of_bounds(
                    src.tier(),
                    src_base,
                    run.src,
                    run.len,
                    size,
                    self.resource.capacity(src.tier()),
                ));
            }
            if run.dst + run.len > dst_len {
                return Err(local_out_of_bounds(
                    dst.tier(),
                    dst_base,
                    run.dst,
                    run.len,
                    size,
                    self.resource.capacity(dst.tier()),
                ));
            }
            checked.push((src_base + run.src * size, dst_base + run.dst * size, run.len * size));
        }

        let moved = self.resource.copy_bytes(src.tier(), dst.tier(), checked)?;
        self.stats.local_copy_bytes += moved as u64;
        Ok(())
    }

    /// Accumulator write-back: moves `runs` from a local tensor to global memory, converting every
    /// element on the way out.
    pub fn fixpipe<S: Element, D: Element>(
        &mut self,
        dst: GlobalTensor<D>,
        src: LocalTensor<S>,
        runs: impl IntoIterator<Item = CopyRun>,
    ) -> DeviceResult {
        self.fixpipe_scaled(dst, src, runs, 1.0)
    }

    /// Per tensor dequantizing write-back: every element is multiplied by `scale` before the
    /// conversion.
    pub fn fixpipe_scaled<S: Element, D: Element>(
        &mut self,
        dst: GlobalTensor<D>,
        src: LocalTensor<S>,
        runs: impl IntoIterator<Item = CopyRun>,
        scale: f64,
    ) -> DeviceResult {
        let values = self.resource.slice(src)?;
        let capacity = self.resource.capacity(src.tier());
        let size = size_of::<D>();

        let moved = self.memory.with_bytes_mut(|arena| -> DeviceResult<usize> {
            let mut moved = 0;
            let mut converted: Vec<D> = Vec::new();
            for run in runs {
                if run.src + run.len > values.len() {
                    return Err(local_out_of_bounds(
                        src.tier(),
                        src.byte_offset(),
                        run.src,
                        run.len,
                        size_of::<S>(),
                        capacity,
                    ));
                }
                let to = dst.addr() + run.dst * size;
                let bytes = run.len * size;
                check_global(to, bytes, arena.len())?;

                converted.clear();
                converted.extend(
                    values[run.src..run.src + run.len]
                        .iter()
                        .map(|v| D::from_f64(v.to_f64() * scale)),
                );
                arena[to..to + bytes].copy_from_slice(bytemuck::cast_slice(&converted));
                moved += bytes;
            }
            Ok(moved)
        })?;

        self.stats.gm_write_bytes += moved as u64;
        Ok(())
    }

    /// Signals a cross core flag toward the other engine class.
    ///
    /// From a matrix engine the set reaches every paired vector engine. From a vector engine it
    /// reaches the paired matrix engine, whose wait completes once every vector engine of the pair
    /// has set.
    pub fn cross_core_set_flag(&mut self, flag: CrossCoreFlag) -> DeviceResult {
        self.cross_set(flag.id, 1)
    }

    pub fn cross_core_wait_flag(&mut self, flag: CrossCoreFlag) -> DeviceResult {
        self.cross_wait(flag.id)
    }

    pub fn cross_core_set_flag_with_reverse(
        &mut self,
        flag: &mut CrossCoreFlagWithReverse,
    ) -> DeviceResult {
        if flag.count >= REVERSE_DEPTH {
            self.cross_wait(flag.reverse_id)?;
            flag.count = 0;
        }
        self.cross_set(flag.id, REVERSE_DEPTH)?;
        flag.count += 1;
        Ok(())
    }

    pub fn cross_core_wait_flag_with_reverse(
        &mut self,
        flag: &mut CrossCoreFlagWithReverse,
    ) -> DeviceResult {
        self.cross_wait(flag.id)?;
        flag.count += 1;
        if flag.count >= REVERSE_DEPTH {
            self.cross_set(flag.reverse_id, 1)?;
            flag.count = 0;
        }
        Ok(())
    }

    /// Rendezvous of every vector engine of the launch.
    pub fn cross_core_barrier_aiv(&mut self) -> DeviceResult {
        if self.id.core_type != CoreType::Aiv {
            return Err(ProtocolViolation::WrongCoreType("a matrix engine").into());
        }
        self.board.aiv_barrier()
    }

    fn cross_set(&mut self, id: u8, max_pending: u32) -> DeviceResult {
        let aic = self.aic_idx();
        match self.id.core_type {
            CoreType::Aic => {
                for sub in 0..self.sub_block_num() {
                    self.board.set(aic, sub, id, Direction::ToAiv, max_pending)?;
                }
            }
            CoreType::Aiv => {
                let sub = self.sub_block_idx();
                self.board.set(aic, sub, id, Direction::ToAic, max_pending)?;
            }
        }
        if self.events.is_tracing() {
            log::trace!("{}: cross_core_set_flag {id}", self.id);
        }
        self.stats.cross_sets += 1;
        Ok(())
    }

    fn cross_wait(&mut self, id: u8) -> DeviceResult {
        let aic = self.aic_idx();
        match self.id.core_type {
            CoreType::Aic => {
                for sub in 0..self.sub_block_num() {
                    self.board.wait(aic, sub, id, Direction::ToAic)?;
                }
            }
            CoreType::Aiv => {
                let sub = self.sub_block_idx();
                self.board.wait(aic, sub, id, Direction::ToAiv)?;
            }
        }
        self.stats.cross_waits += 1;
        Ok(())
    }

    /// Whether another core already faulted. Long vector loops poll this to stop early.
    pub fn is_aborted(&self) -> bool {
        self.board.is_aborted()
    }

    /// Global tensor at the address of `buffer`.
    pub fn global<E: Pod>(&self, buffer: GmBuffer) -> GlobalTensor<E> {
        buffer.tensor()
    }

    /// Typed tensor inside one of this core's tiers.
    pub fn local<E: Pod>(
        &self,
        tier: TierKind,
        byte_offset: usize,
        len: usize,
    ) -> DeviceResult<LocalTensor<E>> {
        self.resource.tensor(tier, byte_offset, len)
    }
}

fn local_out_of_bounds(
    tier: TierKind,
    base: usize,
    start: usize,
    len: usize,
    size: usize,
    capacity: usize,
) -> Fault {
    Fault::TierOutOfBounds {
        tier,
        offset: base + start * size,
        len: len * size,
        capacity,
    }
}
