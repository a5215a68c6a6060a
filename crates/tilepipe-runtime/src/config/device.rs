/// Shape and limits of the simulated device.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct DeviceConfig {
    /// Matrix engines to expose. Defaults to the architecture maximum.
    #[serde(default)]
    pub aic_core_num: Option<usize>,

    /// Size of the global memory arena in MiB.
    #[serde(default = "global_memory_mib_default")]
    pub global_memory_mib: usize,

    /// Time a core may block on a cross core flag before the launch is declared hung.
    #[serde(default = "watchdog_ms_default")]
    pub watchdog_ms: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            aic_core_num: None,
            global_memory_mib: global_memory_mib_default(),
            watchdog_ms: watchdog_ms_default(),
        }
    }
}

fn global_memory_mib_default() -> usize {
    512
}

fn watchdog_ms_default() -> u64 {
    10_000
}
