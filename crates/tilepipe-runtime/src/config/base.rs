use super::{device::DeviceConfig, launch::LaunchConfig, pipeline::PipelineConfig};
use std::sync::Arc;

/// Static mutex holding the global configuration, initialized as `None`.
static TILEPIPE_GLOBAL_CONFIG: spin::Mutex<Option<Arc<GlobalConfig>>> = spin::Mutex::new(None);

/// Represents the global configuration, combining device, launch reporting and pipeline tracing
/// settings.
#[derive(Default, Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct GlobalConfig {
    /// Configuration of the simulated device.
    #[serde(default)]
    pub device: DeviceConfig,

    /// Configuration for launch reports.
    #[serde(default)]
    pub launch: LaunchConfig,

    /// Configuration for pipeline tracing.
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

impl GlobalConfig {
    /// Retrieves the current global configuration, loading it from the current directory if not set.
    ///
    /// If no configuration is set, it attempts to load one from `tilepipe.toml` or `TilePipe.toml`
    /// in the current directory or its parents. If no file is found, a default configuration is
    /// used. Environment variables are applied last.
    pub fn get() -> Arc<Self> {
        let mut state = TILEPIPE_GLOBAL_CONFIG.lock();
        match state.as_ref() {
            Some(config) => config.clone(),
            None => {
                let config = Arc::new(Self::from_current_dir().override_from_env());
                *state = Some(config.clone());
                config
            }
        }
    }

    /// Save the current configuration to the provided file path.
    pub fn save_default<P: AsRef<std::path::Path>>(path: P) -> std::io::Result<()> {
        let config = Self::get();
        let content = toml::to_string_pretty(config.as_ref()).map_err(std::io::Error::other)?;
        std::fs::write(path, content)
    }

    /// Sets the global configuration to the provided value.
    ///
    /// # Panics
    /// Panics if the configuration has already been set or read, as it cannot be overridden.
    ///
    /// # Warning
    /// This method must be called at the start of the program, before any calls to `get`.
    pub fn set(config: Self) {
        let mut state = TILEPIPE_GLOBAL_CONFIG.lock();
        if state.is_some() {
            panic!("Cannot set the global configuration multiple times.");
        }
        *state = Some(Arc::new(config));
    }

    /// Overrides configuration fields based on environment variables.
    pub fn override_from_env(mut self) -> Self {
        use super::{launch::LaunchLogLevel, pipeline::PipelineLogLevel};

        if let Ok(val) = std::env::var("TILEPIPE_DEBUG_LOG") {
            self.launch.logger.level = LaunchLogLevel::Full;
            self.pipeline.logger.level = PipelineLogLevel::Phases;

            match val.as_str() {
                "stdout" => {
                    self.launch.logger.stdout = true;
                    self.pipeline.logger.stdout = true;
                }
                "stderr" => {
                    self.launch.logger.stderr = true;
                    self.pipeline.logger.stderr = true;
                }
                "1" | "true" => {
                    let file_path = "/tmp/tilepipe.log";
                    self.launch.logger.file = Some(file_path.into());
                    self.pipeline.logger.file = Some(file_path.into());
                }
                "0" | "false" => {
                    self.launch.logger.level = LaunchLogLevel::Disabled;
                    self.pipeline.logger.level = PipelineLogLevel::Disabled;
                }
                "flags" => {
                    self.pipeline.logger.level = PipelineLogLevel::Flags;
                    self.launch.logger.log = Some(super::logger::LogCrateLevel::Info);
                }
                file_path => {
                    self.launch.logger.file = Some(file_path.into());
                    self.pipeline.logger.file = Some(file_path.into());
                }
            }
        };

        if let Ok(val) = std::env::var("TILEPIPE_WATCHDOG_MS") {
            match val.parse() {
                Ok(ms) => self.device.watchdog_ms = ms,
                Err(err) => log::warn!("Ignoring TILEPIPE_WATCHDOG_MS={val}: {err}"),
            }
        }

        if let Ok(val) = std::env::var("TILEPIPE_AIC_CORES") {
            match val.parse() {
                Ok(cores) => self.device.aic_core_num = Some(cores),
                Err(err) => log::warn!("Ignoring TILEPIPE_AIC_CORES={val}: {err}"),
            }
        }

        self
    }

    // Loads configuration from `tilepipe.toml` or `TilePipe.toml` in the current directory or its
    // parents.
    //
    // Traverses up the directory tree until a valid configuration file is found or the root is
    // reached. Returns a default configuration if no file is found.
    fn from_current_dir() -> Self {
        let Ok(mut dir) = std::env::current_dir() else {
            return Self::default();
        };

        loop {
            if let Some(content) = Self::from_file_path(dir.join("tilepipe.toml")) {
                return content;
            }

            if let Some(content) = Self::from_file_path(dir.join("TilePipe.toml")) {
                return content;
            }

            if !dir.pop() {
                break;
            }
        }

        Self::default()
    }

    // Loads configuration from a specified file path. A file with the wrong format is reported and
    // skipped.
    fn from_file_path<P: AsRef<std::path::Path>>(path: P) -> Option<Self> {
        let content = std::fs::read_to_string(path.as_ref()).ok()?;
        match toml::from_str(&content) {
            Ok(config) => Some(config),
            Err(err) => {
                log::warn!(
                    "The file {} doesn't have the right format => {err}",
                    path.as_ref().display()
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::launch::LaunchLogLevel;
    use crate::config::pipeline::PipelineLogLevel;

    #[test_log::test]
    fn parse_partial_file() {
        let config: GlobalConfig = toml::from_str(
            r#"
            [device]
            aic_core_num = 4
            watchdog_ms = 250

            [launch.logger]
            level = "basic"
            stdout = true

            [pipeline.logger]
            level = "flags"
            "#,
        )
        .unwrap();

        assert_eq!(config.device.aic_core_num, Some(4));
        assert_eq!(config.device.watchdog_ms, 250);
        assert_eq!(config.device.global_memory_mib, 512);
        assert_eq!(config.launch.logger.level, LaunchLogLevel::Basic);
        assert!(config.launch.logger.stdout);
        assert_eq!(config.pipeline.logger.level, PipelineLogLevel::Flags);
    }

    #[test_log::test]
    fn defaults_roundtrip_through_toml() {
        let content = toml::to_string_pretty(&GlobalConfig::default()).unwrap();
        let config: GlobalConfig = toml::from_str(&content).unwrap();

        assert_eq!(config.device.watchdog_ms, 10_000);
        assert_eq!(config.launch.logger.level, LaunchLogLevel::Disabled);
    }

    #[test_log::test]
    #[serial_test::serial]
    fn environment_overrides_the_file() {
        // SAFETY: serialized with every other test touching these variables.
        unsafe {
            std::env::set_var("TILEPIPE_WATCHDOG_MS", "250");
            std::env::set_var("TILEPIPE_AIC_CORES", "lots");
        }
        let config = GlobalConfig::default().override_from_env();
        unsafe {
            std::env::remove_var("TILEPIPE_WATCHDOG_MS");
            std::env::remove_var("TILEPIPE_AIC_CORES");
        }

        assert_eq!(config.device.watchdog_ms, 250);
        assert_eq!(config.device.aic_core_num, None);
    }
}
