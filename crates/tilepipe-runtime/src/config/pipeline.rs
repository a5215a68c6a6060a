use super::logger::{LogLevel, LoggerConfig};

/// Configuration of pipeline tracing.
#[derive(Default, Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct PipelineConfig {
    /// Logger configuration for pipeline phases.
    #[serde(default)]
    pub logger: LoggerConfig<PipelineLogLevel>,
}

/// Verbosity of pipeline tracing.
#[derive(Default, Clone, Copy, Debug, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub enum PipelineLogLevel {
    #[default]
    #[serde(rename = "disabled")]
    Disabled,

    /// Kernel phases reported through `CoreContext::log_phase`.
    #[serde(rename = "phases")]
    Phases,

    /// Kernel phases, plus every flag set and wait through `log::trace!`.
    #[serde(rename = "flags")]
    Flags,
}

impl LogLevel for PipelineLogLevel {}
