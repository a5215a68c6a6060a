use super::logger::{LogLevel, LoggerConfig};

/// Configuration of the per-launch report.
#[derive(Default, Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct LaunchConfig {
    /// Logger configuration for launch reports.
    #[serde(default)]
    pub logger: LoggerConfig<LaunchLogLevel>,
}

/// Verbosity of launch reports.
#[derive(Default, Clone, Copy, Debug, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub enum LaunchLogLevel {
    /// Nothing is reported.
    #[default]
    #[serde(rename = "disabled")]
    Disabled,

    /// One line per launch with the aggregated counters.
    #[serde(rename = "basic")]
    Basic,

    /// Adds one line per core.
    #[serde(rename = "full")]
    Full,
}

impl LogLevel for LaunchLogLevel {}
