//! Logging configuration

use crate::error::ObservabilityError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

/// Log output format
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable, multi-line
    #[default]
    Pretty,
    /// One JSON object per line
    Json,
    /// Single line
    Compact,
}

impl FromStr for LogFormat {
    type Err = ObservabilityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            "compact" => Ok(Self::Compact),
            other => Err(ObservabilityError::Config(format!("unknown log format {other:?}"))),
        }
    }
}

/// Log level
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// This level made `steps` notches more verbose, saturating at trace
    pub fn raised(self, steps: u8) -> Self {
        const ORDER: [LogLevel; 5] = [
            LogLevel::Error,
            LogLevel::Warn,
            LogLevel::Info,
            LogLevel::Debug,
            LogLevel::Trace,
        ];
        let index = ORDER.iter().position(|l| *l == self).unwrap_or(2);
        ORDER[(index + usize::from(steps)).min(ORDER.len() - 1)]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

impl FromStr for LogLevel {
    type Err = ObservabilityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "error" => Ok(Self::Error),
            "warn" | "warning" => Ok(Self::Warn),
            "info" => Ok(Self::Info),
            "debug" => Ok(Self::Debug),
            "trace" => Ok(Self::Trace),
            other => Err(ObservabilityError::Config(format!("unknown log level {other:?}"))),
        }
    }
}

impl From<LogLevel> for tracing_subscriber::filter::LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Self::TRACE,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: LogLevel,

    #[serde(default)]
    pub format: LogFormat,

    /// Extra `EnvFilter` directives, e.g. `meshweave_overlay=debug`
    #[serde(default)]
    pub filter_directives: Option<String>,

    /// Also write JSON logs to rotated files
    #[serde(default)]
    pub file: Option<FileLoggingConfig>,

    /// Include source file and line
    #[serde(default)]
    pub include_location: bool,

    /// Include the module path
    #[serde(default = "default_true")]
    pub include_target: bool,
}

fn default_true() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Pretty,
            filter_directives: None,
            file: None,
            include_location: false,
            include_target: true,
        }
    }
}

impl LoggingConfig {
    /// `EnvFilter` directives used when `RUST_LOG` is unset
    pub fn directives(&self) -> String {
        match &self.filter_directives {
            Some(extra) if !extra.trim().is_empty() => format!("{},{extra}", self.level.as_str()),
            _ => self.level.as_str().to_string(),
        }
    }
}

/// File logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileLoggingConfig {
    /// Directory for log files
    pub directory: PathBuf,

    /// File name prefix
    #[serde(default = "default_prefix")]
    pub prefix: String,

    #[serde(default)]
    pub rotation: RotationStrategy,
}

fn default_prefix() -> String {
    "meshweave".to_string()
}

/// Log file rotation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RotationStrategy {
    #[default]
    Daily,
    Hourly,
    Never,
}
