//! Subscriber setup
//!
//! Console output goes to stderr in the configured format. With file output
//! enabled, a second layer writes JSON through a non-blocking rotated
//! appender whose worker lives as long as the returned [`LogGuard`].

use crate::config::{FileLoggingConfig, LogFormat, LoggingConfig, RotationStrategy};
use crate::error::{ObservabilityError, Result};
use std::io;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry,
};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Keeps the file writer flushing; hold it for the lifetime of the process
#[must_use = "dropping the guard stops file logging"]
pub struct LogGuard {
    file: Option<WorkerGuard>,
}

impl LogGuard {
    /// Whether logs are also going to a file
    pub fn has_file_output(&self) -> bool {
        self.file.is_some()
    }
}

/// Install the global subscriber
///
/// `RUST_LOG` takes precedence over the configured level and directives.
/// Fails if a global subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<LogGuard> {
    let filter = build_filter(config)?;

    let mut layers: Vec<BoxedLayer> = vec![console_layer(config)];
    let guard = match &config.file {
        Some(file) => {
            std::fs::create_dir_all(&file.directory)?;
            let (writer, guard) = file_writer(file);
            layers.push(
                fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_target(config.include_target)
                    .with_file(config.include_location)
                    .with_line_number(config.include_location)
                    .json()
                    .boxed(),
            );
            Some(guard)
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .map_err(|e| ObservabilityError::LoggingInit(e.to_string()))?;

    Ok(LogGuard { file: guard })
}

fn build_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(config.directives())
        .map_err(|e| ObservabilityError::Config(format!("invalid log filter: {e}")))
}

fn console_layer(config: &LoggingConfig) -> BoxedLayer {
    let layer = fmt::layer()
        .with_writer(io::stderr)
        .with_target(config.include_target)
        .with_file(config.include_location)
        .with_line_number(config.include_location);
    match config.format {
        LogFormat::Pretty => layer.pretty().boxed(),
        LogFormat::Json => layer.json().boxed(),
        LogFormat::Compact => layer.compact().boxed(),
    }
}

fn file_writer(config: &FileLoggingConfig) -> (NonBlocking, WorkerGuard) {
    let appender = match config.rotation {
        RotationStrategy::Daily => {
            tracing_appender::rolling::daily(&config.directory, &config.prefix)
        }
        RotationStrategy::Hourly => {
            tracing_appender::rolling::hourly(&config.directory, &config.prefix)
        }
        RotationStrategy::Never => {
            tracing_appender::rolling::never(&config.directory, &config.prefix)
        }
    };
    tracing_appender::non_blocking(appender)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogLevel;

    #[test]
    fn test_build_filter_accepts_directives() {
        let config = LoggingConfig {
            level: LogLevel::Warn,
            filter_directives: Some("meshweave_overlay=debug".to_string()),
            ..LoggingConfig::default()
        };
        assert!(build_filter(&config).is_ok());
    }

    #[test]
    fn test_build_filter_rejects_garbage() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let config = LoggingConfig {
            filter_directives: Some("meshweave_overlay=[".to_string()),
            ..LoggingConfig::default()
        };
        assert!(matches!(build_filter(&config), Err(ObservabilityError::Config(_))));
    }
}
