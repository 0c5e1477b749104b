//! Structured logging with pretty/compact/JSON console output and file rotation

use std::io;

use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry,
};

use crate::config::{FileLoggingConfig, LogFormat, LoggingConfig, LogLevel, RotationStrategy};
use crate::error::{ObservabilityError, Result};

/// Shorthand level override, e.g. `MESHTOWER_LOG_LEVEL=debug`
pub const LEVEL_ENV: &str = "MESHTOWER_LOG_LEVEL";

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Keeps the non-blocking file writer alive; drop it last
#[must_use = "dropping the guard stops file logging"]
pub struct LogGuard {
    _file: Option<WorkerGuard>,
}

impl std::fmt::Debug for LogGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogGuard")
            .field("file", &self._file.is_some())
            .finish()
    }
}

/// Install the global subscriber described by `config`
///
/// `RUST_LOG` wins over everything, then `MESHTOWER_LOG_LEVEL`, then the
/// configured filter or level.
pub fn init_logging(config: &LoggingConfig) -> Result<LogGuard> {
    let directive = filter_directive(
        config,
        std::env::var(EnvFilter::DEFAULT_ENV).ok().as_deref(),
        std::env::var(LEVEL_ENV).ok().as_deref(),
    );
    let filter = EnvFilter::try_new(&directive).map_err(|e| ObservabilityError::Filter {
        directive: directive.clone(),
        reason: e.to_string(),
    })?;

    let mut layers: Vec<BoxedLayer> = vec![console_layer(config)];
    let mut guard = None;
    if let Some(file_config) = &config.file {
        let (writer, file_guard) = create_file_writer(file_config)?;
        layers.push(file_layer(config, writer));
        guard = Some(file_guard);
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .map_err(|e| ObservabilityError::LoggingInit(e.to_string()))?;

    Ok(LogGuard { _file: guard })
}

fn filter_directive(config: &LoggingConfig, rust_log: Option<&str>, level_env: Option<&str>) -> String {
    if let Some(rust_log) = rust_log.filter(|s| !s.trim().is_empty()) {
        return rust_log.to_string();
    }
    if let Some(level) = level_env.and_then(|s| s.parse::<LogLevel>().ok()) {
        return level.as_str().to_string();
    }
    match &config.filter {
        Some(filter) => filter.clone(),
        None => config.level.as_str().to_string(),
    }
}

fn console_layer(config: &LoggingConfig) -> BoxedLayer {
    let layer = fmt::layer()
        .with_writer(io::stdout)
        .with_target(config.include_target)
        .with_file(config.include_location)
        .with_line_number(config.include_location);

    match config.format {
        LogFormat::Pretty => layer.pretty().boxed(),
        LogFormat::Compact => layer.compact().boxed(),
        LogFormat::Json => layer.json().boxed(),
    }
}

/// Files always get JSON, whatever the console format
fn file_layer(config: &LoggingConfig, writer: NonBlocking) -> BoxedLayer {
    fmt::layer()
        .with_writer(writer)
        .with_target(config.include_target)
        .with_file(config.include_location)
        .with_line_number(config.include_location)
        .with_ansi(false)
        .json()
        .boxed()
}

fn create_file_writer(config: &FileLoggingConfig) -> Result<(NonBlocking, WorkerGuard)> {
    std::fs::create_dir_all(&config.directory)?;

    let appender = match config.rotation {
        RotationStrategy::Daily => tracing_appender::rolling::daily(&config.directory, &config.prefix),
        RotationStrategy::Hourly => {
            tracing_appender::rolling::hourly(&config.directory, &config.prefix)
        }
        RotationStrategy::Never => tracing_appender::rolling::never(&config.directory, &config.prefix),
    };

    Ok(tracing_appender::non_blocking(appender))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_precedence() {
        let config = LoggingConfig::default();
        assert_eq!(filter_directive(&config, None, None), "info");
        assert_eq!(filter_directive(&config, None, Some("debug")), "debug");
        assert_eq!(
            filter_directive(&config, Some("meshtower=trace"), Some("debug")),
            "meshtower=trace"
        );
        // unparsable shorthand is ignored
        assert_eq!(filter_directive(&config, None, Some("chatty")), "info");
        assert_eq!(filter_directive(&config, Some("  "), None), "info");
    }

    #[test]
    fn test_configured_filter_beats_level() {
        let config = LoggingConfig {
            level: LogLevel::Warn,
            filter: Some("meshtower_coordinator=debug,info".to_string()),
            ..Default::default()
        };
        assert_eq!(
            filter_directive(&config, None, None),
            "meshtower_coordinator=debug,info"
        );
    }

    #[test]
    fn test_file_writer_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let config = FileLoggingConfig {
            directory: dir.path().join("logs"),
            prefix: "test".to_string(),
            rotation: RotationStrategy::Never,
        };
        let (_writer, _guard) = create_file_writer(&config).unwrap();
        assert!(dir.path().join("logs").is_dir());
    }
}
