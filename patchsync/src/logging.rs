//! Tracing subscriber setup.
//!
//! Logs go to stderr and, optionally, to a file through a non-blocking
//! writer. `RUST_LOG` takes precedence over the configured level.

use std::fs;
use std::path::PathBuf;

use time::macros::format_description;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::LocalTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::error::{SyncError, SyncResult};

/// Default filter directive.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Logging settings, usually from the `[logging]` config section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// `EnvFilter` directive, e.g. `info` or `patchsync=debug`.
    pub level: String,
    /// Also write logs to this file.
    pub file: Option<PathBuf>,
    /// Colorize stderr output.
    pub ansi: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: DEFAULT_LOG_LEVEL.to_string(),
            file: None,
            ansi: true,
        }
    }
}

impl LogConfig {
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    pub fn with_file(mut self, file: impl Into<PathBuf>) -> Self {
        self.file = Some(file.into());
        self
    }

    pub fn with_ansi(mut self, ansi: bool) -> Self {
        self.ansi = ansi;
        self
    }

    /// Build the filter, preferring `RUST_LOG` when it is set and valid.
    pub fn env_filter(&self) -> SyncResult<EnvFilter> {
        if let Ok(filter) = EnvFilter::try_from_default_env() {
            return Ok(filter);
        }
        EnvFilter::try_new(&self.level)
            .map_err(|e| SyncError::InvalidConfig(format!("log level '{}': {}", self.level, e)))
    }
}

/// Keeps the file writer alive; dropping it flushes buffered log lines.
#[must_use = "dropping the guard stops file logging"]
#[derive(Debug)]
pub struct LoggingGuard {
    _file: Option<WorkerGuard>,
}

/// Install the global tracing subscriber.
///
/// Fails if the level is malformed, the log directory cannot be created, or
/// a global subscriber is already installed.
pub fn init_logging(config: &LogConfig) -> SyncResult<LoggingGuard> {
    let filter = config.env_filter()?;
    let timer = LocalTime::new(format_description!(
        "[year]-[month]-[day] [hour]:[minute]:[second]"
    ));

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(config.ansi)
        .with_timer(timer.clone());

    let (file_layer, guard) = match &config.file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("."));
            let name = path.file_name().ok_or_else(|| {
                SyncError::InvalidConfig(format!("log file '{}' has no name", path.display()))
            })?;
            fs::create_dir_all(&dir).map_err(|e| SyncError::CreateDirFailed {
                path: dir.clone(),
                source: e,
            })?;

            let appender = tracing_appender::rolling::never(&dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_timer(timer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| SyncError::InvalidConfig(format!("logging already initialized: {}", e)))?;

    Ok(LoggingGuard { _file: guard })
}
