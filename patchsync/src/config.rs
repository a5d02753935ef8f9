//! Configuration for a synchronization run.
//!
//! Settings come from builder calls, optionally layered over an INI file:
//!
//! ```ini
//! [sync]
//! install_dir = /opt/game
//! base_url = https://cdn.example.com/content
//! workers = 8
//! retries = 5
//! backoff_base_ms = 5000
//! backoff_step_ms = 2500
//! timeout_secs = 300
//!
//! [logging]
//! level = info
//! file = /var/log/patchsync.log
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use ini::{Ini, Properties};

use crate::command::{RetryBackoff, DEFAULT_BACKOFF_BASE_MS, DEFAULT_BACKOFF_STEP_MS};
use crate::error::{SyncError, SyncResult};
use crate::logging::LogConfig;
use crate::manifest::is_contained_path;
use crate::progress::DEFAULT_PROGRESS_INTERVAL;
use crate::transfer::{DEFAULT_CHUNK_SIZE, DEFAULT_TIMEOUT_SECS};

/// Default download retry budget per bundle.
pub const DEFAULT_RETRIES: u32 = 5;

/// Upper bound on the default worker count.
pub const MAX_DEFAULT_WORKERS: usize = 8;

/// Default character budget of the aggregated error message.
pub const DEFAULT_ERROR_BUDGET: usize = 2000;

/// Logical cores, capped at [`MAX_DEFAULT_WORKERS`].
pub fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(MAX_DEFAULT_WORKERS)
}

/// `<config dir>/patchsync/config.ini`, if the platform has a config dir.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("patchsync").join("config.ini"))
}

/// A file written into the install root only after a fully successful run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionMarker {
    /// Path relative to the install root.
    pub file_name: String,
    pub contents: String,
}

impl VersionMarker {
    pub fn new(file_name: impl Into<String>, contents: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            contents: contents.into(),
        }
    }

    /// Check that the marker names a file inside the install root.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidConfig`] for an empty name, an absolute
    /// path or one with `..` components.
    pub fn validate(&self) -> SyncResult<()> {
        if self.file_name.trim().is_empty() || !is_contained_path(&self.file_name) {
            return Err(SyncError::InvalidConfig(format!(
                "version marker '{}' must be a relative path inside the install directory",
                self.file_name
            )));
        }
        Ok(())
    }
}

/// Configuration for a [`crate::sync::Synchronizer`].
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Root that manifest paths are resolved against.
    pub install_dir: PathBuf,

    /// Prefix joined with each entry's remote path. `None` means remote
    /// paths are absolute URLs.
    pub base_url: Option<String>,

    /// Worker threads draining the command queue.
    pub worker_count: usize,

    /// Download attempts charged per bundle before giving up.
    pub retries: u32,

    pub backoff: RetryBackoff,

    /// HTTP request timeout.
    pub timeout: Duration,

    /// Bytes read per transfer chunk.
    pub chunk_size: usize,

    /// Minimum time between progress updates.
    pub progress_interval: Duration,

    /// Validate and repair locally, never download.
    pub verify_only: bool,

    pub version_marker: Option<VersionMarker>,

    /// Maximum characters in the aggregated failure message.
    pub error_budget: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            install_dir: PathBuf::from("."),
            base_url: None,
            worker_count: default_worker_count(),
            retries: DEFAULT_RETRIES,
            backoff: RetryBackoff::default(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            chunk_size: DEFAULT_CHUNK_SIZE,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            verify_only: false,
            version_marker: None,
            error_budget: DEFAULT_ERROR_BUDGET,
        }
    }
}

impl SyncConfig {
    /// Create a configuration for the given install directory.
    pub fn new(install_dir: impl Into<PathBuf>) -> Self {
        Self {
            install_dir: install_dir.into(),
            ..Default::default()
        }
    }

    /// Load `[sync]` settings from an INI file over the defaults.
    pub fn load_ini(path: &Path) -> SyncResult<Self> {
        Ok(ConfigFile::load(path)?.sync)
    }

    pub fn with_install_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.install_dir = dir.into();
        self
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count.max(1);
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_backoff(mut self, backoff: RetryBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.max(1);
        self
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    pub fn with_verify_only(mut self, verify_only: bool) -> Self {
        self.verify_only = verify_only;
        self
    }

    pub fn with_version_marker(mut self, marker: VersionMarker) -> Self {
        self.version_marker = Some(marker);
        self
    }

    pub fn with_error_budget(mut self, budget: usize) -> Self {
        self.error_budget = budget;
        self
    }
}

/// Parsed contents of a config file.
#[derive(Debug, Clone, Default)]
pub struct ConfigFile {
    pub sync: SyncConfig,
    pub logging: LogConfig,
}

impl ConfigFile {
    /// Read `[sync]` and `[logging]` from an INI file.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::ReadFailed`] for a missing or unreadable file and
    /// [`SyncError::InvalidConfig`], prefixed with the path, for bad values.
    pub fn load(path: &Path) -> SyncResult<Self> {
        let text = fs::read_to_string(path).map_err(|e| SyncError::ReadFailed {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_ini_str(&text).map_err(|e| match e {
            SyncError::InvalidConfig(msg) => {
                SyncError::InvalidConfig(format!("{}: {}", path.display(), msg))
            }
            other => other,
        })
    }

    /// Parse INI text. Unknown sections and keys are ignored.
    pub fn from_ini_str(text: &str) -> SyncResult<Self> {
        let ini = Ini::load_from_str(text).map_err(|e| SyncError::InvalidConfig(e.to_string()))?;
        let mut file = Self::default();
        if let Some(section) = ini.section(Some("sync")) {
            apply_sync_section(&mut file.sync, section)?;
        }
        if let Some(section) = ini.section(Some("logging")) {
            apply_logging_section(&mut file.logging, section)?;
        }
        Ok(file)
    }
}

fn apply_sync_section(config: &mut SyncConfig, section: &Properties) -> SyncResult<()> {
    if let Some(dir) = section.get("install_dir") {
        config.install_dir = PathBuf::from(dir);
    }
    if let Some(url) = section.get("base_url") {
        config.base_url = Some(url.to_string());
    }
    if let Some(n) = parse_key::<usize>(section, "workers")? {
        config.worker_count = n.max(1);
    }
    if let Some(n) = parse_key(section, "retries")? {
        config.retries = n;
    }
    let base = parse_key(section, "backoff_base_ms")?.unwrap_or(DEFAULT_BACKOFF_BASE_MS);
    let step = parse_key(section, "backoff_step_ms")?.unwrap_or(DEFAULT_BACKOFF_STEP_MS);
    config.backoff = RetryBackoff::new(Duration::from_millis(base), Duration::from_millis(step));
    if let Some(secs) = parse_key(section, "timeout_secs")? {
        config.timeout = Duration::from_secs(secs);
    }
    if let Some(size) = parse_key::<usize>(section, "chunk_size")? {
        config.chunk_size = size.max(1);
    }
    if let Some(ms) = parse_key(section, "progress_interval_ms")? {
        config.progress_interval = Duration::from_millis(ms);
    }
    if let Some(flag) = parse_bool(section, "verify_only")? {
        config.verify_only = flag;
    }
    if let Some(budget) = parse_key(section, "error_budget")? {
        config.error_budget = budget;
    }
    if let Some(name) = section.get("version_marker") {
        let contents = section.get("version").unwrap_or_default();
        let marker = VersionMarker::new(name, contents);
        marker.validate()?;
        config.version_marker = Some(marker);
    }
    Ok(())
}

fn apply_logging_section(config: &mut LogConfig, section: &Properties) -> SyncResult<()> {
    if let Some(level) = section.get("level") {
        config.level = level.to_string();
    }
    if let Some(file) = section.get("file") {
        config.file = Some(PathBuf::from(file));
    }
    if let Some(ansi) = parse_bool(section, "ansi")? {
        config.ansi = ansi;
    }
    Ok(())
}

fn parse_key<T>(section: &Properties, key: &str) -> SyncResult<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    section
        .get(key)
        .map(|value| {
            value
                .trim()
                .parse()
                .map_err(|e| SyncError::InvalidConfig(format!("{} = '{}': {}", key, value, e)))
        })
        .transpose()
}

fn parse_bool(section: &Properties, key: &str) -> SyncResult<Option<bool>> {
    section
        .get(key)
        .map(|value| match value.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "on" | "1" => Ok(true),
            "false" | "no" | "off" | "0" => Ok(false),
            other => Err(SyncError::InvalidConfig(format!(
                "{} = '{}': expected a boolean",
                key, other
            ))),
        })
        .transpose()
}
