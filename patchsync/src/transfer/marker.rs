//! Sidecar progress marker for resumable transfers.
//!
//! The marker lives next to the target as `{target}.progress` and holds a
//! single line `received/expected/version_tag`. It is rewritten after every
//! chunk so an interrupted transfer can pick up where it stopped.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{SyncError, SyncResult};

/// Suffix of the in-progress data file.
pub const PART_SUFFIX: &str = "part";

/// Suffix of the resume bookkeeping file.
pub const PROGRESS_SUFFIX: &str = "progress";

/// `{target}.part`
pub fn part_path(target: &Path) -> PathBuf {
    with_suffix(target, PART_SUFFIX)
}

/// `{target}.progress`
pub fn marker_path(target: &Path) -> PathBuf {
    with_suffix(target, PROGRESS_SUFFIX)
}

fn with_suffix(target: &Path, suffix: &str) -> PathBuf {
    let mut name = target.as_os_str().to_owned();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

/// Resume bookkeeping for one transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressMarker {
    pub received: u64,
    pub expected: u64,
    pub version_tag: String,
}

impl ProgressMarker {
    pub fn new(received: u64, expected: u64, version_tag: impl Into<String>) -> Self {
        Self {
            received,
            expected,
            version_tag: version_tag.into(),
        }
    }

    /// Parse `received/expected/version_tag`.
    ///
    /// The tag may itself contain `/`; everything after the second separator
    /// belongs to it.
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.trim_end_matches(['\r', '\n']).splitn(3, '/');
        let received = parts.next()?.parse().ok()?;
        let expected = parts.next()?.parse().ok()?;
        let version_tag = parts.next()?.to_string();
        if received > expected {
            return None;
        }
        Some(Self {
            received,
            expected,
            version_tag,
        })
    }

    /// Read the marker for `target`, if present and well formed.
    pub fn load(target: &Path) -> Option<Self> {
        fs::read_to_string(marker_path(target))
            .ok()
            .and_then(|s| Self::parse(&s))
    }

    /// Persist the marker for `target`.
    pub fn store(&self, target: &Path) -> SyncResult<()> {
        let path = marker_path(target);
        fs::write(&path, self.to_string()).map_err(|e| SyncError::WriteFailed { path, source: e })
    }

    /// Whether a transfer of `expected` bytes at `version_tag` may resume from here.
    pub fn resumable_for(&self, expected: u64, version_tag: &str) -> bool {
        self.expected == expected && self.version_tag == version_tag
    }
}

impl std::fmt::Display for ProgressMarker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.received, self.expected, self.version_tag)
    }
}
