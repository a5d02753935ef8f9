//! Error types for content synchronization.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result type for synchronization operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur while reconciling an installation against a manifest.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Failed to read a file or directory.
    #[error("failed to read {}: {source}", path.display())]
    ReadFailed { path: PathBuf, source: io::Error },

    /// Failed to write a file or directory.
    #[error("failed to write {}: {source}", path.display())]
    WriteFailed { path: PathBuf, source: io::Error },

    /// Failed to create a directory.
    #[error("failed to create directory {}: {source}", path.display())]
    CreateDirFailed { path: PathBuf, source: io::Error },

    /// Failed to download a remote file.
    #[error("failed to download {url}: {reason}")]
    DownloadFailed { url: String, reason: String },

    /// Network timeout.
    #[error("request to {url} timed out after {timeout_secs}s")]
    Timeout { url: String, timeout_secs: u64 },

    /// Content hash did not match the manifest.
    #[error("checksum mismatch for {}: expected {expected}, got {actual}", path.display())]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    /// File size did not match the manifest.
    #[error("size mismatch for {}: expected {expected} bytes, got {actual}", path.display())]
    SizeMismatch {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },

    /// Not enough free space at the destination.
    #[error(
        "insufficient disk space at {}: {required} bytes required, {available} available",
        path.display()
    )]
    InsufficientSpace {
        path: PathBuf,
        required: u64,
        available: u64,
    },

    /// A bundle entry was added to a bundle with different content.
    #[error("entry {path} ({hash}, {size} bytes) does not belong to bundle {bundle_hash}")]
    BundleMismatch {
        path: String,
        hash: String,
        size: u64,
        bundle_hash: String,
    },

    /// The run was cancelled by the caller.
    #[error("synchronization cancelled")]
    Cancelled,

    /// The manifest could not be parsed or contains invalid entries.
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// One or more bundles failed; the message is the deduplicated summary.
    #[error("{message}")]
    Aggregate { message: String, failures: usize },
}

impl SyncError {
    /// Whether a later attempt of the same operation may succeed.
    ///
    /// Transfer and integrity failures are retried against the bundle's retry
    /// budget. Space, cancellation and configuration problems are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::DownloadFailed { .. }
                | Self::Timeout { .. }
                | Self::ChecksumMismatch { .. }
                | Self::SizeMismatch { .. }
                | Self::ReadFailed { .. }
                | Self::WriteFailed { .. }
        )
    }
}
