//! CLI error type.

use std::fmt;

use patchsync::SyncError;

/// Errors surfaced to the user by the `patchsync` binary.
#[derive(Debug)]
pub enum CliError {
    /// Bad arguments or configuration.
    Config(String),
    /// The manifest could not be loaded.
    Manifest(SyncError),
    /// The synchronization run failed.
    Sync(SyncError),
    /// The run was interrupted.
    Cancelled,
}

impl CliError {
    /// Process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Config(_) => 2,
            CliError::Cancelled => 130,
            CliError::Manifest(_) | CliError::Sync(_) => 1,
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::Config(msg) => write!(f, "Configuration error: {}", msg),
            CliError::Manifest(e) => write!(f, "Failed to load manifest: {}", e),
            CliError::Sync(e) => write!(f, "Synchronization failed:\n{}", e),
            CliError::Cancelled => write!(f, "Synchronization cancelled"),
        }
    }
}

impl std::error::Error for CliError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CliError::Manifest(e) | CliError::Sync(e) => Some(e),
            _ => None,
        }
    }
}

impl From<SyncError> for CliError {
    fn from(e: SyncError) -> Self {
        match e {
            SyncError::Cancelled => CliError::Cancelled,
            SyncError::InvalidConfig(msg) => CliError::Config(msg),
            other => CliError::Sync(other),
        }
    }
}
