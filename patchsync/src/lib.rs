//! patchsync - manifest-driven content synchronization
//!
//! Reconciles a local installation directory against a manifest of expected
//! files. Each file is either already correct, repaired by copying from a
//! local file with identical content, or downloaded with resumable,
//! hash-verified transfers. Work runs on a fixed worker pool draining a
//! five-level priority queue.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use patchsync::{CancellationFlag, Manifest, SyncConfig, Synchronizer};
//!
//! let manifest = Manifest::load("manifest.json".as_ref())?;
//! let config = SyncConfig::new("/opt/game").with_base_url("https://cdn.example.com");
//! let sync = Synchronizer::over_http(config, CancellationFlag::new())?;
//! let report = sync.run(&manifest, None)?;
//! println!("{} downloads, {} copies", report.downloads, report.copies);
//! ```

pub mod bundle;
pub mod cancel;
pub mod command;
pub mod config;
pub mod error;
pub mod fileops;
pub mod logging;
pub mod manifest;
pub mod progress;
pub mod queue;
pub mod sync;
pub mod transfer;

pub use bundle::{Bundle, BundleEntry, BundleId, BundleSet, Bundler, DownloadStatus};
pub use cancel::CancellationFlag;
pub use command::{Command, CommandPriority, RetryBackoff};
pub use config::{ConfigFile, SyncConfig, VersionMarker};
pub use error::{SyncError, SyncResult};
pub use fileops::{FileOps, FileOpsStats, LocalFileOps, SyncEvent};
pub use logging::{init_logging, LogConfig, LoggingGuard};
pub use manifest::{Manifest, ManifestEntry};
pub use progress::{ProgressMonitor, ProgressSnapshot};
pub use queue::PriorityWorkQueue;
pub use sync::{SyncReport, Synchronizer};
pub use transfer::{HttpSource, MemorySource, RemoteSource, TransferManager};
