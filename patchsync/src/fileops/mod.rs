//! Local filesystem operations used by the synchronization commands.
//!
//! Commands never touch the filesystem or the network directly; they go
//! through the [`FileOps`] trait. [`LocalFileOps`] is the real implementation
//! over an installation root and a [`TransferManager`].

pub mod checksum;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use sysinfo::Disks;

use crate::cancel::CancellationFlag;
use crate::error::{SyncError, SyncResult};
use crate::manifest::ManifestEntry;
use crate::transfer::{RemoteFileDetails, TransferManager};

/// Structured diagnostics emitted while synchronizing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    InsufficientSpace {
        path: PathBuf,
        required: u64,
        available: u64,
    },
    DownloadAttemptFailed {
        path: String,
        error: String,
        retries_remaining: u32,
    },
    ValidationFailedAfterDownload {
        path: String,
        retries_remaining: u32,
    },
    ZeroFileDetected {
        path: PathBuf,
        size: u64,
    },
    SizeMismatch {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },
}

impl SyncEvent {
    /// Short machine-readable name of the event.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InsufficientSpace { .. } => "insufficient_space",
            Self::DownloadAttemptFailed { .. } => "download_attempt_failed",
            Self::ValidationFailedAfterDownload { .. } => "validation_failed_after_download",
            Self::ZeroFileDetected { .. } => "zero_file_detected",
            Self::SizeMismatch { .. } => "size_mismatch",
            Self::ChecksumMismatch { .. } => "checksum_mismatch",
        }
    }

    /// Write the event to the tracing subscriber.
    pub fn emit(&self) {
        let kind = self.kind();
        match self {
            Self::InsufficientSpace {
                path,
                required,
                available,
            } => tracing::error!(
                event = kind,
                path = %path.display(),
                required,
                available,
                "Insufficient disk space"
            ),
            Self::DownloadAttemptFailed {
                path,
                error,
                retries_remaining,
            } => tracing::warn!(
                event = kind,
                path = %path,
                error = %error,
                retries_remaining,
                "Download attempt failed"
            ),
            Self::ValidationFailedAfterDownload {
                path,
                retries_remaining,
            } => tracing::warn!(
                event = kind,
                path = %path,
                retries_remaining,
                "Downloaded file failed validation"
            ),
            Self::ZeroFileDetected { path, size } => tracing::warn!(
                event = kind,
                path = %path.display(),
                size,
                "Downloaded payload is entirely zero bytes"
            ),
            Self::SizeMismatch {
                path,
                expected,
                actual,
            } => tracing::debug!(
                event = kind,
                path = %path.display(),
                expected,
                actual,
                "Local file size does not match manifest"
            ),
            Self::ChecksumMismatch {
                path,
                expected,
                actual,
            } => tracing::debug!(
                event = kind,
                path = %path.display(),
                expected = %expected,
                actual = %actual,
                "Local file hash does not match manifest"
            ),
        }
    }
}

/// Counters describing the work a [`FileOps`] implementation performed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileOpsStats {
    pub downloads: u64,
    pub copies: u64,
    pub bytes_transferred: u64,
}

/// Filesystem and network operations consumed by the commands.
pub trait FileOps: Send + Sync {
    /// Absolute destination of a manifest entry.
    fn local_path(&self, entry: &ManifestEntry) -> PathBuf;

    /// Remove a file; a missing file is not an error.
    fn remove_file(&self, path: &Path) -> SyncResult<()>;

    fn exists(&self, entry: &ManifestEntry) -> bool;

    /// Copy `source` to `target`, creating parent directories as needed.
    fn copy_file(&self, source: &Path, target: &Path) -> SyncResult<()>;

    /// Whether the local file exists with the declared size and hash.
    fn validate_file(&self, entry: &ManifestEntry) -> bool;

    /// Download `entry` to its local path, reporting bytes received.
    fn download_file(&self, entry: &ManifestEntry, on_progress: &dyn Fn(u64)) -> SyncResult<()>;

    fn remote_file_details(&self, entry: &ManifestEntry) -> SyncResult<RemoteFileDetails>;

    /// Free bytes on the volume that holds (or will hold) `path`.
    fn free_space(&self, path: &Path) -> SyncResult<u64>;

    fn cancel_requested(&self) -> bool;

    /// Record a failure destined for the final report.
    fn set_error(&self, message: &str);

    fn log(&self, event: SyncEvent);

    fn stats(&self) -> FileOpsStats {
        FileOpsStats::default()
    }
}

/// [`FileOps`] over a real installation directory.
pub struct LocalFileOps {
    install_root: PathBuf,
    transfers: TransferManager,
    cancel: CancellationFlag,
    // Bundles can share parent directories; creation must not race.
    dir_lock: Mutex<()>,
    errors: Mutex<Vec<String>>,
    downloads: AtomicU64,
    copies: AtomicU64,
    bytes_transferred: AtomicU64,
}

impl std::fmt::Debug for LocalFileOps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalFileOps")
            .field("install_root", &self.install_root)
            .field("transfers", &self.transfers)
            .finish()
    }
}

impl LocalFileOps {
    pub fn new(
        install_root: impl Into<PathBuf>,
        transfers: TransferManager,
        cancel: CancellationFlag,
    ) -> Self {
        Self {
            install_root: install_root.into(),
            transfers,
            cancel,
            dir_lock: Mutex::new(()),
            errors: Mutex::new(Vec::new()),
            downloads: AtomicU64::new(0),
            copies: AtomicU64::new(0),
            bytes_transferred: AtomicU64::new(0),
        }
    }

    pub fn install_root(&self) -> &Path {
        &self.install_root
    }

    /// Errors recorded through [`FileOps::set_error`].
    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().clone()
    }

    fn ensure_parent(&self, path: &Path) -> SyncResult<()> {
        let Some(parent) = path.parent() else {
            return Ok(());
        };
        let _guard = self.dir_lock.lock();
        fs::create_dir_all(parent).map_err(|e| SyncError::CreateDirFailed {
            path: parent.to_path_buf(),
            source: e,
        })
    }
}

impl FileOps for LocalFileOps {
    fn local_path(&self, entry: &ManifestEntry) -> PathBuf {
        entry.local_path(&self.install_root)
    }

    fn remove_file(&self, path: &Path) -> SyncResult<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SyncError::WriteFailed {
                path: path.to_path_buf(),
                source: e,
            }),
        }
    }

    fn exists(&self, entry: &ManifestEntry) -> bool {
        self.local_path(entry).is_file()
    }

    fn copy_file(&self, source: &Path, target: &Path) -> SyncResult<()> {
        self.ensure_parent(target)?;
        fs::copy(source, target).map_err(|e| SyncError::WriteFailed {
            path: target.to_path_buf(),
            source: e,
        })?;
        self.copies.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn validate_file(&self, entry: &ManifestEntry) -> bool {
        let path = self.local_path(entry);
        let Ok(meta) = fs::metadata(&path) else {
            return false;
        };
        if !meta.is_file() {
            return false;
        }
        if meta.len() != entry.size {
            self.log(SyncEvent::SizeMismatch {
                path,
                expected: entry.size,
                actual: meta.len(),
            });
            return false;
        }
        match checksum::hash_file(&path, &|| self.cancel_requested()) {
            Ok(digest) if checksum::hashes_match(&entry.hash, &digest.hash) => true,
            Ok(digest) if digest.all_zero => {
                self.log(SyncEvent::ZeroFileDetected {
                    path,
                    size: digest.len,
                });
                false
            }
            Ok(digest) => {
                self.log(SyncEvent::ChecksumMismatch {
                    path,
                    expected: entry.hash.clone(),
                    actual: digest.hash,
                });
                false
            }
            Err(SyncError::Cancelled) => false,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to hash local file");
                false
            }
        }
    }

    fn download_file(&self, entry: &ManifestEntry, on_progress: &dyn Fn(u64)) -> SyncResult<()> {
        let target = self.local_path(entry);
        let details = self.remote_file_details(entry)?;
        self.ensure_parent(&target)?;

        let report = self
            .transfers
            .transfer(&details, &target, &self.cancel, on_progress)?;

        if report.all_zero {
            self.log(SyncEvent::ZeroFileDetected {
                path: target.clone(),
                size: entry.size,
            });
        }
        tracing::debug!(
            path = %target.display(),
            bytes = report.bytes_written,
            resumed_from = report.resumed_from,
            hash_verified = report.hash_verified,
            "Transfer complete"
        );

        self.downloads.fetch_add(1, Ordering::Relaxed);
        self.bytes_transferred
            .fetch_add(report.bytes_written, Ordering::Relaxed);
        Ok(())
    }

    fn remote_file_details(&self, entry: &ManifestEntry) -> SyncResult<RemoteFileDetails> {
        self.transfers.source().details(entry)
    }

    fn free_space(&self, path: &Path) -> SyncResult<u64> {
        available_disk_space(path).ok_or_else(|| SyncError::ReadFailed {
            path: path.to_path_buf(),
            source: io::Error::new(io::ErrorKind::NotFound, "no volume found for path"),
        })
    }

    fn cancel_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn set_error(&self, message: &str) {
        tracing::error!(error = %message, "Synchronization error");
        self.errors.lock().push(message.to_string());
    }

    fn log(&self, event: SyncEvent) {
        event.emit();
    }

    fn stats(&self) -> FileOpsStats {
        FileOpsStats {
            downloads: self.downloads.load(Ordering::Relaxed),
            copies: self.copies.load(Ordering::Relaxed),
            bytes_transferred: self.bytes_transferred.load(Ordering::Relaxed),
        }
    }
}

/// Closest ancestor of `path` that exists on disk.
fn nearest_existing_path(path: &Path) -> PathBuf {
    let mut candidate = path.to_path_buf();
    while !candidate.exists() {
        if !candidate.pop() {
            return PathBuf::from(".");
        }
    }
    candidate
}

/// Available bytes on the disk whose mount point is the longest prefix of `path`.
fn available_disk_space(path: &Path) -> Option<u64> {
    let target = nearest_existing_path(path);
    let target = fs::canonicalize(&target).unwrap_or(target);
    let disks = Disks::new_with_refreshed_list();

    disks
        .list()
        .iter()
        .filter(|disk| target.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
}

/// Shared handle type used throughout the engine.
pub type SharedFileOps = Arc<dyn FileOps>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::MemorySource;
    use sha2::{Digest, Sha256};
    use tempfile::TempDir;

    fn sha(data: &[u8]) -> String {
        checksum::digest_hex(Sha256::new_with_prefix(data))
    }

    fn ops(root: &Path, source: MemorySource) -> LocalFileOps {
        LocalFileOps::new(
            root,
            TransferManager::new(Arc::new(source)),
            CancellationFlag::new(),
        )
    }

    #[test]
    fn test_validate_file() {
        let temp = TempDir::new().unwrap();
        let ops = ops(temp.path(), MemorySource::new());
        let entry = ManifestEntry::new("dir/a.txt", sha(b"hello"), 5, "a");

        assert!(!ops.validate_file(&entry));
        assert!(!ops.exists(&entry));

        fs::create_dir_all(temp.path().join("dir")).unwrap();
        fs::write(temp.path().join("dir/a.txt"), b"hellO").unwrap();
        assert!(ops.exists(&entry));
        assert!(!ops.validate_file(&entry));

        fs::write(temp.path().join("dir/a.txt"), b"hello").unwrap();
        assert!(ops.validate_file(&entry));
    }

    #[test]
    fn test_validate_wrong_size() {
        let temp = TempDir::new().unwrap();
        let ops = ops(temp.path(), MemorySource::new());
        let entry = ManifestEntry::new("a.txt", sha(b"hello"), 5, "a");
        fs::write(temp.path().join("a.txt"), b"hello!").unwrap();
        assert!(!ops.validate_file(&entry));
    }

    #[test]
    fn test_zero_filled_file_is_invalid() {
        let temp = TempDir::new().unwrap();
        let ops = ops(temp.path(), MemorySource::new());
        let entry = ManifestEntry::new("z.bin", sha(b"abcd"), 4, "z");
        fs::write(temp.path().join("z.bin"), [0u8; 4]).unwrap();

        assert!(!ops.validate_file(&entry));
    }

    #[test]
    fn test_validate_stops_when_cancelled() {
        let temp = TempDir::new().unwrap();
        let cancel = CancellationFlag::new();
        let ops = LocalFileOps::new(
            temp.path(),
            TransferManager::new(Arc::new(MemorySource::new())),
            cancel.clone(),
        );
        let entry = ManifestEntry::new("a.txt", sha(b"hello"), 5, "a");
        fs::write(temp.path().join("a.txt"), b"hello").unwrap();
        assert!(ops.validate_file(&entry));

        cancel.cancel();
        assert!(!ops.validate_file(&entry));
    }

    #[test]
    fn test_copy_creates_parents() {
        let temp = TempDir::new().unwrap();
        let ops = ops(temp.path(), MemorySource::new());
        let source = temp.path().join("a.txt");
        let target = temp.path().join("x/y/b.txt");
        fs::write(&source, b"data").unwrap();

        ops.copy_file(&source, &target).unwrap();

        assert_eq!(fs::read(&target).unwrap(), b"data");
        assert_eq!(ops.stats().copies, 1);
    }

    #[test]
    fn test_remove_missing_file_is_ok() {
        let temp = TempDir::new().unwrap();
        let ops = ops(temp.path(), MemorySource::new());
        assert!(ops.remove_file(&temp.path().join("missing")).is_ok());
    }

    #[test]
    fn test_download_file() {
        let temp = TempDir::new().unwrap();
        let source = MemorySource::new().with_file("remote/a", b"payload".to_vec());
        let ops = ops(temp.path(), source);
        let entry = ManifestEntry::new("sub/a.bin", sha(b"payload"), 7, "remote/a");

        ops.download_file(&entry, &|_| {}).unwrap();

        assert!(ops.validate_file(&entry));
        let stats = ops.stats();
        assert_eq!(stats.downloads, 1);
        assert_eq!(stats.bytes_transferred, 7);
    }

    #[test]
    fn test_set_error_collects() {
        let temp = TempDir::new().unwrap();
        let ops = ops(temp.path(), MemorySource::new());
        ops.set_error("first");
        ops.set_error("second");
        assert_eq!(ops.errors(), vec!["first".to_string(), "second".to_string()]);
    }

    #[test]
    fn test_nearest_existing_path() {
        let temp = TempDir::new().unwrap();
        let deep = temp.path().join("a/b/c/file");
        assert_eq!(nearest_existing_path(&deep), temp.path());
    }

    #[test]
    fn test_event_kinds() {
        let event = SyncEvent::ZeroFileDetected {
            path: PathBuf::from("a"),
            size: 1,
        };
        assert_eq!(event.kind(), "zero_file_detected");
        event.emit();
    }
}
