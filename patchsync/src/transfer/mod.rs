//! Resumable, chunked, hash-verified transfer of a single remote file.
//!
//! # On-disk protocol
//!
//! ```text
//! {target}.part       pre-sized data file, written at the resume offset
//! {target}.progress   "received/expected/version_tag", rewritten per chunk
//!        │
//!        ▼  (all bytes received, hash ok)
//! {target}            part file renamed into place, marker removed
//! ```
//!
//! A marker is trusted only when both the expected size and the remote
//! version tag match; otherwise the transfer restarts from byte 0. The SHA-256
//! is streamed only for transfers that start at 0. Resumed transfers are
//! verified later by the validate command.

mod marker;
mod source;

use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use sha2::{Digest, Sha256};

pub use marker::{marker_path, part_path, ProgressMarker, PART_SUFFIX, PROGRESS_SUFFIX};
pub use source::{
    join_url, HttpSource, MemorySource, RemoteFileDetails, RemoteSource, RemoteStream,
    DEFAULT_TIMEOUT_SECS,
};

use crate::cancel::CancellationFlag;
use crate::error::{SyncError, SyncResult};
use crate::fileops::checksum::{digest_hex, hashes_match};

/// Default chunk size for the transfer loop (64KB).
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Summary of a completed transfer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferReport {
    /// Bytes received during this call.
    pub bytes_written: u64,
    /// Offset the transfer resumed from (0 for a fresh transfer).
    pub resumed_from: u64,
    /// The streamed hash was computed and matched.
    pub hash_verified: bool,
    /// Every byte received during this call was zero.
    pub all_zero: bool,
}

/// Performs single-file transfers from a [`RemoteSource`].
pub struct TransferManager {
    source: Arc<dyn RemoteSource>,
    chunk_size: usize,
}

impl std::fmt::Debug for TransferManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferManager")
            .field("chunk_size", &self.chunk_size)
            .finish()
    }
}

impl TransferManager {
    pub fn new(source: Arc<dyn RemoteSource>) -> Self {
        Self::with_chunk_size(source, DEFAULT_CHUNK_SIZE)
    }

    pub fn with_chunk_size(source: Arc<dyn RemoteSource>, chunk_size: usize) -> Self {
        Self {
            source,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn source(&self) -> &Arc<dyn RemoteSource> {
        &self.source
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Transfer `details` into `target`.
    ///
    /// `on_progress` receives the total bytes present in the part file after
    /// every chunk, including any resumed prefix. The parent directory of
    /// `target` must already exist.
    ///
    /// # Errors
    ///
    /// * [`SyncError::Cancelled`] - the flag was raised between chunks; the
    ///   part file and marker are kept for a later resume
    /// * [`SyncError::SizeMismatch`] - the body ended early or ran long
    /// * [`SyncError::ChecksumMismatch`] - the streamed hash differs; the part
    ///   file is discarded so the next attempt starts from zero
    /// * transport errors from the [`RemoteSource`]
    pub fn transfer(
        &self,
        details: &RemoteFileDetails,
        target: &Path,
        cancel: &CancellationFlag,
        on_progress: &dyn Fn(u64),
    ) -> SyncResult<TransferReport> {
        let part = part_path(target);
        let expected = details.expected_size;
        let resume_from = resume_offset(target, &part, details);

        let (offset, received) = if resume_from == expected && expected > 0 {
            tracing::debug!(path = %target.display(), "Part file already complete");
            (
                resume_from,
                Received {
                    bytes: 0,
                    hash: None,
                    all_zero: false,
                },
            )
        } else {
            let stream = self.source.open(details, resume_from)?;
            let offset = stream.offset;
            let received = self.receive(details, target, &part, stream, cancel, on_progress)?;
            (offset, received)
        };

        let report = TransferReport {
            bytes_written: received.bytes,
            resumed_from: offset,
            hash_verified: received.hash.is_some(),
            all_zero: received.bytes > 0 && received.all_zero,
        };

        if let Some(actual) = received.hash {
            if !hashes_match(&details.expected_hash, &actual) {
                discard(&part, target);
                return Err(SyncError::ChecksumMismatch {
                    path: target.to_path_buf(),
                    expected: details.expected_hash.clone(),
                    actual,
                });
            }
        }

        finalize(&part, target)?;
        Ok(report)
    }

    fn receive(
        &self,
        details: &RemoteFileDetails,
        target: &Path,
        part: &Path,
        stream: RemoteStream,
        cancel: &CancellationFlag,
        on_progress: &dyn Fn(u64),
    ) -> SyncResult<Received> {
        let expected = details.expected_size;
        let write_err = |e| SyncError::WriteFailed {
            path: part.to_path_buf(),
            source: e,
        };

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(part)
            .map_err(write_err)?;
        file.set_len(expected).map_err(write_err)?;
        file.seek(SeekFrom::Start(stream.offset)).map_err(write_err)?;

        let mut reader = stream.reader;
        let mut hasher = (stream.offset == 0).then(Sha256::new);
        // One buffer per transfer; never shared between concurrent downloads.
        let mut buffer = vec![0u8; self.chunk_size];
        let mut position = stream.offset;
        let mut all_zero = true;

        ProgressMarker::new(position, expected, &details.version_tag).store(target)?;
        on_progress(position);

        loop {
            if cancel.is_cancelled() {
                file.flush().map_err(write_err)?;
                return Err(SyncError::Cancelled);
            }

            let n = reader
                .read(&mut buffer)
                .map_err(|e| SyncError::DownloadFailed {
                    url: details.url.clone(),
                    reason: format!("Read error: {}", e),
                })?;
            if n == 0 {
                break;
            }

            if position + n as u64 > expected {
                return Err(SyncError::SizeMismatch {
                    path: target.to_path_buf(),
                    expected,
                    actual: position + n as u64,
                });
            }

            let chunk = &buffer[..n];
            file.write_all(chunk).map_err(write_err)?;
            if let Some(h) = hasher.as_mut() {
                h.update(chunk);
            }
            all_zero &= chunk.iter().all(|&b| b == 0);
            position += n as u64;

            ProgressMarker::new(position, expected, &details.version_tag).store(target)?;
            on_progress(position);
        }

        file.flush().map_err(write_err)?;
        file.sync_all().map_err(write_err)?;

        if position != expected {
            return Err(SyncError::SizeMismatch {
                path: target.to_path_buf(),
                expected,
                actual: position,
            });
        }

        Ok(Received {
            bytes: position - stream.offset,
            hash: hasher.map(digest_hex),
            all_zero,
        })
    }
}

struct Received {
    bytes: u64,
    hash: Option<String>,
    all_zero: bool,
}

/// Offset an existing part file can be resumed from, or 0.
fn resume_offset(target: &Path, part: &Path, details: &RemoteFileDetails) -> u64 {
    let Some(marker) = ProgressMarker::load(target) else {
        return 0;
    };
    if !marker.resumable_for(details.expected_size, &details.version_tag) {
        tracing::debug!(
            path = %target.display(),
            marker = %marker,
            "Discarding stale progress marker"
        );
        return 0;
    }
    match fs::metadata(part) {
        Ok(meta) if meta.len() >= marker.received => marker.received,
        _ => 0,
    }
}

/// Move a finished part file into place and drop its marker.
fn finalize(part: &Path, target: &Path) -> SyncResult<()> {
    remove_best_effort(&marker_path(target));
    if target.exists() {
        remove_best_effort(target);
    }
    fs::rename(part, target).map_err(|e| SyncError::WriteFailed {
        path: target.to_path_buf(),
        source: e,
    })
}

/// Remove a rejected part file so the next attempt starts from zero.
fn discard(part: &Path, target: &Path) {
    remove_best_effort(part);
    remove_best_effort(&marker_path(target));
}

fn remove_best_effort(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fileops::checksum::file_sha256;
    use crate::manifest::ManifestEntry;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tempfile::TempDir;

    fn sha256_hex(data: &[u8]) -> String {
        let mut h = Sha256::new();
        h.update(data);
        digest_hex(h)
    }

    fn setup(data: &[u8]) -> (Arc<MemorySource>, RemoteFileDetails) {
        let source = Arc::new(MemorySource::new().with_file("f", data.to_vec()));
        let entry = ManifestEntry::new("f", sha256_hex(data), data.len() as u64, "f");
        let details = source.details(&entry).unwrap();
        (source, details)
    }

    #[test]
    fn test_fresh_transfer() {
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("file.bin");
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let (source, details) = setup(&data);
        let manager = TransferManager::with_chunk_size(source, 1024);
        let last = AtomicU64::new(0);

        let report = manager
            .transfer(&details, &target, &CancellationFlag::new(), &|p| {
                last.store(p, Ordering::SeqCst)
            })
            .unwrap();

        assert_eq!(report.bytes_written, 10_000);
        assert_eq!(report.resumed_from, 0);
        assert!(report.hash_verified);
        assert!(!report.all_zero);
        assert_eq!(last.load(Ordering::SeqCst), 10_000);
        assert_eq!(fs::read(&target).unwrap(), data);
        assert!(!part_path(&target).exists());
        assert!(!marker_path(&target).exists());
    }

    #[test]
    fn test_resume_from_marker() {
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("file.bin");
        let data = b"0123456789".to_vec();
        let (source, details) = setup(&data);

        let mut partial = data[..4].to_vec();
        partial.resize(10, 0);
        fs::write(part_path(&target), &partial).unwrap();
        ProgressMarker::new(4, 10, "v1").store(&target).unwrap();

        let manager = TransferManager::new(source);
        let report = manager
            .transfer(&details, &target, &CancellationFlag::new(), &|_| {})
            .unwrap();

        assert_eq!(report.resumed_from, 4);
        assert_eq!(report.bytes_written, 6);
        assert!(!report.hash_verified);
        assert_eq!(fs::read(&target).unwrap(), data);
    }

    #[test]
    fn test_stale_marker_restarts() {
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("file.bin");
        let data = b"0123456789".to_vec();
        let (source, details) = setup(&data);

        fs::write(part_path(&target), b"XXXXXXXXXX").unwrap();
        ProgressMarker::new(4, 10, "old-tag").store(&target).unwrap();

        let report = TransferManager::new(source)
            .transfer(&details, &target, &CancellationFlag::new(), &|_| {})
            .unwrap();

        assert_eq!(report.resumed_from, 0);
        assert!(report.hash_verified);
        assert_eq!(fs::read(&target).unwrap(), data);
    }

    #[test]
    fn test_checksum_mismatch_discards_part() {
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("file.bin");
        let (source, mut details) = setup(b"payload");
        details.expected_hash = sha256_hex(b"something else");

        let result = TransferManager::new(source).transfer(
            &details,
            &target,
            &CancellationFlag::new(),
            &|_| {},
        );

        assert!(matches!(result, Err(SyncError::ChecksumMismatch { .. })));
        assert!(!target.exists());
        assert!(!part_path(&target).exists());
        assert!(!marker_path(&target).exists());
    }

    #[test]
    fn test_short_body_is_size_mismatch() {
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("file.bin");
        let (source, mut details) = setup(b"short");
        details.expected_size = 50;

        let result = TransferManager::new(source).transfer(
            &details,
            &target,
            &CancellationFlag::new(),
            &|_| {},
        );

        assert!(matches!(
            result,
            Err(SyncError::SizeMismatch {
                expected: 50,
                actual: 5,
                ..
            })
        ));
        assert!(!target.exists());
    }

    #[test]
    fn test_cancellation_keeps_marker() {
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("file.bin");
        let (source, details) = setup(&[7u8; 4096]);
        let cancel = CancellationFlag::new();

        let result = TransferManager::with_chunk_size(source, 1024).transfer(
            &details,
            &target,
            &cancel,
            &|p| {
                if p >= 2048 {
                    cancel.cancel();
                }
            },
        );

        assert!(matches!(result, Err(SyncError::Cancelled)));
        assert_eq!(ProgressMarker::load(&target).unwrap().received, 2048);
        assert!(!target.exists());
    }

    #[test]
    fn test_zero_payload_is_flagged() {
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("zeros.bin");
        let (source, details) = setup(&[0u8; 300]);

        let report = TransferManager::new(source)
            .transfer(&details, &target, &CancellationFlag::new(), &|_| {})
            .unwrap();

        assert!(report.all_zero);
    }

    #[test]
    fn test_replaces_existing_target() {
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("file.bin");
        fs::write(&target, b"stale contents").unwrap();
        let (source, details) = setup(b"fresh");

        TransferManager::new(source)
            .transfer(&details, &target, &CancellationFlag::new(), &|_| {})
            .unwrap();

        assert_eq!(file_sha256(&target).unwrap(), sha256_hex(b"fresh"));
    }

    #[test]
    fn test_server_without_range_restarts_from_zero() {
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("file.bin");
        let data = b"abcdefgh".to_vec();
        let source = Arc::new(
            MemorySource::new()
                .with_file("f", data.clone())
                .without_range_support(),
        );
        let entry = ManifestEntry::new("f", sha256_hex(&data), 8, "f");
        let details = source.details(&entry).unwrap();

        fs::write(part_path(&target), b"abcd\0\0\0\0").unwrap();
        ProgressMarker::new(4, 8, "v1").store(&target).unwrap();

        let report = TransferManager::new(source)
            .transfer(&details, &target, &CancellationFlag::new(), &|_| {})
            .unwrap();

        assert_eq!(report.resumed_from, 0);
        assert!(report.hash_verified);
        assert_eq!(fs::read(&target).unwrap(), data);
    }
}
