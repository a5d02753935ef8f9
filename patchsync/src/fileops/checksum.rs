//! SHA-256 content hashing for local validation.
//!
//! Local files are hashed in blocks so a long validation pass can be
//! abandoned between blocks when the run is cancelled.

use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::{SyncError, SyncResult};

/// Read block size while hashing (64KB).
const BLOCK_SIZE: usize = 64 * 1024;

/// Result of hashing a local file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDigest {
    /// Lowercase hexadecimal SHA-256.
    pub hash: String,
    /// Bytes hashed.
    pub len: u64,
    /// Every byte was zero. False for an empty file.
    pub all_zero: bool,
}

/// Hash a file, checking `cancelled` before every block.
///
/// # Arguments
///
/// * `path` - File to hash
/// * `cancelled` - Polled between blocks; returning `true` abandons the hash
///
/// # Errors
///
/// Returns [`SyncError::ReadFailed`] if the file cannot be opened or read,
/// and [`SyncError::Cancelled`] if `cancelled` fired part way through.
pub fn hash_file(path: &Path, cancelled: &dyn Fn() -> bool) -> SyncResult<FileDigest> {
    let read_err = |e| SyncError::ReadFailed {
        path: path.to_path_buf(),
        source: e,
    };
    let mut file = File::open(path).map_err(read_err)?;

    let mut hasher = Sha256::new();
    let mut block = vec![0u8; BLOCK_SIZE];
    let mut len = 0u64;
    let mut all_zero = true;

    loop {
        if cancelled() {
            return Err(SyncError::Cancelled);
        }
        let n = match file.read(&mut block) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(read_err(e)),
        };
        let data = &block[..n];
        hasher.update(data);
        all_zero = all_zero && data.iter().all(|&b| b == 0);
        len += n as u64;
    }

    Ok(FileDigest {
        hash: digest_hex(hasher),
        len,
        all_zero: all_zero && len > 0,
    })
}

/// Hash a file to completion. See [`hash_file`].
pub fn file_sha256(path: &Path) -> SyncResult<String> {
    hash_file(path, &|| false).map(|digest| digest.hash)
}

/// Hex-encode a finished digest the same way [`hash_file`] does.
pub fn digest_hex(hasher: Sha256) -> String {
    format!("{:x}", hasher.finalize())
}

/// Compare two hex digests, ignoring case.
pub fn hashes_match(expected: &str, actual: &str) -> bool {
    expected.eq_ignore_ascii_case(actual)
}
