//! Manifest entries describing the expected contents of an installation.
//!
//! The manifest wire format belongs to the server; this module only defines
//! the immutable entry type the engine consumes, plus a small JSON loader used
//! by the command-line front end.

use std::collections::HashSet;
use std::fs;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};

/// One file the server expects to exist in the installation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Path relative to the installation root.
    pub path: String,
    /// Lowercase hexadecimal SHA-256 of the file contents.
    pub hash: String,
    /// File size in bytes.
    pub size: u64,
    /// Location of the file relative to the download mirror.
    pub remote_path: String,
    /// Cookies required by the mirror for this file, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_cookies: Option<String>,
}

impl ManifestEntry {
    /// Create an entry without access cookies.
    pub fn new(
        path: impl Into<String>,
        hash: impl Into<String>,
        size: u64,
        remote_path: impl Into<String>,
    ) -> Self {
        Self {
            path: path.into(),
            hash: hash.into().to_ascii_lowercase(),
            size,
            remote_path: remote_path.into(),
            access_cookies: None,
        }
    }

    /// Attach access cookies to the entry.
    pub fn with_access_cookies(mut self, cookies: impl Into<String>) -> Self {
        self.access_cookies = Some(cookies.into());
        self
    }

    /// Resolve the entry's local path under an installation root.
    pub fn local_path(&self, install_root: &Path) -> PathBuf {
        install_root.join(&self.path)
    }

    fn check_path(&self) -> SyncResult<()> {
        if self.path.is_empty() {
            return Err(SyncError::InvalidManifest("entry with empty path".to_string()));
        }
        if !is_contained_path(&self.path) {
            return Err(SyncError::InvalidManifest(format!(
                "path {} escapes the installation root",
                self.path
            )));
        }
        Ok(())
    }
}

/// Whether a relative path stays inside the directory it is joined onto.
///
/// Rejects `..` components and absolute or prefixed paths.
pub fn is_contained_path(path: &str) -> bool {
    !Path::new(path).components().any(|c| {
        matches!(
            c,
            Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    })
}

/// A parsed manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub entries: Vec<ManifestEntry>,
}

impl Manifest {
    /// Build a manifest from entries.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidManifest`] if a path escapes the install
    /// root or two entries share a path.
    pub fn new(entries: Vec<ManifestEntry>) -> SyncResult<Self> {
        let manifest = Self { entries };
        manifest.validate()?;
        Ok(manifest)
    }

    /// Parse a JSON manifest.
    pub fn from_json_str(json: &str) -> SyncResult<Self> {
        let mut manifest: Manifest =
            serde_json::from_str(json).map_err(|e| SyncError::InvalidManifest(e.to_string()))?;
        for entry in &mut manifest.entries {
            entry.hash.make_ascii_lowercase();
        }
        manifest.validate()?;
        Ok(manifest)
    }

    /// Load a JSON manifest from disk.
    ///
    /// # Arguments
    ///
    /// * `path` - JSON file of the form `{ "entries": [...] }`
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::ReadFailed`] if the file cannot be read and
    /// [`SyncError::InvalidManifest`] if it does not parse or validate.
    pub fn load(path: &Path) -> SyncResult<Self> {
        let json = fs::read_to_string(path).map_err(|e| SyncError::ReadFailed {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_json_str(&json)
    }

    /// Total bytes declared by the manifest, counting every target path.
    pub fn total_size(&self) -> u64 {
        self.entries.iter().map(|e| e.size).sum()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Every path must stay inside the install root and appear only once.
    fn validate(&self) -> SyncResult<()> {
        let mut seen = HashSet::with_capacity(self.entries.len());
        for entry in &self.entries {
            entry.check_path()?;
            if !seen.insert(Path::new(&entry.path).components().collect::<PathBuf>()) {
                return Err(SyncError::InvalidManifest(format!(
                    "duplicate path {}",
                    entry.path
                )));
            }
        }
        Ok(())
    }
}
