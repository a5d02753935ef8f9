//! Content-addressed grouping of manifest entries.
//!
//! Every manifest entry sharing the same `(hash, size)` lands in one
//! [`Bundle`]. A bundle is downloaded at most once per attempt; its other
//! target paths are repaired by copying from whichever entry validates first.
//!
//! # Lifecycle
//!
//! ```text
//! Bundler::add_entry (prescan) ──► Bundler::set_retries ──► Bundler::seal
//!                                                               │
//!                                                               ▼
//!                                              BundleSet (shared by workers)
//! ```
//!
//! Bundles live for one synchronization run. Mutation is serialized by the
//! command protocol (at most one live command per bundle); the per-bundle
//! mutex only makes concurrent progress reads from the aggregator sound.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::error::{SyncError, SyncResult};
use crate::manifest::ManifestEntry;

/// Index of a bundle inside a [`BundleSet`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BundleId(pub usize);

impl std::fmt::Display for BundleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "bundle#{}", self.0)
    }
}

/// Outcome of the most recent download attempt of a bundle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DownloadStatus {
    Succeeded,
    Failed(String),
}

/// Synchronization state of one manifest entry.
#[derive(Debug)]
pub struct BundleEntry {
    entry: ManifestEntry,
    /// The local file matches the manifest.
    pub validated: bool,
    /// The file was downloaded and awaits validation.
    pub downloaded: bool,
    progress: Arc<AtomicU64>,
}

impl BundleEntry {
    fn new(entry: ManifestEntry) -> Self {
        Self {
            entry,
            validated: false,
            downloaded: false,
            progress: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn manifest(&self) -> &ManifestEntry {
        &self.entry
    }

    pub fn path(&self) -> &str {
        &self.entry.path
    }

    /// Raw bytes transferred for this entry by the current download attempt.
    pub fn download_progress(&self) -> u64 {
        self.progress.load(Ordering::Relaxed)
    }

    /// Handle that a transfer can update without holding the bundle lock.
    pub fn progress_handle(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.progress)
    }

    /// Forget a failed or rejected download.
    pub fn reset_download(&mut self) {
        self.downloaded = false;
        self.progress.store(0, Ordering::Relaxed);
    }
}

/// A set of manifest entries with identical content.
#[derive(Debug)]
pub struct Bundle {
    hash: String,
    size: u64,
    entries: Vec<BundleEntry>,
    /// Every entry is validated.
    pub validated: bool,
    retries_remaining: u32,
    original_retries: u32,
    /// Result of the last download attempt; cleared when a new one starts.
    pub last_download_status: Option<DownloadStatus>,
    audit: String,
    last_error: Option<String>,
}

impl Bundle {
    fn new(entry: ManifestEntry) -> Self {
        Self {
            hash: entry.hash.clone(),
            size: entry.size,
            entries: vec![BundleEntry::new(entry)],
            validated: false,
            retries_remaining: 0,
            original_retries: 0,
            last_download_status: None,
            audit: String::new(),
            last_error: None,
        }
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn entries(&self) -> &[BundleEntry] {
        &self.entries
    }

    pub fn entries_mut(&mut self) -> &mut [BundleEntry] {
        &mut self.entries
    }

    /// Whether the entry belongs in this bundle.
    pub fn accepts(&self, entry: &ManifestEntry) -> bool {
        self.hash == entry.hash && self.size == entry.size
    }

    /// Add another target path with the same content.
    pub fn add_entry(&mut self, entry: ManifestEntry) -> SyncResult<()> {
        if !self.accepts(&entry) {
            return Err(SyncError::BundleMismatch {
                path: entry.path,
                hash: entry.hash,
                size: entry.size,
                bundle_hash: self.hash.clone(),
            });
        }
        self.entries.push(BundleEntry::new(entry));
        Ok(())
    }

    /// Confirmed-good bytes, counted once per target path.
    pub fn validated_progress(&self) -> u64 {
        self.size * self.entries.iter().filter(|e| e.validated).count() as u64
    }

    /// Bytes considered done, including downloads that await validation.
    pub fn progress(&self) -> u64 {
        self.entries
            .iter()
            .map(|e| {
                if e.validated || e.downloaded {
                    self.size
                } else {
                    e.download_progress().min(self.size)
                }
            })
            .sum()
    }

    /// Index of the first validated entry, the trusted local copy source.
    pub fn matching(&self) -> Option<usize> {
        self.entries.iter().position(|e| e.validated)
    }

    pub fn all_validated(&self) -> bool {
        self.entries.iter().all(|e| e.validated)
    }

    pub fn retries_remaining(&self) -> u32 {
        self.retries_remaining
    }

    pub fn original_retries(&self) -> u32 {
        self.original_retries
    }

    /// A download attempt has consumed part of the retry budget.
    pub fn has_retried(&self) -> bool {
        self.retries_remaining < self.original_retries
    }

    /// Attempts already charged against the budget.
    pub fn attempts_used(&self) -> u32 {
        self.original_retries - self.retries_remaining
    }

    /// Charge one attempt against the budget.
    ///
    /// Returns `false` when the budget is already spent, meaning the attempt
    /// may still run but must not be retried on failure.
    pub fn consume_retry(&mut self) -> bool {
        if self.retries_remaining == 0 {
            return false;
        }
        self.retries_remaining -= 1;
        true
    }

    fn set_retries(&mut self, retries: u32) {
        self.retries_remaining = retries;
        self.original_retries = retries;
    }

    /// Append a command letter to the audit trail.
    pub fn record(&mut self, action: char) {
        self.audit.push(action);
    }

    /// Sequence of commands run against this bundle, e.g. `"VDV"`.
    pub fn audit(&self) -> &str {
        &self.audit
    }

    /// Whether any download command has run for this bundle.
    pub fn download_attempted(&self) -> bool {
        self.audit.contains('D')
    }

    pub fn set_error(&mut self, message: impl Into<String>) {
        self.last_error = Some(message.into());
    }

    pub fn clear_error(&mut self) {
        self.last_error = None;
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }
}

/// Builds bundles from manifest entries during the prescan.
#[derive(Debug, Default)]
pub struct Bundler {
    bundles: Vec<Bundle>,
    index: HashMap<(String, u64), BundleId>,
}

impl Bundler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry, joining the bundle with the same `(hash, size)` if any.
    pub fn add_entry(&mut self, entry: ManifestEntry) -> SyncResult<BundleId> {
        let key = (entry.hash.clone(), entry.size);
        if let Some(&id) = self.index.get(&key) {
            self.bundles[id.0].add_entry(entry)?;
            return Ok(id);
        }
        let id = BundleId(self.bundles.len());
        self.bundles.push(Bundle::new(entry));
        self.index.insert(key, id);
        Ok(id)
    }

    /// Set the retry budget of every bundle. Call once, after all entries.
    pub fn set_retries(&mut self, retries: u32) {
        for bundle in &mut self.bundles {
            bundle.set_retries(retries);
        }
    }

    pub fn bundles(&self) -> &[Bundle] {
        &self.bundles
    }

    pub fn len(&self) -> usize {
        self.bundles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bundles.is_empty()
    }

    /// Freeze the bundle list for sharing with the worker pool.
    pub fn seal(self) -> BundleSet {
        BundleSet {
            bundles: self.bundles.into_iter().map(Mutex::new).collect(),
        }
    }
}

/// Arena of bundles shared by commands, which refer to bundles by [`BundleId`].
#[derive(Debug, Default)]
pub struct BundleSet {
    bundles: Vec<Mutex<Bundle>>,
}

impl BundleSet {
    pub fn lock(&self, id: BundleId) -> MutexGuard<'_, Bundle> {
        self.bundles[id.0].lock()
    }

    pub fn ids(&self) -> impl Iterator<Item = BundleId> {
        (0..self.bundles.len()).map(BundleId)
    }

    pub fn len(&self) -> usize {
        self.bundles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bundles.is_empty()
    }

    /// Sum of [`Bundle::validated_progress`] over all bundles.
    pub fn validated_progress(&self) -> u64 {
        self.bundles.iter().map(|b| b.lock().validated_progress()).sum()
    }

    /// Sum of [`Bundle::progress`] over all bundles.
    pub fn progress(&self) -> u64 {
        self.bundles.iter().map(|b| b.lock().progress()).sum()
    }

    /// Total bytes across every target path.
    pub fn total_size(&self) -> u64 {
        self.bundles
            .iter()
            .map(|b| {
                let b = b.lock();
                b.size() * b.entries().len() as u64
            })
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn entry(path: &str, hash: &str, size: u64) -> ManifestEntry {
        ManifestEntry::new(path, hash, size, path)
    }

    #[test]
    fn test_entries_with_same_content_share_bundle() {
        let mut bundler = Bundler::new();
        let a = bundler.add_entry(entry("a", "h1", 100)).unwrap();
        let b = bundler.add_entry(entry("b", "h1", 100)).unwrap();
        let c = bundler.add_entry(entry("c", "h2", 50)).unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(bundler.len(), 2);
        assert_eq!(bundler.bundles()[0].entries().len(), 2);
    }

    #[test]
    fn test_same_hash_different_size_splits() {
        let mut bundler = Bundler::new();
        bundler.add_entry(entry("a", "h1", 100)).unwrap();
        bundler.add_entry(entry("b", "h1", 99)).unwrap();
        assert_eq!(bundler.len(), 2);
    }

    #[test]
    fn test_add_mismatched_entry_is_error() {
        let mut bundle = Bundle::new(entry("a", "h1", 100));
        let result = bundle.add_entry(entry("b", "h2", 100));
        assert!(matches!(result, Err(SyncError::BundleMismatch { .. })));
        assert_eq!(bundle.entries().len(), 1);
    }

    #[test]
    fn test_set_retries_is_uniform() {
        let mut bundler = Bundler::new();
        bundler.add_entry(entry("a", "h1", 1)).unwrap();
        bundler.add_entry(entry("b", "h2", 1)).unwrap();
        bundler.set_retries(5);

        for bundle in bundler.bundles() {
            assert_eq!(bundle.retries_remaining(), 5);
            assert_eq!(bundle.original_retries(), 5);
            assert!(!bundle.has_retried());
        }
    }

    #[test]
    fn test_consume_retry_stops_at_zero() {
        let mut bundle = Bundle::new(entry("a", "h", 1));
        bundle.set_retries(2);

        assert!(bundle.consume_retry());
        assert!(bundle.consume_retry());
        assert!(!bundle.consume_retry());
        assert_eq!(bundle.retries_remaining(), 0);
        assert_eq!(bundle.attempts_used(), 2);
        assert!(bundle.has_retried());
    }

    #[test]
    fn test_progress_accounting() {
        let mut bundle = Bundle::new(entry("a", "h", 100));
        bundle.add_entry(entry("b", "h", 100)).unwrap();
        bundle.add_entry(entry("c", "h", 100)).unwrap();

        bundle.entries_mut()[0].validated = true;
        bundle.entries_mut()[1].downloaded = true;
        bundle.entries_mut()[2]
            .progress_handle()
            .store(40, Ordering::Relaxed);

        assert_eq!(bundle.validated_progress(), 100);
        assert_eq!(bundle.progress(), 240);
        assert_eq!(bundle.matching(), Some(0));
        assert!(!bundle.all_validated());
    }

    #[test]
    fn test_reset_download_clears_progress() {
        let mut bundle = Bundle::new(entry("a", "h", 100));
        let e = &mut bundle.entries_mut()[0];
        e.downloaded = true;
        e.progress_handle().store(100, Ordering::Relaxed);
        e.reset_download();
        assert_eq!(bundle.progress(), 0);
    }

    #[test]
    fn test_audit_trail() {
        let mut bundle = Bundle::new(entry("a", "h", 1));
        bundle.record('V');
        assert!(!bundle.download_attempted());
        bundle.record('D');
        bundle.record('V');
        assert_eq!(bundle.audit(), "VDV");
        assert!(bundle.download_attempted());
    }

    #[test]
    fn test_sealed_set_totals() {
        let mut bundler = Bundler::new();
        bundler.add_entry(entry("a", "h1", 100)).unwrap();
        bundler.add_entry(entry("b", "h1", 100)).unwrap();
        bundler.add_entry(entry("c", "h2", 50)).unwrap();
        let set = bundler.seal();

        assert_eq!(set.len(), 2);
        assert_eq!(set.total_size(), 250);
        assert_eq!(set.progress(), 0);

        set.lock(BundleId(1)).entries_mut()[0].validated = true;
        assert_eq!(set.validated_progress(), 50);
    }

    proptest! {
        #[test]
        fn prop_one_bundle_per_content(keys in proptest::collection::vec((0u8..4, 1u64..4), 0..40)) {
            let mut bundler = Bundler::new();
            for (i, (h, size)) in keys.iter().enumerate() {
                bundler
                    .add_entry(entry(&format!("f{}", i), &format!("h{}", h), *size))
                    .unwrap();
            }

            let mut expected: HashMap<(String, u64), usize> = HashMap::new();
            for (h, size) in &keys {
                *expected.entry((format!("h{}", h), *size)).or_default() += 1;
            }

            prop_assert_eq!(bundler.len(), expected.len());
            for bundle in bundler.bundles() {
                let key = (bundle.hash().to_string(), bundle.size());
                prop_assert_eq!(bundle.entries().len(), expected[&key]);
                for e in bundle.entries() {
                    prop_assert!(bundle.accepts(e.manifest()));
                }
            }
        }
    }
}
