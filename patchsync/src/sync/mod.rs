//! Orchestration of one synchronization run.
//!
//! ```text
//! check install dir ─► stage marker ─► bundle manifest ─► seed Validate (Low)
//!                                                               │
//!        commit marker ◄─ summarize failures ◄─ flush progress ◄─ process
//! ```

mod summary;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub use summary::ErrorSummary;

use crate::bundle::{BundleSet, Bundler};
use crate::cancel::CancellationFlag;
use crate::command::{Command, CommandContext, CommandPolicy, CommandPriority};
use crate::config::{SyncConfig, VersionMarker};
use crate::error::{SyncError, SyncResult};
use crate::fileops::{LocalFileOps, SharedFileOps};
use crate::manifest::Manifest;
use crate::progress::{ProgressAggregator, ProgressMonitor, ProgressSnapshot};
use crate::queue::PriorityWorkQueue;
use crate::transfer::{HttpSource, RemoteSource, TransferManager};

/// Suffix of the version marker while the run is in progress.
pub const STAGED_SUFFIX: &str = "new";

const WRITE_PROBE: &str = ".patchsync-write-probe";

/// Outcome of a synchronization run.
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    pub bundles: usize,
    pub files: usize,
    pub validated_bundles: usize,
    pub downloads: u64,
    pub copies: u64,
    pub bytes_transferred: u64,
    pub cancelled: bool,
    pub elapsed: Duration,
    /// Final published progress.
    pub progress: ProgressSnapshot,
    /// `(content hash, audit trail)` per bundle, e.g. `("ab12..", "VDV")`.
    pub audit: Vec<(String, String)>,
}

impl SyncReport {
    pub fn is_complete(&self) -> bool {
        !self.cancelled && self.validated_bundles == self.bundles
    }
}

/// Reconciles an install directory against a manifest.
pub struct Synchronizer {
    config: SyncConfig,
    ops: SharedFileOps,
}

impl std::fmt::Debug for Synchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Synchronizer")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Synchronizer {
    pub fn new(config: SyncConfig, ops: SharedFileOps) -> Self {
        Self { config, ops }
    }

    /// Synchronizer over the local install dir, downloading from `source`.
    pub fn with_source(
        config: SyncConfig,
        source: Arc<dyn RemoteSource>,
        cancel: CancellationFlag,
    ) -> Self {
        let transfers = TransferManager::with_chunk_size(source, config.chunk_size);
        let ops = LocalFileOps::new(config.install_dir.clone(), transfers, cancel);
        Self::new(config, Arc::new(ops))
    }

    /// Synchronizer downloading over HTTP from `config.base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidConfig`] if the HTTP client cannot be built.
    pub fn over_http(config: SyncConfig, cancel: CancellationFlag) -> SyncResult<Self> {
        let base_url = config.base_url.clone().unwrap_or_default();
        let source = HttpSource::with_timeout(base_url, config.timeout)?;
        Ok(Self::with_source(config, Arc::new(source), cancel))
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Run to completion, cancellation, or failure.
    ///
    /// Returns [`SyncError::Cancelled`] if cancellation was observed and
    /// [`SyncError::Aggregate`] if any bundle ended unvalidated.
    pub fn run(
        &self,
        manifest: &Manifest,
        monitor: Option<Arc<dyn ProgressMonitor>>,
    ) -> SyncResult<SyncReport> {
        let started = Instant::now();
        self.check_install_dir()?;
        let staged = self.stage_version_marker()?;

        let bundles = Arc::new(self.build_bundles(manifest)?);
        tracing::info!(
            files = manifest.len(),
            bundles = bundles.len(),
            bytes = manifest.total_size(),
            verify_only = self.config.verify_only,
            "Starting synchronization"
        );

        let queue = PriorityWorkQueue::new();
        for id in bundles.ids() {
            queue.add_command(Command::validate(id, CommandPriority::Low));
        }

        let aggregator = ProgressAggregator::start(
            Arc::clone(&bundles),
            queue.subscribe(),
            monitor,
            self.config.progress_interval,
        );
        let policy = CommandPolicy {
            backoff: self.config.backoff,
            allow_download: !self.config.verify_only,
        };
        let ctx = CommandContext {
            bundles: &bundles,
            ops: self.ops.as_ref(),
            policy: &policy,
        };
        let stats = queue.process(self.config.worker_count, &ctx);
        queue.close_subscribers();
        let progress = aggregator.finish();

        // A cancel that arrives after the last command finished changes nothing.
        let cancelled = stats.stopped;
        let report = self.build_report(manifest, &bundles, progress, cancelled, started);

        if cancelled {
            tracing::warn!(
                executed = stats.executed,
                pending = queue.pending(),
                "Synchronization cancelled"
            );
            self.discard_staged(staged.as_deref());
            return Err(SyncError::Cancelled);
        }

        let summary = collect_failures(&bundles);
        if !summary.is_empty() {
            self.discard_staged(staged.as_deref());
            let failures = summary.total();
            tracing::error!(
                failures,
                validated = report.validated_bundles,
                bundles = report.bundles,
                "Synchronization failed"
            );
            return Err(SyncError::Aggregate {
                message: summary.render(self.config.error_budget),
                failures,
            });
        }

        if let Some(staged) = staged {
            self.commit_version_marker(&staged)?;
        }
        tracing::info!(
            bundles = report.bundles,
            downloads = report.downloads,
            copies = report.copies,
            bytes = report.bytes_transferred,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Synchronization complete"
        );
        Ok(report)
    }

    /// Create the install root and prove it is writable.
    fn check_install_dir(&self) -> SyncResult<()> {
        let dir = &self.config.install_dir;
        fs::create_dir_all(dir).map_err(|e| SyncError::CreateDirFailed {
            path: dir.clone(),
            source: e,
        })?;

        let probe = dir.join(WRITE_PROBE);
        fs::write(&probe, b"").map_err(|e| SyncError::WriteFailed {
            path: probe.clone(),
            source: e,
        })?;
        if let Err(e) = fs::remove_file(&probe) {
            tracing::warn!(path = %probe.display(), error = %e, "Failed to remove write probe");
        }
        Ok(())
    }

    fn marker_paths(&self, marker: &VersionMarker) -> (PathBuf, PathBuf) {
        let target = self.config.install_dir.join(&marker.file_name);
        let mut staged = target.clone().into_os_string();
        staged.push(".");
        staged.push(STAGED_SUFFIX);
        (target, PathBuf::from(staged))
    }

    /// Write the version marker under its staging name.
    fn stage_version_marker(&self) -> SyncResult<Option<PathBuf>> {
        let Some(marker) = &self.config.version_marker else {
            return Ok(None);
        };
        marker.validate()?;
        let (_, staged) = self.marker_paths(marker);
        if let Some(parent) = staged.parent() {
            fs::create_dir_all(parent).map_err(|e| SyncError::CreateDirFailed {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        fs::write(&staged, marker.contents.as_bytes()).map_err(|e| SyncError::WriteFailed {
            path: staged.clone(),
            source: e,
        })?;
        tracing::debug!(path = %staged.display(), "Staged version marker");
        Ok(Some(staged))
    }

    fn commit_version_marker(&self, staged: &Path) -> SyncResult<()> {
        let Some(marker) = &self.config.version_marker else {
            return Ok(());
        };
        let (target, _) = self.marker_paths(marker);
        fs::rename(staged, &target).map_err(|e| SyncError::WriteFailed {
            path: target.clone(),
            source: e,
        })?;
        tracing::debug!(path = %target.display(), "Committed version marker");
        Ok(())
    }

    fn discard_staged(&self, staged: Option<&Path>) {
        let Some(staged) = staged else {
            return;
        };
        if let Err(e) = fs::remove_file(staged) {
            tracing::warn!(path = %staged.display(), error = %e, "Failed to remove staged marker");
        }
    }

    fn build_bundles(&self, manifest: &Manifest) -> SyncResult<BundleSet> {
        let mut bundler = Bundler::new();
        for entry in &manifest.entries {
            bundler.add_entry(entry.clone())?;
        }
        bundler.set_retries(self.config.retries);
        Ok(bundler.seal())
    }

    fn build_report(
        &self,
        manifest: &Manifest,
        bundles: &BundleSet,
        progress: ProgressSnapshot,
        cancelled: bool,
        started: Instant,
    ) -> SyncReport {
        let stats = self.ops.stats();
        let mut validated_bundles = 0;
        let mut audit = Vec::with_capacity(bundles.len());
        for id in bundles.ids() {
            let bundle = bundles.lock(id);
            if bundle.validated {
                validated_bundles += 1;
            }
            audit.push((bundle.hash().to_string(), bundle.audit().to_string()));
        }

        SyncReport {
            bundles: bundles.len(),
            files: manifest.len(),
            validated_bundles,
            downloads: stats.downloads,
            copies: stats.copies,
            bytes_transferred: stats.bytes_transferred,
            cancelled,
            elapsed: started.elapsed(),
            progress,
            audit,
        }
    }
}

/// One message per bundle that did not end validated.
fn collect_failures(bundles: &BundleSet) -> ErrorSummary {
    let mut summary = ErrorSummary::new();
    for id in bundles.ids() {
        let bundle = bundles.lock(id);
        if bundle.validated {
            continue;
        }
        match bundle.last_error() {
            Some(message) => summary.add(message),
            None => summary.add(format!(
                "{}: not synchronized",
                bundle.entries()[0].path()
            )),
        }
    }
    summary
}
