//! Download of one bundle's content into its first entry.

use std::sync::atomic::Ordering;

use crate::bundle::{BundleId, DownloadStatus};
use crate::error::SyncError;
use crate::fileops::SyncEvent;

use super::{
    sleep_unless_cancelled, BundleCommand, Command, CommandContext, CommandPriority, Outcome,
};

/// Fetch a bundle's content once, into the path of its first entry.
///
/// A successful download is followed by a `Highest` priority validation,
/// which also fans the bytes out to the bundle's other paths. A failed one is
/// retried at `Lowest` priority after a backoff while the budget allows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadCommand {
    bundle: BundleId,
}

impl DownloadCommand {
    pub fn new(bundle: BundleId) -> Self {
        Self { bundle }
    }

    fn fail(&self, ctx: &CommandContext<'_>, message: String) -> Outcome {
        ctx.ops.set_error(&message);
        let mut bundle = ctx.bundles.lock(self.bundle);
        bundle.last_download_status = Some(DownloadStatus::Failed(message.clone()));
        bundle.set_error(message);
        Outcome::done()
    }
}

impl BundleCommand for DownloadCommand {
    const AUDIT: char = 'D';

    fn bundle(&self) -> BundleId {
        self.bundle
    }

    fn execute(&self, ctx: &CommandContext<'_>) -> Outcome {
        let (entry, progress) = {
            let mut bundle = ctx.bundles.lock(self.bundle);
            bundle.record(Self::AUDIT);
            let first = &bundle.entries()[0];
            (first.manifest().clone(), first.progress_handle())
        };
        let target = ctx.ops.local_path(&entry);

        match ctx.ops.free_space(&target) {
            Ok(available) if available < entry.size => {
                ctx.ops.log(SyncEvent::InsufficientSpace {
                    path: target.clone(),
                    required: entry.size,
                    available,
                });
                let error = SyncError::InsufficientSpace {
                    path: target,
                    required: entry.size,
                    available,
                };
                return self.fail(ctx, error.to_string());
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(
                    path = %target.display(),
                    error = %e,
                    "Could not determine free space, downloading anyway"
                );
            }
        }

        let may_retry = {
            let mut bundle = ctx.bundles.lock(self.bundle);
            bundle.last_download_status = None;
            bundle.consume_retry()
        };

        if ctx.ops.cancel_requested() {
            return Outcome::stop();
        }

        let size = entry.size;
        let result = ctx.ops.download_file(&entry, &|received| {
            progress.store(received.min(size), Ordering::Relaxed);
        });

        let error = match result {
            Ok(()) => {
                let mut bundle = ctx.bundles.lock(self.bundle);
                bundle.entries_mut()[0].downloaded = true;
                bundle.last_download_status = Some(DownloadStatus::Succeeded);
                drop(bundle);
                tracing::debug!(bundle = %self.bundle, path = %entry.path, "Download finished");
                return Outcome::then(Command::validate(self.bundle, CommandPriority::Highest));
            }
            Err(SyncError::Cancelled) => {
                ctx.bundles.lock(self.bundle).entries_mut()[0].reset_download();
                return Outcome::stop();
            }
            Err(e) => e,
        };

        let (retries_remaining, attempts_used, attempts) = {
            let mut bundle = ctx.bundles.lock(self.bundle);
            bundle.entries_mut()[0].reset_download();
            bundle.last_download_status = Some(DownloadStatus::Failed(error.to_string()));
            let attempts = bundle.audit().matches(Self::AUDIT).count();
            (bundle.retries_remaining(), bundle.attempts_used(), attempts)
        };
        ctx.ops.log(SyncEvent::DownloadAttemptFailed {
            path: entry.path.clone(),
            error: error.to_string(),
            retries_remaining,
        });

        if !(may_retry && error.is_retryable()) {
            return self.fail(
                ctx,
                format!(
                    "{}: download failed after {} attempt(s): {}",
                    entry.path, attempts, error
                ),
            );
        }

        let delay = ctx.policy.backoff.delay_for(attempts_used);
        tracing::info!(
            path = %entry.path,
            delay_ms = delay.as_millis() as u64,
            retries_remaining,
            "Retrying download"
        );
        if !sleep_unless_cancelled(ctx.ops, delay) {
            return Outcome::stop();
        }
        Outcome::then(Command::download(self.bundle, CommandPriority::Lowest))
    }
}
