//! Validation and local repair of one bundle.

use crate::bundle::BundleId;
use crate::fileops::SyncEvent;
use crate::manifest::ManifestEntry;

use super::{BundleCommand, Command, CommandContext, CommandPriority, Outcome};

/// Check every entry of a bundle and repair invalid ones from a valid copy.
///
/// When no entry validates, a download is scheduled. A bundle whose download
/// already ran and whose retry budget is spent fails instead, so a source
/// that keeps serving bad bytes cannot loop forever.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidateCommand {
    bundle: BundleId,
}

impl ValidateCommand {
    pub fn new(bundle: BundleId) -> Self {
        Self { bundle }
    }
}

impl BundleCommand for ValidateCommand {
    const AUDIT: char = 'V';

    fn bundle(&self) -> BundleId {
        self.bundle
    }

    fn execute(&self, ctx: &CommandContext<'_>) -> Outcome {
        // Snapshot under the lock; hashing runs without it so progress reads
        // are never blocked behind disk I/O.
        let (entries, download_attempted, retries_remaining) = {
            let mut bundle = ctx.bundles.lock(self.bundle);
            bundle.record(Self::AUDIT);
            let entries: Vec<ManifestEntry> =
                bundle.entries().iter().map(|e| e.manifest().clone()).collect();
            (
                entries,
                bundle.download_attempted(),
                bundle.retries_remaining(),
            )
        };

        let mut valid = Vec::with_capacity(entries.len());
        for entry in &entries {
            if ctx.ops.cancel_requested() {
                return Outcome::stop();
            }
            valid.push(ctx.ops.validate_file(entry));
        }
        // A hash abandoned mid-file reads as invalid; do not act on it.
        if ctx.ops.cancel_requested() {
            return Outcome::stop();
        }

        let matching = valid.iter().position(|v| *v);
        let mut repair_error = None;

        if let Some(source_index) = matching {
            let source = ctx.ops.local_path(&entries[source_index]);
            for (i, entry) in entries.iter().enumerate() {
                if valid[i] {
                    continue;
                }
                if ctx.ops.cancel_requested() {
                    self.store(ctx, &valid);
                    return Outcome::stop();
                }
                let target = ctx.ops.local_path(entry);
                let copied = ctx
                    .ops
                    .remove_file(&target)
                    .and_then(|_| ctx.ops.copy_file(&source, &target));
                match copied {
                    Ok(()) if ctx.ops.validate_file(entry) => {
                        tracing::debug!(
                            path = %entry.path,
                            source = %source.display(),
                            "Repaired from local copy"
                        );
                        valid[i] = true;
                    }
                    Ok(()) => {
                        repair_error = Some(format!(
                            "{}: copy from {} failed validation",
                            entry.path,
                            source.display()
                        ));
                    }
                    Err(e) => {
                        repair_error = Some(format!(
                            "{}: copy from {} failed: {}",
                            entry.path,
                            source.display(),
                            e
                        ));
                    }
                }
            }
        }

        let all_valid = self.store(ctx, &valid);

        if let Some(message) = repair_error {
            ctx.ops.set_error(&message);
            ctx.bundles.lock(self.bundle).set_error(message);
            return Outcome::done();
        }

        if matching.is_some() {
            if all_valid {
                ctx.bundles.lock(self.bundle).clear_error();
            }
            return Outcome::done();
        }

        let first = &entries[0].path;
        if !ctx.policy.allow_download {
            let message = format!("{}: missing or corrupt, needs download", first);
            ctx.ops.set_error(&message);
            ctx.bundles.lock(self.bundle).set_error(message);
            return Outcome::done();
        }

        if !download_attempted {
            return Outcome::then(Command::download(self.bundle, CommandPriority::High));
        }

        ctx.ops.log(SyncEvent::ValidationFailedAfterDownload {
            path: first.clone(),
            retries_remaining,
        });
        if retries_remaining == 0 {
            let message = format!(
                "{}: downloaded file failed validation, retries exhausted",
                first
            );
            ctx.ops.set_error(&message);
            ctx.bundles.lock(self.bundle).set_error(message);
            return Outcome::done();
        }
        Outcome::then(Command::download(self.bundle, CommandPriority::Normal))
    }
}

impl ValidateCommand {
    /// Write validation results back to the bundle; returns whether all passed.
    fn store(&self, ctx: &CommandContext<'_>, valid: &[bool]) -> bool {
        let mut bundle = ctx.bundles.lock(self.bundle);
        for (entry, ok) in bundle.entries_mut().iter_mut().zip(valid) {
            entry.validated = *ok;
            if !*ok && entry.downloaded {
                entry.reset_download();
            }
        }
        let all = bundle.all_validated();
        bundle.validated = all;
        all
    }
}
