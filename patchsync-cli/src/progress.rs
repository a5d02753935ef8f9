//! Terminal progress bar for synchronization runs.

use indicatif::{HumanBytes, ProgressBar, ProgressStyle};
use patchsync::{ProgressMonitor, ProgressSnapshot};

const TEMPLATE: &str =
    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}";

/// Renders validated bytes as the bar position and transferred bytes as the
/// message.
pub struct BarMonitor {
    bar: ProgressBar,
}

impl BarMonitor {
    pub fn new(total: u64) -> Self {
        let style = ProgressStyle::with_template(TEMPLATE)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-");
        let bar = ProgressBar::new(total);
        bar.set_style(style);
        Self { bar }
    }

    /// Bar that draws nowhere, for `--quiet` runs.
    pub fn hidden() -> Self {
        Self {
            bar: ProgressBar::hidden(),
        }
    }
}

impl ProgressMonitor for BarMonitor {
    fn on_progress(&self, snapshot: ProgressSnapshot) {
        self.bar.set_length(snapshot.total);
        self.bar.set_position(snapshot.validated);
        self.bar
            .set_message(format!("{} processed", HumanBytes(snapshot.transferred)));
    }

    fn on_finish(&self, snapshot: ProgressSnapshot) {
        self.bar.set_position(snapshot.validated);
        self.bar.finish_with_message(format!(
            "{} verified",
            HumanBytes(snapshot.validated)
        ));
    }
}
