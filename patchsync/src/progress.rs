//! Rate-limited, monotonic progress reporting.
//!
//! A dedicated reporter thread listens for queue completion notices and
//! recomputes aggregate progress from bundle state at most once per interval,
//! with a forced flush when the run finishes.
//!
//! Bundle progress credits a downloaded file before it is validated, so the
//! raw sum can drop when a download is rejected. Published counters are
//! clamped to never decrease; the raw values stay available on the bundles.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::bundle::BundleSet;
use crate::queue::CommandCompleted;

/// Default minimum time between published updates.
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

/// Aggregate progress of a synchronization run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressSnapshot {
    /// Confirmed-good bytes across all target paths.
    pub validated: u64,
    /// Bytes considered done, including downloads awaiting validation.
    pub transferred: u64,
    /// Total bytes across all target paths.
    pub total: u64,
    /// Commands completed so far.
    pub commands_completed: u64,
}

impl ProgressSnapshot {
    /// Validated fraction in `[0, 1]`.
    pub fn validated_fraction(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.validated as f64 / self.total as f64
        }
    }
}

/// Receives progress updates from the reporter thread.
pub trait ProgressMonitor: Send + Sync {
    fn on_progress(&self, snapshot: ProgressSnapshot);

    /// Called once after the final flush.
    fn on_finish(&self, _snapshot: ProgressSnapshot) {}
}

/// Clamps observed counters so published values never decrease.
#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicProgress {
    validated: u64,
    transferred: u64,
}

impl MonotonicProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold in a raw observation and return the values to publish.
    pub fn observe(&mut self, validated: u64, transferred: u64) -> (u64, u64) {
        self.validated = self.validated.max(validated);
        self.transferred = self.transferred.max(transferred).max(self.validated);
        (self.validated, self.transferred)
    }
}

/// Background reporter publishing [`ProgressSnapshot`]s to a monitor.
pub struct ProgressAggregator {
    handle: Option<JoinHandle<()>>,
    done: Arc<AtomicBool>,
    latest: Arc<Mutex<ProgressSnapshot>>,
}

impl ProgressAggregator {
    /// Start the reporter thread.
    ///
    /// `completions` should come from [`crate::queue::PriorityWorkQueue::subscribe`].
    pub fn start(
        bundles: Arc<BundleSet>,
        completions: Receiver<CommandCompleted>,
        monitor: Option<Arc<dyn ProgressMonitor>>,
        interval: Duration,
    ) -> Self {
        let done = Arc::new(AtomicBool::new(false));
        let latest = Arc::new(Mutex::new(ProgressSnapshot {
            total: bundles.total_size(),
            ..Default::default()
        }));

        let reporter = Reporter {
            bundles,
            completions,
            monitor,
            interval,
            done: Arc::clone(&done),
            latest: Arc::clone(&latest),
        };
        let handle = thread::spawn(move || reporter.run());

        Self {
            handle: Some(handle),
            done,
            latest,
        }
    }

    /// Most recently published snapshot.
    pub fn latest(&self) -> ProgressSnapshot {
        *self.latest.lock()
    }

    /// Flush a final update, stop the thread and return the last snapshot.
    pub fn finish(mut self) -> ProgressSnapshot {
        self.shutdown();
        self.latest()
    }

    fn shutdown(&mut self) {
        self.done.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("Progress reporter thread panicked");
            }
        }
    }
}

impl Drop for ProgressAggregator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Reporter {
    bundles: Arc<BundleSet>,
    completions: Receiver<CommandCompleted>,
    monitor: Option<Arc<dyn ProgressMonitor>>,
    interval: Duration,
    done: Arc<AtomicBool>,
    latest: Arc<Mutex<ProgressSnapshot>>,
}

impl Reporter {
    fn run(self) {
        let tick = self
            .interval
            .min(Duration::from_millis(100))
            .max(Duration::from_millis(1));
        let total = self.bundles.total_size();
        let mut counters = MonotonicProgress::new();
        let mut completed = 0u64;
        let mut last_publish: Option<Instant> = None;
        let mut published = ProgressSnapshot {
            total,
            ..Default::default()
        };

        loop {
            match self.completions.recv_timeout(tick) {
                Ok(_) => completed += 1,
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            if self.done.load(Ordering::SeqCst) {
                break;
            }

            let due = last_publish.map_or(true, |at| at.elapsed() >= self.interval);
            if !due {
                continue;
            }
            let (validated, transferred) = counters.observe(
                self.bundles.validated_progress(),
                self.bundles.progress(),
            );
            let snapshot = ProgressSnapshot {
                validated,
                transferred,
                total,
                commands_completed: completed,
            };
            last_publish = Some(Instant::now());
            if snapshot != published {
                published = snapshot;
                self.publish(snapshot);
            }
        }

        completed += self.completions.try_iter().count() as u64;
        let (validated, transferred) = counters.observe(
            self.bundles.validated_progress(),
            self.bundles.progress(),
        );
        let snapshot = ProgressSnapshot {
            validated,
            transferred,
            total,
            commands_completed: completed,
        };
        self.publish(snapshot);
        if let Some(monitor) = &self.monitor {
            monitor.on_finish(snapshot);
        }
        tracing::debug!(validated, transferred, total, "Progress reporter finished");
    }

    fn publish(&self, snapshot: ProgressSnapshot) {
        *self.latest.lock() = snapshot;
        if let Some(monitor) = &self.monitor {
            monitor.on_progress(snapshot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::{BundleId, Bundler};
    use crate::command::{Command, CommandPriority};
    use crate::manifest::ManifestEntry;
    use crate::queue::PriorityWorkQueue;
    use proptest::prelude::*;

    #[derive(Default)]
    struct RecordingMonitor {
        updates: Mutex<Vec<ProgressSnapshot>>,
        finished: Mutex<Option<ProgressSnapshot>>,
    }

    impl ProgressMonitor for RecordingMonitor {
        fn on_progress(&self, snapshot: ProgressSnapshot) {
            self.updates.lock().push(snapshot);
        }

        fn on_finish(&self, snapshot: ProgressSnapshot) {
            *self.finished.lock() = Some(snapshot);
        }
    }

    fn bundles() -> Arc<BundleSet> {
        let mut bundler = Bundler::new();
        bundler
            .add_entry(ManifestEntry::new("a", "h1", 100, "a"))
            .unwrap();
        bundler
            .add_entry(ManifestEntry::new("b", "h1", 100, "b"))
            .unwrap();
        bundler
            .add_entry(ManifestEntry::new("c", "h2", 50, "c"))
            .unwrap();
        Arc::new(bundler.seal())
    }

    #[test]
    fn test_monotonic_clamp() {
        let mut progress = MonotonicProgress::new();
        assert_eq!(progress.observe(0, 100), (0, 100));
        assert_eq!(progress.observe(0, 40), (0, 100));
        assert_eq!(progress.observe(150, 120), (150, 150));
    }

    #[test]
    fn test_final_flush_reflects_state() {
        let bundles = bundles();
        let queue = PriorityWorkQueue::new();
        let monitor = Arc::new(RecordingMonitor::default());
        let aggregator = ProgressAggregator::start(
            Arc::clone(&bundles),
            queue.subscribe(),
            Some(monitor.clone() as Arc<dyn ProgressMonitor>),
            Duration::from_secs(3600),
        );

        {
            let mut bundle = bundles.lock(BundleId(0));
            for entry in bundle.entries_mut() {
                entry.validated = true;
            }
        }
        queue.add_command(Command::validate(BundleId(0), CommandPriority::Low));
        let command = queue.next_command().unwrap();
        queue.complete(&command, true);

        let snapshot = aggregator.finish();

        assert_eq!(snapshot.total, 250);
        assert_eq!(snapshot.validated, 200);
        assert_eq!(snapshot.transferred, 200);
        assert_eq!(snapshot.commands_completed, 1);
        assert_eq!(*monitor.finished.lock(), Some(snapshot));
    }

    #[test]
    fn test_rate_limited_updates() {
        let bundles = bundles();
        let queue = PriorityWorkQueue::new();
        let monitor = Arc::new(RecordingMonitor::default());
        let aggregator = ProgressAggregator::start(
            Arc::clone(&bundles),
            queue.subscribe(),
            Some(monitor.clone() as Arc<dyn ProgressMonitor>),
            Duration::from_secs(3600),
        );

        for i in 0..50 {
            bundles.lock(BundleId(1)).entries_mut()[0]
                .progress_handle()
                .store(i, Ordering::Relaxed);
            queue.add_command(Command::validate(BundleId(1), CommandPriority::Low));
            let command = queue.next_command().unwrap();
            queue.complete(&command, true);
        }
        aggregator.finish();

        // One interval-gated update at most, plus the final flush.
        assert!(monitor.updates.lock().len() <= 2);
    }

    #[test]
    fn test_published_progress_never_regresses() {
        let bundles = bundles();
        let queue = PriorityWorkQueue::new();
        let monitor = Arc::new(RecordingMonitor::default());
        let aggregator = ProgressAggregator::start(
            Arc::clone(&bundles),
            queue.subscribe(),
            Some(monitor.clone() as Arc<dyn ProgressMonitor>),
            Duration::from_millis(1),
        );

        bundles.lock(BundleId(1)).entries_mut()[0].downloaded = true;
        thread::sleep(Duration::from_millis(200));
        bundles.lock(BundleId(1)).entries_mut()[0].reset_download();
        thread::sleep(Duration::from_millis(200));
        let snapshot = aggregator.finish();

        assert_eq!(snapshot.transferred, 50);
        let updates = monitor.updates.lock();
        for pair in updates.windows(2) {
            assert!(pair[0].transferred <= pair[1].transferred);
            assert!(pair[0].validated <= pair[1].validated);
        }
    }

    #[test]
    fn test_validated_fraction() {
        let snapshot = ProgressSnapshot {
            validated: 25,
            total: 100,
            ..Default::default()
        };
        assert!((snapshot.validated_fraction() - 0.25).abs() < f64::EPSILON);
        assert_eq!(ProgressSnapshot::default().validated_fraction(), 1.0);
    }

    proptest! {
        #[test]
        fn prop_published_counters_non_decreasing(
            observations in proptest::collection::vec((0u64..1000, 0u64..1000), 1..50)
        ) {
            let mut progress = MonotonicProgress::new();
            let mut previous = (0, 0);
            for (validated, transferred) in observations {
                let published = progress.observe(validated, transferred);
                prop_assert!(published.0 >= previous.0);
                prop_assert!(published.1 >= previous.1);
                prop_assert!(published.0 >= validated);
                prop_assert!(published.1 >= transferred);
                prop_assert!(published.1 >= published.0);
                previous = published;
            }
        }
    }
}
