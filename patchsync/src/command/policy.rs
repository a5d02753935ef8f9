//! Scheduling priority and retry backoff for commands.
//!
//! # Priority Levels
//!
//! | Level     | Used for                                           |
//! |-----------|----------------------------------------------------|
//! | `Highest` | validating bytes that were just downloaded          |
//! | `High`    | first download of a bundle                          |
//! | `Normal`  | re-download after a downloaded file failed to verify |
//! | `Low`     | initial validation seeded from the manifest         |
//! | `Lowest`  | scheduled download retries                          |
//!
//! Lower levels are starved while higher ones have work. Fresh work taking
//! precedence over retries is intended.

use std::time::Duration;

/// Default base delay before a download retry (5 seconds).
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 5000;

/// Default extra delay per attempt already used (2.5 seconds).
pub const DEFAULT_BACKOFF_STEP_MS: u64 = 2500;

/// Number of priority levels in the work queue.
pub const PRIORITY_LEVELS: usize = 5;

/// Command scheduling priority. `Highest` runs first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum CommandPriority {
    Highest = 0,
    High = 1,
    Normal = 2,
    #[default]
    Low = 3,
    Lowest = 4,
}

impl CommandPriority {
    /// All levels, highest first.
    pub const ALL: [CommandPriority; PRIORITY_LEVELS] = [
        Self::Highest,
        Self::High,
        Self::Normal,
        Self::Low,
        Self::Lowest,
    ];

    /// Sub-queue index, 0 for `Highest`.
    pub fn index(self) -> usize {
        self as usize
    }
}

impl std::fmt::Display for CommandPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Highest => "Highest",
            Self::High => "High",
            Self::Normal => "Normal",
            Self::Low => "Low",
            Self::Lowest => "Lowest",
        };
        write!(f, "{}({})", name, self.index())
    }
}

/// Linear backoff between download attempts: `base + step * attempts_used`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryBackoff {
    pub base: Duration,
    pub step: Duration,
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(DEFAULT_BACKOFF_BASE_MS),
            step: Duration::from_millis(DEFAULT_BACKOFF_STEP_MS),
        }
    }
}

impl RetryBackoff {
    pub fn new(base: Duration, step: Duration) -> Self {
        Self { base, step }
    }

    /// No delay at all, for tests and offline sources.
    pub fn none() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }

    /// Delay before the next attempt, given attempts already charged.
    pub fn delay_for(&self, attempts_used: u32) -> Duration {
        self.base + self.step * attempts_used
    }
}
