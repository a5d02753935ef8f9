//! The two units of work that advance a bundle: validate and download.
//!
//! A command never enqueues work itself. It returns an [`Outcome`] naming at
//! most one follow-up command, which the worker enqueues before marking the
//! command complete. One follow-up per command keeps every bundle at one live
//! command at a time, so bundle state has a single writer.
//!
//! ```text
//! Validate ──(no local match)──► Download ──(ok)──► Validate (Highest)
//!    │                              │
//!    │ all entries valid            └──(failed, retries left)──► Download (Lowest)
//!    ▼
//!  done
//! ```

mod download;
mod policy;
mod validate;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

pub use download::DownloadCommand;
pub use policy::{
    CommandPriority, RetryBackoff, DEFAULT_BACKOFF_BASE_MS, DEFAULT_BACKOFF_STEP_MS,
    PRIORITY_LEVELS,
};
pub use validate::ValidateCommand;

use crate::bundle::{BundleId, BundleSet};
use crate::fileops::FileOps;

static COMMAND_COUNTER: AtomicU64 = AtomicU64::new(0);

fn next_command_id() -> CommandId {
    CommandId(COMMAND_COUNTER.fetch_add(1, Ordering::Relaxed))
}

/// Unique identity of a queued or running command.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommandId(pub u64);

/// Settings shared by every command in a run.
#[derive(Clone, Copy, Debug)]
pub struct CommandPolicy {
    pub backoff: RetryBackoff,
    /// When false, validation never schedules downloads (verify-only runs).
    pub allow_download: bool,
}

impl Default for CommandPolicy {
    fn default() -> Self {
        Self {
            backoff: RetryBackoff::default(),
            allow_download: true,
        }
    }
}

/// Everything a command may touch while executing.
pub struct CommandContext<'a> {
    pub bundles: &'a BundleSet,
    pub ops: &'a dyn FileOps,
    pub policy: &'a CommandPolicy,
}

/// Result of executing a command.
#[derive(Debug)]
pub struct Outcome {
    /// False only when cancellation was observed.
    pub proceed: bool,
    pub follow_up: Option<Command>,
}

impl Outcome {
    pub fn done() -> Self {
        Self {
            proceed: true,
            follow_up: None,
        }
    }

    pub fn then(command: Command) -> Self {
        Self {
            proceed: true,
            follow_up: Some(command),
        }
    }

    pub fn stop() -> Self {
        Self {
            proceed: false,
            follow_up: None,
        }
    }
}

/// Behaviour shared by the validate and download commands.
pub trait BundleCommand {
    /// Letter appended to the bundle's audit trail.
    const AUDIT: char;

    fn bundle(&self) -> BundleId;

    fn execute(&self, ctx: &CommandContext<'_>) -> Outcome;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandKind {
    Validate(ValidateCommand),
    Download(DownloadCommand),
}

/// A prioritized unit of work over exactly one bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    id: CommandId,
    priority: CommandPriority,
    kind: CommandKind,
}

impl Command {
    pub fn validate(bundle: BundleId, priority: CommandPriority) -> Self {
        Self {
            id: next_command_id(),
            priority,
            kind: CommandKind::Validate(ValidateCommand::new(bundle)),
        }
    }

    pub fn download(bundle: BundleId, priority: CommandPriority) -> Self {
        Self {
            id: next_command_id(),
            priority,
            kind: CommandKind::Download(DownloadCommand::new(bundle)),
        }
    }

    pub fn id(&self) -> CommandId {
        self.id
    }

    pub fn priority(&self) -> CommandPriority {
        self.priority
    }

    pub fn kind(&self) -> &CommandKind {
        &self.kind
    }

    pub fn bundle(&self) -> BundleId {
        match &self.kind {
            CommandKind::Validate(c) => c.bundle(),
            CommandKind::Download(c) => c.bundle(),
        }
    }

    pub fn is_download(&self) -> bool {
        matches!(self.kind, CommandKind::Download(_))
    }

    pub fn execute(&self, ctx: &CommandContext<'_>) -> Outcome {
        match &self.kind {
            CommandKind::Validate(c) => c.execute(ctx),
            CommandKind::Download(c) => c.execute(ctx),
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self.kind {
            CommandKind::Validate(_) => "validate",
            CommandKind::Download(_) => "download",
        };
        write!(f, "{} {} at {}", name, self.bundle(), self.priority)
    }
}

/// Sleep for `duration`, waking early if cancellation is requested.
///
/// Returns false if cancelled.
pub(crate) fn sleep_unless_cancelled(ops: &dyn FileOps, duration: Duration) -> bool {
    const SLICE: Duration = Duration::from_millis(100);
    let deadline = Instant::now() + duration;
    loop {
        if ops.cancel_requested() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep(SLICE.min(deadline - now));
    }
}
