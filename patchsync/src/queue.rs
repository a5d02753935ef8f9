//! Five-level priority work queue and the worker pool that drains it.
//!
//! Commands are ordered by priority level (`Highest` first), then by enqueue
//! order (FIFO within a level). A continuous stream of high-priority work
//! starves lower levels; scheduled retries wait behind fresh work.
//!
//! # Completion
//!
//! The queue is complete only when every level is empty *and* no command is
//! running. A running command may still produce a follow-up, so an empty
//! queue alone never ends the run. Workers block on a condition variable
//! rather than polling.
//!
//! ```text
//! worker:  next_command ──► execute ──► add_command(follow_up) ──► complete
//!                ▲                                                    │
//!                └────────────────────────────────────────────────────┘
//! ```

use std::collections::{HashSet, VecDeque};
use std::sync::mpsc;
use std::thread;

use parking_lot::{Condvar, Mutex};

use crate::bundle::BundleId;
use crate::command::{Command, CommandContext, CommandId, PRIORITY_LEVELS};

// =============================================================================
// Completion Notifications
// =============================================================================

/// Sent to every subscriber after a command's side effects are visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandCompleted {
    pub id: CommandId,
    pub bundle: BundleId,
    /// False when the command observed cancellation.
    pub proceed: bool,
}

/// Counters returned by [`PriorityWorkQueue::process`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessStats {
    pub executed: usize,
    /// A command observed cancellation or a worker panicked, so workers stopped
    /// taking commands.
    pub stopped: bool,
}

// =============================================================================
// Priority Work Queue
// =============================================================================

#[derive(Debug, Default)]
struct QueueState {
    levels: [VecDeque<Command>; PRIORITY_LEVELS],
    running: HashSet<CommandId>,
    stopped: bool,
}

impl QueueState {
    fn pending(&self) -> usize {
        self.levels.iter().map(VecDeque::len).sum()
    }

    fn is_complete(&self) -> bool {
        self.running.is_empty() && self.levels.iter().all(VecDeque::is_empty)
    }

    fn pop(&mut self) -> Option<Command> {
        let command = self.levels.iter_mut().find_map(VecDeque::pop_front)?;
        self.running.insert(command.id());
        Some(command)
    }
}

/// Thread-safe priority queue of commands plus the running set.
#[derive(Debug, Default)]
pub struct PriorityWorkQueue {
    state: Mutex<QueueState>,
    changed: Condvar,
    subscribers: Mutex<Vec<mpsc::Sender<CommandCompleted>>>,
}

impl PriorityWorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue at the command's priority level.
    pub fn add_command(&self, command: Command) {
        let mut state = self.state.lock();
        state.levels[command.priority().index()].push_back(command);
        drop(state);
        self.changed.notify_one();
    }

    /// Dequeue the head of the highest non-empty level without blocking.
    ///
    /// The command joins the running set in the same critical section.
    pub fn next_command(&self) -> Option<Command> {
        let mut state = self.state.lock();
        if state.stopped {
            return None;
        }
        state.pop()
    }

    /// Dequeue the next command, blocking while others are still running.
    ///
    /// Returns `None` once the queue is complete or stopped.
    pub fn wait_command(&self) -> Option<Command> {
        let mut state = self.state.lock();
        loop {
            if state.stopped {
                return None;
            }
            if let Some(command) = state.pop() {
                return Some(command);
            }
            if state.running.is_empty() {
                return None;
            }
            self.changed.wait(&mut state);
        }
    }

    /// Remove a finished command from the running set and notify subscribers.
    ///
    /// Call only after any follow-up command has been added.
    pub fn complete(&self, command: &Command, proceed: bool) {
        let complete = {
            let mut state = self.state.lock();
            state.running.remove(&command.id());
            state.is_complete()
        };
        if complete {
            self.changed.notify_all();
        }

        let notice = CommandCompleted {
            id: command.id(),
            bundle: command.bundle(),
            proceed,
        };
        self.subscribers
            .lock()
            .retain(|tx| tx.send(notice).is_ok());
    }

    /// Both every level and the running set are empty.
    pub fn is_complete(&self) -> bool {
        self.state.lock().is_complete()
    }

    /// Commands waiting in any level.
    pub fn pending(&self) -> usize {
        self.state.lock().pending()
    }

    /// Commands currently executing.
    pub fn running(&self) -> usize {
        self.state.lock().running.len()
    }

    /// Receive a [`CommandCompleted`] for every command completed from now on.
    pub fn subscribe(&self) -> mpsc::Receiver<CommandCompleted> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Drop all subscriber senders so their receivers disconnect.
    pub fn close_subscribers(&self) {
        self.subscribers.lock().clear();
    }

    /// Make workers stop taking new commands. Running commands finish.
    pub fn stop(&self) {
        self.state.lock().stopped = true;
        self.changed.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }

    /// Drain the queue with `worker_count` threads.
    ///
    /// Returns once the queue is complete or a command observed cancellation
    /// and every worker has exited.
    pub fn process(&self, worker_count: usize, ctx: &CommandContext<'_>) -> ProcessStats {
        let worker_count = worker_count.max(1);
        tracing::debug!(
            workers = worker_count,
            pending = self.pending(),
            "Starting worker pool"
        );

        let executed = thread::scope(|scope| {
            let handles: Vec<_> = (0..worker_count)
                .map(|index| scope.spawn(move || self.worker_loop(index, ctx)))
                .collect();

            handles
                .into_iter()
                .map(|handle| match handle.join() {
                    Ok(count) => count,
                    Err(_) => {
                        tracing::error!("Worker thread panicked");
                        0
                    }
                })
                .sum::<usize>()
        });

        let stats = ProcessStats {
            executed,
            stopped: self.is_stopped(),
        };
        tracing::debug!(
            executed = stats.executed,
            stopped = stats.stopped,
            "Worker pool finished"
        );
        stats
    }

    fn worker_loop(&self, index: usize, ctx: &CommandContext<'_>) -> usize {
        let _guard = StopOnPanic(self);
        let mut executed = 0;

        while let Some(command) = self.wait_command() {
            tracing::trace!(worker = index, command = %command, "Executing");
            let outcome = command.execute(ctx);
            if let Some(next) = outcome.follow_up {
                self.add_command(next);
            }
            self.complete(&command, outcome.proceed);
            executed += 1;

            if !outcome.proceed {
                tracing::info!(worker = index, "Cancellation observed, stopping workers");
                self.stop();
                break;
            }
        }
        executed
    }
}

/// Stops the queue if a worker unwinds, so the others do not wait forever on
/// a command that will never complete.
struct StopOnPanic<'a>(&'a PriorityWorkQueue);

impl Drop for StopOnPanic<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            self.0.stop();
        }
    }
}
