//! Cooperative cancellation shared between the caller and the worker pool.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A shared, polled cancellation flag.
///
/// Commands check it between entries and transfers check it between chunks.
/// Nothing is interrupted preemptively.
#[derive(Clone, Debug, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
