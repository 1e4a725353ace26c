//! The "current test" slot shared between dispatch and log tagging.
//!
//! Dispatch publishes the id of each job it hands out; the log batching
//! loop reads whatever value is present when it drains a line. Neither
//! side ever waits on the other. Lines queued before a publish but drained
//! after it are tagged with the newer id; tagging is best-effort.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

const UNSET: usize = usize::MAX;

/// Cheaply cloneable handle to the slot.
#[derive(Debug, Clone)]
pub struct CurrentTest {
    slot: Arc<AtomicUsize>,
}

impl CurrentTest {
    pub fn new() -> Self {
        Self {
            slot: Arc::new(AtomicUsize::new(UNSET)),
        }
    }

    /// Record `id` as the most recently dispatched job.
    pub fn publish(&self, id: usize) {
        self.slot.store(id, Ordering::Release);
    }

    /// The most recently dispatched job, if any.
    pub fn get(&self) -> Option<usize> {
        match self.slot.load(Ordering::Acquire) {
            UNSET => None,
            id => Some(id),
        }
    }
}

impl Default for CurrentTest {
    fn default() -> Self {
        Self::new()
    }
}
