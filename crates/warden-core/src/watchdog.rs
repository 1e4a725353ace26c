//! Per-job deadline enforcement.
//!
//! Every dispatched job gets a watchdog. It is never cancelled when the
//! job completes: it sleeps out its full timeout, then asks the sequencer
//! to expire the job. If the worker already reported, the sequencer says
//! so and the watchdog disarms without producing anything. Shutdown of the
//! supervisor cancels any watchdog still sleeping.
//!
//! ```text
//! Armed --timeout, job unresolved--> Fired
//! Armed --timeout, job resolved----> Disarmed
//! Armed --shutdown-----------------> Cancelled
//! ```

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::sequencer::{JobSequencer, Resolution};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogState {
    Fired,
    Disarmed,
    Cancelled,
}

/// How a watchdog ended.
#[derive(Debug, Clone)]
pub enum WatchdogOutcome {
    /// The deadline passed with the job unresolved; a timeout outcome was
    /// recorded.
    Fired(Resolution),
    /// The job was resolved before the deadline.
    Disarmed,
    /// Shutdown arrived before the deadline.
    Cancelled,
}

impl WatchdogOutcome {
    pub fn state(&self) -> WatchdogState {
        match self {
            WatchdogOutcome::Fired(_) => WatchdogState::Fired,
            WatchdogOutcome::Disarmed => WatchdogState::Disarmed,
            WatchdogOutcome::Cancelled => WatchdogState::Cancelled,
        }
    }
}

/// Deadline timer for one dispatched job.
#[derive(Debug, Clone)]
pub struct Watchdog {
    id: usize,
    timeout: Duration,
}

impl Watchdog {
    pub fn arm(id: usize, timeout: Duration) -> Self {
        Self { id, timeout }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Wait out the deadline, then expire the job if it is still open.
    pub async fn run(self, sequencer: &JobSequencer, cancel: CancellationToken) -> WatchdogOutcome {
        tokio::select! {
            _ = tokio::time::sleep(self.timeout) => {}
            _ = cancel.cancelled() => {
                tracing::debug!(test_id = self.id, "watchdog cancelled by shutdown");
                return WatchdogOutcome::Cancelled;
            }
        }

        match sequencer.expire(self.id).await {
            Some(resolution) => {
                tracing::warn!(
                    test_id = self.id,
                    timeout_ms = self.timeout.as_millis() as u64,
                    execution_ms = resolution.outcome.execution_time.as_millis() as u64,
                    "job exceeded its deadline"
                );
                WatchdogOutcome::Fired(resolution)
            }
            None => {
                tracing::debug!(test_id = self.id, "job resolved before deadline, watchdog disarmed");
                WatchdogOutcome::Disarmed
            }
        }
    }
}
