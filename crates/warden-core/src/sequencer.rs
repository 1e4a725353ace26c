//! Job sequencer: hands out catalog entries in order and records exactly
//! one outcome per entry.
//!
//! The cursor, per-job `started_at`/`completed` bookkeeping and the result
//! log all live behind a single mutex. Both the worker's `done` path and
//! the watchdog's expiry path check and set `completed` under that lock,
//! so whichever arrives first produces the outcome and the other becomes a
//! no-op. The lock is never held across I/O.

use std::time::Duration;

use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::catalog::Catalog;
use crate::results::{Outcome, ResultLog, Verdict};

/// Errors returned by [`JobSequencer::take`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TakeError {
    #[error("job {id} is still in flight")]
    JobInFlight { id: usize },

    #[error("test catalog exhausted")]
    ExhaustedCatalog,
}

/// Errors returned by [`JobSequencer::resolve`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DoneError {
    #[error("no job with id {0}")]
    UnknownJob(usize),

    #[error("job {0} has not been dispatched")]
    NotDispatched(usize),
}

/// What the worker receives for a dispatched job.
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatch {
    pub id: usize,
    pub name: String,
    pub input: Value,
    pub timeout: Duration,
}

/// The effect of recording an outcome.
#[derive(Debug, Clone)]
pub struct Resolution {
    /// The outcome that was appended.
    pub outcome: Outcome,
    /// Every outcome recorded so far, including this one.
    pub snapshot: Vec<Outcome>,
    /// Set on the resolution that completed the run, exactly once.
    pub final_snapshot: Option<Vec<Outcome>>,
}

/// Result of a `done` call.
#[derive(Debug, Clone)]
pub enum DoneAck {
    Recorded(Resolution),
    /// The job was already resolved; nothing was appended.
    Duplicate,
}

#[derive(Debug, Default)]
struct JobState {
    started_at: Option<Instant>,
    completed: bool,
}

#[derive(Debug)]
struct SequencerState {
    cursor: usize,
    jobs: Vec<JobState>,
    results: ResultLog,
    final_claimed: bool,
}

/// Owns the catalog and the guarded run state.
#[derive(Debug)]
pub struct JobSequencer {
    catalog: Catalog,
    state: Mutex<SequencerState>,
}

impl JobSequencer {
    pub fn new(catalog: Catalog) -> Self {
        let jobs = catalog.iter().map(|_| JobState::default()).collect();
        Self {
            catalog,
            state: Mutex::new(SequencerState {
                cursor: 0,
                jobs,
                results: ResultLog::new(),
                final_claimed: false,
            }),
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Dispatch the next job in catalog order.
    ///
    /// Refuses while the previously dispatched job is unresolved, so at
    /// most one job is in flight.
    pub async fn take(&self) -> Result<Dispatch, TakeError> {
        let mut state = self.state.lock().await;

        if let Some(prev) = state.cursor.checked_sub(1) {
            if !state.jobs[prev].completed {
                return Err(TakeError::JobInFlight { id: prev });
            }
        }

        let id = state.cursor;
        let Some(case) = self.catalog.get(id) else {
            return Err(TakeError::ExhaustedCatalog);
        };

        state.cursor += 1;
        state.jobs[id].started_at = Some(Instant::now());

        Ok(Dispatch {
            id,
            name: case.name.clone(),
            input: case.input.clone(),
            timeout: case.timeout,
        })
    }

    /// Record the worker's verdict for job `id`.
    pub async fn resolve(&self, id: usize, verdict: Verdict) -> Result<DoneAck, DoneError> {
        let mut state = self.state.lock().await;

        let job = state.jobs.get(id).ok_or(DoneError::UnknownJob(id))?;
        if job.started_at.is_none() {
            return Err(DoneError::NotDispatched(id));
        }
        if job.completed {
            return Ok(DoneAck::Duplicate);
        }

        Ok(self
            .record(&mut state, id, verdict)
            .map_or(DoneAck::Duplicate, DoneAck::Recorded))
    }

    /// Record a timeout for job `id` unless it was already resolved.
    ///
    /// Returns `None` when the job completed first.
    pub async fn expire(&self, id: usize) -> Option<Resolution> {
        let mut state = self.state.lock().await;
        let job = state.jobs.get(id)?;
        if job.completed || job.started_at.is_none() {
            return None;
        }
        self.record(&mut state, id, Verdict::timed_out())
    }

    /// Close the run early and return the outcomes recorded so far.
    ///
    /// Returns `None` if the run was already closed, either by the
    /// resolution that completed it or by an earlier abort. Later
    /// resolutions are still recorded but never carry a final snapshot.
    pub async fn claim_abort(&self) -> Option<Vec<Outcome>> {
        let mut state = self.state.lock().await;
        if state.final_claimed {
            return None;
        }
        state.final_claimed = true;
        Some(state.results.snapshot())
    }

    /// Every outcome recorded so far.
    pub async fn snapshot(&self) -> Vec<Outcome> {
        self.state.lock().await.results.snapshot()
    }

    /// Whether every catalog entry has an outcome.
    pub async fn is_complete(&self) -> bool {
        self.state.lock().await.results.len() == self.catalog.len()
    }

    fn record(&self, state: &mut SequencerState, id: usize, verdict: Verdict) -> Option<Resolution> {
        let case = self.catalog.get(id)?;
        let job = &mut state.jobs[id];
        let execution_time = job.started_at.map(|s| s.elapsed()).unwrap_or_default();
        job.completed = true;

        let outcome = Outcome {
            id,
            name: case.name.clone(),
            verdict,
            execution_time,
        };
        if !state.results.append(outcome.clone()) {
            return None;
        }

        let final_snapshot = Self::claim_final_locked(state, self.catalog.len());
        Some(Resolution {
            outcome,
            snapshot: state.results.snapshot(),
            final_snapshot,
        })
    }

    fn claim_final_locked(state: &mut SequencerState, total: usize) -> Option<Vec<Outcome>> {
        if state.final_claimed || state.results.len() < total {
            return None;
        }
        state.final_claimed = true;
        Some(state.results.snapshot())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::TestCase;

    fn catalog(n: usize) -> Catalog {
        Catalog::new(
            (0..n)
                .map(|i| TestCase {
                    id: i,
                    name: format!("Test {}", i + 1),
                    input: Value::from(i),
                    timeout: Duration::from_secs(2),
                })
                .collect(),
        )
    }

    #[tokio::test]
    async fn take_dispatches_in_order() {
        let seq = JobSequencer::new(catalog(2));

        let first = seq.take().await.unwrap();
        assert_eq!(first.id, 0);
        assert_eq!(first.input, Value::from(0));
        assert_eq!(first.timeout, Duration::from_secs(2));
        seq.resolve(0, Verdict::success(None)).await.unwrap();

        let second = seq.take().await.unwrap();
        assert_eq!(second.id, 1);
        seq.resolve(1, Verdict::success(None)).await.unwrap();

        assert_eq!(seq.take().await, Err(TakeError::ExhaustedCatalog));
    }

    #[tokio::test]
    async fn take_refuses_while_job_in_flight() {
        let seq = JobSequencer::new(catalog(2));
        seq.take().await.unwrap();
        assert_eq!(seq.take().await, Err(TakeError::JobInFlight { id: 0 }));
    }

    #[tokio::test]
    async fn resolve_rejects_unknown_and_undispatched_ids() {
        let seq = JobSequencer::new(catalog(2));
        assert_eq!(
            seq.resolve(5, Verdict::success(None)).await.unwrap_err(),
            DoneError::UnknownJob(5)
        );
        assert_eq!(
            seq.resolve(0, Verdict::success(None)).await.unwrap_err(),
            DoneError::NotDispatched(0)
        );
        assert!(seq.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn expire_after_done_is_noop() {
        let seq = JobSequencer::new(catalog(1));
        seq.take().await.unwrap();
        assert!(matches!(
            seq.resolve(0, Verdict::success(None)).await.unwrap(),
            DoneAck::Recorded(_)
        ));
        assert!(seq.expire(0).await.is_none());
        assert_eq!(seq.snapshot().await.len(), 1);
    }

    #[tokio::test]
    async fn final_snapshot_is_claimed_once() {
        let seq = JobSequencer::new(catalog(1));
        seq.take().await.unwrap();
        let DoneAck::Recorded(resolution) = seq.resolve(0, Verdict::success(None)).await.unwrap()
        else {
            panic!("expected a recorded outcome");
        };
        assert_eq!(resolution.final_snapshot.map(|s| s.len()), Some(1));
        assert!(seq.claim_abort().await.is_none());
        assert!(seq.is_complete().await);
    }

    #[tokio::test]
    async fn abort_closes_the_run() {
        let seq = JobSequencer::new(catalog(1));
        seq.take().await.unwrap();

        assert_eq!(seq.claim_abort().await.map(|s| s.len()), Some(0));
        assert!(seq.claim_abort().await.is_none());

        let DoneAck::Recorded(resolution) = seq.resolve(0, Verdict::success(None)).await.unwrap()
        else {
            panic!("expected a recorded outcome");
        };
        assert!(resolution.final_snapshot.is_none());
        assert_eq!(seq.snapshot().await.len(), 1);
    }
}
