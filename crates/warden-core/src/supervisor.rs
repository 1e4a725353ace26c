//! Run supervisor: the guarded entry points the HTTP layer calls, plus the
//! background work (watchdogs, report deliveries) they trigger.
//!
//! Every background task is spawned on one [`TaskTracker`] and observes
//! one [`CancellationToken`], so shutdown can cancel and join all of them.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::catalog::Catalog;
use crate::current::CurrentTest;
use crate::reporter::Reporter;
use crate::results::{Outcome, RunStatus, Verdict};
use crate::sequencer::{Dispatch, DoneAck, DoneError, JobSequencer, Resolution, TakeError};
use crate::watchdog::{Watchdog, WatchdogOutcome};

/// Cheaply cloneable handle shared by the HTTP handlers and the run loop.
#[derive(Debug, Clone)]
pub struct Supervisor {
    sequencer: Arc<JobSequencer>,
    reporter: Arc<Reporter>,
    current: CurrentTest,
    tracker: TaskTracker,
    cancel: CancellationToken,
    finished: CancellationToken,
}

impl Supervisor {
    pub fn new(
        catalog: Catalog,
        reporter: Reporter,
        current: CurrentTest,
        tracker: TaskTracker,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            sequencer: Arc::new(JobSequencer::new(catalog)),
            reporter: Arc::new(reporter),
            current,
            tracker,
            cancel,
            finished: CancellationToken::new(),
        }
    }

    pub fn sequencer(&self) -> &JobSequencer {
        &self.sequencer
    }

    pub fn current(&self) -> &CurrentTest {
        &self.current
    }

    pub fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    /// Fires once the run's final report has been delivered (or dropped)
    /// or the run was aborted.
    pub fn finished(&self) -> CancellationToken {
        self.finished.clone()
    }

    /// Hand out the next job and arm its watchdog.
    pub async fn take(&self) -> Result<Dispatch, TakeError> {
        let result = self.sequencer.take().await;
        match &result {
            Ok(dispatch) => {
                self.current.publish(dispatch.id);
                tracing::info!(
                    test_id = dispatch.id,
                    name = %dispatch.name,
                    timeout_ms = dispatch.timeout.as_millis() as u64,
                    "dispatched job"
                );
                self.arm_watchdog(dispatch);
            }
            Err(TakeError::JobInFlight { id }) => {
                tracing::debug!(test_id = id, "take refused, job still in flight");
            }
            Err(TakeError::ExhaustedCatalog) => {
                tracing::info!("no more tests in catalog");
            }
        }
        result
    }

    /// Record the worker's verdict for job `id`.
    pub async fn done(&self, id: usize, verdict: Verdict) -> Result<DoneAck, DoneError> {
        let ack = self.sequencer.resolve(id, verdict).await?;
        match &ack {
            DoneAck::Recorded(resolution) => {
                tracing::info!(
                    test_id = id,
                    success = resolution.outcome.is_success(),
                    execution_ms = resolution.outcome.execution_time.as_millis() as u64,
                    "job done"
                );
                self.after_resolution(resolution.clone());
            }
            DoneAck::Duplicate => {
                tracing::warn!(test_id = id, "job already resolved, ignoring done");
            }
        }
        Ok(ack)
    }

    /// End the run early with a FAILED report, e.g. when the worker dies.
    ///
    /// Does nothing if the run already finished. Outcomes recorded after an
    /// abort produce no further reports.
    pub async fn abort(&self, reason: impl Into<String>) {
        let Some(results) = self.sequencer.claim_abort().await else {
            return;
        };
        let reason = reason.into();
        tracing::error!(reason = %reason, "aborting run");
        self.reporter
            .report(RunStatus::Failed, Some(reason), results)
            .await;
        self.finished.cancel();
    }

    /// Cancel watchdogs and pending work, then wait for every supervised
    /// task to finish.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }

    fn arm_watchdog(&self, dispatch: &Dispatch) {
        let watchdog = Watchdog::arm(dispatch.id, dispatch.timeout);
        let supervisor = self.clone();
        self.tracker.spawn(async move {
            let outcome = watchdog
                .run(&supervisor.sequencer, supervisor.cancel.clone())
                .await;
            if let WatchdogOutcome::Fired(resolution) = outcome {
                supervisor.after_resolution(resolution);
            }
        });
    }

    fn after_resolution(&self, resolution: Resolution) {
        if let Some(results) = resolution.final_snapshot {
            self.spawn_final_report(results);
            return;
        }
        if self.finished.is_cancelled() {
            return;
        }

        if let Some(reason) = resolution.outcome.error() {
            let reason = reason.to_string();
            let reporter = Arc::clone(&self.reporter);
            let snapshot = resolution.snapshot;
            self.tracker.spawn(async move {
                reporter
                    .report(RunStatus::Failed, Some(reason), snapshot)
                    .await;
            });
        }
    }

    fn spawn_final_report(&self, results: Vec<Outcome>) {
        let status = RunStatus::from_outcomes(&results);
        tracing::info!(%status, results = results.len(), "run complete, sending final report");
        let reporter = Arc::clone(&self.reporter);
        let finished = self.finished.clone();
        self.tracker.spawn(async move {
            reporter.report(status, None, results).await;
            finished.cancel();
        });
    }
}
