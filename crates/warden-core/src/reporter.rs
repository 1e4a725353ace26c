//! Result reporting: snapshots of the result log delivered to a webhook.
//!
//! Deliveries are single-flight. The reporter's own lock is held for the
//! whole send plus the post-send delay, so bursts of failure reports are
//! strictly serialized and throttled. Delivery is at-most-once: errors are
//! logged and the report is dropped.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Mutex;

pub use crate::delivery::DeliveryError;
use crate::delivery::post_with_bearer;
use crate::results::{Outcome, RunStatus};

/// Identifies the run in every outbound payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunIdentity {
    pub pod_id: String,
    pub test_id: String,
}

/// The webhook payload.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    pub pod_id: String,
    pub test_id: String,
    pub results: Vec<Outcome>,
    pub status: RunStatus,
    pub error: Option<String>,
}

/// Destination for reports.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn deliver(&self, report: &Report) -> Result<(), DeliveryError>;
}

/// Posts reports as JSON to a webhook with a bearer token.
///
/// The request carries no client-side timeout: a hung webhook holds the
/// reporter's lock until the connection fails.
#[derive(Debug, Clone)]
pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
    token: String,
}

impl WebhookSink {
    pub fn new(client: reqwest::Client, url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
            token: token.into(),
        }
    }
}

#[async_trait]
impl ResultSink for WebhookSink {
    async fn deliver(&self, report: &Report) -> Result<(), DeliveryError> {
        let body = serde_json::to_string(report)?;
        post_with_bearer(&self.client, &self.url, &self.token, "application/json", body).await
    }
}

/// Serializes report delivery.
pub struct Reporter {
    sink: Option<Arc<dyn ResultSink>>,
    identity: RunIdentity,
    post_send_delay: Duration,
    gate: Mutex<()>,
}

impl std::fmt::Debug for Reporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reporter")
            .field("configured", &self.sink.is_some())
            .field("identity", &self.identity)
            .field("post_send_delay", &self.post_send_delay)
            .finish()
    }
}

impl Reporter {
    /// `sink` is `None` when no webhook is configured; reports are then
    /// logged and dropped.
    pub fn new(
        sink: Option<Arc<dyn ResultSink>>,
        identity: RunIdentity,
        post_send_delay: Duration,
    ) -> Self {
        Self {
            sink,
            identity,
            post_send_delay,
            gate: Mutex::new(()),
        }
    }

    pub fn identity(&self) -> &RunIdentity {
        &self.identity
    }

    /// Deliver a snapshot. Returns whether the webhook accepted it.
    pub async fn report(
        &self,
        status: RunStatus,
        error: Option<String>,
        results: Vec<Outcome>,
    ) -> bool {
        let _guard = self.gate.lock().await;

        let Some(sink) = &self.sink else {
            tracing::error!(%status, "results webhook not configured, dropping report");
            return false;
        };

        let report = Report {
            pod_id: self.identity.pod_id.clone(),
            test_id: self.identity.test_id.clone(),
            results,
            status,
            error,
        };

        match sink.deliver(&report).await {
            Ok(()) => {
                tracing::info!(
                    %status,
                    results = report.results.len(),
                    "results delivered to webhook"
                );
                if !self.post_send_delay.is_zero() {
                    tokio::time::sleep(self.post_send_delay).await;
                }
                true
            }
            Err(e) => {
                tracing::error!(%status, error = %e, "failed to deliver results");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::results::Verdict;

    /// Sink that tracks how many deliveries overlap.
    #[derive(Default)]
    struct OverlapSink {
        active: AtomicUsize,
        max_active: AtomicUsize,
        delivered: AtomicUsize,
    }

    #[async_trait]
    impl ResultSink for OverlapSink {
        async fn deliver(&self, _report: &Report) -> Result<(), DeliveryError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            self.delivered.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingSink;

    #[async_trait]
    impl ResultSink for FailingSink {
        async fn deliver(&self, _report: &Report) -> Result<(), DeliveryError> {
            Err(DeliveryError::Status {
                status: 500,
                body: "nope".to_string(),
            })
        }
    }

    fn identity() -> RunIdentity {
        RunIdentity {
            pod_id: "pod-1".to_string(),
            test_id: "run-1".to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn deliveries_never_overlap() {
        let sink = Arc::new(OverlapSink::default());
        let reporter = Arc::new(Reporter::new(
            Some(sink.clone()),
            identity(),
            Duration::from_millis(10),
        ));

        let handles: Vec<_> = (0..5)
            .map(|_| {
                let reporter = Arc::clone(&reporter);
                tokio::spawn(async move {
                    reporter
                        .report(RunStatus::Failed, Some("boom".to_string()), Vec::new())
                        .await
                })
            })
            .collect();
        for handle in handles {
            assert!(handle.await.unwrap());
        }

        assert_eq!(sink.delivered.load(Ordering::SeqCst), 5);
        assert_eq!(sink.max_active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_delivery_is_swallowed() {
        let reporter = Reporter::new(Some(Arc::new(FailingSink)), identity(), Duration::ZERO);
        assert!(!reporter.report(RunStatus::Passed, None, Vec::new()).await);
    }

    #[tokio::test]
    async fn unconfigured_reporter_drops_reports() {
        let reporter = Reporter::new(None, identity(), Duration::ZERO);
        assert!(!reporter.report(RunStatus::Failed, None, Vec::new()).await);
    }

    #[test]
    fn report_serializes_camel_case() {
        let report = Report {
            pod_id: "pod-1".to_string(),
            test_id: "run-1".to_string(),
            results: vec![Outcome {
                id: 0,
                name: "Test 1".to_string(),
                verdict: Verdict::success(None),
                execution_time: Duration::from_millis(12),
            }],
            status: RunStatus::Passed,
            error: None,
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["podId"], "pod-1");
        assert_eq!(json["testId"], "run-1");
        assert_eq!(json["status"], "PASSED");
        assert!(json["error"].is_null());
        assert_eq!(json["results"][0]["executionTime"], 12);
    }
}
