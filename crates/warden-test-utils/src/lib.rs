//! Shared test utilities for warden tests.
//!
//! - [`CaptureServer`]: a real local HTTP endpoint that records every
//!   request it receives, standing in for the results webhook and the log
//!   sink.
//! - [`RecordingResultSink`] / [`RecordingLogSink`]: in-memory sinks for
//!   tests that run on paused time and must not touch the network.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::routing::any;
use tokio::task::JoinHandle;

use warden_core::DeliveryError;
use warden_core::logs::LogSink;
use warden_core::reporter::{Report, ResultSink};

/// How often the `wait_for_*` helpers re-check.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

// ---------------------------------------------------------------------------
// CaptureServer
// ---------------------------------------------------------------------------

/// One request seen by a [`CaptureServer`].
#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub method: String,
    pub path: String,
    pub authorization: Option<String>,
    pub content_type: Option<String>,
    pub body: String,
}

impl CapturedRequest {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_str(&self.body)
            .unwrap_or_else(|e| panic!("captured body is not JSON ({e}): {}", self.body))
    }

    /// Parse a newline-delimited JSON body.
    pub fn json_lines(&self) -> Vec<serde_json::Value> {
        self.body
            .lines()
            .map(|line| {
                serde_json::from_str(line)
                    .unwrap_or_else(|e| panic!("captured line is not JSON ({e}): {line}"))
            })
            .collect()
    }
}

#[derive(Clone, Default)]
struct CaptureState {
    requests: Arc<Mutex<Vec<CapturedRequest>>>,
    status: Arc<AtomicU16>,
}

/// Local HTTP server that answers every request with a fixed status and
/// records it.
pub struct CaptureServer {
    addr: SocketAddr,
    state: CaptureState,
    handle: JoinHandle<()>,
}

impl CaptureServer {
    /// Start a server answering `200 OK`.
    pub async fn start() -> Self {
        Self::start_with_status(200).await
    }

    /// Start a server answering with `status`.
    pub async fn start_with_status(status: u16) -> Self {
        let state = CaptureState {
            requests: Arc::default(),
            status: Arc::new(AtomicU16::new(status)),
        };
        let app = Router::new()
            .fallback(any(capture))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind capture server");
        let addr = listener.local_addr().expect("capture server has no address");
        let handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .await
                .expect("capture server failed");
        });

        Self {
            addr,
            state,
            handle,
        }
    }

    /// Absolute URL for `path` on this server.
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    /// Change the status returned to subsequent requests.
    pub fn set_status(&self, status: u16) {
        self.state.status.store(status, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<CapturedRequest> {
        self.state.requests.lock().unwrap().clone()
    }

    /// Wait until at least `n` requests arrived, panicking after `timeout`.
    pub async fn wait_for_requests(&self, n: usize, timeout: Duration) -> Vec<CapturedRequest> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let requests = self.requests();
            if requests.len() >= n {
                return requests;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("expected {n} requests, got {}: {requests:?}", requests.len());
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

impl Drop for CaptureServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn capture(
    State(state): State<CaptureState>,
    method: axum::http::Method,
    uri: Uri,
    headers: HeaderMap,
    body: String,
) -> StatusCode {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    state.requests.lock().unwrap().push(CapturedRequest {
        method: method.to_string(),
        path: uri.path().to_string(),
        authorization: header("authorization"),
        content_type: header("content-type"),
        body,
    });
    StatusCode::from_u16(state.status.load(Ordering::SeqCst)).unwrap_or(StatusCode::OK)
}

// ---------------------------------------------------------------------------
// In-memory sinks
// ---------------------------------------------------------------------------

/// Result sink that keeps every report in memory.
#[derive(Default)]
pub struct RecordingResultSink {
    reports: Mutex<Vec<Report>>,
}

impl RecordingResultSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn reports(&self) -> Vec<Report> {
        self.reports.lock().unwrap().clone()
    }

    /// Wait (in tokio time) until at least `n` reports were delivered.
    pub async fn wait_for_reports(&self, n: usize, timeout: Duration) -> Vec<Report> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let reports = self.reports();
            if reports.len() >= n {
                return reports;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("expected {n} reports, got {}", reports.len());
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

#[async_trait]
impl ResultSink for RecordingResultSink {
    async fn deliver(&self, report: &Report) -> Result<(), DeliveryError> {
        self.reports.lock().unwrap().push(report.clone());
        Ok(())
    }
}

/// Log sink that keeps every batch in memory. Can be told to panic on its
/// next delivery.
#[derive(Default)]
pub struct RecordingLogSink {
    batches: Mutex<Vec<String>>,
    panic_next: AtomicBool,
}

impl RecordingLogSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make the next delivery panic instead of recording.
    pub fn panic_on_next_delivery(&self) {
        self.panic_next.store(true, Ordering::SeqCst);
    }

    /// Every delivered batch, each parsed into its JSON records.
    pub fn batches(&self) -> Vec<Vec<serde_json::Value>> {
        self.batches
            .lock()
            .unwrap()
            .iter()
            .map(|body| {
                body.lines()
                    .map(|line| serde_json::from_str(line).expect("log record should be JSON"))
                    .collect()
            })
            .collect()
    }

    /// Wait (in tokio time) until at least `n` batches were delivered.
    pub async fn wait_for_batches(&self, n: usize, timeout: Duration) -> Vec<Vec<serde_json::Value>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let batches = self.batches();
            if batches.len() >= n {
                return batches;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("expected {n} log batches, got {}", batches.len());
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

#[async_trait]
impl LogSink for RecordingLogSink {
    async fn deliver(&self, body: String) -> Result<(), DeliveryError> {
        if self.panic_next.swap(false, Ordering::SeqCst) {
            panic!("log sink exploded");
        }
        self.batches.lock().unwrap().push(body);
        Ok(())
    }
}
