//! Outbound HTTP: webhook reports, log batches and catalog fetches against a
//! local capture server.

use std::sync::Arc;
use std::time::Duration;

use warden_core::catalog::CatalogError;
use warden_core::logs::{HttpLogSink, LogSink};
use warden_core::results::Verdict;
use warden_core::{
    Catalog, DeliveryError, Outcome, Report, Reporter, ResultSink, RunIdentity, RunStatus,
    WebhookSink,
};
use warden_test_utils::CaptureServer;

fn identity() -> RunIdentity {
    RunIdentity {
        pod_id: "pod-h".to_string(),
        test_id: "run-h".to_string(),
    }
}

fn sample_report() -> Report {
    Report {
        pod_id: "pod-h".to_string(),
        test_id: "run-h".to_string(),
        results: vec![Outcome {
            id: 0,
            name: "Test 1".to_string(),
            verdict: Verdict::failure("timeout exceeded"),
            execution_time: Duration::from_millis(1500),
        }],
        status: RunStatus::Failed,
        error: None,
    }
}

#[tokio::test]
async fn webhook_posts_report_with_bearer_token() {
    let server = CaptureServer::start().await;
    let sink = WebhookSink::new(reqwest::Client::new(), server.url("/hook"), "s3cret");

    sink.deliver(&sample_report()).await.unwrap();

    let requests = server.requests();
    assert_eq!(requests.len(), 1);
    let req = &requests[0];
    assert_eq!(req.method, "POST");
    assert_eq!(req.path, "/hook");
    assert_eq!(req.authorization.as_deref(), Some("Bearer s3cret"));
    assert_eq!(req.content_type.as_deref(), Some("application/json"));

    let body = req.json();
    assert_eq!(body["podId"], "pod-h");
    assert_eq!(body["testId"], "run-h");
    assert_eq!(body["status"], "FAILED");
    assert_eq!(body["error"], serde_json::Value::Null);
    assert_eq!(body["results"][0]["status"], "FAILED");
    assert_eq!(body["results"][0]["error"], "timeout exceeded");
    assert_eq!(body["results"][0]["executionTime"], 1500);
}

#[tokio::test]
async fn webhook_non_2xx_is_a_delivery_error() {
    let server = CaptureServer::start_with_status(503).await;
    let sink = WebhookSink::new(reqwest::Client::new(), server.url("/hook"), "t");

    let err = sink.deliver(&sample_report()).await.unwrap_err();
    assert!(
        matches!(err, DeliveryError::Status { status: 503, .. }),
        "unexpected error: {err}"
    );
}

#[tokio::test]
async fn reporter_absorbs_delivery_failures() {
    let server = CaptureServer::start_with_status(500).await;
    let sink = Arc::new(WebhookSink::new(
        reqwest::Client::new(),
        server.url("/hook"),
        "t",
    ));
    let reporter = Reporter::new(Some(sink), identity(), Duration::ZERO);

    assert!(!reporter.report(RunStatus::Failed, None, Vec::new()).await);

    server.set_status(200);
    assert!(reporter.report(RunStatus::Passed, None, Vec::new()).await);
    assert_eq!(server.requests().len(), 2);
}

#[tokio::test]
async fn log_sink_posts_ndjson_with_bearer_token() {
    let server = CaptureServer::start().await;
    let sink = HttpLogSink::new(server.url("/v0/events"), "log-token").unwrap();

    let body = "{\"message\":\"a\"}\n{\"message\":\"b\"}".to_string();
    sink.deliver(body).await.unwrap();

    let requests = server.requests();
    let req = &requests[0];
    assert_eq!(req.path, "/v0/events");
    assert_eq!(req.authorization.as_deref(), Some("Bearer log-token"));
    assert_eq!(req.content_type.as_deref(), Some("application/x-ndjson"));
    let lines = req.json_lines();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[1]["message"], "b");
}

#[tokio::test]
async fn log_sink_unreachable_is_a_transport_error() {
    let server = CaptureServer::start().await;
    let url = server.url("/v0/events");
    drop(server);
    // Give the aborted server task a moment to release the socket.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let sink = HttpLogSink::new(url, "t").unwrap();
    let err = sink.deliver("{}".to_string()).await.unwrap_err();
    assert!(matches!(err, DeliveryError::Transport(_)), "unexpected error: {err}");
}

#[tokio::test]
async fn catalog_fetch_failure_names_the_url() {
    let server = CaptureServer::start_with_status(404).await;
    let url = server.url("/catalog.json");

    let err = Catalog::load(&reqwest::Client::new(), &format!("URL:{url}"))
        .await
        .unwrap_err();
    match err {
        CatalogError::Fetch { url: failed, .. } => assert_eq!(failed, url),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(server.requests()[0].method, "GET");
}
