use std::collections::HashMap;
use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use warden_core::results::DonePayload;
use warden_core::{Dispatch, DoneAck, DoneError, Supervisor, TakeError, Verdict};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: msg.into(),
        }
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: msg.into(),
        }
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            message: msg.into(),
        }
    }
}

impl From<DoneError> for AppError {
    fn from(err: DoneError) -> Self {
        match err {
            DoneError::UnknownJob(_) => Self::not_found(err.to_string()),
            DoneError::NotDispatched(_) => Self::conflict(err.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

/// Job descriptor in the shape the worker runtime polls for.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResponse {
    pub delay_time: u64,
    pub error: String,
    /// Deadline for the job, in milliseconds.
    pub execution_time: u64,
    pub id: String,
    pub input: Value,
    pub retries: u32,
    pub status: u16,
}

impl From<Dispatch> for JobResponse {
    fn from(d: Dispatch) -> Self {
        Self {
            delay_time: 0,
            error: String::new(),
            execution_time: d.timeout.as_millis() as u64,
            id: d.id.to_string(),
            input: d.input,
            retries: 0,
            status: 200,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct DoneResponse {
    pub status: &'static str,
    pub message: String,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(supervisor: Supervisor) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/job-take/{pod_id}", get(job_take))
        .route("/job-done/{pod_id}/{id}", post(job_done))
        .route("/v2/{model}/job-take/{pod_id}", get(job_take))
        .route("/v2/{model}/job-done/{pod_id}/{id}", post(job_done))
        .layer(TraceLayer::new_for_http())
        .with_state(supervisor)
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Serve the job API until `shutdown` fires or Ctrl+C is received.
pub async fn run_serve(
    supervisor: Supervisor,
    bind: String,
    port: u16,
    shutdown: CancellationToken,
) -> Result<()> {
    let app = build_router(supervisor);
    let addr: SocketAddr = format!("{bind}:{port}")
        .parse()
        .with_context(|| format!("invalid listen address {bind}:{port}"))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!("warden listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await?;
    tracing::info!("warden server shut down");
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    tokio::select! {
        _ = shutdown.cancelled() => {}
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                tracing::error!(error = %e, "failed to listen for Ctrl+C");
                shutdown.cancelled().await;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health() -> Json<Value> {
    Json(serde_json::json!({ "status": "healthy" }))
}

async fn job_take(
    State(supervisor): State<Supervisor>,
    Path(params): Path<HashMap<String, String>>,
) -> Result<axum::response::Response, AppError> {
    tracing::debug!(pod_id = params.get("pod_id").map(String::as_str), "job take");
    match supervisor.take().await {
        Ok(dispatch) => Ok(Json(JobResponse::from(dispatch)).into_response()),
        Err(TakeError::JobInFlight { .. }) => Ok(StatusCode::NO_CONTENT.into_response()),
        Err(TakeError::ExhaustedCatalog) => Err(AppError::not_found("catalog exhausted")),
    }
}

async fn job_done(
    State(supervisor): State<Supervisor>,
    Path(params): Path<HashMap<String, String>>,
    body: Bytes,
) -> Result<axum::response::Response, AppError> {
    let raw_id = params.get("id").map(String::as_str).unwrap_or_default();
    let id: usize = raw_id
        .parse()
        .map_err(|_| AppError::bad_request(format!("invalid job id {raw_id:?}")))?;

    let payload: DonePayload = serde_json::from_slice(&body).map_err(|e| {
        tracing::warn!(test_id = id, error = %e, "malformed job-done body");
        AppError::bad_request("invalid request body")
    })?;

    let response = match supervisor.done(id, Verdict::from(payload)).await? {
        DoneAck::Recorded(_) => DoneResponse {
            status: "accepted",
            message: format!("job {id} recorded"),
        },
        DoneAck::Duplicate => DoneResponse {
            status: "duplicate",
            message: format!("job {id} was already resolved"),
        },
    };
    Ok(Json(response).into_response())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
