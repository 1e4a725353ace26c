//! Shared plumbing for outbound HTTP deliveries (results webhook, log sink).

use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};

/// Why an outbound delivery failed. Deliveries are never retried; callers
/// log the error and move on.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("endpoint returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("failed to serialize payload: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// POST `body` to `url` with bearer authentication and fail on any
/// non-2xx response.
pub(crate) async fn post_with_bearer(
    client: &reqwest::Client,
    url: &str,
    token: &str,
    content_type: &str,
    body: String,
) -> Result<(), DeliveryError> {
    let response = client
        .post(url)
        .header(AUTHORIZATION, format!("Bearer {token}"))
        .header(CONTENT_TYPE, content_type)
        .body(body)
        .send()
        .await?;

    let status = response.status();
    if status.is_success() {
        return Ok(());
    }

    let body = response.text().await.unwrap_or_default();
    Err(DeliveryError::Status {
        status: status.as_u16(),
        body,
    })
}
