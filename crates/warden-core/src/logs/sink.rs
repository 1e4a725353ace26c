use std::time::Duration;

use async_trait::async_trait;

use crate::delivery::{DeliveryError, post_with_bearer};

/// Client-side timeout for a single log batch POST.
pub const LOG_SINK_TIMEOUT: Duration = Duration::from_secs(2);

/// Destination for encoded log batches.
#[async_trait]
pub trait LogSink: Send + Sync {
    /// Deliver one newline-delimited batch.
    async fn deliver(&self, body: String) -> Result<(), DeliveryError>;
}

/// Posts batches to an HTTP ingestion endpoint.
#[derive(Debug, Clone)]
pub struct HttpLogSink {
    client: reqwest::Client,
    url: String,
    token: String,
}

impl HttpLogSink {
    /// Build a sink with its own client carrying [`LOG_SINK_TIMEOUT`].
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder().timeout(LOG_SINK_TIMEOUT).build()?;
        Ok(Self {
            client,
            url: url.into(),
            token: token.into(),
        })
    }
}

#[async_trait]
impl LogSink for HttpLogSink {
    async fn deliver(&self, body: String) -> Result<(), DeliveryError> {
        post_with_bearer(&self.client, &self.url, &self.token, "application/x-ndjson", body).await
    }
}
