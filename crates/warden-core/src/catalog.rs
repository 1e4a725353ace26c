//! Test catalog: the ordered, immutable list of jobs a run dispatches.
//!
//! The catalog arrives as a JSON array of `{name?, input, timeout?}`
//! entries (timeout in milliseconds), either verbatim, base64-encoded, or
//! behind a `URL:<location>` indirection that is fetched first.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use serde_json::Value;

/// Deadline applied to entries that do not specify one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(30_000);

const URL_PREFIX: &str = "URL:";

/// Errors that can occur while loading a catalog.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("failed to fetch test catalog from {url}: {message}")]
    Fetch { url: String, message: String },

    #[error("test catalog is neither JSON nor base64-encoded JSON: {0}")]
    Decode(String),

    #[error("invalid test catalog: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("test {index} ({name:?}) has no input")]
    MissingInput { index: usize, name: String },

    #[error("test catalog contains no tests")]
    Empty,
}

/// Wire form of a single catalog entry.
#[derive(Debug, Deserialize)]
struct CatalogEntry {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    input: Option<Value>,
    /// Milliseconds.
    #[serde(default)]
    timeout: Option<u64>,
}

/// A single job in the catalog. Immutable once loaded.
#[derive(Debug, Clone, PartialEq)]
pub struct TestCase {
    /// Load-order index.
    pub id: usize,
    pub name: String,
    /// Opaque payload handed to the worker.
    pub input: Value,
    pub timeout: Duration,
}

/// The ordered set of jobs for one run.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    cases: Vec<TestCase>,
}

impl Catalog {
    /// Build a catalog from already-constructed cases, renumbering them by
    /// position so ids always equal load order.
    pub fn new(cases: Vec<TestCase>) -> Self {
        let cases = cases
            .into_iter()
            .enumerate()
            .map(|(id, case)| TestCase { id, ..case })
            .collect();
        Self { cases }
    }

    /// Parse a JSON array of catalog entries.
    pub fn from_json(json: &str) -> Result<Self, CatalogError> {
        let entries: Vec<CatalogEntry> = serde_json::from_str(json)?;
        if entries.is_empty() {
            return Err(CatalogError::Empty);
        }

        let mut cases = Vec::with_capacity(entries.len());
        for (index, entry) in entries.into_iter().enumerate() {
            let name = entry
                .name
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| format!("Test {}", index + 1));
            let Some(input) = entry.input else {
                return Err(CatalogError::MissingInput { index, name });
            };
            let timeout = entry
                .timeout
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_TIMEOUT);
            cases.push(TestCase {
                id: index,
                name,
                input,
                timeout,
            });
        }

        Ok(Self { cases })
    }

    /// Decode a catalog that is either a JSON array or base64-encoded JSON.
    pub fn decode(raw: &str) -> Result<Self, CatalogError> {
        let trimmed = raw.trim();
        if trimmed.starts_with('[') {
            return Self::from_json(trimmed);
        }

        let bytes = STANDARD
            .decode(trimmed)
            .map_err(|e| CatalogError::Decode(e.to_string()))?;
        let json = String::from_utf8(bytes).map_err(|e| CatalogError::Decode(e.to_string()))?;
        Self::from_json(&json)
    }

    /// Resolve a `URL:` indirection if present, then [`Self::decode`].
    pub async fn load(client: &reqwest::Client, raw: &str) -> Result<Self, CatalogError> {
        let Some(url) = raw.trim().strip_prefix(URL_PREFIX) else {
            return Self::decode(raw);
        };

        tracing::info!(url, "fetching test catalog");
        let fetch_err = |e: reqwest::Error| CatalogError::Fetch {
            url: url.to_string(),
            message: e.to_string(),
        };
        let body = client
            .get(url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(fetch_err)?
            .text()
            .await
            .map_err(fetch_err)?;

        Self::decode(&body)
    }

    pub fn len(&self) -> usize {
        self.cases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }

    pub fn get(&self, id: usize) -> Option<&TestCase> {
        self.cases.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TestCase> {
        self.cases.iter()
    }
}
