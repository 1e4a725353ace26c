//! Outcomes and the append-only result log.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

/// Failure reason recorded when a job outlives its deadline.
pub const TIMEOUT_ERROR: &str = "timeout exceeded";

/// Largest JSON-encoded output forwarded to the webhook.
pub const OUTPUT_LIMIT_BYTES: usize = 10_000;

/// Replaces outputs larger than [`OUTPUT_LIMIT_BYTES`].
pub const REDACTED_OUTPUT: &str = "REDACTED (payload exceeded size limit)";

/// Body of a `job-done` request as sent by the worker.
#[derive(Debug, Default, Deserialize)]
pub struct DonePayload {
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub error: Option<Value>,
}

/// How a job ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Success { output: Option<Value> },
    Failure { reason: String },
}

impl Verdict {
    /// A successful verdict, redacting oversized output.
    pub fn success(output: Option<Value>) -> Self {
        Verdict::Success {
            output: output.map(cap_output),
        }
    }

    pub fn failure(reason: impl Into<String>) -> Self {
        Verdict::Failure {
            reason: reason.into(),
        }
    }

    pub fn timed_out() -> Self {
        Self::failure(TIMEOUT_ERROR)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Verdict::Success { .. })
    }
}

impl From<DonePayload> for Verdict {
    fn from(payload: DonePayload) -> Self {
        match payload.error {
            None | Some(Value::Null) => Verdict::success(payload.output),
            Some(Value::String(reason)) => Verdict::Failure { reason },
            Some(other) => Verdict::Failure {
                reason: other.to_string(),
            },
        }
    }
}

fn cap_output(output: Value) -> Value {
    let size = serde_json::to_vec(&output).map(|b| b.len()).unwrap_or(0);
    if size > OUTPUT_LIMIT_BYTES {
        tracing::warn!(bytes = size, "output payload exceeded size limit; redacted");
        Value::String(REDACTED_OUTPUT.to_string())
    } else {
        output
    }
}

/// The single, final result for one catalog entry.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub id: usize,
    pub name: String,
    pub verdict: Verdict,
    pub execution_time: Duration,
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        self.verdict.is_success()
    }

    pub fn error(&self) -> Option<&str> {
        match &self.verdict {
            Verdict::Success { .. } => None,
            Verdict::Failure { reason } => Some(reason),
        }
    }
}

/// Wire shape of an outcome inside a webhook report.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ResultRecord<'a> {
    id: usize,
    name: &'a str,
    status: &'static str,
    error: Option<&'a str>,
    execution_time: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    output: Option<&'a Value>,
}

impl Serialize for Outcome {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let (status, output) = match &self.verdict {
            Verdict::Success { output } => ("SUCCESS", output.as_ref()),
            Verdict::Failure { .. } => ("FAILED", None),
        };
        ResultRecord {
            id: self.id,
            name: &self.name,
            status,
            error: self.error(),
            execution_time: u64::try_from(self.execution_time.as_millis()).unwrap_or(u64::MAX),
            output,
        }
        .serialize(serializer)
    }
}

/// Overall status of a run as reported to the webhook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunStatus {
    Passed,
    Failed,
}

impl RunStatus {
    /// `Passed` only when every outcome succeeded.
    pub fn from_outcomes(outcomes: &[Outcome]) -> Self {
        if outcomes.iter().all(Outcome::is_success) {
            RunStatus::Passed
        } else {
            RunStatus::Failed
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Passed => f.write_str("PASSED"),
            RunStatus::Failed => f.write_str("FAILED"),
        }
    }
}

/// Append-only, ordered collection of outcomes. At most one outcome is
/// accepted per job id.
#[derive(Debug, Default)]
pub struct ResultLog {
    outcomes: Vec<Outcome>,
    recorded: HashSet<usize>,
}

impl ResultLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `outcome` unless one already exists for its id.
    ///
    /// Returns whether the outcome was appended.
    pub fn append(&mut self, outcome: Outcome) -> bool {
        if !self.recorded.insert(outcome.id) {
            return false;
        }
        self.outcomes.push(outcome);
        true
    }

    pub fn contains(&self, id: usize) -> bool {
        self.recorded.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn outcomes(&self) -> &[Outcome] {
        &self.outcomes
    }

    pub fn snapshot(&self) -> Vec<Outcome> {
        self.outcomes.clone()
    }
}
