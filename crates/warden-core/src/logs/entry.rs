use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

use crate::reporter::RunIdentity;

/// Prefix the worker runner puts on stderr lines.
pub const ERROR_MARKER: &str = "#ERROR:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Info,
    Error,
}

/// One line of worker output on its way to the log sink.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    /// Job that was current when the line was drained; best-effort.
    pub test_number: Option<usize>,
    pub level: Level,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl LogEntry {
    /// Classify `line` by its marker and stamp it.
    pub fn new(line: &str, test_number: Option<usize>, timestamp: DateTime<Utc>) -> Self {
        let (level, message) = classify(line);
        Self {
            test_number,
            level,
            message: message.to_string(),
            timestamp,
        }
    }
}

/// Split off the error marker, if any.
pub fn classify(line: &str) -> (Level, &str) {
    match line.strip_prefix(ERROR_MARKER) {
        Some(rest) => (Level::Error, rest.strip_prefix(' ').unwrap_or(rest)),
        None => (Level::Info, line),
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LogRecord<'a> {
    test_id: &'a str,
    level: Level,
    pod_id: &'a str,
    test_number: Option<usize>,
    message: &'a str,
    timestamp: String,
}

/// Encode a batch as newline-delimited JSON records.
pub fn encode_batch(entries: &[LogEntry], identity: &RunIdentity) -> Result<String, serde_json::Error> {
    let mut records = Vec::with_capacity(entries.len());
    for entry in entries {
        let record = LogRecord {
            test_id: &identity.test_id,
            level: entry.level,
            pod_id: &identity.pod_id,
            test_number: entry.test_number,
            message: &entry.message,
            timestamp: entry.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
        };
        records.push(serde_json::to_string(&record)?);
    }
    Ok(records.join("\n"))
}
