//! Worker log streaming.
//!
//! Lines from the worker's output streams enter a small bounded queue
//! through [`LogIngest`]. The batching loop in [`LogPipeline`] drains the
//! queue, tags each line with the current test, and ships batches of
//! newline-delimited JSON to a [`LogSink`] whenever the batch fills or the
//! flush interval elapses with something buffered.

pub mod entry;
pub mod pipeline;
pub mod sink;

pub use entry::{ERROR_MARKER, Level, LogEntry};
pub use pipeline::{LogIngest, LogPipeline, PipelineConfig};
pub use sink::{HttpLogSink, LogSink};
