use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::entry::{LogEntry, encode_batch};
use super::sink::LogSink;
use crate::current::CurrentTest;
use crate::reporter::RunIdentity;

const MIN_FLUSH_INTERVAL: Duration = Duration::from_millis(1);

/// Tuning for the batching loop.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Lines that may wait in the ingestion queue before new ones are dropped.
    pub queue_capacity: usize,
    /// Entries that trigger an immediate flush.
    pub batch_size: usize,
    /// Period of the flush tick. Clamped to at least one millisecond.
    pub flush_interval: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 16,
            batch_size: 16,
            flush_interval: Duration::from_secs(3),
        }
    }
}

/// Producer side of the pipeline. Never blocks: when the queue is full the
/// submitted line is dropped.
#[derive(Debug, Clone)]
pub struct LogIngest {
    tx: mpsc::Sender<String>,
}

impl LogIngest {
    /// Queue a line. Returns whether it was accepted.
    pub fn submit(&self, line: impl Into<String>) -> bool {
        match self.tx.try_send(line.into()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!("log queue full, discarding line");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

/// The batching loop. Single owner of the batch buffer.
pub struct LogPipeline {
    rx: mpsc::Receiver<String>,
    config: PipelineConfig,
    sink: Arc<dyn LogSink>,
    identity: RunIdentity,
    current: CurrentTest,
    tracker: TaskTracker,
}

impl LogPipeline {
    /// Create the pipeline and its producer handle. Deliveries are spawned
    /// on `tracker` so the loop never waits on the sink.
    pub fn new(
        config: PipelineConfig,
        sink: Arc<dyn LogSink>,
        identity: RunIdentity,
        current: CurrentTest,
        tracker: TaskTracker,
    ) -> (LogIngest, Self) {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let pipeline = Self {
            rx,
            config,
            sink,
            identity,
            current,
            tracker,
        };
        (LogIngest { tx }, pipeline)
    }

    /// Run until `cancel` fires or every [`LogIngest`] is dropped, then
    /// flush what is left and return.
    pub async fn run(mut self, cancel: CancellationToken) {
        let batch_size = self.config.batch_size.max(1);
        let period = self.config.flush_interval.max(MIN_FLUSH_INTERVAL);
        let mut buffer: Vec<LogEntry> = Vec::with_capacity(batch_size);
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                line = self.rx.recv() => {
                    let Some(line) = line else { break };
                    self.push(&mut buffer, &line);
                    if buffer.len() >= batch_size {
                        self.flush(&mut buffer);
                    }
                }
                _ = ticker.tick() => {
                    if !buffer.is_empty() {
                        self.flush(&mut buffer);
                    }
                }
            }
        }

        while let Ok(line) = self.rx.try_recv() {
            self.push(&mut buffer, &line);
        }
        if !buffer.is_empty() {
            let batch = std::mem::take(&mut buffer);
            deliver_batch(Arc::clone(&self.sink), self.identity.clone(), batch).await;
        }
        tracing::debug!("log pipeline stopped");
    }

    fn push(&self, buffer: &mut Vec<LogEntry>, chunk: &str) {
        let test_number = self.current.get();
        for line in chunk.split('\n') {
            let line = line.strip_suffix('\r').unwrap_or(line);
            if line.is_empty() {
                continue;
            }
            buffer.push(LogEntry::new(line, test_number, Utc::now()));
        }
    }

    fn flush(&self, buffer: &mut Vec<LogEntry>) {
        let batch = std::mem::replace(buffer, Vec::with_capacity(self.config.batch_size));
        self.tracker.spawn(deliver_batch(
            Arc::clone(&self.sink),
            self.identity.clone(),
            batch,
        ));
    }
}

/// Encode and deliver one batch. Errors and panics are logged and the
/// batch is discarded.
async fn deliver_batch(sink: Arc<dyn LogSink>, identity: RunIdentity, batch: Vec<LogEntry>) {
    let count = batch.len();
    let attempt = async move {
        let body = encode_batch(&batch, &identity)?;
        sink.deliver(body).await
    };

    match AssertUnwindSafe(attempt).catch_unwind().await {
        Ok(Ok(())) => tracing::debug!(count, "log batch delivered"),
        Ok(Err(e)) => tracing::warn!(count, error = %e, "failed to deliver log batch, discarding"),
        Err(panic) => tracing::error!(
            count,
            panic = panic_message(panic.as_ref()),
            "panic while delivering log batch, discarding"
        ),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}
