//! Core of the warden test-harness supervisor.
//!
//! A worker process polls for jobs, executes them and reports back. The
//! pieces here hand out jobs in catalog order, enforce per-job deadlines,
//! collect outcomes, deliver them to a results webhook and stream the
//! worker's output to a log sink.
//!
//! ```text
//! worker --take--> Supervisor --> JobSequencer --arm--> Watchdog
//!        --done--> Supervisor --> JobSequencer --> ResultLog
//!                                     |
//!                                     v
//!                                  Reporter --POST--> webhook
//!
//! worker stdout/stderr --> LogIngest --> batching loop --POST--> log sink
//! ```

pub mod catalog;
pub mod current;
pub mod delivery;
pub mod logs;
pub mod reporter;
pub mod results;
pub mod sequencer;
pub mod supervisor;
pub mod watchdog;
pub mod worker;

pub use catalog::{Catalog, TestCase};
pub use current::CurrentTest;
pub use delivery::DeliveryError;
pub use reporter::{Report, Reporter, ResultSink, RunIdentity, WebhookSink};
pub use results::{Outcome, RunStatus, Verdict};
pub use sequencer::{Dispatch, DoneAck, DoneError, JobSequencer, TakeError};
pub use supervisor::Supervisor;
