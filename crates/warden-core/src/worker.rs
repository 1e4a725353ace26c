//! Worker process runner.
//!
//! Spawns the worker command, forwards every stdout/stderr line to the
//! tracing log and the log pipeline, and reports how the process ended.

use std::fmt;
use std::process::{ExitStatus, Stdio};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::LinesStream;
use tokio_util::sync::CancellationToken;

use crate::logs::{ERROR_MARKER, LogIngest};

/// Shell wrappers container runtimes put around the real command.
const SHELL_WRAPPERS: &[&str] = &["/bin/sh -c ", "/bin/bash -o pipefail -c "];

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("worker command is empty")]
    EmptyCommand,

    #[error("invalid worker command: {0}")]
    Parse(#[from] shell_words::ParseError),

    #[error("failed to spawn worker {program:?}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed waiting on worker: {0}")]
    Wait(#[source] std::io::Error),
}

/// A parsed worker command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    program: String,
    args: Vec<String>,
    display: String,
}

impl WorkerCommand {
    /// Split `command` into program and arguments, dropping a leading
    /// shell wrapper.
    pub fn parse(command: &str) -> Result<Self, WorkerError> {
        let mut display = command.trim();
        for wrapper in SHELL_WRAPPERS {
            if let Some(rest) = display.strip_prefix(wrapper) {
                display = rest;
                break;
            }
        }

        let mut words = shell_words::split(display)?;
        if words.is_empty() {
            return Err(WorkerError::EmptyCommand);
        }
        let program = words.remove(0);

        Ok(Self {
            program,
            args: words,
            display: display.to_string(),
        })
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }
}

impl fmt::Display for WorkerCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display)
    }
}

/// How the worker run ended.
#[derive(Debug)]
pub enum WorkerExit {
    Exited(ExitStatus),
    /// Killed because of shutdown.
    Cancelled,
}

#[derive(Debug, Clone, Copy)]
enum OutputStream {
    Stdout,
    Stderr,
}

impl fmt::Display for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputStream::Stdout => f.write_str("stdout"),
            OutputStream::Stderr => f.write_str("stderr"),
        }
    }
}

/// Run the worker to completion, or until `cancel` fires.
///
/// `ingest` receives each output line; stderr lines carry
/// [`ERROR_MARKER`].
pub async fn run_worker(
    command: &WorkerCommand,
    ingest: Option<LogIngest>,
    cancel: CancellationToken,
) -> Result<WorkerExit, WorkerError> {
    let forward = |line: String| {
        if let Some(ingest) = &ingest {
            ingest.submit(line);
        }
    };

    forward(format!("Running command: {command}"));
    tracing::info!(command = %command, "starting worker");

    let mut child = Command::new(&command.program)
        .args(&command.args)
        .env("RUNPOD_LOG_LEVEL", "INFO")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| {
            forward(format!("Failed to start command: {source}"));
            WorkerError::Spawn {
                program: command.program.clone(),
                source,
            }
        })?;

    let stdout = child.stdout.take().map(|out| {
        LinesStream::new(BufReader::new(out).lines()).map(|line| (OutputStream::Stdout, line))
    });
    let stderr = child.stderr.take().map(|err| {
        LinesStream::new(BufReader::new(err).lines()).map(|line| (OutputStream::Stderr, line))
    });
    let (Some(stdout), Some(stderr)) = (stdout, stderr) else {
        let _ = child.kill().await;
        return Err(WorkerError::Spawn {
            program: command.program.clone(),
            source: std::io::Error::other("worker output pipes unavailable"),
        });
    };
    let mut lines = stdout.merge(stderr);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("shutdown requested, killing worker");
                let _ = child.kill().await;
                return Ok(WorkerExit::Cancelled);
            }
            next = lines.next() => match next {
                Some((stream, Ok(line))) => {
                    tracing::info!(stream = %stream, output = %line, "worker output");
                    match stream {
                        OutputStream::Stdout => forward(line),
                        OutputStream::Stderr => forward(format!("{ERROR_MARKER} {line}")),
                    }
                }
                Some((stream, Err(e))) => {
                    tracing::warn!(stream = %stream, error = %e, "failed to read worker output");
                    forward(format!("Failed to read {stream}: {e}"));
                }
                None => break,
            }
        }
    }

    tokio::select! {
        _ = cancel.cancelled() => {
            let _ = child.kill().await;
            Ok(WorkerExit::Cancelled)
        }
        status = child.wait() => {
            let status = status.map_err(WorkerError::Wait)?;
            tracing::info!(%status, "worker exited");
            Ok(WorkerExit::Exited(status))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_strips_shell_wrappers() {
        let cmd = WorkerCommand::parse("/bin/sh -c python3 handler.py --rp_serve_api").unwrap();
        assert_eq!(cmd.program(), "python3");
        assert_eq!(cmd.args(), &["handler.py", "--rp_serve_api"]);
        assert_eq!(cmd.to_string(), "python3 handler.py --rp_serve_api");

        let cmd = WorkerCommand::parse("/bin/bash -o pipefail -c node 'index file.js'").unwrap();
        assert_eq!(cmd.program(), "node");
        assert_eq!(cmd.args(), &["index file.js"]);
    }

    #[test]
    fn parse_rejects_empty_and_unbalanced() {
        assert!(matches!(WorkerCommand::parse("   "), Err(WorkerError::EmptyCommand)));
        assert!(matches!(
            WorkerCommand::parse("echo 'unterminated"),
            Err(WorkerError::Parse(_))
        ));
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let cmd = WorkerCommand::parse("/definitely/not/a/real/binary").unwrap();
        let err = run_worker(&cmd, None, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::Spawn { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exit_status_is_returned() {
        let cmd = WorkerCommand::parse("sh -c 'exit 3'").unwrap();
        let exit = run_worker(&cmd, None, CancellationToken::new()).await.unwrap();
        match exit {
            WorkerExit::Exited(status) => assert_eq!(status.code(), Some(3)),
            other => panic!("unexpected exit: {other:?}"),
        }
    }
}
