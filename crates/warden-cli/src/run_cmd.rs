//! `warden run` / `warden serve`: load the catalog, start the job API and
//! (optionally) the worker, and wait for the run to finish.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use warden_core::logs::{HttpLogSink, LogIngest, LogPipeline};
use warden_core::worker::{self, WorkerCommand, WorkerExit};
use warden_core::{Catalog, CurrentTest, Reporter, ResultSink, RunStatus, Supervisor, WebhookSink};

use crate::config::WardenConfig;
use crate::serve_cmd;

/// Upper bound on joining supervised tasks at shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn run_supervisor(config: WardenConfig, worker: Option<WorkerCommand>) -> Result<()> {
    let client = reqwest::Client::new();
    let reporter = build_reporter(&config, client.clone());

    let catalog = match load_catalog(&config, &client).await {
        Ok(catalog) => catalog,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "cannot start run");
            reporter
                .report(RunStatus::Failed, Some(format!("{e:#}")), Vec::new())
                .await;
            return Err(e);
        }
    };
    tracing::info!(tests = catalog.len(), pod_id = %config.identity.pod_id, "catalog loaded");

    let current = CurrentTest::new();
    let tracker = TaskTracker::new();
    let cancel = CancellationToken::new();

    let ingest = start_log_pipeline(&config, &current, &tracker, &cancel)?;
    let supervisor = Supervisor::new(catalog, reporter, current, tracker.clone(), cancel.clone());

    if let Some(command) = worker {
        spawn_worker(&supervisor, command, ingest, cancel.clone());
    }

    let server_stop = CancellationToken::new();
    let mut server = tokio::spawn(serve_cmd::run_serve(
        supervisor.clone(),
        config.bind.clone(),
        config.port,
        server_stop.clone(),
    ));

    let finished = supervisor.finished();
    let mut interrupted = false;
    let server_exit = tokio::select! {
        _ = finished.cancelled() => {
            tracing::info!("run finished");
            None
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("interrupted");
            interrupted = true;
            None
        }
        res = &mut server => {
            interrupted = true;
            Some(res)
        }
    };

    server_stop.cancel();
    let server_result = match server_exit {
        Some(res) => res,
        None => server.await,
    };
    let server_result = server_result.context("server task panicked").and_then(|r| r);
    if let Err(e) = &server_result {
        tracing::error!(error = %format!("{e:#}"), "server stopped");
    }

    let drain = async {
        if interrupted {
            let reason = match &server_result {
                Err(e) => format!("server stopped: {e:#}"),
                Ok(()) => "supervisor interrupted".to_string(),
            };
            supervisor.abort(reason).await;
        }
        supervisor.shutdown().await;
    };
    if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
        tracing::warn!(
            timeout_secs = DRAIN_TIMEOUT.as_secs(),
            "timed out waiting for background tasks"
        );
    }

    server_result
}

fn build_reporter(config: &WardenConfig, client: reqwest::Client) -> Reporter {
    let sink = config.webhook_url.as_ref().map(|url| {
        Arc::new(WebhookSink::new(client, url.clone(), config.webhook_token.clone()))
            as Arc<dyn ResultSink>
    });
    if sink.is_none() {
        tracing::warn!("no results webhook configured; reports will be dropped");
    }
    Reporter::new(sink, config.identity.clone(), config.post_send_delay)
}

async fn load_catalog(config: &WardenConfig, client: &reqwest::Client) -> Result<Catalog> {
    let raw = config
        .tests
        .as_deref()
        .context("no test catalog; set WARDEN_TESTS or pass --tests")?;
    Catalog::load(client, raw)
        .await
        .context("failed to load test catalog")
}

/// Start the batching loop if a log sink is configured.
fn start_log_pipeline(
    config: &WardenConfig,
    current: &CurrentTest,
    tracker: &TaskTracker,
    cancel: &CancellationToken,
) -> Result<Option<LogIngest>> {
    let Some(url) = &config.log_sink_url else {
        tracing::info!("no log sink configured; worker output goes to the local log only");
        return Ok(None);
    };

    let sink = HttpLogSink::new(url.clone(), config.log_sink_token.clone())
        .context("failed to build log sink client")?;
    let (ingest, pipeline) = LogPipeline::new(
        config.pipeline.clone(),
        Arc::new(sink),
        config.identity.clone(),
        current.clone(),
        tracker.clone(),
    );
    tracker.spawn(pipeline.run(cancel.clone()));
    Ok(Some(ingest))
}

/// Run the worker under the tracker. A worker that stops before the run
/// finished fails the run.
fn spawn_worker(
    supervisor: &Supervisor,
    command: WorkerCommand,
    ingest: Option<LogIngest>,
    cancel: CancellationToken,
) {
    let tracker = supervisor.tracker().clone();
    let supervisor = supervisor.clone();
    tracker.spawn(async move {
        match worker::run_worker(&command, ingest, cancel).await {
            Ok(WorkerExit::Cancelled) => {}
            Ok(WorkerExit::Exited(status)) => {
                supervisor
                    .abort(format!("worker exited ({status}) before all tests completed"))
                    .await;
            }
            Err(e) => {
                tracing::error!(error = %e, "worker failed");
                supervisor.abort(format!("worker failed: {e}")).await;
            }
        }
    });
}
