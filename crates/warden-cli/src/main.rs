mod config;
mod run_cmd;
mod serve_cmd;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};

use warden_core::worker::WorkerCommand;

use config::{Overrides, WardenConfig};

#[derive(Parser)]
#[command(name = "warden", about = "Local test-harness supervisor for polling job workers")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a warden config file
    Init {
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Start the worker and supervise a full test run
    Run {
        /// Worker command line (overrides WARDEN_COMMAND)
        #[arg(long)]
        command: Option<String>,
        #[command(flatten)]
        server: ServerArgs,
    },
    /// Serve the job API for an externally started worker
    Serve {
        #[command(flatten)]
        server: ServerArgs,
    },
}

#[derive(Args)]
pub struct ServerArgs {
    /// Test catalog: JSON, base64 JSON, or URL:<url> (overrides WARDEN_TESTS)
    #[arg(long)]
    tests: Option<String>,
    /// Address to bind to (overrides WARDEN_BIND)
    #[arg(long)]
    bind: Option<String>,
    /// Port to listen on (overrides WARDEN_PORT)
    #[arg(long)]
    port: Option<u16>,
}

impl ServerArgs {
    fn into_overrides(self, command: Option<String>) -> Overrides {
        Overrides {
            bind: self.bind,
            port: self.port,
            tests: self.tests,
            command,
        }
    }
}

/// Execute the `warden init` command: write a template config file.
fn cmd_init(force: bool) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let cfg = config::ConfigFile::default();
    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  server = {}:{}", cfg.server.bind, cfg.server.port);
    println!("  report.post_send_delay_secs = {}", cfg.report.post_send_delay_secs);
    println!();
    println!("Next: set report.webhook_url and logs.sink_url, then run `warden run`.");

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { force } => {
            cmd_init(force)?;
        }
        Commands::Run { command, server } => {
            let resolved = WardenConfig::resolve(server.into_overrides(command))?;
            let line = resolved
                .command
                .as_deref()
                .context("no worker command; set WARDEN_COMMAND or pass --command")?;
            let worker = WorkerCommand::parse(line).context("invalid worker command")?;
            run_cmd::run_supervisor(resolved, Some(worker)).await?;
        }
        Commands::Serve { server } => {
            let resolved = WardenConfig::resolve(server.into_overrides(None))?;
            run_cmd::run_supervisor(resolved, None).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod test_util {
    use std::sync::{Mutex, MutexGuard};

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    /// Serialise tests that mutate process environment variables.
    pub fn lock_env() -> MutexGuard<'static, ()> {
        ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner())
    }
}
