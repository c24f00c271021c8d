use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tpsync_core::{RunMode, RunStatus};
use tpsync_sync::{build_orchestrator, run_sync_once_from_env, SyncConfig, SyncScheduler};
use tpsync_web::{serve, web_port_from_env, AppState};
use tracing::{error, info, warn};

#[derive(Debug, Parser)]
#[command(name = "tpsync")]
#[command(about = "Sync Metabase reports and JSON feeds into the teacher portal tables")]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    /// Run once and exit instead of starting the scheduler.
    #[arg(short = 'm', long)]
    manual: bool,
    /// With --manual, skip heavy jobs.
    #[arg(long, requires = "manual", conflicts_with = "job")]
    light: bool,
    /// With --manual, run only this job.
    #[arg(long, requires = "manual")]
    job: Option<String>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Serve the HTTP sync trigger.
    Serve {
        /// Also run the cron schedule in this process.
        #[arg(long)]
        schedule: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    if let Err(err) = init_tracing() {
        eprintln!("{err:#}");
        return ExitCode::from(1);
    }

    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            error!("{err:#}");
            eprintln!("error: {err:#}");
            ExitCode::from(1)
        }
    }
}

fn init_tracing() -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|error| anyhow::anyhow!("failed to initialize tracing subscriber: {error}"))
}

async fn run(cli: Cli) -> Result<ExitCode> {
    if cli.manual {
        let mode = match (cli.job, cli.light) {
            (Some(job), _) => RunMode::Job(job),
            (None, true) => RunMode::Lightweight,
            (None, false) => RunMode::Full,
        };
        let summary = run_sync_once_from_env(mode).await?;
        println!("{}", summary.render_table());
        return Ok(ExitCode::from(exit_code(summary.status)));
    }

    let config = SyncConfig::from_env()?;
    let orchestrator = Arc::new(build_orchestrator(&config).await?);

    if let Some(Commands::Serve { schedule }) = cli.command {
        let scheduler = if schedule {
            Some(SyncScheduler::new(orchestrator.clone(), config.schedule()).start().await?)
        } else {
            None
        };
        let state = AppState::new(orchestrator)
            .with_trigger_token(std::env::var("TPSYNC_TRIGGER_TOKEN").ok());
        serve(state, web_port_from_env(), shutdown_signal()).await?;
        if let Some(handle) = scheduler {
            handle.shutdown(config.drain_on_shutdown).await?;
        }
        return Ok(ExitCode::SUCCESS);
    }

    let handle = SyncScheduler::new(orchestrator, config.schedule()).start().await?;
    shutdown_signal().await;
    info!(drain = config.drain_on_shutdown, "shutdown requested");
    handle.shutdown(config.drain_on_shutdown).await?;
    Ok(ExitCode::SUCCESS)
}

fn exit_code(status: RunStatus) -> u8 {
    match status {
        RunStatus::Completed => 0,
        RunStatus::PartiallyCompleted => 2,
        _ => 1,
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(%err, "could not listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(%err, "could not listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
