//! scribe command-line entry point
//!
//! `serve` runs the HTTP API (with an in-process janitor), `worker` runs a
//! pool of execution slots, `janitor` runs the cleanup loop standalone, and
//! `check` validates the effective configuration.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use scribe_api::AppState;
use scribe_core::{Config, EngineConfig, Janitor, MockEngine, TranscriptionEngine, Worker};

#[derive(Parser)]
#[command(name = "scribe", version, about = "Asynchronous transcription service")]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(short, long, global = true, env = "SCRIBE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP API server
    Serve,

    /// Run a worker process
    Worker {
        /// Execution slots, overriding the configured concurrency
        #[arg(long)]
        concurrency: Option<usize>,

        /// Use the canned mock engine regardless of configuration
        #[arg(long)]
        mock_engine: bool,
    },

    /// Run the cleanup loop standalone
    Janitor,

    /// Validate configuration and print the effective values
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::from_env()?,
    };

    match cli.command {
        Command::Serve => scribe_api::run(config).await?,
        Command::Worker {
            concurrency,
            mock_engine,
        } => run_worker(config, concurrency, mock_engine).await?,
        Command::Janitor => run_janitor(config).await?,
        Command::Check => {
            config.validate()?;
            println!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

/// Spawn the configured number of execution slots and wait for all of them
/// to recycle; the surrounding supervisor restarts the process.
async fn run_worker(
    mut config: Config,
    concurrency: Option<usize>,
    mock_engine: bool,
) -> anyhow::Result<()> {
    if let Some(n) = concurrency {
        config.worker.concurrency = n;
    }
    if mock_engine {
        config.engine.kind = "mock".to_string();
    }
    config.validate()?;

    let state = AppState::from_config(config.clone()).await?;
    let mut slots = tokio::task::JoinSet::new();

    for slot in 0..config.worker.concurrency {
        // One engine instance per slot; the engine is only ever called
        // serially from its own slot
        let engine = build_engine(&config.engine)?;
        let worker = Worker::new(
            state.registry.clone(),
            state.queue.clone(),
            state.cache.clone(),
            state.blob.clone(),
            state.telemetry.clone(),
            engine,
            config.worker.clone(),
        );
        info!(slot, worker_id = %worker.id, "starting execution slot");
        slots.spawn(async move { worker.run().await });
    }

    while let Some(joined) = slots.join_next().await {
        joined??;
    }

    info!("all slots recycled, exiting for supervisor restart");
    Ok(())
}

async fn run_janitor(config: Config) -> anyhow::Result<()> {
    let state = AppState::from_config(config.clone()).await?;
    let janitor = Janitor::new(
        state.registry.clone(),
        state.queue.clone(),
        state.blob.clone(),
        config.janitor.clone(),
        config.registry.clone(),
    );
    janitor.run().await;
    Ok(())
}

/// The transcription engine itself is wired in at deployment time; this
/// binary ships with the canned mock used by tests and smoke checks.
fn build_engine(config: &EngineConfig) -> anyhow::Result<Arc<dyn TranscriptionEngine>> {
    match config.kind.as_str() {
        "mock" => Ok(Arc::new(MockEngine::canned())),
        other => anyhow::bail!(
            "unknown engine kind {:?} (model={}, device={}, precision={}); supported here: \"mock\"",
            other,
            config.model,
            config.device,
            config.precision
        ),
    }
}
