//! Exposes the command line application.
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use pinion_service::config::Config;
use pinion_service::engine::LogEngine;
use pinion_service::logging;
use pinion_service::metrics;
use pinion_service::service::Pinion;

/// Command line interface parser.
#[derive(Debug, Parser)]
#[command(version, about = "Keeps OrbitDB stores requested in a pubsub room pinned")]
pub struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, value_name = "FILE", env = "PINION_CONFIG")]
    pub config: Option<PathBuf>,
}

impl Cli {
    /// Returns the path to the configuration file.
    pub fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// Loads the configuration file and applies the `PINION_*` environment variables on top.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let mut config = Config::get(path).context("failed loading config")?;
    config.apply_env()?;
    config.validate()?;
    Ok(config)
}

/// Runs the pinner with the engine created by `make_engine`, and exits the process.
pub fn main<F>(make_engine: F) -> !
where
    F: FnOnce(&Config) -> Result<Arc<dyn LogEngine>>,
{
    match execute(Cli::parse(), make_engine) {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            eprintln!("Pinion crashed. Exiting...");
            std::process::exit(1);
        }
    }
}

/// Runs the main application until it receives a shutdown signal.
pub fn execute<F>(cli: Cli, make_engine: F) -> Result<()>
where
    F: FnOnce(&Config) -> Result<Arc<dyn LogEngine>>,
{
    let config = load_config(cli.config())?;

    let _sentry = logging::init_sentry(&config);
    // SAFETY: The runtime is not started yet, so this is still single-threaded.
    unsafe { logging::init_logging(&config) };
    metrics::configure(&config.metrics).context("failed to configure metrics")?;

    let engine = make_engine(&config).context("failed to create the log engine")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create the runtime")?;
    runtime.block_on(run(config, engine, shutdown_signal()))
}

/// Runs the pinner until `shutdown` resolves, then stops it.
pub async fn run(
    config: Config,
    engine: Arc<dyn LogEngine>,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    let pinion = Pinion::new(&config, engine)?;
    pinion.start().await.context("failed to start the pinner")?;
    tracing::info!(room = %config.room, "pinion is running");

    shutdown.await;

    tracing::info!("shutting down");
    pinion.stop().await
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(
            error = &error as &dyn std::error::Error,
            "failed to listen for the shutdown signal"
        );
        std::future::pending::<()>().await;
    }
}
