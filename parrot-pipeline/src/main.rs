//! parrot-pipeline - voice cloning pipeline workers
//!
//! Runs the sample-ingestion trigger and the three stage consumers against
//! the shared metadata store until Ctrl+C or SIGTERM. In-progress jobs finish
//! before the process exits; anything left leased is redelivered to the next
//! run once its lease expires.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use parrot_common::config::{PipelineConfig, Stage};
use parrot_common::logging::init_tracing;
use parrot_common::shutdown::shutdown_signal;
use parrot_pipeline::{ElevenLabsClient, Pipeline, StageContext};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "parrot-pipeline")]
#[command(about = "Voice cloning pipeline workers", long_about = None)]
#[command(version)]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, env = "PARROT_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = PipelineConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    init_tracing(&config.logging)?;

    info!(
        "Starting parrot-pipeline v{} [{}] built {} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_PROFILE")
    );
    info!(stage = %String::from(config.stage.clone()), database = %config.database.url, "Configuration resolved");
    if config.provider.api_key.is_empty() && config.stage != Stage::Local {
        warn!("Provider API key is empty; provider calls will be rejected");
    }

    let provider = ElevenLabsClient::new(&config.provider).context("Failed to build provider client")?;
    let ctx = StageContext::connect(Arc::new(config), Arc::new(provider))
        .await
        .context("Failed to open metadata store")?;

    let cancel = CancellationToken::new();
    let pipeline = Pipeline::new(ctx);
    let workers = tokio::spawn(pipeline.run(cancel.clone()));

    shutdown_signal().await;
    cancel.cancel();
    workers.await.context("Pipeline task failed")?;

    info!("parrot-pipeline stopped");
    Ok(())
}
