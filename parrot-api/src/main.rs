//! parrot-api - Front-Door HTTP API
//!
//! Accepts sample uploads and clone requests, reports status, and serves
//! stored outputs through signed references. Shares the metadata database
//! and storage root with parrot-pipeline.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use parrot_api::{build_router, AppState};
use parrot_common::config::PipelineConfig;
use parrot_common::db::init_database;
use parrot_common::logging::init_tracing;
use parrot_common::shutdown::shutdown_signal;
use tracing::{info, warn};

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "parrot-api")]
#[command(about = "Voice cloning front-door API", long_about = None)]
#[command(version)]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, env = "PARROT_CONFIG")]
    config: Option<PathBuf>,

    /// Bind address (overrides api.bind)
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = PipelineConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(bind) = args.bind {
        config.api.bind = bind;
    }
    init_tracing(&config.logging)?;

    info!(
        "Starting parrot-api v{} [{}] built {} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_PROFILE")
    );
    if config.storage.signing_secret.is_empty() {
        warn!("storage.signing_secret is empty; output references are not protected");
    }

    let db = init_database(&config.database.url)
        .await
        .context("Failed to open metadata store")?;

    let bind = config.api.bind.clone();
    let state = AppState::new(Arc::new(config), db);
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("Failed to bind {}", bind))?;
    info!("parrot-api listening on http://{}", bind);
    info!("Health check: http://{}/health", bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("parrot-api stopped");
    Ok(())
}
