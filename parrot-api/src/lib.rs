//! parrot-api library - Front-Door HTTP API
//!
//! The only synchronous entry point to the pipeline: sample uploads, clone
//! submission, status queries and signed output retrieval. Handlers read and
//! write the metadata store and enqueue jobs; they never call the synthesis
//! provider.

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::Router;
use chrono::{DateTime, Utc};
use parrot_common::config::PipelineConfig;
use parrot_common::queue::SqliteQueue;
use parrot_common::storage::ObjectStore;
use sqlx::SqlitePool;
use tower_http::trace::TraceLayer;

pub mod api;
pub mod error;

pub use crate::error::{ApiError, ApiResult};

/// Application state shared across HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<PipelineConfig>,
    pub db: SqlitePool,
    pub queue: SqliteQueue,
    pub store: ObjectStore,
    /// Service startup timestamp for uptime reporting
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(config: Arc<PipelineConfig>, db: SqlitePool) -> Self {
        let queue = SqliteQueue::new(db.clone(), config.queues.visibility_timeout());
        let store = ObjectStore::new(config.storage.root.clone());
        Self {
            config,
            db,
            queue,
            store,
            started_at: Utc::now(),
        }
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    use axum::routing::{get, post, put};

    let upload_limit = state.config.api.max_upload_bytes;

    let uploads = Router::new()
        .route("/samples/:voice_id/:file_name", put(api::upload_sample))
        .layer(DefaultBodyLimit::max(upload_limit));

    Router::new()
        .route("/health", get(api::health_check))
        .route("/clones", post(api::submit_clone))
        .route("/clones/:id", get(api::get_clone))
        .route("/clones/:id/output", get(api::get_clone_output))
        .route("/clones/:id/regenerate", post(api::regenerate_clone))
        .route("/artifacts/:id", get(api::get_artifact))
        .route("/voices", get(api::list_voices))
        .route("/voices/:voice_id", get(api::get_voice))
        .route("/jobs/*job_id", get(api::get_job))
        .route("/dead-letters", get(api::list_dead_letters))
        .route("/outputs/*key", get(api::download_output))
        .merge(uploads)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
