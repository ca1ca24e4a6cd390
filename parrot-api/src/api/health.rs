//! Health check endpoint

use std::collections::BTreeMap;

use axum::{extract::State, Json};
use chrono::Utc;
use parrot_common::queue::QueueDepth;
use serde::Serialize;
use tracing::warn;

use crate::AppState;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub module: String,
    pub version: String,
    pub git_hash: String,
    pub uptime_secs: i64,
    /// Unfinished messages per queue; empty when the store is unreachable
    pub queues: BTreeMap<String, QueueDepth>,
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let mut status = "ok";
    let mut queues = BTreeMap::new();

    for name in state.config.queues.all() {
        match state.queue.depth(name).await {
            Ok(depth) => {
                queues.insert(name.to_string(), depth);
            }
            Err(e) => {
                warn!(queue = name, error = %e, "Queue depth unavailable");
                status = "degraded";
                queues.clear();
                break;
            }
        }
    }

    Json(HealthResponse {
        status: status.to_string(),
        module: "parrot-api".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        git_hash: env!("GIT_HASH").to_string(),
        uptime_secs: (Utc::now() - state.started_at).num_seconds(),
        queues,
    })
}
