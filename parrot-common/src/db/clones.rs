//! Clone request records
//!
//! Updates issued by consumers carry the generation of the job that issued
//! them. A stale job (from before a regenerate) matches no row and the update
//! reports `false`, which the caller treats as an absorbed duplicate.

use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use super::{to_i64, to_u64};
use crate::models::{CloneRequest, CloneStatus};
use crate::time::parse_rfc3339;
use crate::Result;

const COLUMNS: &str = "id, voice_id, text, status, generation, result_key, result_version, \
                       output_artifact_id, failure_reason, created_at, updated_at";

fn from_row(row: &SqliteRow) -> Result<CloneRequest> {
    let status: String = row.get("status");
    let generation: i64 = row.get("generation");
    let result_version: Option<i64> = row.get("result_version");
    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");

    Ok(CloneRequest {
        id: row.get("id"),
        voice_id: row.get("voice_id"),
        text: row.get("text"),
        status: status.parse()?,
        generation: u32::try_from(generation).map_err(|_| {
            crate::Error::Internal(format!("Invalid generation {} in clone_requests", generation))
        })?,
        result_key: row.get("result_key"),
        result_version: result_version
            .map(|v| to_u64(v, "result_version"))
            .transpose()?,
        output_artifact_id: row.get("output_artifact_id"),
        failure_reason: row.get("failure_reason"),
        created_at: parse_rfc3339(&created_at)?,
        updated_at: parse_rfc3339(&updated_at)?,
    })
}

pub async fn create(pool: &SqlitePool, request: &CloneRequest) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO clone_requests (
            id, voice_id, text, status, generation, result_key, result_version,
            output_artifact_id, failure_reason, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&request.id)
    .bind(&request.voice_id)
    .bind(&request.text)
    .bind(request.status.as_str())
    .bind(i64::from(request.generation))
    .bind(&request.result_key)
    .bind(request.result_version.map(to_i64).transpose()?)
    .bind(&request.output_artifact_id)
    .bind(&request.failure_reason)
    .bind(request.created_at.to_rfc3339())
    .bind(request.updated_at.to_rfc3339())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get(pool: &SqlitePool, id: &str) -> Result<Option<CloneRequest>> {
    let row = sqlx::query(&format!("SELECT {} FROM clone_requests WHERE id = ?", COLUMNS))
        .bind(id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(from_row).transpose()
}

/// Requests waiting for the voice's profile to finish training, oldest first
pub async fn list_queued_for_voice(pool: &SqlitePool, voice_id: &str) -> Result<Vec<CloneRequest>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM clone_requests WHERE voice_id = ? AND status = ? ORDER BY created_at, id",
        COLUMNS
    ))
    .bind(voice_id)
    .bind(CloneStatus::Queued.as_str())
    .fetch_all(pool)
    .await?;
    rows.iter().map(from_row).collect()
}

/// Synthesis started for `generation`
pub async fn mark_cloning(pool: &SqlitePool, id: &str, generation: u32) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE clone_requests
        SET status = ?, failure_reason = NULL, updated_at = ?
        WHERE id = ? AND generation = ? AND status IN ('queued', 'cloning')
        "#,
    )
    .bind(CloneStatus::Cloning.as_str())
    .bind(Utc::now().to_rfc3339())
    .bind(id)
    .bind(i64::from(generation))
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Record where the raw synthesis result for `generation` was written
pub async fn record_result(
    pool: &SqlitePool,
    id: &str,
    generation: u32,
    result_key: &str,
    result_version: u64,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE clone_requests
        SET result_key = ?, result_version = ?, updated_at = ?
        WHERE id = ? AND generation = ?
        "#,
    )
    .bind(result_key)
    .bind(to_i64(result_version)?)
    .bind(Utc::now().to_rfc3339())
    .bind(id)
    .bind(i64::from(generation))
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn mark_failed(pool: &SqlitePool, id: &str, generation: u32, reason: &str) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE clone_requests
        SET status = ?, failure_reason = ?, updated_at = ?
        WHERE id = ? AND generation = ? AND status != 'done'
        "#,
    )
    .bind(CloneStatus::Failed.as_str())
    .bind(reason)
    .bind(Utc::now().to_rfc3339())
    .bind(id)
    .bind(i64::from(generation))
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Fail every request still waiting on a voice whose training failed
pub async fn fail_queued_for_voice(pool: &SqlitePool, voice_id: &str, reason: &str) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE clone_requests SET status = ?, failure_reason = ?, updated_at = ? WHERE voice_id = ? AND status = ?",
    )
    .bind(CloneStatus::Failed.as_str())
    .bind(reason)
    .bind(Utc::now().to_rfc3339())
    .bind(voice_id)
    .bind(CloneStatus::Queued.as_str())
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// Start a new generation of a finished request
///
/// Returns the new generation, or `None` when the request is missing or still
/// in progress. The previous output artifact stays referenced until the new
/// generation completes.
pub async fn regenerate(pool: &SqlitePool, id: &str) -> Result<Option<u32>> {
    let generation: Option<i64> = sqlx::query_scalar(
        r#"
        UPDATE clone_requests
        SET status = ?, generation = generation + 1, result_key = NULL,
            result_version = NULL, failure_reason = NULL, updated_at = ?
        WHERE id = ? AND status IN ('done', 'failed')
        RETURNING generation
        "#,
    )
    .bind(CloneStatus::Queued.as_str())
    .bind(Utc::now().to_rfc3339())
    .bind(id)
    .fetch_optional(pool)
    .await?;

    generation
        .map(|g| {
            u32::try_from(g)
                .map_err(|_| crate::Error::Internal(format!("Invalid generation {}", g)))
        })
        .transpose()
}
