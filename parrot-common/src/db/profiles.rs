//! Voice profile records (written only by the train-voice consumer)
//!
//! `voice_id` is the primary key, so every transition is an upsert on the
//! single row for that voice: re-training replaces the active profile.

use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::models::{ProfileStatus, VoiceProfile};
use crate::time::parse_rfc3339;
use crate::Result;

const COLUMNS: &str =
    "voice_id, model_ref, status, source_sample_id, failure_reason, created_at, updated_at";

fn from_row(row: &SqliteRow) -> Result<VoiceProfile> {
    let status: String = row.get("status");
    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");

    Ok(VoiceProfile {
        voice_id: row.get("voice_id"),
        model_ref: row.get("model_ref"),
        status: status.parse()?,
        source_sample_id: row.get("source_sample_id"),
        failure_reason: row.get("failure_reason"),
        created_at: parse_rfc3339(&created_at)?,
        updated_at: parse_rfc3339(&updated_at)?,
    })
}

pub async fn get(pool: &SqlitePool, voice_id: &str) -> Result<Option<VoiceProfile>> {
    let row = sqlx::query(&format!("SELECT {} FROM voice_profiles WHERE voice_id = ?", COLUMNS))
        .bind(voice_id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(from_row).transpose()
}

pub async fn list(pool: &SqlitePool) -> Result<Vec<VoiceProfile>> {
    let rows = sqlx::query(&format!("SELECT {} FROM voice_profiles ORDER BY voice_id", COLUMNS))
        .fetch_all(pool)
        .await?;
    rows.iter().map(from_row).collect()
}

/// Training started from `sample_id`; the previous model reference is kept until replaced
pub async fn mark_training(pool: &SqlitePool, voice_id: &str, sample_id: &str) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    sqlx::query(
        r#"
        INSERT INTO voice_profiles (voice_id, model_ref, status, source_sample_id, failure_reason, created_at, updated_at)
        VALUES (?, NULL, ?, ?, NULL, ?, ?)
        ON CONFLICT(voice_id) DO UPDATE SET
            status = excluded.status,
            source_sample_id = excluded.source_sample_id,
            failure_reason = NULL,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(voice_id)
    .bind(ProfileStatus::Training.as_str())
    .bind(sample_id)
    .bind(&now)
    .bind(&now)
    .execute(pool)
    .await?;
    Ok(())
}

/// Training finished; `model_ref` becomes the active profile
pub async fn mark_trained(
    pool: &SqlitePool,
    voice_id: &str,
    model_ref: &str,
    sample_id: &str,
) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    sqlx::query(
        r#"
        INSERT INTO voice_profiles (voice_id, model_ref, status, source_sample_id, failure_reason, created_at, updated_at)
        VALUES (?, ?, ?, ?, NULL, ?, ?)
        ON CONFLICT(voice_id) DO UPDATE SET
            model_ref = excluded.model_ref,
            status = excluded.status,
            source_sample_id = excluded.source_sample_id,
            failure_reason = NULL,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(voice_id)
    .bind(model_ref)
    .bind(ProfileStatus::Trained.as_str())
    .bind(sample_id)
    .bind(&now)
    .bind(&now)
    .execute(pool)
    .await?;
    Ok(())
}

/// Training failed terminally or exhausted its retries
pub async fn mark_failed(pool: &SqlitePool, voice_id: &str, reason: &str) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    sqlx::query(
        r#"
        INSERT INTO voice_profiles (voice_id, model_ref, status, source_sample_id, failure_reason, created_at, updated_at)
        VALUES (?, NULL, ?, NULL, ?, ?, ?)
        ON CONFLICT(voice_id) DO UPDATE SET
            status = excluded.status,
            failure_reason = excluded.failure_reason,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(voice_id)
    .bind(ProfileStatus::Failed.as_str())
    .bind(reason)
    .bind(&now)
    .bind(&now)
    .execute(pool)
    .await?;
    Ok(())
}
