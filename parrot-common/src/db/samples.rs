//! Voice sample records (created `pending` by the upload gateway, advanced by
//! the sample-ingestion trigger)

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use super::{to_i64, to_u64};
use crate::models::{SampleStatus, VoiceSample};
use crate::time::parse_rfc3339;
use crate::Result;

const COLUMNS: &str = "id, voice_id, bucket, storage_key, object_version, size_bytes, status, \
                       failure_reason, uploaded_at, updated_at";

fn from_row(row: &SqliteRow) -> Result<VoiceSample> {
    let status: String = row.get("status");
    let uploaded_at: String = row.get("uploaded_at");
    let updated_at: String = row.get("updated_at");

    Ok(VoiceSample {
        id: row.get("id"),
        voice_id: row.get("voice_id"),
        bucket: row.get("bucket"),
        storage_key: row.get("storage_key"),
        object_version: to_u64(row.get("object_version"), "object_version")?,
        size_bytes: to_u64(row.get("size_bytes"), "size_bytes")?,
        status: status.parse()?,
        failure_reason: row.get("failure_reason"),
        uploaded_at: parse_rfc3339(&uploaded_at)?,
        updated_at: parse_rfc3339(&updated_at)?,
    })
}

/// Insert the sample if its id is new; returns the stored row either way
pub async fn record(pool: &SqlitePool, sample: &VoiceSample) -> Result<VoiceSample> {
    sqlx::query(
        r#"
        INSERT INTO voice_samples (
            id, voice_id, bucket, storage_key, object_version, size_bytes,
            status, failure_reason, uploaded_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO NOTHING
        "#,
    )
    .bind(&sample.id)
    .bind(&sample.voice_id)
    .bind(&sample.bucket)
    .bind(&sample.storage_key)
    .bind(to_i64(sample.object_version)?)
    .bind(to_i64(sample.size_bytes)?)
    .bind(sample.status.as_str())
    .bind(&sample.failure_reason)
    .bind(sample.uploaded_at.to_rfc3339())
    .bind(sample.updated_at.to_rfc3339())
    .execute(pool)
    .await?;

    get(pool, &sample.id)
        .await?
        .ok_or_else(|| crate::Error::Internal(format!("Sample {} vanished after insert", sample.id)))
}

pub async fn get(pool: &SqlitePool, id: &str) -> Result<Option<VoiceSample>> {
    let row = sqlx::query(&format!("SELECT {} FROM voice_samples WHERE id = ?", COLUMNS))
        .bind(id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(from_row).transpose()
}

/// Most recently uploaded sample for a voice
pub async fn latest_for_voice(pool: &SqlitePool, voice_id: &str) -> Result<Option<VoiceSample>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM voice_samples WHERE voice_id = ? ORDER BY uploaded_at DESC, object_version DESC LIMIT 1",
        COLUMNS
    ))
    .bind(voice_id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(from_row).transpose()
}

/// Every sample of a voice, oldest first
pub async fn list_for_voice(pool: &SqlitePool, voice_id: &str) -> Result<Vec<VoiceSample>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM voice_samples WHERE voice_id = ? ORDER BY uploaded_at, object_version",
        COLUMNS
    ))
    .bind(voice_id)
    .fetch_all(pool)
    .await?;
    rows.iter().map(from_row).collect()
}

/// Move a sample to `status`; returns false when the sample does not exist
pub async fn set_status(
    pool: &SqlitePool,
    id: &str,
    status: SampleStatus,
    failure_reason: Option<&str>,
) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE voice_samples SET status = ?, failure_reason = ?, updated_at = ? WHERE id = ?",
    )
    .bind(status.as_str())
    .bind(failure_reason)
    .bind(chrono::Utc::now().to_rfc3339())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}
