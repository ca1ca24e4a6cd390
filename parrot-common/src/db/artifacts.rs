//! Output artifact records (written only by the create-output consumer)

use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use super::{to_i64, to_u64};
use crate::models::{ArtifactStatus, CloneStatus, OutputArtifact};
use crate::time::parse_rfc3339;
use crate::Result;

const COLUMNS: &str = "id, clone_request_id, job_id, storage_key, version, checksum, size_bytes, \
                       content_type, status, failure_reason, created_at, updated_at";

/// Values recorded once the artifact bytes are durably stored
#[derive(Debug, Clone)]
pub struct StoredOutput<'a> {
    pub version: u64,
    pub checksum: &'a str,
    pub size_bytes: u64,
    pub content_type: &'a str,
}

fn from_row(row: &SqliteRow) -> Result<OutputArtifact> {
    let status: String = row.get("status");
    let version: Option<i64> = row.get("version");
    let size_bytes: Option<i64> = row.get("size_bytes");
    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");

    Ok(OutputArtifact {
        id: row.get("id"),
        clone_request_id: row.get("clone_request_id"),
        job_id: row.get("job_id"),
        storage_key: row.get("storage_key"),
        version: version.map(|v| to_u64(v, "version")).transpose()?,
        checksum: row.get("checksum"),
        size_bytes: size_bytes.map(|v| to_u64(v, "size_bytes")).transpose()?,
        content_type: row.get("content_type"),
        status: status.parse()?,
        failure_reason: row.get("failure_reason"),
        created_at: parse_rfc3339(&created_at)?,
        updated_at: parse_rfc3339(&updated_at)?,
    })
}

/// Create the pending artifact for a create-output job
///
/// `job_id` is unique: a redelivered job gets back the artifact its first
/// delivery created instead of a second row.
pub async fn create_pending(
    pool: &SqlitePool,
    clone_request_id: &str,
    job_id: &str,
    storage_key: &str,
) -> Result<OutputArtifact> {
    let now = Utc::now().to_rfc3339();
    sqlx::query(
        r#"
        INSERT INTO output_artifacts (
            id, clone_request_id, job_id, storage_key, status, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(job_id) DO NOTHING
        "#,
    )
    .bind(uuid::Uuid::new_v4().to_string())
    .bind(clone_request_id)
    .bind(job_id)
    .bind(storage_key)
    .bind(ArtifactStatus::Pending.as_str())
    .bind(&now)
    .bind(&now)
    .execute(pool)
    .await?;

    get_by_job(pool, job_id).await?.ok_or_else(|| {
        crate::Error::Internal(format!("Artifact for job {} vanished after insert", job_id))
    })
}

pub async fn get(pool: &SqlitePool, id: &str) -> Result<Option<OutputArtifact>> {
    let row = sqlx::query(&format!("SELECT {} FROM output_artifacts WHERE id = ?", COLUMNS))
        .bind(id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(from_row).transpose()
}

pub async fn get_by_job(pool: &SqlitePool, job_id: &str) -> Result<Option<OutputArtifact>> {
    let row = sqlx::query(&format!("SELECT {} FROM output_artifacts WHERE job_id = ?", COLUMNS))
        .bind(job_id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(from_row).transpose()
}

/// Every artifact produced for a request, oldest first
pub async fn list_for_request(pool: &SqlitePool, clone_request_id: &str) -> Result<Vec<OutputArtifact>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM output_artifacts WHERE clone_request_id = ? ORDER BY created_at, version",
        COLUMNS
    ))
    .bind(clone_request_id)
    .fetch_all(pool)
    .await?;
    rows.iter().map(from_row).collect()
}

/// The stored artifact occupying one version of an output key
pub async fn find_stored_version(
    pool: &SqlitePool,
    storage_key: &str,
    version: u64,
) -> Result<Option<OutputArtifact>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM output_artifacts WHERE storage_key = ? AND version = ? AND status = ?",
        COLUMNS
    ))
    .bind(storage_key)
    .bind(to_i64(version)?)
    .bind(ArtifactStatus::Stored.as_str())
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(from_row).transpose()
}

/// Mark the artifact stored and the clone request done in one transaction
///
/// Returns false when the request has moved on to a newer generation; the
/// artifact is still recorded as stored since its bytes exist.
pub async fn complete(
    pool: &SqlitePool,
    artifact_id: &str,
    clone_request_id: &str,
    generation: u32,
    stored: &StoredOutput<'_>,
) -> Result<bool> {
    let now = Utc::now().to_rfc3339();
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        UPDATE output_artifacts
        SET status = ?, version = ?, checksum = ?, size_bytes = ?, content_type = ?,
            failure_reason = NULL, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(ArtifactStatus::Stored.as_str())
    .bind(to_i64(stored.version)?)
    .bind(stored.checksum)
    .bind(to_i64(stored.size_bytes)?)
    .bind(stored.content_type)
    .bind(&now)
    .bind(artifact_id)
    .execute(&mut *tx)
    .await?;

    let updated = sqlx::query(
        r#"
        UPDATE clone_requests
        SET status = ?, output_artifact_id = ?, failure_reason = NULL, updated_at = ?
        WHERE id = ? AND generation = ?
        "#,
    )
    .bind(CloneStatus::Done.as_str())
    .bind(artifact_id)
    .bind(&now)
    .bind(clone_request_id)
    .bind(i64::from(generation))
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(updated.rows_affected() > 0)
}

pub async fn mark_failed(pool: &SqlitePool, artifact_id: &str, reason: &str) -> Result<()> {
    sqlx::query(
        "UPDATE output_artifacts SET status = ?, failure_reason = ?, updated_at = ? WHERE id = ? AND status != ?",
    )
    .bind(ArtifactStatus::Failed.as_str())
    .bind(reason)
    .bind(Utc::now().to_rfc3339())
    .bind(artifact_id)
    .bind(ArtifactStatus::Stored.as_str())
    .execute(pool)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{clones, init_database};
    use crate::models::CloneRequest;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, SqlitePool) {
        let dir = TempDir::new().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("t.db").display());
        let pool = init_database(&url).await.unwrap();

        let now = Utc::now();
        clones::create(
            &pool,
            &CloneRequest {
                id: "r1".to_string(),
                voice_id: "v1".to_string(),
                text: "hi".to_string(),
                status: CloneStatus::Cloning,
                generation: 1,
                result_key: None,
                result_version: None,
                output_artifact_id: None,
                failure_reason: None,
                created_at: now,
                updated_at: now,
            },
        )
        .await
        .unwrap();
        (dir, pool)
    }

    fn stored() -> StoredOutput<'static> {
        StoredOutput {
            version: 1,
            checksum: "abc123",
            size_bytes: 42,
            content_type: "audio/mpeg",
        }
    }

    #[tokio::test]
    async fn test_create_pending_is_idempotent_per_job() {
        let (_dir, pool) = setup().await;
        let first = create_pending(&pool, "r1", "output:r1:g1", "v1/output-r1").await.unwrap();
        let second = create_pending(&pool, "r1", "output:r1:g1", "v1/output-r1").await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(list_for_request(&pool, "r1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_complete_marks_request_done() {
        let (_dir, pool) = setup().await;
        let artifact = create_pending(&pool, "r1", "output:r1:g1", "v1/output-r1").await.unwrap();

        assert!(complete(&pool, &artifact.id, "r1", 1, &stored()).await.unwrap());

        let artifact = get(&pool, &artifact.id).await.unwrap().unwrap();
        assert_eq!(artifact.status, ArtifactStatus::Stored);
        assert_eq!(artifact.version, Some(1));
        assert_eq!(artifact.size_bytes, Some(42));

        let request = clones::get(&pool, "r1").await.unwrap().unwrap();
        assert_eq!(request.status, CloneStatus::Done);
        assert_eq!(request.output_artifact_id.as_deref(), Some(artifact.id.as_str()));
    }

    #[tokio::test]
    async fn test_complete_for_stale_generation_leaves_request() {
        let (_dir, pool) = setup().await;
        let artifact = create_pending(&pool, "r1", "output:r1:g7", "v1/output-r1").await.unwrap();

        assert!(!complete(&pool, &artifact.id, "r1", 7, &stored()).await.unwrap());
        let request = clones::get(&pool, "r1").await.unwrap().unwrap();
        assert_eq!(request.status, CloneStatus::Cloning);
    }

    #[tokio::test]
    async fn test_mark_failed_does_not_demote_stored() {
        let (_dir, pool) = setup().await;
        let artifact = create_pending(&pool, "r1", "output:r1:g1", "v1/output-r1").await.unwrap();
        complete(&pool, &artifact.id, "r1", 1, &stored()).await.unwrap();

        mark_failed(&pool, &artifact.id, "late failure").await.unwrap();
        let artifact = get(&pool, &artifact.id).await.unwrap().unwrap();
        assert_eq!(artifact.status, ArtifactStatus::Stored);
    }

    #[tokio::test]
    async fn test_find_stored_version() {
        let (_dir, pool) = setup().await;
        let artifact = create_pending(&pool, "r1", "output:r1:g1", "v1/output-r1").await.unwrap();
        assert!(find_stored_version(&pool, "v1/output-r1", 1).await.unwrap().is_none());

        complete(&pool, &artifact.id, "r1", 1, &stored()).await.unwrap();
        let found = find_stored_version(&pool, "v1/output-r1", 1).await.unwrap().unwrap();
        assert_eq!(found.id, artifact.id);
        assert!(find_stored_version(&pool, "v1/output-r1", 2).await.unwrap().is_none());
    }
}
