//! Database initialization
//!
//! Opens (creating if needed) the SQLite metadata store and creates every
//! table the pipeline uses. Table creation is idempotent, so both binaries
//! run it at startup.

use crate::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// Connect to the metadata store and create tables if needed
pub async fn init_database(database_url: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        // WAL allows concurrent readers with one writer across worker tasks
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_millis(5000))
        .foreign_keys(true);

    if let Some(parent) = options.get_filename().parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(10)
        .connect_with(options)
        .await?;

    create_voice_samples_table(&pool).await?;
    create_voice_profiles_table(&pool).await?;
    create_clone_requests_table(&pool).await?;
    create_output_artifacts_table(&pool).await?;
    create_processed_jobs_table(&pool).await?;
    create_queue_tables(&pool).await?;

    info!("Metadata store ready: {}", database_url);
    Ok(pool)
}

async fn create_voice_samples_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS voice_samples (
            id TEXT PRIMARY KEY,
            voice_id TEXT NOT NULL,
            bucket TEXT NOT NULL,
            storage_key TEXT NOT NULL,
            object_version INTEGER NOT NULL,
            size_bytes INTEGER NOT NULL,
            status TEXT NOT NULL,
            failure_reason TEXT,
            uploaded_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_voice_samples_voice ON voice_samples(voice_id, uploaded_at)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_voice_profiles_table(pool: &SqlitePool) -> Result<()> {
    // voice_id is the primary key: one profile per voice, re-training updates in place
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS voice_profiles (
            voice_id TEXT PRIMARY KEY,
            model_ref TEXT,
            status TEXT NOT NULL,
            source_sample_id TEXT,
            failure_reason TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_clone_requests_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS clone_requests (
            id TEXT PRIMARY KEY,
            voice_id TEXT NOT NULL,
            text TEXT NOT NULL,
            status TEXT NOT NULL,
            generation INTEGER NOT NULL DEFAULT 1,
            result_key TEXT,
            result_version INTEGER,
            output_artifact_id TEXT,
            failure_reason TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_clone_requests_voice_status ON clone_requests(voice_id, status)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_output_artifacts_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS output_artifacts (
            id TEXT PRIMARY KEY,
            clone_request_id TEXT NOT NULL,
            job_id TEXT NOT NULL UNIQUE,
            storage_key TEXT NOT NULL,
            version INTEGER,
            checksum TEXT,
            size_bytes INTEGER,
            content_type TEXT,
            status TEXT NOT NULL,
            failure_reason TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_output_artifacts_request ON output_artifacts(clone_request_id, created_at)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_processed_jobs_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS processed_jobs (
            job_id TEXT PRIMARY KEY,
            queue TEXT NOT NULL,
            outcome TEXT NOT NULL,
            detail TEXT,
            processed_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_queue_tables(pool: &SqlitePool) -> Result<()> {
    // UNIQUE(queue, message_id) is the deduplication window: a message id is
    // accepted once per queue, for the lifetime of the store
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS queue_messages (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            queue TEXT NOT NULL,
            message_id TEXT NOT NULL,
            group_key TEXT NOT NULL,
            body TEXT NOT NULL,
            state TEXT NOT NULL,
            visible_at INTEGER NOT NULL,
            lease_expires_at INTEGER,
            receive_count INTEGER NOT NULL DEFAULT 0,
            enqueued_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE(queue, message_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_queue_messages_ready ON queue_messages(queue, state, group_key, seq)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_queue_messages_group ON queue_messages(group_key, state)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS dead_letters (
            queue TEXT NOT NULL,
            message_id TEXT NOT NULL,
            group_key TEXT NOT NULL,
            body TEXT NOT NULL,
            reason TEXT NOT NULL,
            attempts INTEGER NOT NULL,
            dead_lettered_at TEXT NOT NULL,
            PRIMARY KEY (queue, message_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_init_creates_all_tables() {
        let dir = TempDir::new().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("nested/parrot.db").display());
        let pool = init_database(&url).await.unwrap();

        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .fetch_all(&pool)
        .await
        .unwrap();

        assert_eq!(
            tables,
            vec![
                "clone_requests",
                "dead_letters",
                "output_artifacts",
                "processed_jobs",
                "queue_messages",
                "voice_profiles",
                "voice_samples",
            ]
        );
    }

    #[tokio::test]
    async fn test_init_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("parrot.db").display());
        init_database(&url).await.unwrap().close().await;
        init_database(&url).await.unwrap();
    }
}
