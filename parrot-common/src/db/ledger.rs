//! Processed-job ledger
//!
//! A job id is recorded once it reaches a final outcome. Consumers check the
//! ledger before doing any work, so a redelivered job is acknowledged without
//! repeating side effects. Entries are never removed.

use sqlx::{Row, SqlitePool};

use crate::time::parse_rfc3339;
use crate::{Error, Result};

/// Final outcome of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    /// Superseded or already applied; acknowledged without side effects
    Absorbed,
    Failed,
    DeadLettered,
}

impl JobOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobOutcome::Completed => "completed",
            JobOutcome::Absorbed => "absorbed",
            JobOutcome::Failed => "failed",
            JobOutcome::DeadLettered => "dead_lettered",
        }
    }

    fn parse(value: &str) -> Result<Self> {
        match value {
            "completed" => Ok(JobOutcome::Completed),
            "absorbed" => Ok(JobOutcome::Absorbed),
            "failed" => Ok(JobOutcome::Failed),
            "dead_lettered" => Ok(JobOutcome::DeadLettered),
            other => Err(Error::Internal(format!("Unknown job outcome '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedJob {
    pub job_id: String,
    pub queue: String,
    pub outcome: JobOutcome,
    pub detail: Option<String>,
    pub processed_at: chrono::DateTime<chrono::Utc>,
}

/// Record a final outcome; returns false if the job was already recorded
pub async fn record(
    pool: &SqlitePool,
    job_id: &str,
    queue: &str,
    outcome: JobOutcome,
    detail: Option<&str>,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        INSERT OR IGNORE INTO processed_jobs (job_id, queue, outcome, detail, processed_at)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(job_id)
    .bind(queue)
    .bind(outcome.as_str())
    .bind(detail)
    .bind(chrono::Utc::now().to_rfc3339())
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn get(pool: &SqlitePool, job_id: &str) -> Result<Option<ProcessedJob>> {
    let row = sqlx::query(
        "SELECT job_id, queue, outcome, detail, processed_at FROM processed_jobs WHERE job_id = ?",
    )
    .bind(job_id)
    .fetch_optional(pool)
    .await?;

    match row {
        Some(row) => {
            let outcome: String = row.get("outcome");
            let processed_at: String = row.get("processed_at");
            Ok(Some(ProcessedJob {
                job_id: row.get("job_id"),
                queue: row.get("queue"),
                outcome: JobOutcome::parse(&outcome)?,
                detail: row.get("detail"),
                processed_at: parse_rfc3339(&processed_at)?,
            }))
        }
        None => Ok(None),
    }
}

pub async fn is_processed(pool: &SqlitePool, job_id: &str) -> Result<bool> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM processed_jobs WHERE job_id = ?")
        .bind(job_id)
        .fetch_one(pool)
        .await?;
    Ok(count > 0)
}
