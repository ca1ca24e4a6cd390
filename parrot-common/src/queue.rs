//! Ordered work queues backed by the metadata store
//!
//! Each named queue holds JSON message bodies in the `queue_messages` table.
//! Delivery guarantees:
//! - **Deduplication:** a message id is accepted once per queue; later sends
//!   with the same id report [`SendOutcome::Duplicate`].
//! - **Group order:** a message is delivered only when it is the oldest
//!   unfinished message of its group across every queue. `seq` is global, so
//!   a clone job sent after a train job for the same voice waits for it.
//! - **Group exclusivity:** while any message of a group holds an unexpired
//!   lease, in any queue, no other message of that group is delivered. Jobs
//!   for one voice therefore never run concurrently across stages.
//! - **At-least-once:** a delivery whose lease expires before it is acked,
//!   retried or dead-lettered becomes receivable again.
//!
//! A receive is a single `UPDATE .. RETURNING`, so concurrent workers never
//! lease the same message.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use tracing::{debug, warn};

use crate::db::retry_on_lock;
use crate::time::{from_millis, now_millis};
use crate::{Error, Result};

/// How long a queue operation keeps retrying SQLite lock contention
const LOCK_WAIT_MS: u64 = 5000;

/// A message that can be carried on a [`SqliteQueue`]
pub trait QueueMessage: Serialize + DeserializeOwned + Send + Sync {
    /// Deduplication key within a queue
    fn message_id(&self) -> &str;

    /// Ordering and exclusivity key
    fn group_key(&self) -> &str;

    /// Failed deliveries recorded in the body
    fn retry_count(&self) -> u32;

    fn set_retry_count(&mut self, retry_count: u32);
}

/// Result of [`SqliteQueue::send`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Enqueued,
    /// The message id was already accepted on this queue
    Duplicate,
}

/// A leased message
#[derive(Debug, Clone)]
pub struct Delivery<M> {
    pub queue: String,
    pub seq: i64,
    /// Deliveries of this message so far, including this one
    pub receive_count: u32,
    pub message: M,
}

/// Lifecycle of a queued message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageState {
    Pending,
    InFlight,
    Acked,
    Dead,
}

impl MessageState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageState::Pending => "pending",
            MessageState::InFlight => "in_flight",
            MessageState::Acked => "acked",
            MessageState::Dead => "dead",
        }
    }

    fn parse(value: &str) -> Result<Self> {
        match value {
            "pending" => Ok(MessageState::Pending),
            "in_flight" => Ok(MessageState::InFlight),
            "acked" => Ok(MessageState::Acked),
            "dead" => Ok(MessageState::Dead),
            other => Err(Error::Internal(format!("Unknown message state '{}'", other))),
        }
    }
}

/// Where a message currently is
#[derive(Debug, Clone, PartialEq)]
pub struct MessageRecord {
    pub queue: String,
    pub message_id: String,
    pub state: MessageState,
    pub receive_count: u32,
    pub enqueued_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

/// A message moved to the dead-letter store
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeadLetter {
    pub queue: String,
    pub message_id: String,
    pub group_key: String,
    /// Original message body (JSON text)
    pub body: String,
    pub reason: String,
    pub attempts: u32,
    pub dead_lettered_at: chrono::DateTime<chrono::Utc>,
}

/// Unfinished message counts for one queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepth {
    pub pending: u64,
    pub in_flight: u64,
    pub dead: u64,
}

/// SQLite-backed ordered queue set; cheap to clone
#[derive(Debug, Clone)]
pub struct SqliteQueue {
    pool: SqlitePool,
    visibility_timeout: Duration,
}

fn to_u32(value: i64, column: &str) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| Error::Internal(format!("Invalid value {} in column {}", value, column)))
}

fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

impl SqliteQueue {
    pub fn new(pool: SqlitePool, visibility_timeout: Duration) -> Self {
        Self {
            pool,
            visibility_timeout,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Enqueue `message` on `queue` unless its id was already accepted there
    pub async fn send<M: QueueMessage>(&self, queue: &str, message: &M) -> Result<SendOutcome> {
        let body = serde_json::to_string(message)?;
        let message_id = message.message_id();
        let group_key = message.group_key();

        let inserted = retry_on_lock("queue_send", LOCK_WAIT_MS, || async {
            let now = now_millis();
            let result = sqlx::query(
                r#"
                INSERT OR IGNORE INTO queue_messages (
                    queue, message_id, group_key, body, state, visible_at,
                    lease_expires_at, receive_count, enqueued_at, updated_at
                ) VALUES (?, ?, ?, ?, 'pending', ?, NULL, 0, ?, ?)
                "#,
            )
            .bind(queue)
            .bind(message_id)
            .bind(group_key)
            .bind(&body)
            .bind(now)
            .bind(now)
            .bind(now)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        })
        .await?;

        if inserted {
            debug!(queue, message_id, group_key, "Message enqueued");
            Ok(SendOutcome::Enqueued)
        } else {
            debug!(queue, message_id, "Duplicate message absorbed");
            Ok(SendOutcome::Duplicate)
        }
    }

    /// Lease the next deliverable message of `queue`, if any
    ///
    /// Bodies that do not decode as `M` are dead-lettered here and the next
    /// candidate is tried.
    pub async fn receive<M: QueueMessage>(&self, queue: &str) -> Result<Option<Delivery<M>>> {
        loop {
            let Some(leased) = self.lease_next(queue).await? else {
                return Ok(None);
            };

            match serde_json::from_str::<M>(&leased.body) {
                Ok(message) => {
                    return Ok(Some(Delivery {
                        queue: queue.to_string(),
                        seq: leased.seq,
                        receive_count: leased.receive_count,
                        message,
                    }))
                }
                Err(e) => {
                    warn!(
                        queue,
                        message_id = %leased.message_id,
                        error = %e,
                        "Undecodable message body, dead-lettering"
                    );
                    self.move_to_dead_letters(
                        queue,
                        leased.seq,
                        &leased.message_id,
                        &leased.group_key,
                        &leased.body,
                        &format!("undecodable message body: {}", e),
                        leased.receive_count,
                    )
                    .await?;
                }
            }
        }
    }

    async fn lease_next(&self, queue: &str) -> Result<Option<LeasedRow>> {
        let lease = duration_millis(self.visibility_timeout);

        retry_on_lock("queue_receive", LOCK_WAIT_MS, || async {
            let now = now_millis();
            let row = sqlx::query(
                r#"
                UPDATE queue_messages
                SET state = 'in_flight',
                    lease_expires_at = ?1 + ?2,
                    receive_count = receive_count + 1,
                    updated_at = ?1
                WHERE seq = (
                    SELECT m.seq FROM queue_messages m
                    WHERE m.queue = ?3
                      AND ((m.state = 'pending' AND m.visible_at <= ?1)
                           OR (m.state = 'in_flight' AND m.lease_expires_at <= ?1))
                      AND m.seq = (
                          SELECT MIN(h.seq) FROM queue_messages h
                          WHERE h.group_key = m.group_key
                            AND h.state IN ('pending', 'in_flight')
                      )
                      AND NOT EXISTS (
                          SELECT 1 FROM queue_messages f
                          WHERE f.group_key = m.group_key
                            AND f.state = 'in_flight'
                            AND f.lease_expires_at > ?1
                      )
                    ORDER BY m.seq
                    LIMIT 1
                )
                RETURNING seq, message_id, group_key, body, receive_count
                "#,
            )
            .bind(now)
            .bind(lease)
            .bind(queue)
            .fetch_optional(&self.pool)
            .await?;

            row.map(|row| -> Result<LeasedRow> {
                Ok(LeasedRow {
                    seq: row.get("seq"),
                    message_id: row.get("message_id"),
                    group_key: row.get("group_key"),
                    body: row.get("body"),
                    receive_count: to_u32(row.get("receive_count"), "receive_count")?,
                })
            })
            .transpose()
        })
        .await
    }

    /// Finish a delivery; the group's next message becomes deliverable
    pub async fn ack<M>(&self, delivery: &Delivery<M>) -> Result<()> {
        retry_on_lock("queue_ack", LOCK_WAIT_MS, || async {
            sqlx::query(
                r#"
                UPDATE queue_messages
                SET state = 'acked', lease_expires_at = NULL, updated_at = ?
                WHERE seq = ? AND state = 'in_flight'
                "#,
            )
            .bind(now_millis())
            .bind(delivery.seq)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    /// Return a delivery to the queue after `delay`, storing `message` as its new body
    ///
    /// The message keeps its position at the head of its group, so later
    /// messages of the group wait for it.
    pub async fn retry<M: QueueMessage>(
        &self,
        delivery: &Delivery<M>,
        message: &M,
        delay: Duration,
    ) -> Result<()> {
        let body = serde_json::to_string(message)?;
        let delay = duration_millis(delay);

        retry_on_lock("queue_retry", LOCK_WAIT_MS, || async {
            let now = now_millis();
            sqlx::query(
                r#"
                UPDATE queue_messages
                SET state = 'pending', body = ?, visible_at = ?, lease_expires_at = NULL, updated_at = ?
                WHERE seq = ? AND state = 'in_flight'
                "#,
            )
            .bind(&body)
            .bind(now.saturating_add(delay))
            .bind(now)
            .bind(delivery.seq)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    /// Move a delivery to the dead-letter store and release its group
    pub async fn dead_letter<M: QueueMessage>(
        &self,
        delivery: &Delivery<M>,
        reason: &str,
        attempts: u32,
    ) -> Result<()> {
        let body = serde_json::to_string(&delivery.message)?;
        self.move_to_dead_letters(
            &delivery.queue,
            delivery.seq,
            delivery.message.message_id(),
            delivery.message.group_key(),
            &body,
            reason,
            attempts,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn move_to_dead_letters(
        &self,
        queue: &str,
        seq: i64,
        message_id: &str,
        group_key: &str,
        body: &str,
        reason: &str,
        attempts: u32,
    ) -> Result<()> {
        retry_on_lock("queue_dead_letter", LOCK_WAIT_MS, || async {
            let mut tx = self.pool.begin().await?;

            sqlx::query(
                r#"
                INSERT OR IGNORE INTO dead_letters (
                    queue, message_id, group_key, body, reason, attempts, dead_lettered_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(queue)
            .bind(message_id)
            .bind(group_key)
            .bind(body)
            .bind(reason)
            .bind(i64::from(attempts))
            .bind(chrono::Utc::now().to_rfc3339())
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "UPDATE queue_messages SET state = 'dead', lease_expires_at = NULL, updated_at = ? WHERE seq = ?",
            )
            .bind(now_millis())
            .bind(seq)
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;
            Ok(())
        })
        .await?;

        warn!(queue, message_id, attempts, reason, "Message dead-lettered");
        Ok(())
    }

    /// Look up a message by id across all queues
    pub async fn find(&self, message_id: &str) -> Result<Option<MessageRecord>> {
        let row = sqlx::query(
            r#"
            SELECT queue, message_id, state, receive_count, enqueued_at, updated_at
            FROM queue_messages WHERE message_id = ?
            ORDER BY seq DESC LIMIT 1
            "#,
        )
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let state: String = row.get("state");
                Ok(Some(MessageRecord {
                    queue: row.get("queue"),
                    message_id: row.get("message_id"),
                    state: MessageState::parse(&state)?,
                    receive_count: to_u32(row.get("receive_count"), "receive_count")?,
                    enqueued_at: from_millis(row.get("enqueued_at")),
                    updated_at: from_millis(row.get("updated_at")),
                }))
            }
            None => Ok(None),
        }
    }

    /// Dead letters, newest first, optionally for one queue
    pub async fn dead_letters(&self, queue: Option<&str>) -> Result<Vec<DeadLetter>> {
        let rows = sqlx::query(
            r#"
            SELECT queue, message_id, group_key, body, reason, attempts, dead_lettered_at
            FROM dead_letters
            WHERE ?1 IS NULL OR queue = ?1
            ORDER BY dead_lettered_at DESC, message_id
            "#,
        )
        .bind(queue)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let dead_lettered_at: String = row.get("dead_lettered_at");
                Ok(DeadLetter {
                    queue: row.get("queue"),
                    message_id: row.get("message_id"),
                    group_key: row.get("group_key"),
                    body: row.get("body"),
                    reason: row.get("reason"),
                    attempts: to_u32(row.get("attempts"), "attempts")?,
                    dead_lettered_at: crate::time::parse_rfc3339(&dead_lettered_at)?,
                })
            })
            .collect()
    }

    pub async fn depth(&self, queue: &str) -> Result<QueueDepth> {
        let rows = sqlx::query(
            "SELECT state, COUNT(*) AS n FROM queue_messages WHERE queue = ? AND state != 'acked' GROUP BY state",
        )
        .bind(queue)
        .fetch_all(&self.pool)
        .await?;

        let mut depth = QueueDepth::default();
        for row in rows {
            let state: String = row.get("state");
            let count = crate::db::to_u64(row.get("n"), "count")?;
            match MessageState::parse(&state)? {
                MessageState::Pending => depth.pending = count,
                MessageState::InFlight => depth.in_flight = count,
                MessageState::Dead => depth.dead = count,
                MessageState::Acked => {}
            }
        }
        Ok(depth)
    }
}

struct LeasedRow {
    seq: i64,
    message_id: String,
    group_key: String,
    body: String,
    receive_count: u32,
}
