//! Queue worker
//!
//! A [`Worker`] pulls deliveries from one queue and runs them through a
//! [`StageHandler`]. All retry, dead-letter and idempotency bookkeeping lives
//! here so handlers only implement the stage's business logic:
//!
//! 1. A job id already in the processed ledger is acked without running.
//! 2. A delivery whose failed attempts reached the retry bound (including
//!    crash redeliveries, counted from the receive count) is dead-lettered.
//! 3. Otherwise the handler runs under the invocation timeout:
//!    - success records the job in the ledger and acks;
//!    - a skipped notification is acked with no state change;
//!    - an absorbed duplicate is recorded and acked;
//!    - a retryable failure is requeued with backoff until the bound is hit,
//!      then dead-lettered;
//!    - a terminal failure marks the entity failed and acks.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parrot_common::config::{RetryPolicy, WorkerConfig};
use parrot_common::db::ledger::{self, JobOutcome};
use parrot_common::queue::{Delivery, QueueMessage, SqliteQueue};
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{StageError, StageResult};

/// Successful handler result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleOutcome {
    /// The job's side effects were applied
    Completed,
    /// The message was ignored (e.g. filtered notification); nothing recorded
    Skipped,
}

/// Business logic of one pipeline stage
#[async_trait]
pub trait StageHandler: Send + Sync + 'static {
    type Message: QueueMessage + Clone + 'static;

    /// Stage name for logs
    fn name(&self) -> &'static str;

    /// Queue this stage consumes
    fn queue(&self) -> &str;

    async fn handle(&self, message: &Self::Message) -> StageResult<HandleOutcome>;

    /// Record a terminal failure on the entity the message refers to
    async fn fail(&self, message: &Self::Message, reason: &str) -> StageResult<()>;
}

/// What happened to one delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobDisposition {
    Completed,
    Skipped,
    Duplicate,
    Retried { attempt: u32, delay: Duration },
    Failed,
    DeadLettered,
}

pub struct Worker<H: StageHandler> {
    handler: Arc<H>,
    queue: SqliteQueue,
    db: SqlitePool,
    retry: RetryPolicy,
    settings: WorkerConfig,
}

impl<H: StageHandler> Clone for Worker<H> {
    fn clone(&self) -> Self {
        Self {
            handler: Arc::clone(&self.handler),
            queue: self.queue.clone(),
            db: self.db.clone(),
            retry: self.retry.clone(),
            settings: self.settings.clone(),
        }
    }
}

impl<H: StageHandler> Worker<H> {
    pub fn new(handler: H, queue: SqliteQueue, retry: RetryPolicy, settings: WorkerConfig) -> Self {
        let db = queue.pool().clone();
        Self {
            handler: Arc::new(handler),
            queue,
            db,
            retry,
            settings,
        }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Receive and process one delivery; `None` when nothing is deliverable
    pub async fn process_next(&self) -> StageResult<Option<JobDisposition>> {
        let queue_name = self.handler.queue();
        let Some(delivery) = self.queue.receive::<H::Message>(queue_name).await? else {
            return Ok(None);
        };

        let disposition = self.process(&delivery).await?;
        Ok(Some(disposition))
    }

    async fn process(&self, delivery: &Delivery<H::Message>) -> StageResult<JobDisposition> {
        let message = &delivery.message;
        let job_id = message.message_id();
        let group = message.group_key();
        let queue_name = self.handler.queue();

        // Deliveries beyond the first that did not end in an explicit retry
        // were lost to crashes or lease expiry and count as failures too
        let failed_attempts = message
            .retry_count()
            .max(delivery.receive_count.saturating_sub(1));

        if ledger::is_processed(&self.db, job_id).await? {
            debug!(stage = self.handler.name(), job_id, group, "Job already processed, acking duplicate delivery");
            self.queue.ack(delivery).await?;
            return Ok(JobDisposition::Duplicate);
        }

        if self.retry.is_exhausted(failed_attempts) {
            let reason = format!("delivery attempts exhausted after {} failures", failed_attempts);
            return self.dead_letter(delivery, &reason, failed_attempts).await;
        }

        let attempt = failed_attempts + 1;
        debug!(stage = self.handler.name(), job_id, group, queue = queue_name, attempt, "Processing job");

        let timeout = self.settings.invocation_timeout();
        let result = match tokio::time::timeout(timeout, self.handler.handle(message)).await {
            Ok(result) => result,
            Err(_) => Err(StageError::TransientProvider(format!(
                "invocation timed out after {}s",
                timeout.as_secs()
            ))),
        };

        match result {
            Ok(HandleOutcome::Completed) => {
                ledger::record(&self.db, job_id, queue_name, JobOutcome::Completed, None).await?;
                self.queue.ack(delivery).await?;
                info!(stage = self.handler.name(), job_id, group, attempt, "Job completed");
                Ok(JobDisposition::Completed)
            }
            Ok(HandleOutcome::Skipped) => {
                self.queue.ack(delivery).await?;
                debug!(stage = self.handler.name(), job_id, "Message skipped");
                Ok(JobDisposition::Skipped)
            }
            Err(StageError::DuplicateDelivery(detail)) => {
                ledger::record(&self.db, job_id, queue_name, JobOutcome::Absorbed, Some(&detail)).await?;
                self.queue.ack(delivery).await?;
                debug!(stage = self.handler.name(), job_id, group, detail = %detail, "Duplicate delivery absorbed");
                Ok(JobDisposition::Duplicate)
            }
            Err(err) if err.is_retryable() => {
                if self.retry.is_exhausted(attempt) {
                    let reason = format!("retry bound exceeded: {}", err);
                    return self.dead_letter(delivery, &reason, attempt).await;
                }

                let delay = self.retry.delay_for_retry(attempt);
                let mut body = message.clone();
                body.set_retry_count(attempt);
                self.queue.retry(delivery, &body, delay).await?;

                warn!(
                    stage = self.handler.name(),
                    job_id,
                    group,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Job failed transiently, retrying"
                );
                Ok(JobDisposition::Retried { attempt, delay })
            }
            Err(err) => {
                let reason = err.to_string();
                self.handler.fail(message, &reason).await?;
                ledger::record(&self.db, job_id, queue_name, JobOutcome::Failed, Some(&reason)).await?;
                self.queue.ack(delivery).await?;
                error!(stage = self.handler.name(), job_id, group, attempt, error = %err, "Job failed terminally");
                Ok(JobDisposition::Failed)
            }
        }
    }

    async fn dead_letter(
        &self,
        delivery: &Delivery<H::Message>,
        reason: &str,
        attempts: u32,
    ) -> StageResult<JobDisposition> {
        let message = &delivery.message;
        let job_id = message.message_id();

        // Entity first: if this fails the lease expires and we come back here
        self.handler.fail(message, reason).await?;
        self.queue.dead_letter(delivery, reason, attempts).await?;
        ledger::record(&self.db, job_id, self.handler.queue(), JobOutcome::DeadLettered, Some(reason)).await?;

        error!(
            stage = self.handler.name(),
            job_id,
            group = message.group_key(),
            attempts,
            reason,
            "Job dead-lettered"
        );
        Ok(JobDisposition::DeadLettered)
    }

    /// Process deliveries until none is receivable
    pub async fn drain(&self) -> StageResult<Vec<JobDisposition>> {
        let mut dispositions = Vec::new();
        while let Some(disposition) = self.process_next().await? {
            dispositions.push(disposition);
        }
        Ok(dispositions)
    }

    /// Poll with `concurrency` tasks until `cancel` fires
    ///
    /// A task finishes the job it is running before observing cancellation.
    pub async fn run(self, cancel: CancellationToken) {
        let concurrency = self.settings.concurrency.max(1);
        info!(
            stage = self.handler.name(),
            queue = self.handler.queue(),
            concurrency,
            "Worker pool starting"
        );

        let tasks: Vec<_> = (0..concurrency)
            .map(|task_index| {
                let worker = self.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move { worker.poll_loop(task_index, cancel).await })
            })
            .collect();

        for result in futures::future::join_all(tasks).await {
            if let Err(e) = result {
                error!(stage = self.handler.name(), error = %e, "Worker task panicked");
            }
        }

        info!(stage = self.handler.name(), "Worker pool stopped");
    }

    async fn poll_loop(&self, task_index: usize, cancel: CancellationToken) {
        let poll_interval = self.settings.poll_interval();

        while !cancel.is_cancelled() {
            let idle = match self.process_next().await {
                Ok(Some(_)) => false,
                Ok(None) => true,
                Err(e) => {
                    // Leased message (if any) is redelivered after its lease expires
                    error!(stage = self.handler.name(), task_index, error = %e, "Queue processing error");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(poll_interval) => {}
                }
            }
        }
    }
}
