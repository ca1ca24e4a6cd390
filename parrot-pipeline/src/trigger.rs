//! Sample-ingestion trigger
//!
//! Consumes object-created notifications for the sample bucket. Objects
//! whose key does not end in a configured sample suffix are ignored with no
//! side effect. Matching objects get their [`VoiceSample`] record (created
//! `pending` by the upload gateway, or here) advanced and a train-voice job
//! whose id is derived from the object key and version, so a redelivered
//! notification cannot enqueue a second train job.
//!
//! A rejected sample can leave clone requests with nothing to wait for. When
//! the voice has no usable profile and no other sample on its way to
//! training, those requests are failed here.

use async_trait::async_trait;
use parrot_common::db::{clones, ledger, profiles, samples};
use parrot_common::job::{JobEnvelope, ObjectCreated};
use parrot_common::models::{validate_voice_id, ProfileStatus, SampleStatus, VoiceSample};
use parrot_common::queue::SendOutcome;
use tracing::{debug, info, warn};

use crate::context::StageContext;
use crate::error::{StageError, StageResult};
use crate::worker::{HandleOutcome, StageHandler};

pub struct SampleIngestionTrigger {
    ctx: StageContext,
}

impl SampleIngestionTrigger {
    pub fn new(ctx: StageContext) -> Self {
        Self { ctx }
    }

    /// Fail queued clone requests once no train job can release them
    async fn fail_stranded_requests(&self, voice_id: &str, rejected_id: &str, reason: &str) -> StageResult<()> {
        if let Some(profile) = profiles::get(&self.ctx.db, voice_id).await? {
            // Trained: queued requests already have clone jobs.
            // Queued/Training: a train job will release or fail them.
            if profile.status != ProfileStatus::Failed {
                return Ok(());
            }
        }

        for sample in samples::list_for_voice(&self.ctx.db, voice_id).await? {
            if sample.id == rejected_id {
                continue;
            }
            let outstanding = match sample.status {
                SampleStatus::Pending => true,
                SampleStatus::Ingested => {
                    let train = JobEnvelope::train_voice(voice_id, &sample.id);
                    !ledger::is_processed(&self.ctx.db, &train.job_id).await?
                }
                SampleStatus::Failed => false,
            };
            if outstanding {
                debug!(voice_id, sample_id = %sample.id, "Voice still has a sample heading for training");
                return Ok(());
            }
        }

        let failed = clones::fail_queued_for_voice(
            &self.ctx.db,
            voice_id,
            &format!("voice sample rejected: {}", reason),
        )
        .await?;
        if failed > 0 {
            info!(voice_id, failed, "Failed clone requests waiting on rejected sample");
        }
        Ok(())
    }
}

/// Voice id for a sample key
///
/// `voice123/sample.mp3` belongs to `voice123`; a flat key `voice123.mp3`
/// uses its file stem.
pub fn derive_voice_id(key: &str) -> StageResult<String> {
    let voice_id = match key.split_once('/') {
        Some((first, _)) => first,
        None => key.rsplit_once('.').map(|(stem, _)| stem).unwrap_or(key),
    };

    validate_voice_id(voice_id)
        .map_err(|e| StageError::Validation(format!("cannot derive voice id from '{}': {}", key, e)))?;
    Ok(voice_id.to_string())
}

#[async_trait]
impl StageHandler for SampleIngestionTrigger {
    type Message = ObjectCreated;

    fn name(&self) -> &'static str {
        "sample-ingestion"
    }

    fn queue(&self) -> &str {
        &self.ctx.config.queues.sample_events
    }

    async fn handle(&self, event: &ObjectCreated) -> StageResult<HandleOutcome> {
        let storage = &self.ctx.config.storage;

        if event.bucket != storage.samples_bucket || !storage.is_sample_key(&event.key) {
            debug!(bucket = %event.bucket, key = %event.key, "Ignoring non-sample object");
            return Ok(HandleOutcome::Skipped);
        }

        let voice_id = derive_voice_id(&event.key)?;
        let now = chrono::Utc::now();
        let sample = samples::record(
            &self.ctx.db,
            &VoiceSample {
                id: VoiceSample::id_for(&event.key, event.version),
                voice_id: voice_id.clone(),
                bucket: event.bucket.clone(),
                storage_key: event.key.clone(),
                object_version: event.version,
                size_bytes: event.size_bytes,
                status: SampleStatus::Pending,
                failure_reason: None,
                uploaded_at: event.created_at,
                updated_at: now,
            },
        )
        .await?;

        if sample.status == SampleStatus::Failed {
            debug!(sample_id = %sample.id, "Sample already rejected");
            let reason = sample.failure_reason.as_deref().unwrap_or("sample rejected");
            self.fail_stranded_requests(&voice_id, &sample.id, reason).await?;
            return Ok(HandleOutcome::Completed);
        }

        if sample.size_bytes == 0 || sample.size_bytes > storage.max_sample_bytes {
            let reason = format!(
                "sample size {} bytes outside accepted range 1..={}",
                sample.size_bytes, storage.max_sample_bytes
            );
            warn!(sample_id = %sample.id, voice_id = %voice_id, reason = %reason, "Rejecting voice sample");
            samples::set_status(&self.ctx.db, &sample.id, SampleStatus::Failed, Some(&reason)).await?;
            self.fail_stranded_requests(&voice_id, &sample.id, &reason).await?;
            return Ok(HandleOutcome::Completed);
        }

        samples::set_status(&self.ctx.db, &sample.id, SampleStatus::Ingested, None).await?;

        let job = JobEnvelope::train_voice(&voice_id, &sample.id);
        match self.ctx.queue.send(&self.ctx.config.queues.train_voice, &job).await? {
            SendOutcome::Enqueued => {
                info!(sample_id = %sample.id, voice_id = %voice_id, job_id = %job.job_id, "Sample ingested, train job enqueued")
            }
            SendOutcome::Duplicate => {
                debug!(job_id = %job.job_id, "Train job already enqueued")
            }
        }

        Ok(HandleOutcome::Completed)
    }

    async fn fail(&self, event: &ObjectCreated, reason: &str) -> StageResult<()> {
        let sample_id = VoiceSample::id_for(&event.key, event.version);
        if !samples::set_status(&self.ctx.db, &sample_id, SampleStatus::Failed, Some(reason)).await? {
            return Ok(());
        }
        if let Ok(voice_id) = derive_voice_id(&event.key) {
            self.fail_stranded_requests(&voice_id, &sample_id, reason).await?;
        }
        Ok(())
    }
}
