//! Train-voice consumer
//!
//! Builds the voice profile for an ingested sample, then releases every clone
//! request that was waiting for the voice. The profile row is keyed by voice
//! id, so re-training replaces the active profile in place.

use async_trait::async_trait;
use parrot_common::db::{clones, profiles, samples};
use parrot_common::job::{JobEnvelope, JobPayload, JobType};
use parrot_common::models::{ProfileStatus, SampleStatus};
use parrot_common::queue::SendOutcome;
use tracing::{debug, info};

use super::expect_job_type;
use crate::context::StageContext;
use crate::error::{StageError, StageResult};
use crate::provider::TrainingSample;
use crate::worker::{HandleOutcome, StageHandler};

pub struct TrainVoiceConsumer {
    ctx: StageContext,
}

impl TrainVoiceConsumer {
    pub fn new(ctx: StageContext) -> Self {
        Self { ctx }
    }

    /// Enqueue a clone job for every request still waiting on `voice_id`
    async fn release_waiting_requests(&self, voice_id: &str) -> StageResult<usize> {
        let waiting = clones::list_queued_for_voice(&self.ctx.db, voice_id).await?;
        let mut enqueued = 0;

        for request in &waiting {
            let job = JobEnvelope::clone_voice(voice_id, &request.id, request.generation);
            if self.ctx.queue.send(&self.ctx.config.queues.clone_voice, &job).await?
                == SendOutcome::Enqueued
            {
                enqueued += 1;
            }
        }

        if enqueued > 0 {
            info!(voice_id, enqueued, "Released waiting clone requests");
        }
        Ok(enqueued)
    }
}

#[async_trait]
impl StageHandler for TrainVoiceConsumer {
    type Message = JobEnvelope;

    fn name(&self) -> &'static str {
        "train-voice"
    }

    fn queue(&self) -> &str {
        &self.ctx.config.queues.train_voice
    }

    async fn handle(&self, job: &JobEnvelope) -> StageResult<HandleOutcome> {
        expect_job_type(job, JobType::TrainVoice)?;
        let JobPayload::TrainVoice { sample_id } = &job.payload else {
            return Err(StageError::Validation(format!("job {} has no sample reference", job.job_id)));
        };
        let voice_id = job.voice_id.as_str();

        let sample = samples::get(&self.ctx.db, sample_id)
            .await?
            .ok_or_else(|| StageError::Validation(format!("sample {} does not exist", sample_id)))?;
        if sample.status != SampleStatus::Ingested {
            return Err(StageError::Validation(format!(
                "sample {} is {}, expected ingested",
                sample_id, sample.status
            )));
        }
        if sample.voice_id != voice_id {
            return Err(StageError::Validation(format!(
                "sample {} belongs to voice {}, not {}",
                sample_id, sample.voice_id, voice_id
            )));
        }

        // A redelivery after the profile was stored must not train again
        let mut attempted = false;
        if let Some(profile) = profiles::get(&self.ctx.db, voice_id).await? {
            let same_sample = profile.source_sample_id.as_deref() == Some(sample_id.as_str());
            if same_sample && profile.status == ProfileStatus::Trained {
                debug!(voice_id, sample_id = %sample_id, "Profile already trained from this sample");
                self.release_waiting_requests(voice_id).await?;
                return Ok(HandleOutcome::Completed);
            }
            attempted = same_sample && profile.status == ProfileStatus::Training;
        }

        profiles::mark_training(&self.ctx.db, voice_id, sample_id).await?;
        info!(voice_id, sample_id = %sample_id, job_id = %job.job_id, "Training voice profile");

        let (_, bytes) = self
            .ctx
            .store
            .get(&sample.bucket, &sample.storage_key, Some(sample.object_version))
            .await?;
        let file_name = sample
            .storage_key
            .rsplit('/')
            .next()
            .unwrap_or(sample.storage_key.as_str())
            .to_string();

        // An earlier attempt may have created the provider voice before failing
        let existing = if attempted {
            self.ctx.provider.find_voice(sample_id).await?
        } else {
            None
        };

        let model_ref = match existing {
            Some(model_ref) => {
                info!(voice_id, model_ref = %model_ref, "Reusing provider voice from an earlier attempt");
                model_ref
            }
            None => {
                self.ctx
                    .provider
                    .train_voice(TrainingSample {
                        voice_id: voice_id.to_string(),
                        sample_id: sample_id.clone(),
                        file_name,
                        bytes,
                    })
                    .await?
            }
        };

        profiles::mark_trained(&self.ctx.db, voice_id, &model_ref, sample_id).await?;
        info!(voice_id, model_ref = %model_ref, "Voice profile trained");

        self.release_waiting_requests(voice_id).await?;
        Ok(HandleOutcome::Completed)
    }

    async fn fail(&self, job: &JobEnvelope, reason: &str) -> StageResult<()> {
        profiles::mark_failed(&self.ctx.db, &job.voice_id, reason).await?;
        let failed = clones::fail_queued_for_voice(
            &self.ctx.db,
            &job.voice_id,
            &format!("voice training failed: {}", reason),
        )
        .await?;
        if failed > 0 {
            info!(voice_id = %job.voice_id, failed, "Failed clone requests waiting on voice");
        }
        Ok(())
    }
}
