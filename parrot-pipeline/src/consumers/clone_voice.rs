//! Clone-voice consumer
//!
//! Synthesizes the requested text in a trained voice, parks the raw result in
//! the scratch bucket and hands off to create-output. A job is bound to the
//! request generation it was issued for; jobs from before a regenerate are
//! absorbed.

use async_trait::async_trait;
use parrot_common::db::{clones, profiles};
use parrot_common::job::{JobEnvelope, JobPayload, JobType};
use parrot_common::models::{CloneRequest, CloneStatus, ProfileStatus};
use tracing::{debug, info};

use super::expect_job_type;
use crate::context::StageContext;
use crate::error::{StageError, StageResult};
use crate::worker::{HandleOutcome, StageHandler};

pub struct CloneVoiceConsumer {
    ctx: StageContext,
}

impl CloneVoiceConsumer {
    pub fn new(ctx: StageContext) -> Self {
        Self { ctx }
    }

    async fn enqueue_output(&self, request: &CloneRequest, generation: u32, key: &str, version: u64) -> StageResult<()> {
        let job = JobEnvelope::create_output(&request.voice_id, &request.id, generation, key, version);
        self.ctx
            .queue
            .send(&self.ctx.config.queues.create_output, &job)
            .await?;
        debug!(job_id = %job.job_id, voice_id = %request.voice_id, "Create-output job enqueued");
        Ok(())
    }
}

#[async_trait]
impl StageHandler for CloneVoiceConsumer {
    type Message = JobEnvelope;

    fn name(&self) -> &'static str {
        "clone-voice"
    }

    fn queue(&self) -> &str {
        &self.ctx.config.queues.clone_voice
    }

    async fn handle(&self, job: &JobEnvelope) -> StageResult<HandleOutcome> {
        expect_job_type(job, JobType::CloneVoice)?;
        let JobPayload::CloneVoice {
            clone_request_id,
            generation,
        } = &job.payload
        else {
            return Err(StageError::Validation(format!("job {} has no clone request", job.job_id)));
        };
        let generation = *generation;

        let request = clones::get(&self.ctx.db, clone_request_id)
            .await?
            .ok_or_else(|| {
                StageError::Validation(format!("clone request {} does not exist", clone_request_id))
            })?;

        if request.generation != generation {
            return Err(StageError::DuplicateDelivery(format!(
                "clone request {} is at generation {}, job is for {}",
                request.id, request.generation, generation
            )));
        }
        if matches!(request.status, CloneStatus::Done | CloneStatus::Failed) {
            return Err(StageError::DuplicateDelivery(format!(
                "clone request {} already {}",
                request.id, request.status
            )));
        }

        // Ordering guard: never synthesize against a voice that is not trained
        let profile = profiles::get(&self.ctx.db, &request.voice_id).await?;
        let model_ref = match profile {
            Some(profile) if profile.status == ProfileStatus::Trained => {
                profile.model_ref.ok_or_else(|| {
                    StageError::NotReady(format!("voice {} has no model reference", request.voice_id))
                })?
            }
            Some(profile) => {
                return Err(StageError::NotReady(format!(
                    "voice {} profile is {}",
                    request.voice_id, profile.status
                )))
            }
            None => {
                return Err(StageError::NotReady(format!(
                    "voice {} has no profile yet",
                    request.voice_id
                )))
            }
        };

        // Result already parked by an earlier delivery of this job
        if let (Some(key), Some(version)) = (&request.result_key, request.result_version) {
            debug!(clone_request_id = %request.id, "Synthesis result exists, re-enqueueing output");
            self.enqueue_output(&request, generation, key, version).await?;
            return Ok(HandleOutcome::Completed);
        }

        if !clones::mark_cloning(&self.ctx.db, &request.id, generation).await? {
            return Err(StageError::DuplicateDelivery(format!(
                "clone request {} moved on before cloning started",
                request.id
            )));
        }
        info!(clone_request_id = %request.id, voice_id = %request.voice_id, generation, "Cloning voice");

        let audio = self.ctx.provider.synthesize(&model_ref, &request.text).await?;

        let scratch_key = request.scratch_key(generation);
        let stored = self
            .ctx
            .store
            .put(&self.ctx.config.storage.scratch_bucket, &scratch_key, &audio)
            .await?;

        if !clones::record_result(&self.ctx.db, &request.id, generation, &stored.key, stored.version).await? {
            return Err(StageError::DuplicateDelivery(format!(
                "clone request {} regenerated during synthesis",
                request.id
            )));
        }

        self.enqueue_output(&request, generation, &stored.key, stored.version).await?;
        info!(clone_request_id = %request.id, size = stored.size_bytes, "Synthesis result stored");
        Ok(HandleOutcome::Completed)
    }

    async fn fail(&self, job: &JobEnvelope, reason: &str) -> StageResult<()> {
        if let JobPayload::CloneVoice {
            clone_request_id,
            generation,
        } = &job.payload
        {
            clones::mark_failed(&self.ctx.db, clone_request_id, *generation, reason).await?;
        }
        Ok(())
    }
}
