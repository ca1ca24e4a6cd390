//! Create-output consumer
//!
//! Turns a parked synthesis result into a versioned output artifact:
//! post-process, append a new version under `<voice>/output-<request>`,
//! record the artifact and mark the clone request done. Storage faults are
//! transient; there is no provider involvement.

use async_trait::async_trait;
use parrot_common::db::artifacts::{self, StoredOutput};
use parrot_common::db::clones;
use parrot_common::job::{JobEnvelope, JobPayload, JobType};
use parrot_common::models::{ArtifactStatus, CloneRequest};
use parrot_common::storage::StoredObject;
use tracing::{debug, info, warn};

use super::expect_job_type;
use crate::context::StageContext;
use crate::error::{StageError, StageResult};
use crate::postprocess::{self, FinalizedOutput};
use crate::worker::{HandleOutcome, StageHandler};

pub struct CreateOutputConsumer {
    ctx: StageContext,
}

impl CreateOutputConsumer {
    pub fn new(ctx: StageContext) -> Self {
        Self { ctx }
    }

    /// Write the output bytes as a new version, reusing an orphaned version
    ///
    /// A delivery that crashed after writing but before recording the
    /// artifact leaves a version no artifact claims. If that version holds
    /// identical bytes it is adopted instead of appending a duplicate.
    async fn store_output(
        &self,
        request: &CloneRequest,
        key: &str,
        output: &FinalizedOutput,
    ) -> StageResult<StoredObject> {
        let bucket = &self.ctx.config.storage.outputs_bucket;

        if let Some(latest) = self.ctx.store.latest_version(bucket, key).await? {
            let claimed = artifacts::list_for_request(&self.ctx.db, &request.id)
                .await?
                .iter()
                .any(|a| a.status == ArtifactStatus::Stored && a.version == Some(latest));

            if !claimed {
                let (_, existing) = self.ctx.store.get(bucket, key, Some(latest)).await?;
                if postprocess::checksum(&existing) == output.checksum {
                    debug!(key, version = latest, "Adopting unclaimed output version");
                    return Ok(StoredObject {
                        bucket: bucket.clone(),
                        key: key.to_string(),
                        version: latest,
                        size_bytes: existing.len() as u64,
                    });
                }
            }
        }

        Ok(self.ctx.store.put(bucket, key, &output.bytes).await?)
    }
}

#[async_trait]
impl StageHandler for CreateOutputConsumer {
    type Message = JobEnvelope;

    fn name(&self) -> &'static str {
        "create-output"
    }

    fn queue(&self) -> &str {
        &self.ctx.config.queues.create_output
    }

    async fn handle(&self, job: &JobEnvelope) -> StageResult<HandleOutcome> {
        expect_job_type(job, JobType::CreateOutput)?;
        let JobPayload::CreateOutput {
            clone_request_id,
            generation,
            result_key,
            result_version,
        } = &job.payload
        else {
            return Err(StageError::Validation(format!("job {} has no synthesis result", job.job_id)));
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

        let output_key = request.output_key();
        let artifact = artifacts::create_pending(&self.ctx.db, &request.id, &job.job_id, &output_key).await?;
        if artifact.status == ArtifactStatus::Stored {
            return Err(StageError::DuplicateDelivery(format!(
                "artifact {} already stored for job {}",
                artifact.id, job.job_id
            )));
        }

        let scratch = &self.ctx.config.storage.scratch_bucket;
        let (_, raw) = self.ctx.store.get(scratch, result_key, Some(*result_version)).await?;
        let output = postprocess::finalize(raw)?;

        let stored = self.store_output(&request, &output_key, &output).await?;

        let completed = artifacts::complete(
            &self.ctx.db,
            &artifact.id,
            &request.id,
            generation,
            &StoredOutput {
                version: stored.version,
                checksum: &output.checksum,
                size_bytes: stored.size_bytes,
                content_type: output.content_type,
            },
        )
        .await?;

        if let Err(e) = self.ctx.store.remove(scratch, result_key).await {
            warn!(key = %result_key, error = %e, "Failed to remove scratch result");
        }

        if !completed {
            return Err(StageError::DuplicateDelivery(format!(
                "clone request {} regenerated while output was stored",
                request.id
            )));
        }

        info!(
            clone_request_id = %request.id,
            voice_id = %request.voice_id,
            artifact_id = %artifact.id,
            key = %output_key,
            version = stored.version,
            "Output artifact stored, clone request done"
        );
        Ok(HandleOutcome::Completed)
    }

    async fn fail(&self, job: &JobEnvelope, reason: &str) -> StageResult<()> {
        if let Some(artifact) = artifacts::get_by_job(&self.ctx.db, &job.job_id).await? {
            artifacts::mark_failed(&self.ctx.db, &artifact.id, reason).await?;
        }
        if let JobPayload::CreateOutput {
            clone_request_id,
            generation,
            ..
        } = &job.payload
        {
            clones::mark_failed(&self.ctx.db, clone_request_id, *generation, reason).await?;
        }
        Ok(())
    }
}
