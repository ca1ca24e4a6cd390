//! Stage consumers
//!
//! One [`StageHandler`](crate::worker::StageHandler) per job queue:
//! train-voice, clone-voice and create-output.

pub mod clone_voice;
pub mod create_output;
pub mod train_voice;

pub use clone_voice::CloneVoiceConsumer;
pub use create_output::CreateOutputConsumer;
pub use train_voice::TrainVoiceConsumer;

use parrot_common::job::{JobEnvelope, JobType};

use crate::error::{StageError, StageResult};

/// Reject envelopes delivered to the wrong stage or with inconsistent fields
pub(crate) fn expect_job_type(job: &JobEnvelope, expected: JobType) -> StageResult<()> {
    job.validate()
        .map_err(|e| StageError::Validation(e.to_string()))?;
    if job.job_type != expected {
        return Err(StageError::Validation(format!(
            "job {} of type {} delivered to {} consumer",
            job.job_id,
            job.job_type.as_str(),
            expected.as_str()
        )));
    }
    Ok(())
}
