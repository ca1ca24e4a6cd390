//! Messages carried on the pipeline queues
//!
//! Every stage queue carries a [`JobEnvelope`]. The storage notification
//! channel carries [`ObjectCreated`]. Job ids are derived deterministically
//! from the entity they act on, so a redelivered or re-enqueued job always
//! has the same id and is absorbed by queue deduplication and the processed
//! ledger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::VoiceSample;
use crate::queue::QueueMessage;
use crate::{Error, Result};

/// Stage a job belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    TrainVoice,
    CloneVoice,
    CreateOutput,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::TrainVoice => "train_voice",
            JobType::CloneVoice => "clone_voice",
            JobType::CreateOutput => "create_output",
        }
    }
}

/// References each job type needs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobPayload {
    TrainVoice {
        sample_id: String,
    },
    CloneVoice {
        clone_request_id: String,
        generation: u32,
    },
    CreateOutput {
        clone_request_id: String,
        generation: u32,
        result_key: String,
        result_version: u64,
    },
}

impl JobPayload {
    pub fn job_type(&self) -> JobType {
        match self {
            JobPayload::TrainVoice { .. } => JobType::TrainVoice,
            JobPayload::CloneVoice { .. } => JobType::CloneVoice,
            JobPayload::CreateOutput { .. } => JobType::CreateOutput,
        }
    }
}

/// Message body on the train-voice, clone-voice and create-output queues
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEnvelope {
    /// Idempotency key
    pub job_id: String,
    pub job_type: JobType,
    /// Group key: jobs for one voice are delivered in order, one at a time
    pub voice_id: String,
    pub payload: JobPayload,
    /// Failed deliveries so far
    #[serde(default)]
    pub retry_count: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl JobEnvelope {
    fn new(job_id: String, voice_id: &str, payload: JobPayload) -> Self {
        Self {
            job_id,
            job_type: payload.job_type(),
            voice_id: voice_id.to_string(),
            payload,
            retry_count: 0,
            enqueued_at: Utc::now(),
        }
    }

    /// Train job for one sample version; id `train:<sample id>`
    pub fn train_voice(voice_id: &str, sample_id: &str) -> Self {
        Self::new(
            format!("train:{}", sample_id),
            voice_id,
            JobPayload::TrainVoice {
                sample_id: sample_id.to_string(),
            },
        )
    }

    /// Clone job for one generation of a request; id `clone:<request>:g<generation>`
    pub fn clone_voice(voice_id: &str, clone_request_id: &str, generation: u32) -> Self {
        Self::new(
            format!("clone:{}:g{}", clone_request_id, generation),
            voice_id,
            JobPayload::CloneVoice {
                clone_request_id: clone_request_id.to_string(),
                generation,
            },
        )
    }

    /// Output job for one generation of a request; id `output:<request>:g<generation>`
    pub fn create_output(
        voice_id: &str,
        clone_request_id: &str,
        generation: u32,
        result_key: &str,
        result_version: u64,
    ) -> Self {
        Self::new(
            format!("output:{}:g{}", clone_request_id, generation),
            voice_id,
            JobPayload::CreateOutput {
                clone_request_id: clone_request_id.to_string(),
                generation,
                result_key: result_key.to_string(),
                result_version,
            },
        )
    }

    /// Reject envelopes whose declared type disagrees with the payload
    pub fn validate(&self) -> Result<()> {
        if self.job_type != self.payload.job_type() {
            return Err(Error::InvalidInput(format!(
                "job {} declares type {} but carries a {} payload",
                self.job_id,
                self.job_type.as_str(),
                self.payload.job_type().as_str()
            )));
        }
        if self.job_id.is_empty() || self.voice_id.is_empty() {
            return Err(Error::InvalidInput(
                "job id and voice id must be present".to_string(),
            ));
        }
        Ok(())
    }
}

impl QueueMessage for JobEnvelope {
    fn message_id(&self) -> &str {
        &self.job_id
    }

    fn group_key(&self) -> &str {
        &self.voice_id
    }

    fn retry_count(&self) -> u32 {
        self.retry_count
    }

    fn set_retry_count(&mut self, retry_count: u32) {
        self.retry_count = retry_count;
    }
}

/// Storage notification: a new object version was written
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectCreated {
    /// `<bucket>/<key>@v<version>`
    pub event_id: String,
    pub bucket: String,
    pub key: String,
    pub version: u64,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub retry_count: u32,
}

impl ObjectCreated {
    pub fn new(bucket: &str, key: &str, version: u64, size_bytes: u64) -> Self {
        Self {
            event_id: format!("{}/{}", bucket, VoiceSample::id_for(key, version)),
            bucket: bucket.to_string(),
            key: key.to_string(),
            version,
            size_bytes,
            created_at: Utc::now(),
            retry_count: 0,
        }
    }
}

impl QueueMessage for ObjectCreated {
    fn message_id(&self) -> &str {
        &self.event_id
    }

    /// Notifications are ordered per object key
    fn group_key(&self) -> &str {
        &self.key
    }

    fn retry_count(&self) -> u32 {
        self.retry_count
    }

    fn set_retry_count(&mut self, retry_count: u32) {
        self.retry_count = retry_count;
    }
}
