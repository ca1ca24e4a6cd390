//! Pipeline entities held in the metadata store
//!
//! Each entity has exactly one writer stage:
//! - [`VoiceSample`]: sample-ingestion trigger
//! - [`VoiceProfile`]: train-voice consumer (one row per voice id)
//! - [`CloneRequest`]: API / train-voice consumer create, clone-voice and
//!   create-output consumers advance
//! - [`OutputArtifact`]: create-output consumer

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::storage::StoredObject;
use crate::{Error, Result};

/// Longest accepted voice id
pub const MAX_VOICE_ID_LEN: usize = 64;

macro_rules! status_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(value: &str) -> Result<Self> {
                match value {
                    $($text => Ok($name::$variant),)+
                    other => Err(Error::Internal(format!(
                        "Unknown {} '{}'",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

status_enum!(
    /// Lifecycle of an uploaded sample
    SampleStatus {
        Pending => "pending",
        Ingested => "ingested",
        Failed => "failed",
    }
);

status_enum!(
    /// Lifecycle of a voice profile
    ProfileStatus {
        Queued => "queued",
        Training => "training",
        Trained => "trained",
        Failed => "failed",
    }
);

status_enum!(
    /// Lifecycle of a clone request
    CloneStatus {
        Queued => "queued",
        Cloning => "cloning",
        Done => "done",
        Failed => "failed",
    }
);

status_enum!(
    /// Lifecycle of a stored output artifact
    ArtifactStatus {
        Pending => "pending",
        Stored => "stored",
        Failed => "failed",
    }
);

/// An uploaded voice sample (one row per object version)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceSample {
    /// `<storage key>@v<object version>`
    pub id: String,
    pub voice_id: String,
    pub bucket: String,
    pub storage_key: String,
    pub object_version: u64,
    pub size_bytes: u64,
    pub status: SampleStatus,
    pub failure_reason: Option<String>,
    pub uploaded_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl VoiceSample {
    /// Stable sample id for one version of one object
    pub fn id_for(storage_key: &str, object_version: u64) -> String {
        format!("{}@v{}", storage_key, object_version)
    }

    /// Pending record for a freshly written sample object
    pub fn pending(voice_id: &str, object: &StoredObject) -> Self {
        let now = Utc::now();
        Self {
            id: Self::id_for(&object.key, object.version),
            voice_id: voice_id.to_string(),
            bucket: object.bucket.clone(),
            storage_key: object.key.clone(),
            object_version: object.version,
            size_bytes: object.size_bytes,
            status: SampleStatus::Pending,
            failure_reason: None,
            uploaded_at: now,
            updated_at: now,
        }
    }
}

/// The trained representation of a voice; exactly one per voice id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceProfile {
    pub voice_id: String,
    /// Provider-side model reference, present once trained
    pub model_ref: Option<String>,
    pub status: ProfileStatus,
    pub source_sample_id: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A request to speak `text` in a trained voice
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloneRequest {
    pub id: String,
    pub voice_id: String,
    /// Target content
    pub text: String,
    pub status: CloneStatus,
    /// Bumped on every regenerate; jobs carry the generation they were issued for
    pub generation: u32,
    /// Transient synthesis result (scratch bucket)
    pub result_key: Option<String>,
    pub result_version: Option<u64>,
    /// Latest stored artifact for this request
    pub output_artifact_id: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CloneRequest {
    /// New queued request at generation 1
    pub fn new(voice_id: &str, text: &str) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            voice_id: voice_id.to_string(),
            text: text.to_string(),
            status: CloneStatus::Queued,
            generation: 1,
            result_key: None,
            result_version: None,
            output_artifact_id: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Logical output key; every generation appends a version under it
    pub fn output_key(&self) -> String {
        output_key(&self.voice_id, &self.id)
    }

    /// Scratch key for the raw synthesis result of one generation
    pub fn scratch_key(&self, generation: u32) -> String {
        format!("{}/clone-{}-g{}.raw", self.voice_id, self.id, generation)
    }
}

/// A finalized, versioned output artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputArtifact {
    pub id: String,
    pub clone_request_id: String,
    /// Create-output job that produced this artifact (unique)
    pub job_id: String,
    pub storage_key: String,
    pub version: Option<u64>,
    /// Hex SHA-256 of the stored bytes
    pub checksum: Option<String>,
    pub size_bytes: Option<u64>,
    pub content_type: Option<String>,
    pub status: ArtifactStatus,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Output key layout: `<voice id>/output-<clone request id>`
pub fn output_key(voice_id: &str, clone_request_id: &str) -> String {
    format!("{}/output-{}", voice_id, clone_request_id)
}

/// Voice ids are 1-64 characters of `[A-Za-z0-9_-]`
pub fn validate_voice_id(voice_id: &str) -> Result<()> {
    if voice_id.is_empty() || voice_id.len() > MAX_VOICE_ID_LEN {
        return Err(Error::InvalidInput(format!(
            "voice id must be 1-{} characters",
            MAX_VOICE_ID_LEN
        )));
    }
    if !voice_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(Error::InvalidInput(format!(
            "voice id '{}' may only contain letters, digits, '-' and '_'",
            voice_id
        )));
    }
    Ok(())
}
