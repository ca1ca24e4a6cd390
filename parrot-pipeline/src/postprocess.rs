//! Output post-processing
//!
//! Raw synthesis results are checked and described before they are stored
//! as an artifact: empty results are rejected, the container format is
//! sniffed for the content type, and the SHA-256 checksum is computed.

use sha2::{Digest, Sha256};

use crate::error::{StageError, StageResult};

pub const CONTENT_TYPE_MPEG: &str = "audio/mpeg";
pub const CONTENT_TYPE_WAV: &str = "audio/wav";
pub const CONTENT_TYPE_UNKNOWN: &str = "application/octet-stream";

/// A synthesis result ready to be written to output storage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizedOutput {
    pub bytes: Vec<u8>,
    pub checksum: String,
    pub content_type: &'static str,
}

/// Hex SHA-256 of `bytes`
pub fn checksum(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Sniff the audio container from its leading bytes
pub fn detect_content_type(bytes: &[u8]) -> &'static str {
    if bytes.starts_with(b"ID3") {
        return CONTENT_TYPE_MPEG;
    }
    // MPEG audio frame sync: 11 set bits
    if bytes.len() >= 2 && bytes[0] == 0xFF && (bytes[1] & 0xE0) == 0xE0 {
        return CONTENT_TYPE_MPEG;
    }
    if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WAVE" {
        return CONTENT_TYPE_WAV;
    }
    CONTENT_TYPE_UNKNOWN
}

pub fn finalize(raw: Vec<u8>) -> StageResult<FinalizedOutput> {
    if raw.is_empty() {
        return Err(StageError::Validation("synthesis result is empty".to_string()));
    }

    let content_type = detect_content_type(&raw);
    if content_type == CONTENT_TYPE_UNKNOWN {
        tracing::warn!(size = raw.len(), "Unrecognized audio container in synthesis result");
    }

    Ok(FinalizedOutput {
        checksum: checksum(&raw),
        content_type,
        bytes: raw,
    })
}
