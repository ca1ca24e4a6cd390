//! Time-limited signed references to stored outputs
//!
//! A reference names one object version and an expiry (Unix seconds). The
//! signature is the SHA-256 of the canonical string
//! `<bucket>\n<key>\n<version>\n<expires>\n<secret>`, as 64 hex characters.
//! Holders of a valid reference may read exactly that version until it
//! expires; no other authorization is performed.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Signed reference verification failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SigningError {
    #[error("Signed reference expired at {expires} (now {now})")]
    Expired { expires: i64, now: i64 },

    #[error("Invalid signature")]
    InvalidSignature,
}

/// A time-limited reference to one output version
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SignedReference {
    pub url: String,
    pub bucket: String,
    pub key: String,
    pub version: u64,
    pub expires_at: DateTime<Utc>,
    pub signature: String,
}

/// Calculate the signature for one object version
pub fn calculate_signature(secret: &str, bucket: &str, key: &str, version: u64, expires: i64) -> String {
    let canonical = format!("{}\n{}\n{}\n{}\n{}", bucket, key, version, expires, secret);

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Issue a reference valid for `ttl` from `now`
///
/// The URL points at the output download route of the API:
/// `<base>/outputs/<key>?version=<n>&expires=<unix secs>&signature=<hex>`.
pub fn sign_reference(
    secret: &str,
    public_base_url: &str,
    bucket: &str,
    key: &str,
    version: u64,
    ttl: std::time::Duration,
    now: DateTime<Utc>,
) -> SignedReference {
    let ttl = Duration::from_std(ttl).unwrap_or_else(|_| Duration::seconds(60));
    let expires_at = now + ttl;
    let expires = expires_at.timestamp();
    let signature = calculate_signature(secret, bucket, key, version, expires);

    let url = format!(
        "{}/outputs/{}?version={}&expires={}&signature={}",
        public_base_url.trim_end_matches('/'),
        key,
        version,
        expires,
        signature
    );

    SignedReference {
        url,
        bucket: bucket.to_string(),
        key: key.to_string(),
        version,
        expires_at,
        signature,
    }
}

/// Check a presented reference against the secret and the clock
pub fn verify_reference(
    secret: &str,
    bucket: &str,
    key: &str,
    version: u64,
    expires: i64,
    signature: &str,
    now: DateTime<Utc>,
) -> Result<(), SigningError> {
    let expected = calculate_signature(secret, bucket, key, version, expires);
    if !constant_time_eq(expected.as_bytes(), signature.as_bytes()) {
        return Err(SigningError::InvalidSignature);
    }

    let now = now.timestamp();
    if now >= expires {
        return Err(SigningError::Expired { expires, now });
    }

    Ok(())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test-secret";

    #[test]
    fn test_signature_is_hex_sha256() {
        let sig = calculate_signature(SECRET, "outputs", "v/output-r", 1, 1_700_000_000);
        assert_eq!(sig.len(), 64);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_signed_reference_verifies_until_expiry() {
        let now = Utc::now();
        let reference = sign_reference(
            SECRET,
            "http://localhost:5730/",
            "outputs",
            "voice123/output-r1",
            2,
            std::time::Duration::from_secs(60),
            now,
        );

        assert!(reference.url.starts_with("http://localhost:5730/outputs/voice123/output-r1?version=2&"));
        let expires = reference.expires_at.timestamp();

        assert!(verify_reference(SECRET, "outputs", "voice123/output-r1", 2, expires, &reference.signature, now).is_ok());

        let later = now + Duration::seconds(61);
        assert!(matches!(
            verify_reference(SECRET, "outputs", "voice123/output-r1", 2, expires, &reference.signature, later),
            Err(SigningError::Expired { .. })
        ));
    }

    #[test]
    fn test_tampered_reference_rejected() {
        let now = Utc::now();
        let reference = sign_reference(
            SECRET,
            "http://localhost",
            "outputs",
            "v/output-r",
            1,
            std::time::Duration::from_secs(60),
            now,
        );
        let expires = reference.expires_at.timestamp();

        // Changing any signed input invalidates the signature
        assert_eq!(
            verify_reference(SECRET, "outputs", "v/output-r", 2, expires, &reference.signature, now),
            Err(SigningError::InvalidSignature)
        );
        assert_eq!(
            verify_reference(SECRET, "outputs", "v/output-r", 1, expires + 3600, &reference.signature, now),
            Err(SigningError::InvalidSignature)
        );
        assert_eq!(
            verify_reference("other", "outputs", "v/output-r", 1, expires, &reference.signature, now),
            Err(SigningError::InvalidSignature)
        );
    }
}
