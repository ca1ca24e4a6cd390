//! Versioned object store on the local filesystem
//!
//! Layout: `<root>/<bucket>/<key>.versions/<n>` where `n` starts at 1. A
//! version file is never overwritten: writes go to a temporary file which is
//! then hard-linked into place, and linking fails if the version exists. A
//! put with the same key therefore always appends a new version, and readers
//! never observe a partially written object.

use std::path::{Component, Path, PathBuf};

use tokio::fs;
use tracing::debug;

use crate::{Error, Result};

const VERSIONS_SUFFIX: &str = ".versions";

/// How many times `put` races for a fresh version number
const MAX_PUT_ATTEMPTS: u32 = 8;

/// Location and size of one stored object version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub bucket: String,
    pub key: String,
    pub version: u64,
    pub size_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct ObjectStore {
    root: PathBuf,
}

impl ObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn versions_dir(&self, bucket: &str, key: &str) -> Result<PathBuf> {
        validate_bucket(bucket)?;
        validate_key(key)?;
        Ok(self
            .root
            .join(bucket)
            .join(format!("{}{}", key, VERSIONS_SUFFIX)))
    }

    /// Store `bytes` as the next version of `bucket/key`
    pub async fn put(&self, bucket: &str, key: &str, bytes: &[u8]) -> Result<StoredObject> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let next = self.latest_version(bucket, key).await?.unwrap_or(0) + 1;

            match self.write_version(bucket, key, next, bytes).await {
                Err(Error::StorageVersionConflict { .. }) if attempt < MAX_PUT_ATTEMPTS => {
                    debug!(bucket, key, version = next, "Version taken by concurrent writer, retrying");
                }
                other => return other,
            }
        }
    }

    /// Store `bytes` as exactly `version`; fails if that version exists
    pub async fn write_version(
        &self,
        bucket: &str,
        key: &str,
        version: u64,
        bytes: &[u8],
    ) -> Result<StoredObject> {
        if version == 0 {
            return Err(Error::InvalidInput("object versions start at 1".to_string()));
        }

        let dir = self.versions_dir(bucket, key)?;
        fs::create_dir_all(&dir).await?;

        let temp = dir.join(format!(".tmp-{}", uuid::Uuid::new_v4()));
        fs::write(&temp, bytes).await?;

        let target = dir.join(version.to_string());
        let linked = fs::hard_link(&temp, &target).await;
        // The temp name is unique to this write
        let _ = fs::remove_file(&temp).await;

        match linked {
            Ok(()) => {
                debug!(bucket, key, version, size = bytes.len(), "Object version stored");
                Ok(StoredObject {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                    version,
                    size_bytes: bytes.len() as u64,
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(Error::StorageVersionConflict {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                    version,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Read one version, or the latest when `version` is `None`
    pub async fn get(&self, bucket: &str, key: &str, version: Option<u64>) -> Result<(u64, Vec<u8>)> {
        let version = match version {
            Some(v) => v,
            None => self
                .latest_version(bucket, key)
                .await?
                .ok_or_else(|| Error::NotFound(format!("{}/{}", bucket, key)))?,
        };

        let path = self.versions_dir(bucket, key)?.join(version.to_string());
        match fs::read(&path).await {
            Ok(bytes) => Ok((version, bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::NotFound(format!(
                "{}/{} version {}",
                bucket, key, version
            ))),
            Err(e) => Err(e.into()),
        }
    }

    /// Stored versions of `bucket/key`, ascending
    pub async fn list_versions(&self, bucket: &str, key: &str) -> Result<Vec<u64>> {
        let dir = self.versions_dir(bucket, key)?;
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut versions = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Some(version) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<u64>().ok())
            {
                versions.push(version);
            }
        }
        versions.sort_unstable();
        Ok(versions)
    }

    pub async fn latest_version(&self, bucket: &str, key: &str) -> Result<Option<u64>> {
        Ok(self.list_versions(bucket, key).await?.last().copied())
    }

    /// Delete every version of `bucket/key` (scratch cleanup)
    pub async fn remove(&self, bucket: &str, key: &str) -> Result<()> {
        let dir = self.versions_dir(bucket, key)?;
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn validate_bucket(bucket: &str) -> Result<()> {
    if bucket.is_empty() || bucket.contains('/') || bucket.contains('\\') || bucket.starts_with('.') {
        return Err(Error::InvalidInput(format!("invalid bucket name '{}'", bucket)));
    }
    Ok(())
}

/// Keys are relative `/`-separated paths without empty, `.` or `..` segments
pub fn validate_key(key: &str) -> Result<()> {
    let invalid = || Error::InvalidInput(format!("invalid object key '{}'", key));

    if key.is_empty() || key.contains('\\') || key.contains(VERSIONS_SUFFIX) {
        return Err(invalid());
    }
    if key.split('/').any(|segment| segment.is_empty() || segment == "." || segment == "..") {
        return Err(invalid());
    }
    if !Path::new(key)
        .components()
        .all(|c| matches!(c, Component::Normal(_)))
    {
        return Err(invalid());
    }
    Ok(())
}
