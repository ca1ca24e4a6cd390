//! Process-wide configuration
//!
//! One immutable [`PipelineConfig`] is resolved at startup and handed to every
//! consumer and to the API at construction. Resolution order:
//! 1. Built-in defaults (every field has one)
//! 2. TOML file (`--config` / `PARROT_CONFIG`)
//! 3. Environment variable overrides
//!
//! The TOML schema is versioned and additive: new fields always come with a
//! default, so an older file keeps loading. A file written for a newer schema
//! than this binary understands is rejected.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Highest config schema version this build understands
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// Deployment stage
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Stage {
    #[default]
    Local,
    Test,
    Prod,
    Other(String),
}

impl From<String> for Stage {
    fn from(value: String) -> Self {
        match value.to_lowercase().as_str() {
            "local" => Stage::Local,
            "test" => Stage::Test,
            "prod" => Stage::Prod,
            _ => Stage::Other(value),
        }
    }
}

impl From<Stage> for String {
    fn from(stage: Stage) -> Self {
        match stage {
            Stage::Local => "local".to_string(),
            Stage::Test => "test".to_string(),
            Stage::Prod => "prod".to_string(),
            Stage::Other(name) => name,
        }
    }
}

/// Metadata store connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseConfig {
    /// SQLite connection string
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://parrot-data/parrot.db?mode=rwc".to_string(),
        }
    }
}

/// Object storage buckets and signed-access settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    /// Root directory holding one subdirectory per bucket
    pub root: PathBuf,
    pub samples_bucket: String,
    pub outputs_bucket: String,
    /// Transient synthesis results between clone and create-output
    pub scratch_bucket: String,
    /// Key suffixes that mark an uploaded object as a voice sample
    pub sample_suffixes: Vec<String>,
    /// Largest sample the provider accepts
    pub max_sample_bytes: u64,
    /// Secret for signed retrieval references
    pub signing_secret: String,
    pub signed_url_ttl_secs: u64,
    /// Base URL clients use to reach the retrieval endpoint
    pub public_base_url: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("parrot-data/storage"),
            samples_bucket: "samples".to_string(),
            outputs_bucket: "outputs".to_string(),
            scratch_bucket: "scratch".to_string(),
            sample_suffixes: vec![".mp3".to_string()],
            max_sample_bytes: 11 * 1024 * 1024,
            signing_secret: String::new(),
            signed_url_ttl_secs: 60,
            public_base_url: "http://127.0.0.1:5730".to_string(),
        }
    }
}

impl StorageConfig {
    /// True when `key` ends in one of the sample suffixes (case-insensitive)
    pub fn is_sample_key(&self, key: &str) -> bool {
        let key = key.to_ascii_lowercase();
        self.sample_suffixes
            .iter()
            .any(|suffix| key.ends_with(&suffix.to_ascii_lowercase()))
    }

    pub fn signed_url_ttl(&self) -> Duration {
        Duration::from_secs(self.signed_url_ttl_secs)
    }
}

/// Synthesis provider endpoint and credentials
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProviderConfig {
    pub base_url: String,
    pub api_key: String,
    pub model_id: String,
    pub request_timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.elevenlabs.io/v1".to_string(),
            api_key: String::new(),
            model_id: "eleven_monolingual_v1".to_string(),
            request_timeout_secs: 25,
        }
    }
}

impl ProviderConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Queue names and delivery lease
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueConfig {
    pub sample_events: String,
    pub train_voice: String,
    pub clone_voice: String,
    pub create_output: String,
    /// How long a received message stays invisible before redelivery
    pub visibility_timeout_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            sample_events: "sample-events".to_string(),
            train_voice: "train-voice".to_string(),
            clone_voice: "clone-voice".to_string(),
            create_output: "create-output".to_string(),
            visibility_timeout_secs: 60,
        }
    }
}

impl QueueConfig {
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    pub fn all(&self) -> [&str; 4] {
        [
            &self.sample_events,
            &self.train_voice,
            &self.clone_voice,
            &self.create_output,
        ]
    }
}

/// Bounded exponential backoff shared by every stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryPolicy {
    /// Total handler invocations allowed before dead-lettering
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before the given retry (1-based): base * 2^(retry-1), capped
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(32);
        let delay = self
            .base_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_delay_ms);
        Duration::from_millis(delay)
    }

    /// True once `failed_attempts` invocations have failed and no more are allowed
    pub fn is_exhausted(&self, failed_attempts: u32) -> bool {
        failed_attempts >= self.max_attempts
    }
}

/// Consumer pool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerConfig {
    /// Concurrent pollers per queue
    pub concurrency: usize,
    pub poll_interval_ms: u64,
    /// Per-invocation execution bound
    pub invocation_timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            poll_interval_ms: 250,
            invocation_timeout_secs: 28,
        }
    }
}

impl WorkerConfig {
    pub fn invocation_timeout(&self) -> Duration {
        Duration::from_secs(self.invocation_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Front-door API settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ApiConfig {
    pub bind: String,
    pub max_text_chars: usize,
    pub max_upload_bytes: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:5730".to_string(),
            max_text_chars: 5_000,
            max_upload_bytes: 16 * 1024 * 1024,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// Level or EnvFilter directive (RUST_LOG takes precedence)
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Complete immutable configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub schema_version: u32,
    pub stage: Stage,
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub provider: ProviderConfig,
    pub queues: QueueConfig,
    pub retry: RetryPolicy,
    pub worker: WorkerConfig,
    pub api: ApiConfig,
    pub logging: LoggingConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            stage: Stage::default(),
            database: DatabaseConfig::default(),
            storage: StorageConfig::default(),
            provider: ProviderConfig::default(),
            queues: QueueConfig::default(),
            retry: RetryPolicy::default(),
            worker: WorkerConfig::default(),
            api: ApiConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Resolve configuration: defaults, then optional TOML file, then environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                info!("No config file given, using built-in defaults");
                Self::default()
            }
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML config file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Read {} failed: {}", path.display(), e)))?;
        let config = Self::from_toml_str(&content)?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Parse TOML text; rejects schemas newer than this build
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: PipelineConfig = toml::from_str(content)
            .map_err(|e| Error::Config(format!("Parse TOML failed: {}", e)))?;
        if config.schema_version > CURRENT_SCHEMA_VERSION {
            return Err(Error::Config(format!(
                "Config schema_version {} is newer than supported version {}",
                config.schema_version, CURRENT_SCHEMA_VERSION
            )));
        }
        if config.schema_version == 0 {
            return Err(Error::Config("schema_version must be at least 1".to_string()));
        }
        Ok(config)
    }

    /// Apply environment overrides through `lookup` (first listed name wins)
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let first = |names: &[&str]| names.iter().find_map(|name| lookup(name));

        if let Some(stage) = first(&["PARROT_STAGE", "STAGE"]) {
            self.stage = Stage::from(stage);
        }
        if let Some(url) = first(&["PARROT_DATABASE_URL"]) {
            self.database.url = url;
        }
        if let Some(root) = first(&["PARROT_STORAGE_ROOT"]) {
            self.storage.root = PathBuf::from(root);
        }
        if let Some(secret) = first(&["PARROT_SIGNING_SECRET"]) {
            self.storage.signing_secret = secret;
        }
        if let Some(key) = first(&["PARROT_PROVIDER_API_KEY", "ELEVEN_LABS_API_KEY"]) {
            self.provider.api_key = key;
        }
        if let Some(url) = first(&["PARROT_PROVIDER_BASE_URL"]) {
            self.provider.base_url = url;
        }
        if let Some(bind) = first(&["PARROT_API_BIND"]) {
            self.api.bind = bind;
        }
        if let Some(level) = first(&["PARROT_LOG_LEVEL", "LOG_LEVEL"]) {
            self.logging.level = level.to_lowercase();
        }
    }

    /// Reject configurations the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            return Err(Error::Config("retry.max_attempts must be at least 1".to_string()));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(Error::Config(format!(
                "retry.base_delay_ms ({}) exceeds retry.max_delay_ms ({})",
                self.retry.base_delay_ms, self.retry.max_delay_ms
            )));
        }
        if self.storage.sample_suffixes.is_empty()
            || self.storage.sample_suffixes.iter().any(|s| s.trim().is_empty())
        {
            return Err(Error::Config(
                "storage.sample_suffixes must list at least one non-empty suffix".to_string(),
            ));
        }

        let names = self.queues.all();
        if names.iter().any(|name| name.trim().is_empty()) {
            return Err(Error::Config("queue names must not be empty".to_string()));
        }
        for (i, name) in names.iter().enumerate() {
            if names[i + 1..].contains(name) {
                return Err(Error::Config(format!("queue name '{}' used twice", name)));
            }
        }

        let buckets = [
            &self.storage.samples_bucket,
            &self.storage.outputs_bucket,
            &self.storage.scratch_bucket,
        ];
        if buckets.iter().any(|b| b.trim().is_empty() || b.contains('/')) {
            return Err(Error::Config(
                "bucket names must be non-empty and contain no '/'".to_string(),
            ));
        }

        if self.worker.concurrency == 0 {
            return Err(Error::Config("worker.concurrency must be at least 1".to_string()));
        }
        if self.worker.invocation_timeout_secs == 0 {
            return Err(Error::Config(
                "worker.invocation_timeout_secs must be at least 1".to_string(),
            ));
        }
        if self.queues.visibility_timeout_secs < self.worker.invocation_timeout_secs {
            warn!(
                visibility_timeout_secs = self.queues.visibility_timeout_secs,
                invocation_timeout_secs = self.worker.invocation_timeout_secs,
                "Visibility timeout shorter than invocation timeout; slow jobs may be redelivered while running"
            );
        }

        if self.storage.signing_secret.is_empty() {
            match self.stage {
                Stage::Local | Stage::Test => {
                    warn!("storage.signing_secret is empty; signed references are forgeable")
                }
                _ => {
                    return Err(Error::Config(
                        "storage.signing_secret is required outside local/test stages".to_string(),
                    ))
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_validate() {
        let config = PipelineConfig::default();
        assert_eq!(config.schema_version, CURRENT_SCHEMA_VERSION);
        assert_eq!(config.storage.sample_suffixes, vec![".mp3".to_string()]);
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = PipelineConfig::from_toml_str(
            r#"
            schema_version = 1
            stage = "prod"

            [retry]
            max_attempts = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.stage, Stage::Prod);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.base_delay_ms, 1_000);
        assert_eq!(config.queues.train_voice, "train-voice");
    }

    #[test]
    fn test_newer_schema_rejected() {
        let err = PipelineConfig::from_toml_str("schema_version = 2").unwrap_err();
        assert!(err.to_string().contains("newer than supported"));
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(PipelineConfig::from_toml_str("[retry]\nmax_tries = 3").is_err());
    }

    #[test]
    fn test_env_overrides_prefer_parrot_names() {
        let env: HashMap<&str, &str> = [
            ("PARROT_PROVIDER_API_KEY", "primary"),
            ("ELEVEN_LABS_API_KEY", "legacy"),
            ("LOG_LEVEL", "DEBUG"),
            ("STAGE", "staging"),
        ]
        .into_iter()
        .collect();

        let mut config = PipelineConfig::default();
        config.apply_env_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.provider.api_key, "primary");
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.stage, Stage::Other("staging".to_string()));
    }

    #[test]
    fn test_prod_requires_signing_secret() {
        let mut config = PipelineConfig::default();
        config.stage = Stage::Prod;
        assert!(config.validate().is_err());

        config.storage.signing_secret = "s3cret".to_string();
        config.validate().unwrap();
    }

    #[test]
    fn test_sample_suffix_match_ignores_case() {
        let mut storage = StorageConfig::default();
        storage.sample_suffixes.push(".WAV".to_string());

        assert!(storage.is_sample_key("voice123/sample.mp3"));
        assert!(storage.is_sample_key("voice123/SAMPLE.MP3"));
        assert!(storage.is_sample_key("voice123/take.wav"));
        assert!(!storage.is_sample_key("voice123/notes.txt"));
        assert!(!storage.is_sample_key("voice123/mp3"));
    }

    #[test]
    fn test_duplicate_queue_names_rejected() {
        let mut config = PipelineConfig::default();
        config.queues.clone_voice = config.queues.train_voice.clone();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
        };
        assert_eq!(policy.delay_for_retry(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_retry(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_retry(4), Duration::from_millis(800));
        assert_eq!(policy.delay_for_retry(5), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for_retry(60), Duration::from_millis(1_000));
    }

    #[test]
    fn test_retry_exhaustion_boundary() {
        let policy = RetryPolicy {
            max_attempts: 3,
            ..Default::default()
        };
        assert!(!policy.is_exhausted(2));
        assert!(policy.is_exhausted(3));
    }
}
