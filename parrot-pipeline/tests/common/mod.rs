//! Shared fixtures for pipeline integration tests

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use parrot_common::config::PipelineConfig;
use parrot_common::db::{clones, profiles};
use parrot_common::job::{JobEnvelope, ObjectCreated};
use parrot_common::models::{CloneRequest, ProfileStatus};
use parrot_common::storage::StoredObject;
use parrot_pipeline::{Pipeline, ProviderError, StageContext, SynthesisProvider, TrainingSample};
use tempfile::TempDir;

/// MP3 frame header followed by padding
pub const SAMPLE_MP3: &[u8] = &[0xFF, 0xFB, 0x90, 0x64, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];

/// Provider fake: plays scripted results in order, then succeeds
#[derive(Default)]
pub struct ScriptedProvider {
    train_script: Mutex<VecDeque<Result<String, ProviderError>>>,
    synth_script: Mutex<VecDeque<Result<Vec<u8>, ProviderError>>>,
    train_calls: AtomicUsize,
    synth_calls: AtomicUsize,
    synth_models: Mutex<Vec<String>>,
    lost_responses: Mutex<VecDeque<String>>,
    created_voices: Mutex<Vec<(String, String)>>,
    find_calls: AtomicUsize,
}

impl ScriptedProvider {
    pub fn script_training(&self, result: Result<String, ProviderError>) {
        self.train_script.lock().unwrap().push_back(result);
    }

    pub fn script_synthesis(&self, result: Result<Vec<u8>, ProviderError>) {
        self.synth_script.lock().unwrap().push_back(result);
    }

    /// Next training call creates `model_ref` but fails as if the response was lost
    pub fn script_lost_training_response(&self, model_ref: &str) {
        self.lost_responses.lock().unwrap().push_back(model_ref.to_string());
    }

    pub fn find_calls(&self) -> usize {
        self.find_calls.load(Ordering::SeqCst)
    }

    pub fn train_calls(&self) -> usize {
        self.train_calls.load(Ordering::SeqCst)
    }

    pub fn synth_calls(&self) -> usize {
        self.synth_calls.load(Ordering::SeqCst)
    }

    /// Model references passed to synthesis, in call order
    pub fn synth_models(&self) -> Vec<String> {
        self.synth_models.lock().unwrap().clone()
    }
}

/// Synthesized audio for `text`: an ID3 tag followed by the text bytes
pub fn synthesized_audio(text: &str) -> Vec<u8> {
    let mut audio = b"ID3\x04\x00\x00\x00\x00\x00\x00".to_vec();
    audio.extend_from_slice(text.as_bytes());
    audio
}

pub fn transient(message: &str) -> ProviderError {
    ProviderError::Transient {
        status: Some(503),
        message: message.to_string(),
    }
}

pub fn terminal(message: &str) -> ProviderError {
    ProviderError::Terminal {
        status: Some(400),
        message: message.to_string(),
    }
}

#[async_trait]
impl SynthesisProvider for ScriptedProvider {
    async fn train_voice(&self, sample: TrainingSample) -> Result<String, ProviderError> {
        self.train_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(model_ref) = self.lost_responses.lock().unwrap().pop_front() {
            self.created_voices.lock().unwrap().push((sample.sample_id, model_ref));
            return Err(transient("connection reset"));
        }
        let result = match self.train_script.lock().unwrap().pop_front() {
            Some(result) => result,
            None => Ok(format!("model-{}", sample.voice_id)),
        };
        if let Ok(model_ref) = &result {
            self.created_voices.lock().unwrap().push((sample.sample_id, model_ref.clone()));
        }
        result
    }

    async fn find_voice(&self, name: &str) -> Result<Option<String>, ProviderError> {
        self.find_calls.fetch_add(1, Ordering::SeqCst);
        let voices = self.created_voices.lock().unwrap();
        Ok(voices.iter().find(|(n, _)| n == name).map(|(_, model_ref)| model_ref.clone()))
    }

    async fn synthesize(&self, model_ref: &str, text: &str) -> Result<Vec<u8>, ProviderError> {
        self.synth_calls.fetch_add(1, Ordering::SeqCst);
        self.synth_models.lock().unwrap().push(model_ref.to_string());
        match self.synth_script.lock().unwrap().pop_front() {
            Some(result) => result,
            None => Ok(synthesized_audio(text)),
        }
    }
}

/// A pipeline over a temporary metadata store and object store
pub struct TestPipeline {
    pub _dir: TempDir,
    pub ctx: StageContext,
    pub provider: Arc<ScriptedProvider>,
    pub pipeline: Pipeline,
}

/// Config with immediate retries and a short retry bound
pub fn test_config(dir: &TempDir) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.database.url = format!("sqlite://{}?mode=rwc", dir.path().join("parrot.db").display());
    config.storage.root = dir.path().join("storage");
    config.storage.signing_secret = "test-secret".to_string();
    config.retry.max_attempts = 3;
    config.retry.base_delay_ms = 0;
    config.retry.max_delay_ms = 0;
    config.worker.poll_interval_ms = 10;
    config
}

pub async fn setup() -> TestPipeline {
    setup_with(|_| {}).await
}

pub async fn setup_with(adjust: impl FnOnce(&mut PipelineConfig)) -> TestPipeline {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    adjust(&mut config);

    let provider = Arc::new(ScriptedProvider::default());
    let ctx = StageContext::connect(Arc::new(config), provider.clone()).await.unwrap();
    let pipeline = Pipeline::new(ctx.clone());

    TestPipeline {
        _dir: dir,
        ctx,
        provider,
        pipeline,
    }
}

impl TestPipeline {
    /// Write an object and deliver its creation notification
    pub async fn upload(&self, bucket: &str, key: &str, bytes: &[u8]) -> StoredObject {
        let stored = self.ctx.store.put(bucket, key, bytes).await.unwrap();
        self.notify(&stored).await;
        stored
    }

    pub async fn upload_sample(&self, key: &str) -> StoredObject {
        let bucket = self.ctx.config.storage.samples_bucket.clone();
        self.upload(&bucket, key, SAMPLE_MP3).await
    }

    pub async fn notify(&self, stored: &StoredObject) {
        let event = ObjectCreated::new(&stored.bucket, &stored.key, stored.version, stored.size_bytes);
        self.ctx
            .queue
            .send(&self.ctx.config.queues.sample_events, &event)
            .await
            .unwrap();
    }

    /// Create a clone request the way the API does: enqueue now if the voice
    /// is trained, otherwise leave it for the train-voice consumer to release
    pub async fn submit_clone(&self, voice_id: &str, text: &str) -> CloneRequest {
        let request = CloneRequest::new(voice_id, text);
        clones::create(&self.ctx.db, &request).await.unwrap();

        let trained = profiles::get(&self.ctx.db, voice_id)
            .await
            .unwrap()
            .is_some_and(|p| p.status == ProfileStatus::Trained);
        if trained {
            let job = JobEnvelope::clone_voice(voice_id, &request.id, request.generation);
            self.ctx
                .queue
                .send(&self.ctx.config.queues.clone_voice, &job)
                .await
                .unwrap();
        }
        request
    }
}
