//! Integration tests for the parrot-api endpoints
//!
//! Each test gets a fresh metadata store and object store in a temp
//! directory. Where a test needs the pipeline to make progress it drives the
//! real stage workers over the same store with a fake synthesis provider.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use parrot_api::{build_router, AppState};
use parrot_common::config::PipelineConfig;
use parrot_common::signing::calculate_signature;
use parrot_pipeline::{Pipeline, ProviderError, StageContext, SynthesisProvider, TrainingSample};
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::util::ServiceExt; // for `oneshot` method

const SAMPLE_MP3: &[u8] = &[0xFF, 0xFB, 0x90, 0x64, 0x00, 0x00, 0x00, 0x00];
const BASE_URL: &str = "http://parrot.test";

/// Provider fake: trains every voice, speaks text back behind an ID3 tag
#[derive(Default)]
struct FakeProvider {
    training_rejected: AtomicBool,
    synthesis_down: AtomicBool,
    synth_calls: AtomicUsize,
}

#[async_trait]
impl SynthesisProvider for FakeProvider {
    async fn train_voice(&self, sample: TrainingSample) -> Result<String, ProviderError> {
        if self.training_rejected.load(Ordering::SeqCst) {
            return Err(ProviderError::Terminal {
                status: Some(400),
                message: "sample too noisy".to_string(),
            });
        }
        Ok(format!("model-{}", sample.voice_id))
    }

    async fn synthesize(&self, _model_ref: &str, text: &str) -> Result<Vec<u8>, ProviderError> {
        let call = self.synth_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.synthesis_down.load(Ordering::SeqCst) {
            return Err(ProviderError::Transient {
                status: Some(503),
                message: "provider overloaded".to_string(),
            });
        }
        let mut audio = b"ID3\x04\x00\x00\x00\x00\x00\x00".to_vec();
        audio.extend_from_slice(format!("{}#{}", text, call).as_bytes());
        Ok(audio)
    }
}

struct TestApp {
    _dir: TempDir,
    router: Router,
    pipeline: Pipeline,
    provider: Arc<FakeProvider>,
}

async fn setup() -> TestApp {
    setup_with(|_| {}).await
}

async fn setup_with(adjust: impl FnOnce(&mut PipelineConfig)) -> TestApp {
    let dir = TempDir::new().unwrap();
    let mut config = PipelineConfig::default();
    config.database.url = format!("sqlite://{}?mode=rwc", dir.path().join("parrot.db").display());
    config.storage.root = dir.path().join("storage");
    config.storage.signing_secret = "test-secret".to_string();
    config.storage.public_base_url = BASE_URL.to_string();
    config.retry.max_attempts = 3;
    config.retry.base_delay_ms = 0;
    config.retry.max_delay_ms = 0;
    adjust(&mut config);
    let config = Arc::new(config);

    let provider = Arc::new(FakeProvider::default());
    let ctx = StageContext::connect(config.clone(), provider.clone()).await.unwrap();
    let router = build_router(AppState::new(config, ctx.db.clone()));

    TestApp {
        _dir: dir,
        router,
        pipeline: Pipeline::new(ctx),
        provider,
    }
}

impl TestApp {
    async fn send(&self, request: Request<Body>) -> (StatusCode, Vec<u8>) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("Should read body");
        (status, bytes.to_vec())
    }

    async fn get(&self, uri: &str) -> (StatusCode, Value) {
        let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let (status, bytes) = self.send(request).await;
        (status, parse_json(&bytes))
    }

    async fn post_json(&self, uri: &str, body: Value) -> (StatusCode, Value) {
        let request = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let (status, bytes) = self.send(request).await;
        (status, parse_json(&bytes))
    }

    async fn put_sample(&self, voice_id: &str, file_name: &str, bytes: &[u8]) -> (StatusCode, Value) {
        let request = Request::builder()
            .method("PUT")
            .uri(format!("/samples/{}/{}", voice_id, file_name))
            .body(Body::from(bytes.to_vec()))
            .unwrap();
        let (status, bytes) = self.send(request).await;
        (status, parse_json(&bytes))
    }

    /// Fetch a signed output URL through the router
    async fn download(&self, url: &str) -> (StatusCode, Option<String>, Vec<u8>) {
        let path = url.strip_prefix(BASE_URL).expect("URL should use the public base");
        let request = Request::builder().uri(path).body(Body::empty()).unwrap();
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, content_type, bytes.to_vec())
    }

    async fn submit(&self, voice_id: &str, text: &str) -> String {
        let (status, body) = self
            .post_json("/clones", json!({ "voice_id": voice_id, "text": text }))
            .await;
        assert_eq!(status, StatusCode::ACCEPTED, "submit failed: {}", body);
        body["id"].as_str().unwrap().to_string()
    }

    async fn drain(&self) {
        self.pipeline.run_until_idle().await.unwrap();
    }
}

fn parse_json(bytes: &[u8]) -> Value {
    if bytes.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(bytes).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()))
}

fn error_code(body: &Value) -> &str {
    body["error"]["code"].as_str().unwrap_or_default()
}

// =============================================================================
// Health
// =============================================================================

#[tokio::test]
async fn test_health_reports_queue_depths() {
    let app = setup().await;

    let (status, body) = app.get("/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["module"], "parrot-api");
    assert_eq!(body["queues"].as_object().unwrap().len(), 4);
}

// =============================================================================
// Sample upload
// =============================================================================

#[tokio::test]
async fn test_upload_assigns_versions_and_records_pending_sample() {
    let app = setup().await;

    let (status, first) = app.put_sample("voice123", "sample.mp3", SAMPLE_MP3).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(first["key"], "voice123/sample.mp3");
    assert_eq!(first["version"], 1);
    assert_eq!(first["event_id"], "samples/voice123/sample.mp3@v1");

    let (_, second) = app.put_sample("voice123", "sample.mp3", SAMPLE_MP3).await;
    assert_eq!(second["version"], 2);

    let (status, voice) = app.get("/voices/voice123").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(voice["latest_sample"]["status"], "pending");
    assert_eq!(voice["latest_sample"]["object_version"], 2);
    assert!(voice["profile"].is_null());
}

#[tokio::test]
async fn test_upload_rejects_bad_input() {
    let app = setup_with(|config| config.api.max_upload_bytes = 64).await;

    let (status, body) = app.put_sample("voice123", "sample.mp3", b"").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error_code(&body), "VALIDATION_ERROR");

    let (status, _) = app.put_sample("bad.voice", "sample.mp3", SAMPLE_MP3).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = app.put_sample("voice123", "sample.mp3", &[0u8; 128]).await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
}

// =============================================================================
// Clone submission
// =============================================================================

#[tokio::test]
async fn test_submit_validates_voice_and_text() {
    let app = setup_with(|config| config.api.max_text_chars = 10).await;

    let (status, body) = app
        .post_json("/clones", json!({ "voice_id": "ghost", "text": "hello" }))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(error_code(&body), "NOT_FOUND");

    app.put_sample("voice123", "sample.mp3", SAMPLE_MP3).await;

    let (status, _) = app
        .post_json("/clones", json!({ "voice_id": "voice123", "text": "   " }))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = app
        .post_json("/clones", json!({ "voice_id": "voice123", "text": "far too long for this" }))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_submit_before_training_waits_in_queued() {
    let app = setup().await;
    app.put_sample("voice123", "sample.mp3", SAMPLE_MP3).await;

    let id = app.submit("voice123", "hello there").await;

    let (status, body) = app.get(&format!("/clones/{}", id)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "queued");
    assert!(body["output"].is_null());

    let (status, body) = app.get(&format!("/clones/{}/output", id)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(error_code(&body), "NOT_READY");
}

#[tokio::test]
async fn test_unknown_clone_is_not_found() {
    let app = setup().await;

    let (status, body) = app.get("/clones/does-not-exist").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(error_code(&body), "NOT_FOUND");

    let (status, _) = app.get("/artifacts/does-not-exist").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// =============================================================================
// End to end
// =============================================================================

#[tokio::test]
async fn test_upload_to_signed_download() {
    let app = setup().await;
    app.put_sample("voice123", "sample.mp3", SAMPLE_MP3).await;
    let id = app.submit("voice123", "hello there").await;

    app.drain().await;

    let (status, clone) = app.get(&format!("/clones/{}", id)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(clone["status"], "done");
    assert_eq!(clone["generation"], 1);
    let output = &clone["output"];
    assert_eq!(output["key"], format!("voice123/output-{}", id));
    assert_eq!(output["version"], 1);
    assert_eq!(output["content_type"], "audio/mpeg");

    let (status, content_type, bytes) = app.download(output["url"].as_str().unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(content_type.as_deref(), Some("audio/mpeg"));
    assert!(bytes.starts_with(b"ID3"));
    assert!(bytes.ends_with(b"hello there#1"));

    let (status, reference) = app.get(&format!("/clones/{}/output", id)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(reference["artifact_id"], output["artifact_id"]);

    let (status, artifact) = app
        .get(&format!("/artifacts/{}", output["artifact_id"].as_str().unwrap()))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(artifact["status"], "stored");
    assert_eq!(artifact["job_id"], format!("output:{}:g1", id));
}

#[tokio::test]
async fn test_job_and_voice_status_after_training() {
    let app = setup().await;
    app.put_sample("voice123", "sample.mp3", SAMPLE_MP3).await;

    let (status, job) = app.get("/jobs/train:voice123/sample.mp3@v1").await;
    assert_eq!(status, StatusCode::NOT_FOUND, "no train job before ingestion: {}", job);

    app.drain().await;

    let (status, job) = app.get("/jobs/train:voice123/sample.mp3@v1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(job["status"], "processed");
    assert_eq!(job["attempts"], 1);

    let (_, voices) = app.get("/voices").await;
    let voices = voices.as_array().unwrap();
    assert_eq!(voices.len(), 1);
    assert_eq!(voices[0]["voice_id"], "voice123");
    assert_eq!(voices[0]["status"], "trained");
    assert_eq!(voices[0]["model_ref"], "model-voice123");

    let (_, voice) = app.get("/voices/voice123").await;
    assert_eq!(voice["latest_sample"]["status"], "ingested");

    let (status, _) = app.get("/voices/nobody").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_regenerate_appends_version_and_keeps_old_reference() {
    let app = setup().await;
    app.put_sample("voice123", "sample.mp3", SAMPLE_MP3).await;
    let id = app.submit("voice123", "hello there").await;
    app.drain().await;

    let (_, first) = app.get(&format!("/clones/{}", id)).await;
    let first_url = first["output"]["url"].as_str().unwrap().to_string();

    let (status, body) = app.post_json(&format!("/clones/{}/regenerate", id), json!({})).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["generation"], 2);
    assert_eq!(body["status"], "queued");

    // A second regenerate while generation 2 is outstanding is refused
    let (status, body) = app.post_json(&format!("/clones/{}/regenerate", id), json!({})).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(error_code(&body), "CONFLICT");

    app.drain().await;

    let (_, second) = app.get(&format!("/clones/{}", id)).await;
    assert_eq!(second["status"], "done");
    assert_eq!(second["output"]["version"], 2);
    assert_ne!(second["output"]["artifact_id"], first["output"]["artifact_id"]);

    let (_, _, latest) = app.download(second["output"]["url"].as_str().unwrap()).await;
    assert!(latest.ends_with(b"hello there#2"));

    let (status, _, original) = app.download(&first_url).await;
    assert_eq!(status, StatusCode::OK);
    assert!(original.ends_with(b"hello there#1"));
}

// =============================================================================
// Signed retrieval
// =============================================================================

#[tokio::test]
async fn test_download_rejects_bad_references() {
    let app = setup().await;
    app.put_sample("voice123", "sample.mp3", SAMPLE_MP3).await;
    let id = app.submit("voice123", "hello there").await;
    app.drain().await;

    let (_, clone) = app.get(&format!("/clones/{}", id)).await;
    let url = clone["output"]["url"].as_str().unwrap();
    let key = clone["output"]["key"].as_str().unwrap();

    // Same signature presented for another version
    let tampered = url.replace("version=1", "version=2");
    let (status, _, _) = app.download(&tampered).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let expires = chrono::Utc::now().timestamp() - 10;
    let signature = calculate_signature("test-secret", "outputs", key, 1, expires);
    let expired = format!(
        "{}/outputs/{}?version=1&expires={}&signature={}",
        BASE_URL, key, expires, signature
    );
    let (status, _, _) = app.download(&expired).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _, _) = app.download(&format!("{}/outputs/{}?version=1", BASE_URL, key)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

// =============================================================================
// Failure paths
// =============================================================================

#[tokio::test]
async fn test_exhausted_job_is_dead_lettered_and_request_failed() {
    let app = setup().await;
    app.provider.synthesis_down.store(true, Ordering::SeqCst);
    app.put_sample("voice123", "sample.mp3", SAMPLE_MP3).await;
    let id = app.submit("voice123", "hello there").await;

    app.drain().await;

    assert_eq!(app.provider.synth_calls.load(Ordering::SeqCst), 3);

    let (_, clone) = app.get(&format!("/clones/{}", id)).await;
    assert_eq!(clone["status"], "failed");
    assert!(clone["failure_reason"].as_str().unwrap().contains("provider overloaded"));

    let (status, body) = app.get(&format!("/clones/{}/output", id)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(error_code(&body), "CONFLICT");

    let job_id = format!("clone:{}:g1", id);
    let (_, job) = app.get(&format!("/jobs/{}", job_id)).await;
    assert_eq!(job["status"], "dead_lettered");

    let (status, letters) = app.get("/dead-letters?queue=clone-voice").await;
    assert_eq!(status, StatusCode::OK);
    let letters = letters.as_array().unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0]["message_id"], job_id);
    assert_eq!(letters[0]["attempts"], 3);

    // A failed request may be regenerated once the provider recovers
    app.provider.synthesis_down.store(false, Ordering::SeqCst);
    let (status, _) = app.post_json(&format!("/clones/{}/regenerate", id), json!({})).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    app.drain().await;

    let (_, clone) = app.get(&format!("/clones/{}", id)).await;
    assert_eq!(clone["status"], "done");
    assert_eq!(clone["output"]["version"], 1);
}

#[tokio::test]
async fn test_rejected_sample_blocks_submission() {
    let app = setup_with(|config| config.storage.max_sample_bytes = 4).await;
    app.put_sample("voice123", "sample.mp3", SAMPLE_MP3).await;
    app.drain().await;

    let (_, voice) = app.get("/voices/voice123").await;
    assert_eq!(voice["latest_sample"]["status"], "failed");

    let (status, body) = app
        .post_json("/clones", json!({ "voice_id": "voice123", "text": "hello" }))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(error_code(&body), "NOT_READY");
}

#[tokio::test]
async fn test_request_waiting_on_rejected_sample_is_failed() {
    let app = setup_with(|config| config.storage.max_sample_bytes = 4).await;
    app.put_sample("voice123", "sample.mp3", SAMPLE_MP3).await;

    // Accepted while the sample is still pending
    let id = app.submit("voice123", "hello").await;
    let (_, clone) = app.get(&format!("/clones/{}", id)).await;
    assert_eq!(clone["status"], "queued");

    app.drain().await;

    let (_, voice) = app.get("/voices/voice123").await;
    assert_eq!(voice["latest_sample"]["status"], "failed");

    let (_, clone) = app.get(&format!("/clones/{}", id)).await;
    assert_eq!(clone["status"], "failed");
    assert!(clone["failure_reason"].as_str().unwrap().contains("voice sample rejected"));

    let (status, body) = app.get(&format!("/clones/{}/output", id)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(error_code(&body), "CONFLICT");
}

#[tokio::test]
async fn test_submit_while_failed_voice_retrains_waits_in_queued() {
    let app = setup().await;
    app.provider.training_rejected.store(true, Ordering::SeqCst);
    app.put_sample("voice123", "sample.mp3", SAMPLE_MP3).await;
    app.drain().await;

    let (_, voice) = app.get("/voices/voice123").await;
    assert_eq!(voice["profile"]["status"], "failed");

    // A fresh sample is on its way to retrain the voice
    app.provider.training_rejected.store(false, Ordering::SeqCst);
    app.put_sample("voice123", "sample.mp3", SAMPLE_MP3).await;
    let id = app.submit("voice123", "second try").await;

    let (_, clone) = app.get(&format!("/clones/{}", id)).await;
    assert_eq!(clone["status"], "queued");

    app.drain().await;

    let (_, clone) = app.get(&format!("/clones/{}", id)).await;
    assert_eq!(clone["status"], "done");
    let (_, voice) = app.get("/voices/voice123").await;
    assert_eq!(voice["profile"]["status"], "trained");
}

#[tokio::test]
async fn test_superseded_clone_job_reports_absorbed() {
    let app = setup().await;
    app.put_sample("voice123", "sample.mp3", SAMPLE_MP3).await;
    app.drain().await;

    // Retraining is queued ahead of the clone job and fails
    app.provider.training_rejected.store(true, Ordering::SeqCst);
    app.put_sample("voice123", "sample.mp3", SAMPLE_MP3).await;
    app.pipeline.trigger.drain().await.unwrap();
    let id = app.submit("voice123", "hello there").await;

    app.drain().await;

    let (_, clone) = app.get(&format!("/clones/{}", id)).await;
    assert_eq!(clone["status"], "failed");
    assert_eq!(app.provider.synth_calls.load(Ordering::SeqCst), 0);

    let (status, job) = app.get(&format!("/jobs/clone:{}:g1", id)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(job["status"], "absorbed");
    assert!(job["detail"].as_str().unwrap().contains("already failed"));
}
