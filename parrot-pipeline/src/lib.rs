//! parrot-pipeline library interface
//!
//! The sample-ingestion trigger and the train-voice, clone-voice and
//! create-output consumers, plus the queue worker that drives them.

pub mod consumers;
pub mod context;
pub mod error;
pub mod pipeline;
pub mod postprocess;
pub mod provider;
pub mod trigger;
pub mod worker;

pub use crate::context::StageContext;
pub use crate::error::{StageError, StageResult};
pub use crate::pipeline::{DrainReport, Pipeline};
pub use crate::provider::{ElevenLabsClient, ProviderError, SynthesisProvider, TrainingSample};
pub use crate::worker::{HandleOutcome, JobDisposition, StageHandler, Worker};
