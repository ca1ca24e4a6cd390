//! HTTP API handlers for parrot-api

pub mod clones;
pub mod health;
pub mod jobs;
pub mod outputs;
pub mod samples;
pub mod voices;

pub use clones::{get_clone, get_clone_output, regenerate_clone, submit_clone};
pub use health::health_check;
pub use jobs::{get_job, list_dead_letters};
pub use outputs::{download_output, get_artifact};
pub use samples::upload_sample;
pub use voices::{get_voice, list_voices};
