//! # Parrot Common Library
//!
//! Shared code for the parrot voice-cloning pipeline:
//! - Configuration loading and validation
//! - Metadata store (entities, processed-job ledger)
//! - Ordered SQLite-backed work queues
//! - Versioned object storage and signed output references
//! - Job message types, logging setup and shutdown signal

pub mod config;
pub mod db;
pub mod error;
pub mod job;
pub mod logging;
pub mod models;
pub mod queue;
pub mod shutdown;
pub mod signing;
pub mod storage;
pub mod time;

pub use error::{Error, Result};
