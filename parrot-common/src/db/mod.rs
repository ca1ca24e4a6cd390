//! Metadata store: entity collections, processed-job ledger, queue tables
//!
//! Every write is keyed by voice id or job id. Writers for the same voice are
//! serialized by queue group ordering, so no row locking is done here.

pub mod artifacts;
pub mod clones;
pub mod init;
pub mod ledger;
pub mod profiles;
pub mod retry;
pub mod samples;

pub use init::init_database;
pub use retry::retry_on_lock;

use crate::{Error, Result};

/// Stored integers are i64; domain counters are u64
pub(crate) fn to_u64(value: i64, column: &str) -> Result<u64> {
    u64::try_from(value)
        .map_err(|_| Error::Internal(format!("Negative value {} in column {}", value, column)))
}

pub(crate) fn to_i64(value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| Error::InvalidInput(format!("Value {} out of range", value)))
}
