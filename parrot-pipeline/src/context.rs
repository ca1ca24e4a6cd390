//! Shared handles passed to every stage at construction

use std::sync::Arc;

use parrot_common::config::PipelineConfig;
use parrot_common::db::init_database;
use parrot_common::queue::SqliteQueue;
use parrot_common::storage::ObjectStore;
use sqlx::SqlitePool;

use crate::provider::SynthesisProvider;

/// Immutable configuration plus connections; cheap to clone
#[derive(Clone)]
pub struct StageContext {
    pub config: Arc<PipelineConfig>,
    pub db: SqlitePool,
    pub queue: SqliteQueue,
    pub store: ObjectStore,
    pub provider: Arc<dyn SynthesisProvider>,
}

impl StageContext {
    /// Open the metadata store and object store named by `config`
    pub async fn connect(
        config: Arc<PipelineConfig>,
        provider: Arc<dyn SynthesisProvider>,
    ) -> parrot_common::Result<Self> {
        let db = init_database(&config.database.url).await?;
        Ok(Self::new(config, db, provider))
    }

    pub fn new(config: Arc<PipelineConfig>, db: SqlitePool, provider: Arc<dyn SynthesisProvider>) -> Self {
        let queue = SqliteQueue::new(db.clone(), config.queues.visibility_timeout());
        let store = ObjectStore::new(config.storage.root.clone());
        Self {
            config,
            db,
            queue,
            store,
            provider,
        }
    }
}
