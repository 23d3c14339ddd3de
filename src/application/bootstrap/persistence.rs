use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

use crate::config::PersistenceEnvConfig;
use crate::domain::repositories::SnapshotRepository;
use crate::infrastructure::persistence::{Database, SqliteSnapshotRepository};
use crate::infrastructure::repositories::InMemorySnapshotRepository;

pub struct PersistenceHandle {
    pub db: Option<Database>,
    pub snapshot_repository: Arc<dyn SnapshotRepository>,
}

pub struct PersistenceBootstrap;

impl PersistenceBootstrap {
    /// `None` when export is disabled.
    pub async fn init(config: &PersistenceEnvConfig) -> Result<Option<PersistenceHandle>> {
        if let Some(db_url) = &config.database_url {
            info!("Initializing Database at {}", db_url);
            let db = Database::new(db_url)
                .await
                .context("Failed to initialize database")?;
            let snapshot_repository = Arc::new(SqliteSnapshotRepository::new(db.pool.clone()));
            return Ok(Some(PersistenceHandle {
                db: Some(db),
                snapshot_repository,
            }));
        }

        if config.in_memory_fallback {
            info!("No DATABASE_URL; exporting snapshots to memory");
            return Ok(Some(PersistenceHandle {
                db: None,
                snapshot_repository: Arc::new(InMemorySnapshotRepository::new()),
            }));
        }

        info!("Snapshot export disabled (no DATABASE_URL)");
        Ok(None)
    }
}
