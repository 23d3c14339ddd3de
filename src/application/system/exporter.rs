use crate::application::market_data::FeatureCache;
use crate::application::system::cancel::stop_requested;
use crate::application::system::service::ExportRecord;
use crate::domain::repositories::SnapshotRepository;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{error, info};

/// Writes window snapshots on an interval and predictions/explanations as
/// they are produced. Persistence failures are logged and never reach the
/// prediction path.
pub struct SnapshotExporter {
    repository: Arc<dyn SnapshotRepository>,
    cache: Arc<FeatureCache>,
    interval: Duration,
}

impl SnapshotExporter {
    pub fn new(
        repository: Arc<dyn SnapshotRepository>,
        cache: Arc<FeatureCache>,
        interval: Duration,
    ) -> Self {
        Self {
            repository,
            cache,
            interval,
        }
    }

    pub async fn run(
        self,
        mut records: mpsc::Receiver<ExportRecord>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("SnapshotExporter: started (interval {:?})", self.interval);
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.reset();

        loop {
            tokio::select! {
                _ = stop_requested(&mut shutdown) => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.export_windows().await {
                        error!("SnapshotExporter: window export failed: {}", e);
                    }
                }
                next = records.recv() => match next {
                    Some(record) => self.write(record).await,
                    None => break,
                },
            }
        }

        // Flush what is already queued before the final snapshot.
        while let Ok(record) = records.try_recv() {
            self.write(record).await;
        }
        if let Err(e) = self.export_windows().await {
            error!("SnapshotExporter: final window export failed: {}", e);
        }
        info!("SnapshotExporter: stopped");
    }

    pub async fn export_windows(&self) -> Result<usize> {
        let windows = self.cache.snapshot_all().await;
        if windows.is_empty() {
            return Ok(0);
        }
        self.repository.save_windows(&windows).await?;
        Ok(windows.len())
    }

    async fn write(&self, record: ExportRecord) {
        let result = match &record {
            ExportRecord::Prediction(p) => self.repository.save_prediction(p).await,
            ExportRecord::Explanation(e) => self.repository.save_explanation(e).await,
        };
        if let Err(e) = result {
            error!("SnapshotExporter: failed to persist record: {}", e);
        }
    }
}
