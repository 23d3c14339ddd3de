use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::domain::raw_event::RawEnvelope;

#[derive(Debug, Clone, Copy)]
pub struct ShutdownConfig {
    /// How long queued raw events may take to drain
    pub drain_timeout: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout: Duration::from_secs(5),
        }
    }
}

/// Ordered stop: close ingestion and let it drain, then stop the scheduler,
/// sweeper, exporter and reporter. The exporter writes a final snapshot on
/// its way out.
pub struct ShutdownService {
    ingest_tx: mpsc::Sender<RawEnvelope>,
    pipeline_task: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
    config: ShutdownConfig,
}

impl ShutdownService {
    pub fn new(
        ingest_tx: mpsc::Sender<RawEnvelope>,
        pipeline_task: JoinHandle<()>,
        shutdown_tx: watch::Sender<bool>,
        tasks: Vec<(&'static str, JoinHandle<()>)>,
        config: ShutdownConfig,
    ) -> Self {
        Self {
            ingest_tx,
            pipeline_task,
            shutdown_tx,
            tasks,
            config,
        }
    }

    pub async fn shutdown(self) {
        info!("Initiating Graceful Shutdown Sequence...");

        info!("Step 1: Draining ingestion queue...");
        drop(self.ingest_tx);
        let mut pipeline_task = self.pipeline_task;
        let drained = match tokio::time::timeout(self.config.drain_timeout, &mut pipeline_task).await {
            Ok(result) => {
                if let Err(e) = result {
                    error!("Ingestion task failed: {}", e);
                }
                true
            }
            Err(_) => {
                warn!(
                    "Ingestion did not drain within {:?}; stopping it",
                    self.config.drain_timeout
                );
                false
            }
        };

        info!("Step 2: Stopping background tasks...");
        self.shutdown_tx.send_replace(true);
        if !drained && let Err(e) = pipeline_task.await {
            error!("Ingestion task failed: {}", e);
        }
        for (name, task) in self.tasks {
            if let Err(e) = task.await {
                error!("{} task failed during shutdown: {}", name, e);
            }
        }
        info!("Shutdown sequence completed.");
    }
}
