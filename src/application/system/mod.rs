use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::info;

pub mod cancel;
pub mod exporter;
pub mod scheduler;
pub mod service;
pub mod shutdown_service;

use crate::application::bootstrap::{
    persistence::{PersistenceBootstrap, PersistenceHandle},
    services::{ServicesBootstrap, ServicesHandle},
};
use crate::application::market_data::FeatureCache;
use crate::application::system::cancel::stop_requested;
use crate::application::system::{
    exporter::SnapshotExporter,
    scheduler::PredictionScheduler,
    service::{ExportRecord, FusionService},
    shutdown_service::{ShutdownConfig, ShutdownService},
};
use crate::config::Config;
use crate::domain::raw_event::RawEnvelope;
use crate::domain::signal::InstrumentKey;
use crate::infrastructure::observability::{Metrics, MetricsReporter};

pub struct SystemHandle {
    pub ingest_tx: mpsc::Sender<RawEnvelope>,
    pub service: Arc<FusionService>,
    pub metrics: Metrics,
    shutdown: ShutdownService,
}

impl SystemHandle {
    /// Drain queued events, stop background tasks and flush the export.
    pub async fn shutdown(self) {
        drop(self.ingest_tx);
        self.shutdown.shutdown().await;
    }
}

pub struct Application {
    pub config: Config,
    pub persistence: Option<PersistenceHandle>,
    pub services: ServicesHandle,
    pub metrics: Metrics,
    trigger_rx: mpsc::Receiver<InstrumentKey>,
    export_rx: Option<mpsc::Receiver<ExportRecord>>,
}

impl Application {
    pub async fn build(config: Config) -> Result<Self> {
        info!(
            "Building finsight Application ({} instruments)...",
            config.ingestion.instruments.len()
        );

        let metrics = Metrics::new()?;
        let persistence = PersistenceBootstrap::init(&config.persistence).await?;

        let (trigger_tx, trigger_rx) = mpsc::channel(config.ingestion.queue_capacity.max(1));
        let (export_tx, export_rx) = match &persistence {
            Some(_) => {
                let (tx, rx) = mpsc::channel(config.persistence.export_queue_capacity);
                (Some(tx), Some(rx))
            }
            None => (None, None),
        };

        let services = ServicesBootstrap::init(&config, &metrics, trigger_tx, export_tx)?;

        Ok(Self {
            config,
            persistence,
            services,
            metrics,
            trigger_rx,
            export_rx,
        })
    }

    pub fn service(&self) -> &Arc<FusionService> {
        &self.services.service
    }

    pub async fn start(self) -> Result<SystemHandle> {
        info!("Starting pipeline tasks...");
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (ingest_tx, ingest_rx) = mpsc::channel(self.config.ingestion.queue_capacity.max(1));
        let mut tasks = Vec::new();

        let pipeline_task = tokio::spawn(self.services.pipeline.clone().run(
            ingest_rx,
            self.config.ingestion.concurrency,
            shutdown_rx.clone(),
        ));

        let scheduler = PredictionScheduler::new(
            self.services.service.clone(),
            self.config.broadcast.scheduler_config(),
        );
        tasks.push((
            "scheduler",
            tokio::spawn(scheduler.run(self.trigger_rx, shutdown_rx.clone())),
        ));

        tasks.push((
            "sweeper",
            tokio::spawn(run_sweeper(
                self.services.cache.clone(),
                Duration::from_secs(self.config.cache.sweep_interval_secs.max(1)),
                shutdown_rx.clone(),
            )),
        ));

        if let (Some(persistence), Some(export_rx)) = (&self.persistence, self.export_rx) {
            let exporter = SnapshotExporter::new(
                persistence.snapshot_repository.clone(),
                self.services.cache.clone(),
                Duration::from_secs(self.config.persistence.export_interval_secs),
            );
            tasks.push((
                "exporter",
                tokio::spawn(exporter.run(export_rx, shutdown_rx.clone())),
            ));
        }

        if self.config.observability.enabled {
            let reporter = MetricsReporter::new(
                self.services.service.clone(),
                self.metrics.clone(),
                self.config.observability.interval_secs,
            );
            tasks.push(("reporter", tokio::spawn(reporter.run(shutdown_rx.clone()))));
        }

        info!("{} background tasks running", tasks.len() + 1);

        Ok(SystemHandle {
            ingest_tx: ingest_tx.clone(),
            service: self.services.service.clone(),
            metrics: self.metrics.clone(),
            shutdown: ShutdownService::new(
                ingest_tx,
                pipeline_task,
                shutdown_tx,
                tasks,
                ShutdownConfig::default(),
            ),
        })
    }
}

async fn run_sweeper(cache: Arc<FeatureCache>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(interval);
    ticker.reset();
    loop {
        tokio::select! {
            _ = stop_requested(&mut shutdown) => break,
            _ = ticker.tick() => {
                let evicted = cache.evict_expired(Utc::now());
                if !evicted.is_empty() {
                    info!("Sweeper: evicted {} idle instruments", evicted.len());
                }
            }
        }
    }
}
