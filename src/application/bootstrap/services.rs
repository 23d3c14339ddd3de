use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

use crate::application::broadcast::BroadcastManager;
use crate::application::explainability::ExplainabilityEngine;
use crate::application::fusion::FusionEngine;
use crate::application::ingestion::{IngestionPipeline, SignalNormalizer, TriggerSink};
use crate::application::market_data::FeatureCache;
use crate::application::ml::PredictionEnsemble;
use crate::application::system::service::{ExportRecord, FusionService};
use crate::config::Config;
use crate::domain::signal::InstrumentKey;
use crate::infrastructure::observability::Metrics;
use crate::infrastructure::sentiment::VaderSentimentScorer;

pub struct ServicesHandle {
    pub cache: Arc<FeatureCache>,
    pub broadcast: Arc<BroadcastManager>,
    pub ensemble: Arc<PredictionEnsemble>,
    pub pipeline: Arc<IngestionPipeline>,
    pub service: Arc<FusionService>,
}

pub struct ServicesBootstrap;

impl ServicesBootstrap {
    pub fn init(
        config: &Config,
        metrics: &Metrics,
        trigger_tx: mpsc::Sender<InstrumentKey>,
        export_tx: Option<mpsc::Sender<ExportRecord>>,
    ) -> Result<ServicesHandle> {
        let registry = Arc::new(config.ingestion.registry());
        let normalizer = SignalNormalizer::new(
            registry,
            Arc::new(VaderSentimentScorer::new()),
            config.ingestion.normalizer_config(),
        );

        let cache = Arc::new(
            FeatureCache::new(config.cache.cache.clone()).with_metrics(metrics.clone()),
        );
        let broadcast = Arc::new(
            BroadcastManager::new(config.broadcast.broadcast_config())
                .with_metrics(metrics.clone()),
        );

        let pipeline = Arc::new(
            IngestionPipeline::new(normalizer, cache.clone(), broadcast.clone())
                .with_trigger(TriggerSink {
                    tx: trigger_tx,
                    families: config.broadcast.trigger_families.clone(),
                })
                .with_metrics(metrics.clone()),
        );

        let policy = config
            .fusion
            .build_policy()
            .context("Failed to build fusion policy")?;
        info!("Fusion policy: {} features", policy.features().len());
        let fusion = FusionEngine::new(cache.clone(), policy);

        let ensemble = Arc::new(
            config
                .ensemble
                .build_ensemble()
                .context("Failed to build prediction ensemble")?
                .with_metrics(metrics.clone()),
        );
        let explainer = ExplainabilityEngine::new(ensemble.clone(), config.ensemble.explainer_config())
            .with_metrics(metrics.clone());

        let mut service = FusionService::new(
            pipeline.clone(),
            cache.clone(),
            fusion,
            ensemble.clone(),
            explainer,
            broadcast.clone(),
        )
        .with_metrics(metrics.clone());
        if let Some(tx) = export_tx {
            service = service.with_export(tx);
        }

        Ok(ServicesHandle {
            cache,
            broadcast,
            ensemble,
            pipeline,
            service: Arc::new(service),
        })
    }
}
