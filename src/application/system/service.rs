//! Request-facing facade over the pipeline components.

use crate::application::broadcast::{BroadcastManager, BroadcastPayload, Topic};
use crate::application::explainability::ExplainabilityEngine;
use crate::application::fusion::FusionEngine;
use crate::application::ingestion::{IngestOutcome, IngestionPipeline};
use crate::application::market_data::FeatureCache;
use crate::application::ml::{ModelInfo, PredictionEnsemble, ScoringModel, WeightTable};
use crate::application::system::cancel::CancelSignal;
use crate::domain::errors::{EnsembleError, ExplainError, FusionError};
use crate::domain::features::FeatureVector;
use crate::domain::prediction::{Explanation, Prediction};
use crate::domain::raw_event::RawEnvelope;
use crate::domain::signal::InstrumentKey;
use crate::infrastructure::observability::Metrics;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Fusion(#[from] FusionError),

    #[error(transparent)]
    Ensemble(#[from] EnsembleError),

    #[error(transparent)]
    Explain(#[from] ExplainError),

    #[error("Request cancelled")]
    Cancelled,
}

/// A prediction, the vector it was computed from and its explanation.
#[derive(Debug, Clone)]
pub struct PredictionReport {
    pub vector: Arc<FeatureVector>,
    pub prediction: Arc<Prediction>,
    pub explanation: Arc<Explanation>,
}

/// Records handed to the snapshot exporter.
#[derive(Debug, Clone)]
pub enum ExportRecord {
    Prediction(Arc<Prediction>),
    Explanation(Arc<Explanation>),
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub model_version: String,
    pub cached_instruments: usize,
    pub windows: usize,
    pub subscriptions: usize,
    pub predicted_instruments: usize,
}

pub struct FusionService {
    pipeline: Arc<IngestionPipeline>,
    cache: Arc<FeatureCache>,
    fusion: FusionEngine,
    ensemble: Arc<PredictionEnsemble>,
    explainer: ExplainabilityEngine,
    broadcast: Arc<BroadcastManager>,
    last: RwLock<HashMap<InstrumentKey, PredictionReport>>,
    export_tx: Option<mpsc::Sender<ExportRecord>>,
    metrics: Option<Metrics>,
}

impl FusionService {
    pub fn new(
        pipeline: Arc<IngestionPipeline>,
        cache: Arc<FeatureCache>,
        fusion: FusionEngine,
        ensemble: Arc<PredictionEnsemble>,
        explainer: ExplainabilityEngine,
        broadcast: Arc<BroadcastManager>,
    ) -> Self {
        Self {
            pipeline,
            cache,
            fusion,
            ensemble,
            explainer,
            broadcast,
            last: RwLock::new(HashMap::new()),
            export_tx: None,
            metrics: None,
        }
    }

    pub fn with_export(mut self, tx: mpsc::Sender<ExportRecord>) -> Self {
        self.export_tx = Some(tx);
        self
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn cache(&self) -> &Arc<FeatureCache> {
        &self.cache
    }

    pub fn ensemble(&self) -> &Arc<PredictionEnsemble> {
        &self.ensemble
    }

    pub fn broadcast(&self) -> &Arc<BroadcastManager> {
        &self.broadcast
    }

    pub fn pipeline(&self) -> &Arc<IngestionPipeline> {
        &self.pipeline
    }

    pub fn fusion(&self) -> &FusionEngine {
        &self.fusion
    }

    pub async fn ingest(&self, envelope: &RawEnvelope) -> IngestOutcome {
        self.pipeline.ingest(envelope).await
    }

    pub async fn assemble(
        &self,
        instrument: &InstrumentKey,
        decision_time: DateTime<Utc>,
    ) -> Result<FeatureVector, FusionError> {
        let _timer = self.metrics.as_ref().map(|m| m.time_stage("assemble"));
        let result = self.fusion.assemble(instrument, decision_time).await;
        if let Some(metrics) = &self.metrics {
            metrics.inc_assembly(match &result {
                Ok(v) if v.is_degraded() => "degraded",
                Ok(_) => "ok",
                Err(FusionError::InsufficientSignal { .. }) => "insufficient",
                Err(FusionError::Cancelled) => "cancelled",
                Err(FusionError::Cache(_)) => "cache_error",
            });
        }
        result
    }

    pub fn predict(&self, vector: &FeatureVector) -> Result<Prediction, EnsembleError> {
        let _timer = self.metrics.as_ref().map(|m| m.time_stage("predict"));
        let prediction = self.ensemble.predict(vector)?;
        if let Some(metrics) = &self.metrics {
            metrics.record_prediction(
                prediction.instrument_key.as_str(),
                prediction.confidence,
                prediction.degraded,
            );
        }
        Ok(prediction)
    }

    pub fn explain(
        &self,
        prediction: &Prediction,
        vector: &FeatureVector,
    ) -> Result<Explanation, ExplainError> {
        let _timer = self.metrics.as_ref().map(|m| m.time_stage("explain"));
        self.explainer.explain(prediction, vector)
    }

    /// Assemble, predict and explain, then publish and remember the result.
    ///
    /// A reweight landing between predict and explain makes the fresh
    /// prediction stale; it is recomputed once against the new snapshot.
    pub async fn predict_and_explain(
        &self,
        instrument: &InstrumentKey,
        decision_time: DateTime<Utc>,
    ) -> Result<PredictionReport, ServiceError> {
        let vector = Arc::new(self.assemble(instrument, decision_time).await?);
        let report = self.score_vector(vector)?;
        self.publish(&report);
        Ok(report)
    }

    pub async fn predict_and_explain_cancellable(
        &self,
        instrument: &InstrumentKey,
        decision_time: DateTime<Utc>,
        cancel: &mut CancelSignal,
    ) -> Result<PredictionReport, ServiceError> {
        let vector = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ServiceError::Cancelled),
            result = self.assemble(instrument, decision_time) => Arc::new(result?),
        };
        if cancel.is_cancelled() {
            return Err(ServiceError::Cancelled);
        }
        let report = self.score_vector(vector)?;
        self.publish(&report);
        Ok(report)
    }

    fn score_vector(&self, vector: Arc<FeatureVector>) -> Result<PredictionReport, ServiceError> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let prediction = self.predict(&vector)?;
            match self.explain(&prediction, &vector) {
                Ok(explanation) => {
                    return Ok(PredictionReport {
                        vector,
                        prediction: Arc::new(prediction),
                        explanation: Arc::new(explanation),
                    });
                }
                Err(ExplainError::StaleReference { reason }) if attempts < 2 => {
                    debug!("FusionService: re-scoring after concurrent swap: {}", reason);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Broadcast and remember the report unless a newer decision for the
    /// instrument is already known. Export always happens.
    fn publish(&self, report: &PredictionReport) {
        let instrument = &report.prediction.instrument_key;
        {
            // Held across the broadcast so topic `last` and `self.last` agree.
            let mut last = match self.last.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let newer = last
                .get(instrument)
                .is_none_or(|r| r.prediction.decision_time <= report.prediction.decision_time);
            if newer {
                self.broadcast.publish(
                    &Topic::predictions(instrument),
                    BroadcastPayload::Prediction(report.prediction.as_ref().clone()),
                );
                self.broadcast.publish(
                    &Topic::explanations(instrument),
                    BroadcastPayload::Explanation(report.explanation.as_ref().clone()),
                );
                last.insert(instrument.clone(), report.clone());
            } else {
                debug!(
                    "FusionService: {} decision at {} is older than the current one, not broadcast",
                    instrument, report.prediction.decision_time
                );
            }
        }

        if let Some(tx) = &self.export_tx {
            for record in [
                ExportRecord::Prediction(report.prediction.clone()),
                ExportRecord::Explanation(report.explanation.clone()),
            ] {
                if let Err(e) = tx.try_send(record) {
                    warn!("FusionService: export queue full, record dropped: {}", e);
                }
            }
        }
    }

    fn read_last(&self) -> std::sync::RwLockReadGuard<'_, HashMap<InstrumentKey, PredictionReport>> {
        match self.last.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn last_report(&self, instrument: &InstrumentKey) -> Option<PredictionReport> {
        self.read_last().get(instrument).cloned()
    }

    pub fn last_prediction(&self, instrument: &InstrumentKey) -> Option<Arc<Prediction>> {
        self.read_last().get(instrument).map(|r| r.prediction.clone())
    }

    pub fn last_explanation(&self, instrument: &InstrumentKey) -> Option<Arc<Explanation>> {
        self.read_last().get(instrument).map(|r| r.explanation.clone())
    }

    pub fn reweight(&self, weights: WeightTable) -> u64 {
        let generation = self.ensemble.reweight(weights);
        info!("FusionService: weights now at generation {}", generation);
        generation
    }

    pub fn replace_models(&self, version: &str, models: Vec<ScoringModel>) -> u64 {
        self.ensemble.replace_models(version, models)
    }

    pub fn list_models(&self) -> Vec<ModelInfo> {
        self.ensemble.list_models()
    }

    pub fn status(&self) -> ServiceStatus {
        ServiceStatus {
            model_version: self.ensemble.model_version(),
            cached_instruments: self.cache.instruments().len(),
            windows: self.cache.len(),
            subscriptions: self.broadcast.connection_count(),
            predicted_instruments: self.read_last().len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::broadcast::BroadcastConfig;
    use crate::application::explainability::ExplainerConfig;
    use crate::application::fusion::FusionPolicy;
    use crate::application::ingestion::{NormalizerConfig, SignalNormalizer};
    use crate::application::market_data::CacheConfig;
    use crate::application::ml::EnsembleConfig;
    use crate::application::system::cancel::cancel_pair;
    use crate::domain::ports::SentimentScorer;
    use crate::domain::raw_event::RawEvent;
    use crate::infrastructure::instruments::StaticInstrumentRegistry;
    use rust_decimal_macros::dec;

    struct Bullish;

    impl SentimentScorer for Bullish {
        fn score(&self, _text: &str) -> f64 {
            0.6
        }
    }

    fn service(export: Option<mpsc::Sender<ExportRecord>>) -> FusionService {
        let registry = StaticInstrumentRegistry::new(
            vec![InstrumentKey::from("AAPL"), InstrumentKey::from("XYZ")],
            HashMap::new(),
        );
        let normalizer = SignalNormalizer::new(
            Arc::new(registry),
            Arc::new(Bullish),
            NormalizerConfig::default(),
        );
        let cache = Arc::new(FeatureCache::new(CacheConfig::default()));
        let broadcast = Arc::new(BroadcastManager::new(BroadcastConfig::default()));
        let pipeline = Arc::new(IngestionPipeline::new(normalizer, cache.clone(), broadcast.clone()));
        let ensemble = Arc::new(PredictionEnsemble::with_defaults(EnsembleConfig::default()));
        let explainer = ExplainabilityEngine::new(ensemble.clone(), ExplainerConfig::default());
        let service = FusionService::new(
            pipeline,
            cache.clone(),
            FusionEngine::new(cache, FusionPolicy::standard()),
            ensemble,
            explainer,
            broadcast,
        );
        match export {
            Some(tx) => service.with_export(tx),
            None => service,
        }
    }

    fn tick(symbol: &str, price: rust_decimal::Decimal) -> RawEnvelope {
        let now = Utc::now();
        RawEnvelope::new(
            now,
            RawEvent::PriceTick {
                source: Some("iex".to_string()),
                symbol: Some(symbol.to_string()),
                price: Some(price),
                volume: Some(dec!(1000)),
                timestamp: Some(now),
            },
        )
    }

    #[tokio::test]
    async fn test_predict_and_explain_publishes_and_remembers() {
        let (tx, mut rx) = mpsc::channel(8);
        let service = service(Some(tx));
        let key = InstrumentKey::from("AAPL");
        let mut predictions = service.broadcast().subscribe("ui", Topic::predictions(&key));
        let mut explanations = service.broadcast().subscribe("ui", Topic::explanations(&key));

        service.ingest(&tick("AAPL", dec!(190.00))).await;
        let report = service.predict_and_explain(&key, Utc::now()).await.unwrap();

        assert_eq!(report.prediction.feature_vector_ref, *report.vector.id());
        assert!(report
            .explanation
            .is_consistent_with(report.prediction.value, 1e-6));
        assert!(matches!(
            predictions.try_recv().as_deref(),
            Some(BroadcastPayload::Prediction(_))
        ));
        assert!(matches!(
            explanations.try_recv().as_deref(),
            Some(BroadcastPayload::Explanation(_))
        ));
        assert_eq!(
            service.last_prediction(&key).map(|p| p.id),
            Some(report.prediction.id)
        );
        assert!(matches!(rx.try_recv(), Ok(ExportRecord::Prediction(_))));
        assert!(matches!(rx.try_recv(), Ok(ExportRecord::Explanation(_))));
    }

    #[tokio::test]
    async fn test_missing_required_feature_is_insufficient() {
        let service = service(None);
        let err = service
            .predict_and_explain(&InstrumentKey::from("XYZ"), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Fusion(FusionError::InsufficientSignal { .. })
        ));
        assert!(service.last_prediction(&InstrumentKey::from("XYZ")).is_none());
    }

    #[tokio::test]
    async fn test_cancelled_request_publishes_nothing() {
        let service = service(None);
        let key = InstrumentKey::from("AAPL");
        service.ingest(&tick("AAPL", dec!(190.00))).await;
        let mut sub = service.broadcast().subscribe("ui", Topic::predictions(&key));

        let (handle, mut signal) = cancel_pair();
        handle.cancel();
        let result = service
            .predict_and_explain_cancellable(&key, Utc::now(), &mut signal)
            .await;
        assert_eq!(result.unwrap_err(), ServiceError::Cancelled);
        assert!(sub.try_recv().is_none());
        assert!(service.last_prediction(&key).is_none());
    }

    #[tokio::test]
    async fn test_older_decision_is_not_broadcast() {
        let (tx, mut rx) = mpsc::channel(8);
        let service = service(Some(tx));
        let key = InstrumentKey::from("AAPL");
        service.ingest(&tick("AAPL", dec!(190.00))).await;
        let mut sub = service.broadcast().subscribe("ui", Topic::predictions(&key));

        let earlier = Utc::now();
        let newer = service
            .predict_and_explain(&key, earlier + chrono::Duration::seconds(60))
            .await
            .unwrap();
        let older = service.predict_and_explain(&key, earlier).await.unwrap();
        assert_ne!(newer.prediction.id, older.prediction.id);

        let expect_newer = |payload: Option<Arc<BroadcastPayload>>| match payload.as_deref() {
            Some(BroadcastPayload::Prediction(p)) => assert_eq!(p.id, newer.prediction.id),
            other => panic!("expected the newer prediction, got {:?}", other),
        };
        expect_newer(sub.try_recv());
        assert!(sub.try_recv().is_none());
        expect_newer(service.broadcast().last(&Topic::predictions(&key)));
        assert_eq!(
            service.last_prediction(&key).map(|p| p.id),
            Some(newer.prediction.id)
        );

        // Both decisions are still exported.
        let mut exported = 0;
        while rx.try_recv().is_ok() {
            exported += 1;
        }
        assert_eq!(exported, 4);
    }

    #[tokio::test]
    async fn test_status_reflects_state() {
        let service = service(None);
        service.ingest(&tick("AAPL", dec!(190.00))).await;
        service
            .predict_and_explain(&InstrumentKey::from("AAPL"), Utc::now())
            .await
            .unwrap();
        let status = service.status();
        assert_eq!(status.cached_instruments, 1);
        assert_eq!(status.predicted_instruments, 1);
        assert_eq!(status.model_version, "builtin-1+w0");
    }
}
