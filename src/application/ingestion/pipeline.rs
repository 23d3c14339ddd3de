use crate::application::broadcast::{BroadcastManager, BroadcastPayload, SignalUpdate, Topic};
use crate::application::ingestion::normalizer::SignalNormalizer;
use crate::application::system::cancel::stop_requested;
use crate::application::market_data::{CacheWrite, FeatureCache};
use crate::domain::errors::{CacheError, NormalizationError};
use crate::domain::raw_event::RawEnvelope;
use crate::domain::signal::{InstrumentKey, SignalFamily};
use crate::domain::window::ApplyOutcome;
use crate::infrastructure::observability::Metrics;
use std::sync::Arc;
use tokio::sync::{Semaphore, mpsc, watch};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    Applied {
        instrument: InstrumentKey,
        family: SignalFamily,
        latest_replaced: bool,
    },
    Duplicate,
    Rejected(NormalizationError),
    Failed(CacheError),
}

/// Where applied events that should trigger a prediction are announced.
#[derive(Debug, Clone)]
pub struct TriggerSink {
    pub tx: mpsc::Sender<InstrumentKey>,
    pub families: Vec<SignalFamily>,
}

/// normalize -> cache apply -> signal broadcast -> prediction trigger.
pub struct IngestionPipeline {
    normalizer: SignalNormalizer,
    cache: Arc<FeatureCache>,
    broadcast: Arc<BroadcastManager>,
    trigger: Option<TriggerSink>,
    metrics: Option<Metrics>,
}

impl IngestionPipeline {
    pub fn new(
        normalizer: SignalNormalizer,
        cache: Arc<FeatureCache>,
        broadcast: Arc<BroadcastManager>,
    ) -> Self {
        Self {
            normalizer,
            cache,
            broadcast,
            trigger: None,
            metrics: None,
        }
    }

    pub fn with_trigger(mut self, trigger: TriggerSink) -> Self {
        self.trigger = Some(trigger);
        self
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Process one raw event. Failures are reported, never propagated: a
    /// bad event must not stop the stream.
    pub async fn ingest(&self, envelope: &RawEnvelope) -> IngestOutcome {
        let event = match self.normalizer.normalize(envelope) {
            Ok(event) => event,
            Err(e) => {
                warn!("IngestionPipeline: dropped {}: {}", envelope.event.kind(), e);
                if let Some(metrics) = &self.metrics {
                    metrics.inc_rejected(e.reason_label());
                }
                return IngestOutcome::Rejected(e);
            }
        };

        let outcome = match self.cache.apply(&event).await {
            Ok(CacheWrite::Duplicate) => return IngestOutcome::Duplicate,
            Ok(CacheWrite::Applied(outcome)) => outcome,
            Err(e) => {
                error!("IngestionPipeline: cache rejected {}: {}", event.source_id(), e);
                if let Some(metrics) = &self.metrics {
                    metrics.inc_rejected(match e {
                        CacheError::NonFinitePayload { .. } => "non_finite_payload",
                        CacheError::CacheUnavailable { .. } => "cache_unavailable",
                    });
                }
                return IngestOutcome::Failed(e);
            }
        };
        if let Some(metrics) = &self.metrics {
            metrics.inc_ingested(envelope.event.kind());
        }

        let instrument = event.instrument_key().clone();
        let family = event.family();
        let latest_replaced = outcome == ApplyOutcome::LatestReplaced;

        if latest_replaced {
            self.broadcast.publish(
                &Topic::signals(&instrument, family),
                BroadcastPayload::Signal(SignalUpdate {
                    instrument_key: instrument.clone(),
                    family,
                    value: event.value().clone(),
                    observed_at: event.observed_at(),
                    quality: event.quality(),
                }),
            );
            if let Some(trigger) = &self.trigger
                && trigger.families.contains(&family)
                && let Err(e) = trigger.tx.try_send(instrument.clone())
            {
                // Scheduler is saturated; it debounces anyway.
                debug!("IngestionPipeline: trigger for {} skipped: {}", instrument, e);
            }
        }

        IngestOutcome::Applied {
            instrument,
            family,
            latest_replaced,
        }
    }

    /// Consume a raw event stream until it closes or shutdown fires.
    /// Up to `concurrency` events are processed at once.
    pub async fn run(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<RawEnvelope>,
        concurrency: usize,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let concurrency = concurrency.max(1);
        let permits = Arc::new(Semaphore::new(concurrency));
        info!("IngestionPipeline: started (concurrency {})", concurrency);

        loop {
            let envelope = tokio::select! {
                _ = stop_requested(&mut shutdown) => break,
                next = rx.recv() => match next {
                    Some(envelope) => envelope,
                    None => break,
                },
            };
            let Ok(permit) = permits.clone().acquire_owned().await else {
                break;
            };
            let pipeline = self.clone();
            tokio::spawn(async move {
                pipeline.ingest(&envelope).await;
                drop(permit);
            });
        }

        // Let in-flight events finish.
        let _ = permits.acquire_many(concurrency as u32).await;
        info!("IngestionPipeline: stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::broadcast::BroadcastConfig;
    use crate::application::ingestion::normalizer::NormalizerConfig;
    use crate::application::market_data::CacheConfig;
    use crate::domain::ports::SentimentScorer;
    use crate::domain::raw_event::RawEvent;
    use crate::infrastructure::instruments::StaticInstrumentRegistry;
    use chrono::{Duration, Utc};
    use rust_decimal_macros::dec;
    use std::collections::HashMap;

    struct Neutral;

    impl SentimentScorer for Neutral {
        fn score(&self, _text: &str) -> f64 {
            0.0
        }
    }

    fn pipeline(trigger: Option<TriggerSink>) -> (IngestionPipeline, Arc<BroadcastManager>) {
        let registry = StaticInstrumentRegistry::new(vec![InstrumentKey::from("AAPL")], HashMap::new());
        let normalizer = SignalNormalizer::new(
            Arc::new(registry),
            Arc::new(Neutral),
            NormalizerConfig::default(),
        );
        let broadcast = Arc::new(BroadcastManager::new(BroadcastConfig::default()));
        let mut pipeline = IngestionPipeline::new(
            normalizer,
            Arc::new(FeatureCache::new(CacheConfig::default())),
            broadcast.clone(),
        );
        if let Some(trigger) = trigger {
            pipeline = pipeline.with_trigger(trigger);
        }
        (pipeline, broadcast)
    }

    fn tick(symbol: &str, offset_secs: i64) -> RawEnvelope {
        let now = Utc::now();
        RawEnvelope::new(
            now,
            RawEvent::PriceTick {
                source: Some("iex".to_string()),
                symbol: Some(symbol.to_string()),
                price: Some(dec!(190.10)),
                volume: Some(dec!(300)),
                timestamp: Some(now + Duration::seconds(offset_secs)),
            },
        )
    }

    #[tokio::test]
    async fn test_bad_event_does_not_stop_stream() {
        let (pipeline, _) = pipeline(None);
        assert!(matches!(
            pipeline.ingest(&tick("ZZZZ", 0)).await,
            IngestOutcome::Rejected(NormalizationError::UnknownInstrument { .. })
        ));
        assert!(matches!(
            pipeline.ingest(&tick("AAPL", 0)).await,
            IngestOutcome::Applied { latest_replaced: true, .. }
        ));
    }

    #[tokio::test]
    async fn test_redelivery_is_duplicate() {
        let (pipeline, _) = pipeline(None);
        let raw = tick("AAPL", 0);
        pipeline.ingest(&raw).await;
        assert_eq!(pipeline.ingest(&raw).await, IngestOutcome::Duplicate);
    }

    #[tokio::test]
    async fn test_signal_update_broadcast_and_trigger() {
        let (tx, mut rx) = mpsc::channel(4);
        let (pipeline, broadcast) = pipeline(Some(TriggerSink {
            tx,
            families: vec![SignalFamily::Technical],
        }));
        let topic = Topic::signals(&InstrumentKey::from("AAPL"), SignalFamily::Technical);
        let mut sub = broadcast.subscribe("client", topic);

        pipeline.ingest(&tick("AAPL", 0)).await;
        assert!(matches!(
            sub.try_recv().as_deref(),
            Some(BroadcastPayload::Signal(_))
        ));
        assert_eq!(rx.try_recv().unwrap(), InstrumentKey::from("AAPL"));

        // Older tick: aggregates only, no broadcast, no trigger
        pipeline.ingest(&tick("AAPL", -30)).await;
        assert!(sub.try_recv().is_none());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_run_drains_channel() {
        let (pipeline, _) = pipeline(None);
        let pipeline = Arc::new(pipeline);
        let (tx, rx) = mpsc::channel(16);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        for i in 0..5 {
            tx.send(tick("AAPL", -i)).await.unwrap();
        }
        drop(tx);
        pipeline.clone().run(rx, 2, shutdown_rx).await;
        assert_eq!(pipeline.cache.len(), 1);
        let snapshot = pipeline
            .cache
            .read(&InstrumentKey::from("AAPL"), SignalFamily::Technical, Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.window.event_count(), 5);
    }
}
