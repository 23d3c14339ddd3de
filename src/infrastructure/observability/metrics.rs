//! Prometheus metrics definitions for finsight
//!
//! All metrics use the `finsight_` prefix and are read-only.

use prometheus::{
    CounterVec, Gauge, GaugeVec, HistogramOpts, HistogramVec, IntCounter, IntGauge, Opts,
    Registry, TextEncoder,
    core::{AtomicF64, GenericGauge},
};
use std::sync::Arc;
use std::time::Instant;

/// Prometheus metrics for the fusion pipeline
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,
    /// Normalized events applied to the cache, by raw kind
    pub events_ingested_total: CounterVec,
    /// Raw events dropped by the normalizer, by reason
    pub events_rejected_total: CounterVec,
    /// Redelivered events skipped by source-id dedup
    pub events_duplicate_total: IntCounter,
    /// Lock acquisitions that timed out and were retried
    pub cache_lock_timeouts_total: IntCounter,
    /// Writes or reads that gave up with CacheUnavailable
    pub cache_unavailable_total: IntCounter,
    /// Live (instrument, family) windows
    pub cache_windows: IntGauge,
    /// Instruments purged by the TTL sweeper
    pub cache_evictions_total: IntCounter,
    /// Feature assemblies by outcome
    pub assemblies_total: CounterVec,
    /// Predictions by degraded flag
    pub predictions_total: CounterVec,
    /// Last confidence per instrument
    pub prediction_confidence: GaugeVec,
    /// Explanations by attribution method
    pub explanations_total: CounterVec,
    /// Per-stage latency
    pub stage_latency_seconds: HistogramVec,
    /// Messages published, by topic kind
    pub broadcast_published_total: CounterVec,
    /// Messages a slow subscriber never saw
    pub broadcast_dropped_total: IntCounter,
    /// Active subscriptions
    pub broadcast_subscriptions: IntGauge,
    /// Current ensemble weight generation
    pub weight_generation: IntGauge,
    /// Uptime in seconds
    pub uptime_seconds: GenericGauge<AtomicF64>,
}

impl Metrics {
    /// Create a new Metrics instance with all gauges and counters registered
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let events_ingested_total = CounterVec::new(
            Opts::new(
                "finsight_events_ingested_total",
                "Normalized events applied to the feature cache",
            ),
            &["kind"],
        )?;
        registry.register(Box::new(events_ingested_total.clone()))?;

        let events_rejected_total = CounterVec::new(
            Opts::new(
                "finsight_events_rejected_total",
                "Raw events rejected during normalization",
            ),
            &["reason"],
        )?;
        registry.register(Box::new(events_rejected_total.clone()))?;

        let events_duplicate_total = IntCounter::with_opts(Opts::new(
            "finsight_events_duplicate_total",
            "Redelivered events skipped by source id",
        ))?;
        registry.register(Box::new(events_duplicate_total.clone()))?;

        let cache_lock_timeouts_total = IntCounter::with_opts(Opts::new(
            "finsight_cache_lock_timeouts_total",
            "Window lock acquisitions that timed out",
        ))?;
        registry.register(Box::new(cache_lock_timeouts_total.clone()))?;

        let cache_unavailable_total = IntCounter::with_opts(Opts::new(
            "finsight_cache_unavailable_total",
            "Cache operations abandoned after retries",
        ))?;
        registry.register(Box::new(cache_unavailable_total.clone()))?;

        let cache_windows = IntGauge::with_opts(Opts::new(
            "finsight_cache_windows",
            "Live feature windows",
        ))?;
        registry.register(Box::new(cache_windows.clone()))?;

        let cache_evictions_total = IntCounter::with_opts(Opts::new(
            "finsight_cache_evictions_total",
            "Instruments evicted from the feature cache",
        ))?;
        registry.register(Box::new(cache_evictions_total.clone()))?;

        let assemblies_total = CounterVec::new(
            Opts::new(
                "finsight_assemblies_total",
                "Feature vector assemblies by outcome",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(assemblies_total.clone()))?;

        let predictions_total = CounterVec::new(
            Opts::new("finsight_predictions_total", "Predictions emitted"),
            &["degraded"],
        )?;
        registry.register(Box::new(predictions_total.clone()))?;

        let prediction_confidence = GaugeVec::new(
            Opts::new(
                "finsight_prediction_confidence",
                "Confidence of the last prediction per instrument",
            ),
            &["instrument"],
        )?;
        registry.register(Box::new(prediction_confidence.clone()))?;

        let explanations_total = CounterVec::new(
            Opts::new(
                "finsight_explanations_total",
                "Explanations generated by attribution method",
            ),
            &["method"],
        )?;
        registry.register(Box::new(explanations_total.clone()))?;

        let stage_latency_seconds = HistogramVec::new(
            HistogramOpts::new(
                "finsight_stage_latency_seconds",
                "Pipeline stage latency in seconds",
            )
            .buckets(vec![
                0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
            ]),
            &["stage"],
        )?;
        registry.register(Box::new(stage_latency_seconds.clone()))?;

        let broadcast_published_total = CounterVec::new(
            Opts::new(
                "finsight_broadcast_published_total",
                "Messages published by topic kind",
            ),
            &["topic_kind"],
        )?;
        registry.register(Box::new(broadcast_published_total.clone()))?;

        let broadcast_dropped_total = IntCounter::with_opts(Opts::new(
            "finsight_broadcast_dropped_total",
            "Messages dropped for lagging subscribers",
        ))?;
        registry.register(Box::new(broadcast_dropped_total.clone()))?;

        let broadcast_subscriptions = IntGauge::with_opts(Opts::new(
            "finsight_broadcast_subscriptions",
            "Active broadcast subscriptions",
        ))?;
        registry.register(Box::new(broadcast_subscriptions.clone()))?;

        let weight_generation = IntGauge::with_opts(Opts::new(
            "finsight_weight_generation",
            "Ensemble weight table generation",
        ))?;
        registry.register(Box::new(weight_generation.clone()))?;

        let uptime_seconds = Gauge::with_opts(Opts::new(
            "finsight_uptime_seconds",
            "Process uptime in seconds",
        ))?;
        registry.register(Box::new(uptime_seconds.clone()))?;

        Ok(Self {
            registry: Arc::new(registry),
            events_ingested_total,
            events_rejected_total,
            events_duplicate_total,
            cache_lock_timeouts_total,
            cache_unavailable_total,
            cache_windows,
            cache_evictions_total,
            assemblies_total,
            predictions_total,
            prediction_confidence,
            explanations_total,
            stage_latency_seconds,
            broadcast_published_total,
            broadcast_dropped_total,
            broadcast_subscriptions,
            weight_generation,
            uptime_seconds,
        })
    }

    /// Render all metrics in Prometheus text format
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder
            .encode_to_string(&metric_families)
            .unwrap_or_default()
    }

    pub fn inc_ingested(&self, kind: &str) {
        self.events_ingested_total.with_label_values(&[kind]).inc();
    }

    pub fn inc_rejected(&self, reason: &str) {
        self.events_rejected_total.with_label_values(&[reason]).inc();
    }

    pub fn inc_assembly(&self, outcome: &str) {
        self.assemblies_total.with_label_values(&[outcome]).inc();
    }

    pub fn record_prediction(&self, instrument: &str, confidence: f64, degraded: bool) {
        let label = if degraded { "true" } else { "false" };
        self.predictions_total.with_label_values(&[label]).inc();
        self.prediction_confidence
            .with_label_values(&[instrument])
            .set(confidence);
    }

    pub fn inc_explanations(&self, method: &str) {
        self.explanations_total.with_label_values(&[method]).inc();
    }

    pub fn inc_published(&self, topic_kind: &str) {
        self.broadcast_published_total
            .with_label_values(&[topic_kind])
            .inc();
    }

    /// Starts a timer that records into `stage` when dropped.
    pub fn time_stage(&self, stage: &str) -> StageTimer {
        StageTimer {
            start: Instant::now(),
            histogram: self.stage_latency_seconds.with_label_values(&[stage]),
        }
    }
}

/// RAII guard recording elapsed time into a stage histogram
pub struct StageTimer {
    start: Instant,
    histogram: prometheus::Histogram,
}

impl Drop for StageTimer {
    fn drop(&mut self) {
        self.histogram.observe(self.start.elapsed().as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().expect("Failed to create metrics");
        metrics.inc_ingested("price_tick");
        assert!(metrics.render().contains("finsight_"));
    }

    #[test]
    fn test_rejection_counter_by_reason() {
        let metrics = Metrics::new().expect("Failed to create metrics");
        metrics.inc_rejected("clock_skew");
        metrics.inc_rejected("clock_skew");
        let output = metrics.render();
        assert!(output.contains("finsight_events_rejected_total{reason=\"clock_skew\"} 2"));
    }

    #[test]
    fn test_confidence_per_instrument() {
        let metrics = Metrics::new().expect("Failed to create metrics");
        metrics.record_prediction("AAPL", 0.8, false);
        metrics.record_prediction("MSFT", 0.4, true);
        let output = metrics.render();
        assert!(output.contains("AAPL"));
        assert!(output.contains("MSFT"));
        assert!(output.contains("finsight_predictions_total{degraded=\"true\"} 1"));
    }

    #[test]
    fn test_stage_timer_records_on_drop() {
        let metrics = Metrics::new().expect("Failed to create metrics");
        {
            let _timer = metrics.time_stage("assemble");
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        let histogram = metrics.stage_latency_seconds.with_label_values(&["assemble"]);
        assert_eq!(histogram.get_sample_count(), 1);
        assert!(histogram.get_sample_sum() >= 0.005);
    }
}
