//! Push-based metrics reporter
//!
//! Periodically outputs metrics as structured JSON to stdout.

use crate::application::system::cancel::stop_requested;
use crate::application::system::service::{FusionService, ServiceStatus};
use crate::infrastructure::observability::metrics::Metrics;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{info, warn};

/// Metrics snapshot for JSON output
#[derive(Serialize)]
pub struct MetricsSnapshot {
    pub timestamp: String,
    pub uptime_seconds: u64,
    pub version: String,
    pub service: ServiceStatus,
    pub models: Vec<String>,
}

/// Outputs metrics as structured JSON logs on a configurable interval.
pub struct MetricsReporter {
    service: Arc<FusionService>,
    metrics: Metrics,
    start_time: Instant,
    interval: Duration,
}

impl MetricsReporter {
    pub fn new(service: Arc<FusionService>, metrics: Metrics, interval_seconds: u64) -> Self {
        Self {
            service,
            metrics,
            start_time: Instant::now(),
            interval: Duration::from_secs(interval_seconds.max(1)),
        }
    }

    /// Run the reporter until shutdown, outputting metrics periodically
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "MetricsReporter: Starting push-based metrics (interval: {:?})",
            self.interval
        );

        loop {
            tokio::select! {
                _ = stop_requested(&mut shutdown) => break,
                _ = tokio::time::sleep(self.interval) => {}
            }

            let snapshot = self.collect_snapshot();
            match serde_json::to_string(&snapshot) {
                Ok(json) => {
                    // Prefix so the lines can be filtered out of the log stream
                    println!("METRICS_JSON:{}", json);
                    info!(
                        "Instruments: {} | Windows: {} | Subscriptions: {} | Model: {} | Uptime: {}s",
                        snapshot.service.cached_instruments,
                        snapshot.service.windows,
                        snapshot.service.subscriptions,
                        snapshot.service.model_version,
                        snapshot.uptime_seconds
                    );
                }
                Err(e) => warn!("Failed to serialize metrics: {}", e),
            }
        }
        info!("MetricsReporter: stopped");
    }

    fn collect_snapshot(&self) -> MetricsSnapshot {
        let uptime = self.start_time.elapsed().as_secs();
        let status = self.service.status();

        self.metrics.uptime_seconds.set(uptime as f64);
        self.metrics.cache_windows.set(status.windows as i64);

        MetricsSnapshot {
            timestamp: chrono::Utc::now().to_rfc3339(),
            uptime_seconds: uptime,
            version: env!("CARGO_PKG_VERSION").to_string(),
            models: self
                .service
                .list_models()
                .into_iter()
                .map(|m| format!("{}@{}", m.name, m.version))
                .collect(),
            service: status,
        }
    }
}
