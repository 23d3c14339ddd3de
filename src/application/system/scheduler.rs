use crate::application::system::cancel::stop_requested;
use crate::application::system::service::{FusionService, ServiceError};
use crate::domain::errors::FusionError;
use crate::domain::signal::InstrumentKey;
use chrono::Utc;
use futures::future::join_all;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// Triggers for the same instrument inside this window collapse to one run
    pub debounce: Duration,
    /// Instruments predicted on every tick even without a trigger
    pub always: Vec<InstrumentKey>,
    pub refresh_interval: Option<Duration>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(250),
            always: Vec::new(),
            refresh_interval: None,
        }
    }
}

/// Turns signal-update triggers into debounced prediction runs.
pub struct PredictionScheduler {
    service: Arc<FusionService>,
    config: SchedulerConfig,
}

impl PredictionScheduler {
    pub fn new(service: Arc<FusionService>, config: SchedulerConfig) -> Self {
        Self { service, config }
    }

    pub async fn run(
        self,
        mut triggers: mpsc::Receiver<InstrumentKey>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(
            "PredictionScheduler: started (debounce {:?}, refresh {:?})",
            self.config.debounce, self.config.refresh_interval
        );
        let mut pending: BTreeSet<InstrumentKey> = BTreeSet::new();
        let mut debounce = tokio::time::interval(self.config.debounce.max(Duration::from_millis(1)));
        debounce.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        debounce.reset();
        let mut refresh = self.config.refresh_interval.map(tokio::time::interval);

        loop {
            tokio::select! {
                _ = stop_requested(&mut shutdown) => break,
                next = triggers.recv() => match next {
                    Some(instrument) => {
                        pending.insert(instrument);
                    }
                    None => break,
                },
                _ = debounce.tick() => {
                    if !pending.is_empty() {
                        let batch = std::mem::take(&mut pending);
                        self.run_batch(batch).await;
                    }
                }
                _ = async {
                    match refresh.as_mut() {
                        Some(interval) => interval.tick().await,
                        None => std::future::pending().await,
                    }
                } => {
                    pending.extend(self.config.always.iter().cloned());
                }
            }
        }

        // Triggers already queued when shutdown fired still get their run.
        while let Ok(instrument) = triggers.try_recv() {
            pending.insert(instrument);
        }
        if !pending.is_empty() {
            self.run_batch(std::mem::take(&mut pending)).await;
        }
        info!("PredictionScheduler: stopped");
    }

    /// Predict every instrument in the batch at one shared decision time.
    pub async fn run_batch(&self, batch: BTreeSet<InstrumentKey>) -> usize {
        let decision_time = Utc::now();
        let results = join_all(batch.iter().map(|instrument| {
            let service = self.service.clone();
            async move {
                (
                    instrument,
                    service.predict_and_explain(instrument, decision_time).await,
                )
            }
        }))
        .await;

        let mut produced = 0;
        for (instrument, result) in results {
            match result {
                Ok(report) => {
                    produced += 1;
                    debug!(
                        "PredictionScheduler: {} -> {:.4} (confidence {:.2})",
                        instrument, report.prediction.value, report.prediction.confidence
                    );
                }
                Err(ServiceError::Fusion(FusionError::InsufficientSignal { .. })) => {
                    debug!("PredictionScheduler: {} not ready yet", instrument);
                }
                Err(e) => warn!("PredictionScheduler: {} failed: {}", instrument, e),
            }
        }
        produced
    }
}
