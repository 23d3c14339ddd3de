//! In-memory snapshot repository.
//!
//! Thread-safe and async, for tests and deployments that do not need the
//! export to survive a restart.

use crate::domain::prediction::{Explanation, Prediction};
use crate::domain::repositories::SnapshotRepository;
use crate::domain::signal::{InstrumentKey, SignalFamily};
use crate::domain::window::FeatureWindow;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct Store {
    windows: HashMap<(InstrumentKey, SignalFamily), FeatureWindow>,
    predictions: Vec<Prediction>,
    explanations: HashMap<Uuid, Explanation>,
}

pub struct InMemorySnapshotRepository {
    store: Arc<RwLock<Store>>,
}

impl InMemorySnapshotRepository {
    pub fn new() -> Self {
        Self {
            store: Arc::new(RwLock::new(Store::default())),
        }
    }

    pub async fn window_count(&self) -> usize {
        self.store.read().await.windows.len()
    }

    pub async fn prediction_count(&self) -> usize {
        self.store.read().await.predictions.len()
    }

    pub async fn explanation_for(&self, prediction_id: Uuid) -> Option<Explanation> {
        self.store.read().await.explanations.get(&prediction_id).cloned()
    }
}

impl Default for InMemorySnapshotRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SnapshotRepository for InMemorySnapshotRepository {
    async fn save_windows(&self, windows: &[FeatureWindow]) -> Result<()> {
        let mut store = self.store.write().await;
        for window in windows {
            store.windows.insert(
                (window.instrument_key().clone(), window.family()),
                window.clone(),
            );
        }
        Ok(())
    }

    async fn save_prediction(&self, prediction: &Prediction) -> Result<()> {
        let mut store = self.store.write().await;
        store.predictions.retain(|p| p.id != prediction.id);
        store.predictions.push(prediction.clone());
        Ok(())
    }

    async fn save_explanation(&self, explanation: &Explanation) -> Result<()> {
        self.store
            .write()
            .await
            .explanations
            .insert(explanation.prediction_id, explanation.clone());
        Ok(())
    }

    async fn recent_predictions(
        &self,
        instrument: &InstrumentKey,
        limit: usize,
    ) -> Result<Vec<Prediction>> {
        let store = self.store.read().await;
        let mut matching: Vec<Prediction> = store
            .predictions
            .iter()
            .filter(|p| &p.instrument_key == instrument)
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.decision_time.cmp(&a.decision_time));
        matching.truncate(limit);
        Ok(matching)
    }
}
