//! Persistence abstractions for snapshot export.
//!
//! The core never reads its state back from these; they exist for
//! durability and historical query by external consumers.

use crate::domain::prediction::{Explanation, Prediction};
use crate::domain::signal::InstrumentKey;
use crate::domain::window::FeatureWindow;
use anyhow::Result;
use async_trait::async_trait;

#[async_trait]
pub trait SnapshotRepository: Send + Sync {
    /// Upsert the current state of a batch of windows.
    async fn save_windows(&self, windows: &[FeatureWindow]) -> Result<()>;

    async fn save_prediction(&self, prediction: &Prediction) -> Result<()>;

    async fn save_explanation(&self, explanation: &Explanation) -> Result<()>;

    /// Most recent predictions for an instrument, newest first.
    async fn recent_predictions(
        &self,
        instrument: &InstrumentKey,
        limit: usize,
    ) -> Result<Vec<Prediction>>;
}
