//! Weighted model ensemble.
//!
//! Members and weights live in an immutable `EnsembleSnapshot` behind an
//! `RwLock<Arc<_>>`. A prediction clones the `Arc` once and computes
//! entirely against that snapshot, so `reweight` (which swaps in a new
//! snapshot) never produces a prediction mixing old and new weights.

use crate::application::ml::scoring_model::{ModelScore, ScoringModel, default_models};
use crate::application::ml::weights::WeightTable;
use crate::domain::errors::EnsembleError;
use crate::domain::features::FeatureVector;
use crate::domain::prediction::{MemberContribution, Prediction, PredictionTarget};
use crate::domain::signal::InstrumentKey;
use crate::infrastructure::observability::Metrics;
use chrono::Utc;
use serde::Serialize;
use statrs::distribution::{ContinuousCDF, Normal};
use std::sync::{Arc, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub struct EnsembleConfig {
    /// Target used by `predict`
    pub target: PredictionTarget,
    /// How strongly combined variance discounts confidence
    pub variance_scale: f64,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            target: PredictionTarget::default(),
            variance_scale: 4.0,
        }
    }
}

#[derive(Debug)]
pub struct EnsembleSnapshot {
    models_version: String,
    generation: u64,
    members: Arc<Vec<ScoringModel>>,
    weights: Arc<WeightTable>,
}

impl EnsembleSnapshot {
    /// `<models version>+w<weight generation>`
    pub fn model_version(&self) -> String {
        format!("{}+w{}", self.models_version, self.generation)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn members(&self) -> &[ScoringModel] {
        &self.members
    }

    pub fn weights(&self) -> &WeightTable {
        &self.weights
    }

    /// Normalized weights (sum to 1). If every raw weight is zero the
    /// lowest-variance member carries the prediction alone.
    pub fn combination_weights(
        &self,
        instrument: &InstrumentKey,
        target: PredictionTarget,
    ) -> Vec<f64> {
        let names: Vec<&str> = self.members.iter().map(|m| m.name()).collect();
        let raw = self.weights.weights_for(instrument, target, &names);
        let total: f64 = raw.iter().sum();
        if total > 0.0 {
            return raw.iter().map(|w| w / total).collect();
        }

        let mut weights = vec![0.0; self.members.len()];
        if let Some(idx) = lowest_variance(self.members.iter().map(|m| m.meta().declared_variance)) {
            weights[idx] = 1.0;
        }
        weights
    }
}

fn lowest_variance(variances: impl Iterator<Item = f64>) -> Option<usize> {
    variances
        .enumerate()
        .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(i, _)| i)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelInfo {
    pub name: String,
    pub kind: &'static str,
    pub version: String,
    pub declared_variance: f64,
    pub inputs: Vec<String>,
}

pub struct PredictionEnsemble {
    state: RwLock<Arc<EnsembleSnapshot>>,
    config: EnsembleConfig,
    metrics: Option<Metrics>,
}

impl std::fmt::Debug for PredictionEnsemble {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.snapshot();
        f.debug_struct("PredictionEnsemble")
            .field("model_version", &snapshot.model_version())
            .field("members", &snapshot.members.len())
            .field("config", &self.config)
            .finish()
    }
}

impl PredictionEnsemble {
    pub fn new(
        models_version: impl Into<String>,
        members: Vec<ScoringModel>,
        weights: WeightTable,
        config: EnsembleConfig,
    ) -> Self {
        let snapshot = EnsembleSnapshot {
            models_version: models_version.into(),
            generation: 0,
            members: Arc::new(members),
            weights: Arc::new(weights),
        };
        Self {
            state: RwLock::new(Arc::new(snapshot)),
            config,
            metrics: None,
        }
    }

    /// Built-in members with equal weights.
    pub fn with_defaults(config: EnsembleConfig) -> Self {
        Self::new("builtin-1", default_models(), WeightTable::new(), config)
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        metrics.weight_generation.set(self.snapshot().generation as i64);
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &EnsembleConfig {
        &self.config
    }

    pub fn snapshot(&self) -> Arc<EnsembleSnapshot> {
        match self.state.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn model_version(&self) -> String {
        self.snapshot().model_version()
    }

    pub fn predict(&self, vector: &FeatureVector) -> Result<Prediction, EnsembleError> {
        self.predict_for(vector, self.config.target)
    }

    pub fn predict_for(
        &self,
        vector: &FeatureVector,
        target: PredictionTarget,
    ) -> Result<Prediction, EnsembleError> {
        self.predict_with_snapshot(&self.snapshot(), vector, target)
    }

    /// Score against an explicit snapshot.
    pub fn predict_with_snapshot(
        &self,
        snapshot: &EnsembleSnapshot,
        vector: &FeatureVector,
        target: PredictionTarget,
    ) -> Result<Prediction, EnsembleError> {
        let members = snapshot.members();
        if members.is_empty() {
            return Err(EnsembleError::NoModels);
        }

        let weights = snapshot.combination_weights(vector.instrument_key(), target);
        let scores: Vec<ModelScore> = members
            .iter()
            .map(|m| m.score(vector))
            .collect::<Result<_, _>>()?;

        let value: f64 = weights.iter().zip(&scores).map(|(w, s)| w * s.value).sum();
        let dispersion: f64 = weights
            .iter()
            .zip(&scores)
            .map(|(w, s)| w * (s.value - value).powi(2))
            .sum();
        let declared: f64 = weights
            .iter()
            .zip(members)
            .map(|(w, m)| w * m.meta().declared_variance.max(0.0))
            .sum();
        let raw_confidence: f64 = weights
            .iter()
            .zip(&scores)
            .map(|(w, s)| w * s.raw_confidence)
            .sum();

        let total_variance = dispersion + declared;
        let confidence =
            (raw_confidence / (1.0 + self.config.variance_scale * total_variance)).clamp(0.0, 1.0);

        let lead = lead_member(&weights, members);
        let contributions = members
            .iter()
            .zip(&scores)
            .zip(&weights)
            .map(|((m, s), w)| MemberContribution {
                name: m.name().to_string(),
                version: m.meta().version.clone(),
                value: s.value,
                raw_confidence: s.raw_confidence,
                weight: *w,
            })
            .collect();

        let prediction = Prediction {
            id: Uuid::new_v4(),
            instrument_key: vector.instrument_key().clone(),
            decision_time: vector.decision_time(),
            target,
            value,
            confidence,
            probability_up: probability_up(value, total_variance),
            model_version: snapshot.model_version(),
            feature_vector_ref: vector.id().clone(),
            members: contributions,
            lead_model: members[lead].name().to_string(),
            degraded: vector.is_degraded(),
            created_at: Utc::now(),
        };
        debug!(
            "PredictionEnsemble: {} {} value={:.4} confidence={:.3} lead={}",
            prediction.instrument_key,
            prediction.target,
            prediction.value,
            prediction.confidence,
            prediction.lead_model
        );
        Ok(prediction)
    }

    /// Atomically install a new weight table. Returns the new generation.
    pub fn reweight(&self, weights: WeightTable) -> u64 {
        self.swap(|current| EnsembleSnapshot {
            models_version: current.models_version.clone(),
            generation: current.generation + 1,
            members: current.members.clone(),
            weights: Arc::new(weights),
        })
    }

    /// Atomically install a new member set, keeping the weight table.
    pub fn replace_models(&self, models_version: impl Into<String>, members: Vec<ScoringModel>) -> u64 {
        let models_version = models_version.into();
        self.swap(|current| EnsembleSnapshot {
            models_version,
            generation: current.generation + 1,
            members: Arc::new(members),
            weights: current.weights.clone(),
        })
    }

    fn swap(&self, next: impl FnOnce(&EnsembleSnapshot) -> EnsembleSnapshot) -> u64 {
        let mut guard = match self.state.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("PredictionEnsemble: Lock poisoned during swap, recovering");
                poisoned.into_inner()
            }
        };
        let snapshot = next(&**guard);
        let generation = snapshot.generation;
        info!(
            "PredictionEnsemble: installed {} ({} members)",
            snapshot.model_version(),
            snapshot.members.len()
        );
        *guard = Arc::new(snapshot);
        if let Some(metrics) = &self.metrics {
            metrics.weight_generation.set(generation as i64);
        }
        generation
    }

    pub fn list_models(&self) -> Vec<ModelInfo> {
        self.snapshot()
            .members()
            .iter()
            .map(|m| ModelInfo {
                name: m.name().to_string(),
                kind: m.kind(),
                version: m.meta().version.clone(),
                declared_variance: m.meta().declared_variance,
                inputs: m.inputs(),
            })
            .collect()
    }
}

/// Max weight; ties go to the lowest declared variance, then member order.
fn lead_member(weights: &[f64], members: &[ScoringModel]) -> usize {
    let mut best = 0;
    for i in 1..members.len() {
        let (w, bw) = (weights[i], weights[best]);
        let (v, bv) = (
            members[i].meta().declared_variance,
            members[best].meta().declared_variance,
        );
        if w > bw || (w == bw && v < bv) {
            best = i;
        }
    }
    best
}

/// P(outcome > 0) under N(value, variance).
fn probability_up(value: f64, variance: f64) -> f64 {
    if variance <= 1e-12 {
        return if value > 0.0 {
            1.0
        } else if value < 0.0 {
            0.0
        } else {
            0.5
        };
    }
    match Normal::new(value, variance.sqrt()) {
        Ok(dist) => 1.0 - dist.cdf(0.0),
        Err(_) => 0.5,
    }
}
