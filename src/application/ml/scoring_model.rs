//! Ensemble members.
//!
//! The member set is closed: every model the ensemble can hold is a variant
//! of `ScoringModel`. Each variant reads a fixed, ordered list of named
//! inputs; inputs missing from a feature vector take the model's baseline.

use crate::application::ml::forest::ForestModel;
use crate::domain::errors::EnsembleError;
use crate::domain::features::FeatureVector;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMeta {
    pub name: String,
    pub version: String,
    /// Variance the model reports for its own output
    pub declared_variance: f64,
    /// Confidence when every input is present
    pub base_confidence: f64,
    /// Reference input values (training means); used for missing inputs and
    /// as the attribution baseline
    #[serde(default)]
    pub baseline: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelScore {
    pub value: f64,
    pub raw_confidence: f64,
}

/// Additive model `intercept + Σ cᵢ·xᵢ`, with sentiment coefficients scaled
/// by `sentiment_gain`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearModel {
    pub meta: ModelMeta,
    pub intercept: f64,
    pub coefficients: BTreeMap<String, f64>,
    #[serde(default = "default_gain")]
    pub sentiment_gain: f64,
}

fn default_gain() -> f64 {
    1.0
}

impl LinearModel {
    /// Effective coefficient per input, in input order.
    pub fn effective_coefficients(&self) -> Vec<(String, f64)> {
        self.coefficients
            .iter()
            .map(|(name, c)| {
                let gain = if name.starts_with("sentiment.") {
                    self.sentiment_gain
                } else {
                    1.0
                };
                (name.clone(), c * gain)
            })
            .collect()
    }

    fn evaluate(&self, row: &[f64]) -> f64 {
        self.intercept
            + self
                .effective_coefficients()
                .iter()
                .zip(row)
                .map(|((_, c), x)| c * x)
                .sum::<f64>()
    }
}

/// Short-horizon sequence scorer over lagged returns:
/// `tanh(gain · Σₖ decay^(k-1) · rₖ)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceModel {
    pub meta: ModelMeta,
    pub lags: usize,
    pub decay: f64,
    pub gain: f64,
}

impl SequenceModel {
    fn inputs(&self) -> Vec<String> {
        (1..=self.lags)
            .map(|k| format!("technical.return_lag_{}", k))
            .collect()
    }

    fn evaluate(&self, row: &[f64]) -> f64 {
        let mut weight = 1.0;
        let mut acc = 0.0;
        for r in row {
            acc += weight * r;
            weight *= self.decay;
        }
        (self.gain * acc).tanh()
    }
}

#[derive(Debug, Clone)]
pub enum ScoringModel {
    Linear(LinearModel),
    Forest(ForestModel),
    Sequence(SequenceModel),
}

impl ScoringModel {
    pub fn meta(&self) -> &ModelMeta {
        match self {
            Self::Linear(m) => &m.meta,
            Self::Forest(m) => &m.meta,
            Self::Sequence(m) => &m.meta,
        }
    }

    pub fn name(&self) -> &str {
        &self.meta().name
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Linear(_) => "linear",
            Self::Forest(_) => "forest",
            Self::Sequence(_) => "sequence",
        }
    }

    /// Ordered input names.
    pub fn inputs(&self) -> Vec<String> {
        match self {
            Self::Linear(m) => m.coefficients.keys().cloned().collect(),
            Self::Forest(m) => m.feature_order.clone(),
            Self::Sequence(m) => m.inputs(),
        }
    }

    pub fn baseline_row(&self) -> Vec<f64> {
        let baseline = &self.meta().baseline;
        self.inputs()
            .iter()
            .map(|name| baseline.get(name).copied().unwrap_or(0.0))
            .collect()
    }

    /// Input row for a vector, baseline-filled where a feature is absent.
    /// Also returns how many inputs were present.
    pub fn row_for(&self, vector: &FeatureVector) -> (Vec<f64>, usize) {
        let inputs = self.inputs();
        let baseline = self.baseline_row();
        let mut present = 0;
        let row = inputs
            .iter()
            .zip(baseline)
            .map(|(name, base)| match vector.get(name) {
                Some(v) => {
                    present += 1;
                    v
                }
                None => base,
            })
            .collect();
        (row, present)
    }

    /// Evaluate a batch of input rows.
    pub fn evaluate_rows(&self, rows: &[Vec<f64>]) -> Result<Vec<f64>, EnsembleError> {
        let values = match self {
            Self::Linear(m) => rows.iter().map(|r| m.evaluate(r)).collect(),
            Self::Sequence(m) => rows.iter().map(|r| m.evaluate(r)).collect(),
            Self::Forest(m) => m.predict_rows(rows)?,
        };
        if values.iter().any(|v: &f64| !v.is_finite()) {
            return Err(EnsembleError::Scoring {
                model: self.name().to_string(),
                reason: "non-finite output".to_string(),
            });
        }
        Ok(values)
    }

    /// Score one vector. Raw confidence scales with input coverage.
    pub fn score(&self, vector: &FeatureVector) -> Result<ModelScore, EnsembleError> {
        let (row, present) = self.row_for(vector);
        let total = row.len();
        let value = self
            .evaluate_rows(std::slice::from_ref(&row))?
            .first()
            .copied()
            .ok_or_else(|| EnsembleError::Scoring {
                model: self.name().to_string(),
                reason: "no output".to_string(),
            })?;
        let coverage = if total == 0 {
            1.0
        } else {
            present as f64 / total as f64
        };
        Ok(ModelScore {
            value,
            raw_confidence: (self.meta().base_confidence * coverage).clamp(0.0, 1.0),
        })
    }
}

/// Built-in members used when no model manifest is configured.
pub fn default_models() -> Vec<ScoringModel> {
    let linear = LinearModel {
        meta: ModelMeta {
            name: "linear_sentiment".to_string(),
            version: "1.0.0".to_string(),
            declared_variance: 0.04,
            base_confidence: 0.7,
            baseline: BTreeMap::from([
                ("fundamental.pe_ratio".to_string(), 20.0),
                ("fundamental.eps_growth".to_string(), 0.0),
            ]),
        },
        intercept: 0.0,
        coefficients: BTreeMap::from([
            ("sentiment.score".to_string(), 0.45),
            ("sentiment.score_mean".to_string(), 0.2),
            ("technical.momentum".to_string(), 2.0),
            ("technical.price_zscore".to_string(), 0.05),
            ("fundamental.pe_ratio".to_string(), -0.005),
            ("fundamental.eps_growth".to_string(), 0.3),
        ]),
        sentiment_gain: 1.0,
    };
    let sequence = SequenceModel {
        meta: ModelMeta {
            name: "sequence_returns".to_string(),
            version: "1.0.0".to_string(),
            declared_variance: 0.09,
            base_confidence: 0.6,
            baseline: BTreeMap::new(),
        },
        lags: 3,
        decay: 0.6,
        gain: 25.0,
    };
    vec![ScoringModel::Linear(linear), ScoringModel::Sequence(sequence)]
}
