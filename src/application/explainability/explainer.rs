use crate::application::explainability::shapley;
use crate::application::ml::{PredictionEnsemble, ScoringModel};
use crate::domain::errors::{EnsembleError, ExplainError};
use crate::domain::features::FeatureVector;
use crate::domain::prediction::{AttributionMethod, Explanation, Prediction};
use crate::infrastructure::observability::Metrics;
use chrono::Utc;
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct ExplainerConfig {
    /// Members with at most this many non-baseline inputs get exact Shapley.
    /// Values above `shapley::MAX_EXACT_PLAYERS` are treated as that cap.
    pub exact_limit: usize,
    pub permutation_samples: usize,
    /// Relative tolerance for the `baseline + Σ attributions = value` check
    pub tolerance: f64,
}

impl Default for ExplainerConfig {
    fn default() -> Self {
        Self {
            exact_limit: 10,
            permutation_samples: 128,
            tolerance: 1e-6,
        }
    }
}

struct MemberAttribution {
    inputs: Vec<String>,
    phi: Vec<f64>,
    base_value: f64,
    value: f64,
    method: AttributionMethod,
}

/// Per-feature attributions for predictions.
///
/// Pure with respect to system state: the prediction and the exact feature
/// vector it was computed from are both inputs, and the ensemble snapshot
/// must still carry the prediction's model version.
pub struct ExplainabilityEngine {
    ensemble: Arc<PredictionEnsemble>,
    config: ExplainerConfig,
    metrics: Option<Metrics>,
}

impl ExplainabilityEngine {
    pub fn new(ensemble: Arc<PredictionEnsemble>, config: ExplainerConfig) -> Self {
        Self {
            ensemble,
            config,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn explain(
        &self,
        prediction: &Prediction,
        vector: &FeatureVector,
    ) -> Result<Explanation, ExplainError> {
        if vector.id() != &prediction.feature_vector_ref {
            return Err(ExplainError::StaleReference {
                reason: format!(
                    "feature vector {} does not match prediction input {}",
                    vector.id(),
                    prediction.feature_vector_ref
                ),
            });
        }
        let snapshot = self.ensemble.snapshot();
        let current_version = snapshot.model_version();
        if current_version != prediction.model_version {
            return Err(ExplainError::StaleReference {
                reason: format!(
                    "prediction made by {}, ensemble is now {}",
                    prediction.model_version, current_version
                ),
            });
        }

        let members = snapshot.members();
        let names_match = members.len() == prediction.members.len()
            && members
                .iter()
                .zip(&prediction.members)
                .all(|(m, c)| m.name() == c.name);
        if !names_match {
            return Err(ExplainError::StaleReference {
                reason: "ensemble members differ from the prediction's".to_string(),
            });
        }

        let seed = prediction.id.as_u64_pair().0;
        let per_member: Vec<MemberAttribution> = members
            .par_iter()
            .enumerate()
            .map(|(i, model)| self.attribute(model, vector, seed ^ i as u64))
            .collect::<Result<_, EnsembleError>>()?;

        let mut attributions: BTreeMap<String, f64> =
            vector.features().keys().map(|k| (k.clone(), 0.0)).collect();
        let mut baseline_value = 0.0;
        for (contribution, member) in prediction.members.iter().zip(&per_member) {
            let w = contribution.weight;
            baseline_value += w * member.base_value;
            for (name, phi) in member.inputs.iter().zip(&member.phi) {
                if *phi != 0.0 || attributions.contains_key(name) {
                    *attributions.entry(name.clone()).or_insert(0.0) += w * phi;
                }
            }
            if (member.value - contribution.value).abs() > 1e-9 * contribution.value.abs().max(1.0) {
                warn!(
                    "ExplainabilityEngine: member {} re-evaluated to {} but predicted {}",
                    contribution.name, member.value, contribution.value
                );
            }
        }

        let method = match per_member.as_slice() {
            [single] => single.method,
            _ => AttributionMethod::Ensemble,
        };
        let explanation = Explanation {
            prediction_id: prediction.id,
            feature_vector_ref: prediction.feature_vector_ref.clone(),
            model_version: prediction.model_version.clone(),
            baseline_value,
            attributions,
            method,
            generated_at: Utc::now(),
        };

        if !explanation.is_consistent_with(prediction.value, self.config.tolerance) {
            warn!(
                "ExplainabilityEngine: attribution residual {:.3e} for prediction {}",
                explanation.residual(prediction.value),
                prediction.id
            );
        }
        if let Some(metrics) = &self.metrics {
            metrics.inc_explanations(method_label(method));
        }
        debug!(
            "ExplainabilityEngine: explained {} via {:?} ({} features)",
            prediction.id,
            method,
            explanation.attributions.len()
        );
        Ok(explanation)
    }

    fn attribute(
        &self,
        model: &ScoringModel,
        vector: &FeatureVector,
        seed: u64,
    ) -> Result<MemberAttribution, EnsembleError> {
        let inputs = model.inputs();
        let (x, _) = model.row_for(vector);
        let base = model.baseline_row();

        if let ScoringModel::Linear(linear) = model {
            // Exact closed form for additive models.
            let coefficients = linear.effective_coefficients();
            let phi: Vec<f64> = coefficients
                .iter()
                .zip(x.iter().zip(&base))
                .map(|((_, c), (xi, bi))| c * (xi - bi))
                .collect();
            let base_value = linear.intercept
                + coefficients
                    .iter()
                    .zip(&base)
                    .map(|((_, c), b)| c * b)
                    .sum::<f64>();
            let value = model
                .evaluate_rows(std::slice::from_ref(&x))?
                .first()
                .copied()
                .unwrap_or(base_value);
            return Ok(MemberAttribution {
                inputs,
                phi,
                base_value,
                value,
                method: AttributionMethod::Linear,
            });
        }

        let eval = |rows: &[Vec<f64>]| model.evaluate_rows(rows);
        let exact_limit = self.config.exact_limit.min(shapley::MAX_EXACT_PLAYERS);
        let (values, method) = if shapley::player_count(&x, &base) <= exact_limit {
            (shapley::exact(&x, &base, eval)?, AttributionMethod::ExactShapley)
        } else {
            (
                shapley::sampled(&x, &base, eval, self.config.permutation_samples, seed)?,
                AttributionMethod::SampledShapley,
            )
        };
        Ok(MemberAttribution {
            inputs,
            phi: values.phi,
            base_value: values.base_value,
            value: values.value,
            method,
        })
    }
}

fn method_label(method: AttributionMethod) -> &'static str {
    match method {
        AttributionMethod::Linear => "linear",
        AttributionMethod::ExactShapley => "exact_shapley",
        AttributionMethod::SampledShapley => "sampled_shapley",
        AttributionMethod::Ensemble => "ensemble",
    }
}
