//! Ensemble and explainer configuration.

use super::parse_or;
use crate::application::explainability::ExplainerConfig;
use crate::application::explainability::shapley::MAX_EXACT_PLAYERS;
use crate::application::ml::manifest::load_manifest;
use crate::application::ml::scoring_model::default_models;
use crate::application::ml::{EnsembleConfig, PredictionEnsemble, WeightTable};
use crate::domain::prediction::PredictionTarget;
use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use tracing::info;

#[derive(Debug, Clone)]
pub struct EnsembleEnvConfig {
    /// JSON model manifest; the built-in members are used when unset
    pub manifest_path: Option<PathBuf>,
    pub weights_path: Option<PathBuf>,
    pub target: PredictionTarget,
    pub variance_scale: f64,
    pub shapley_exact_limit: usize,
    pub shapley_permutations: usize,
}

impl Default for EnsembleEnvConfig {
    fn default() -> Self {
        let ensemble = EnsembleConfig::default();
        let explainer = ExplainerConfig::default();
        Self {
            manifest_path: None,
            weights_path: None,
            target: ensemble.target,
            variance_scale: ensemble.variance_scale,
            shapley_exact_limit: explainer.exact_limit,
            shapley_permutations: explainer.permutation_samples,
        }
    }
}

impl EnsembleEnvConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let target = match env::var("PREDICTION_TARGET") {
            Ok(raw) => raw
                .parse::<PredictionTarget>()
                .context("Failed to parse PREDICTION_TARGET")?,
            Err(_) => defaults.target,
        };
        let variance_scale = parse_or("CONFIDENCE_VARIANCE_SCALE", defaults.variance_scale)?;
        if !(variance_scale.is_finite() && variance_scale >= 0.0) {
            anyhow::bail!("CONFIDENCE_VARIANCE_SCALE must be a non-negative number");
        }

        let shapley_exact_limit = parse_or("SHAPLEY_EXACT_LIMIT", defaults.shapley_exact_limit)?;
        if shapley_exact_limit > MAX_EXACT_PLAYERS {
            anyhow::bail!(
                "SHAPLEY_EXACT_LIMIT must be at most {} (got {})",
                MAX_EXACT_PLAYERS,
                shapley_exact_limit
            );
        }

        Ok(Self {
            manifest_path: env::var("MODEL_MANIFEST").ok().map(PathBuf::from),
            weights_path: env::var("WEIGHT_TABLE_FILE").ok().map(PathBuf::from),
            target,
            variance_scale,
            shapley_exact_limit,
            shapley_permutations: parse_or("SHAPLEY_PERMUTATIONS", defaults.shapley_permutations)?,
        })
    }

    pub fn ensemble_config(&self) -> EnsembleConfig {
        EnsembleConfig {
            target: self.target,
            variance_scale: self.variance_scale,
        }
    }

    pub fn explainer_config(&self) -> ExplainerConfig {
        ExplainerConfig {
            exact_limit: self.shapley_exact_limit,
            permutation_samples: self.shapley_permutations.max(1),
            ..ExplainerConfig::default()
        }
    }

    pub fn load_weights(&self) -> Result<WeightTable> {
        match &self.weights_path {
            Some(path) => {
                let content = std::fs::read_to_string(path)
                    .context(format!("Failed to read weight table {}", path.display()))?;
                WeightTable::from_toml_str(&content)
            }
            None => Ok(WeightTable::new()),
        }
    }

    pub fn build_ensemble(&self) -> Result<PredictionEnsemble> {
        let weights = self.load_weights()?;
        let (version, members) = match &self.manifest_path {
            Some(path) => load_manifest(path)?,
            None => ("builtin-1".to_string(), default_models()),
        };
        info!(
            "Ensemble: {} members, version {}, {} weight rows",
            members.len(),
            version,
            weights.row_count()
        );
        Ok(PredictionEnsemble::new(
            version,
            members,
            weights,
            self.ensemble_config(),
        ))
    }
}
