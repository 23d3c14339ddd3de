use chrono::Utc;
use finsight::application::explainability::{ExplainabilityEngine, ExplainerConfig};
use finsight::application::ml::scoring_model::default_models;
use finsight::application::ml::{EnsembleConfig, ForestModel, ModelMeta, PredictionEnsemble, ScoringModel};
use finsight::domain::errors::ExplainError;
use finsight::domain::features::FeatureVector;
use finsight::domain::prediction::AttributionMethod;
use finsight::domain::signal::InstrumentKey;
use smartcore::ensemble::random_forest_regressor::{
    RandomForestRegressor, RandomForestRegressorParameters,
};
use smartcore::linalg::basic::matrix::DenseMatrix;
use std::collections::BTreeMap;
use std::sync::Arc;

const INPUTS: [&str; 3] = ["technical.momentum", "sentiment.score", "fundamental.eps_growth"];

fn forest_member() -> ScoringModel {
    // Nonlinear target: sentiment only matters when momentum is positive.
    let mut x = Vec::new();
    let mut y = Vec::new();
    for i in 0..60 {
        let momentum = ((i % 12) as f64 - 6.0) / 100.0;
        let sentiment = ((i * 7) % 13) as f64 / 6.0 - 1.0;
        let eps = ((i * 5) % 9) as f64 / 20.0;
        x.push(vec![momentum, sentiment, eps]);
        let regime = if momentum > 0.0 { 0.3 + 0.4 * sentiment } else { -0.2 };
        let value = regime + 0.1 * eps;
        y.push(value);
    }
    let params = RandomForestRegressorParameters::default()
        .with_n_trees(12)
        .with_max_depth(5)
        .with_min_samples_split(2);
    let forest =
        RandomForestRegressor::fit(&DenseMatrix::from_2d_vec(&x).unwrap(), &y, params).unwrap();

    ScoringModel::Forest(ForestModel::new(
        ModelMeta {
            name: "forest_momentum".to_string(),
            version: "0.3.0".to_string(),
            declared_variance: 0.03,
            base_confidence: 0.65,
            baseline: BTreeMap::from([("technical.momentum".to_string(), -0.01)]),
        },
        INPUTS.iter().map(|s| s.to_string()).collect(),
        forest,
    ))
}

fn vector() -> FeatureVector {
    FeatureVector::new(
        InstrumentKey::from("AMZN"),
        Utc::now(),
        BTreeMap::from([
            ("technical.momentum".to_string(), 0.04),
            ("sentiment.score".to_string(), 0.6),
            ("fundamental.eps_growth".to_string(), 0.2),
            ("technical.return_lag_1".to_string(), 0.003),
        ]),
        BTreeMap::new(),
    )
}

/// Test: baseline plus attributions reconstructs the prediction for a mixed
/// linear / forest / sequence ensemble.
#[test]
fn test_attributions_sum_to_prediction() {
    let ensemble = Arc::new(PredictionEnsemble::with_defaults(EnsembleConfig::default()));
    let mut members = default_models();
    members.push(forest_member());
    ensemble.replace_models("mixed-1", members);

    let explainer = ExplainabilityEngine::new(ensemble.clone(), ExplainerConfig::default());
    let vector = vector();
    let prediction = ensemble.predict(&vector).unwrap();
    let explanation = explainer.explain(&prediction, &vector).unwrap();

    assert_eq!(explanation.method, AttributionMethod::Ensemble);
    assert!(
        explanation.is_consistent_with(prediction.value, 1e-9),
        "residual {}",
        explanation.residual(prediction.value)
    );
    // Every feature in the vector is attributed, even if only some models read it.
    for name in vector.features().keys() {
        assert!(explanation.attributions.contains_key(name), "{} missing", name);
    }
}

/// Test: sampled Shapley also reconstructs the value and is reproducible for
/// the same prediction.
#[test]
fn test_sampled_shapley_is_consistent_and_reproducible() {
    let ensemble = Arc::new(PredictionEnsemble::with_defaults(EnsembleConfig::default()));
    ensemble.replace_models("forest-only", vec![forest_member()]);

    let config = ExplainerConfig {
        exact_limit: 1,
        permutation_samples: 32,
        ..ExplainerConfig::default()
    };
    let explainer = ExplainabilityEngine::new(ensemble.clone(), config);
    let vector = vector();
    let prediction = ensemble.predict(&vector).unwrap();

    let first = explainer.explain(&prediction, &vector).unwrap();
    let second = explainer.explain(&prediction, &vector).unwrap();

    assert_eq!(first.method, AttributionMethod::SampledShapley);
    assert!(first.is_consistent_with(prediction.value, 1e-9));
    assert_eq!(first.attributions, second.attributions);
}

/// Test: a model swap after prediction makes the old prediction unexplainable.
#[test]
fn test_model_swap_makes_prediction_stale() {
    let ensemble = Arc::new(PredictionEnsemble::with_defaults(EnsembleConfig::default()));
    let explainer = ExplainabilityEngine::new(ensemble.clone(), ExplainerConfig::default());
    let vector = vector();
    let prediction = ensemble.predict(&vector).unwrap();

    ensemble.replace_models("forest-only", vec![forest_member()]);

    let err = explainer.explain(&prediction, &vector).unwrap_err();
    assert!(matches!(err, ExplainError::StaleReference { .. }));
}

/// Test: explaining against a different feature vector is rejected.
#[test]
fn test_mismatched_vector_is_stale_reference() {
    let ensemble = Arc::new(PredictionEnsemble::with_defaults(EnsembleConfig::default()));
    let explainer = ExplainabilityEngine::new(ensemble.clone(), ExplainerConfig::default());
    let prediction = ensemble.predict(&vector()).unwrap();

    let other = FeatureVector::new(
        InstrumentKey::from("AMZN"),
        Utc::now() + chrono::Duration::seconds(1),
        BTreeMap::from([("sentiment.score".to_string(), -0.2)]),
        BTreeMap::new(),
    );
    let err = explainer.explain(&prediction, &other).unwrap_err();
    assert!(matches!(err, ExplainError::StaleReference { .. }));
}
