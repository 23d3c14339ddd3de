use chrono::Utc;
use finsight::application::ml::{EnsembleConfig, PredictionEnsemble, WeightTable};
use finsight::domain::features::FeatureVector;
use finsight::domain::prediction::Prediction;
use finsight::domain::signal::InstrumentKey;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

fn table(linear: f64, sequence: f64) -> WeightTable {
    WeightTable::new().with_default_row(HashMap::from([
        ("linear_sentiment".to_string(), linear),
        ("sequence_returns".to_string(), sequence),
    ]))
}

fn vector() -> FeatureVector {
    FeatureVector::new(
        InstrumentKey::from("NVDA"),
        Utc::now(),
        BTreeMap::from([
            ("sentiment.score".to_string(), 0.35),
            ("technical.momentum".to_string(), 0.01),
            ("technical.return_lag_1".to_string(), 0.004),
            ("technical.return_lag_2".to_string(), -0.002),
        ]),
        BTreeMap::new(),
    )
}

fn generation(prediction: &Prediction) -> u64 {
    prediction
        .model_version
        .rsplit_once("+w")
        .and_then(|(_, generation)| generation.parse().ok())
        .expect("model version carries a weight generation")
}

fn weights_of(prediction: &Prediction) -> (f64, f64) {
    let find = |name: &str| {
        prediction
            .members
            .iter()
            .find(|m| m.name == name)
            .map(|m| m.weight)
            .unwrap()
    };
    (find("linear_sentiment"), find("sequence_returns"))
}

/// Test: predictions made while weights are swapped repeatedly each use
/// exactly one weight table, the one matching the generation they report.
///
/// Odd generations install table A (0.75 / 0.25), even ones table B
/// (0.2 / 0.8); generation 0 is the initial equal weighting.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_no_prediction_mixes_weight_tables() {
    let ensemble = Arc::new(PredictionEnsemble::with_defaults(EnsembleConfig::default()));
    let vector = Arc::new(vector());
    let done = Arc::new(AtomicBool::new(false));

    let mut predictors = Vec::new();
    for _ in 0..4 {
        let ensemble = ensemble.clone();
        let vector = vector.clone();
        let done = done.clone();
        predictors.push(tokio::spawn(async move {
            let mut seen = Vec::new();
            while !done.load(Ordering::Acquire) {
                seen.push(ensemble.predict(&vector).unwrap());
                tokio::task::yield_now().await;
            }
            seen
        }));
    }

    let reweighter = {
        let ensemble = ensemble.clone();
        tokio::spawn(async move {
            for i in 0..200 {
                let next = if i % 2 == 0 { table(3.0, 1.0) } else { table(1.0, 4.0) };
                ensemble.reweight(next);
                tokio::task::yield_now().await;
            }
        })
    };
    reweighter.await.unwrap();
    done.store(true, Ordering::Release);

    let mut total = 0;
    for predictor in predictors {
        for prediction in predictor.await.unwrap() {
            total += 1;
            let (linear, sequence) = weights_of(&prediction);
            let expected = match generation(&prediction) {
                0 => (0.5, 0.5),
                g if g % 2 == 1 => (0.75, 0.25),
                _ => (0.2, 0.8),
            };
            assert!((linear - expected.0).abs() < 1e-12, "{:?}", prediction.members);
            assert!((sequence - expected.1).abs() < 1e-12, "{:?}", prediction.members);

            let combined: f64 = prediction.members.iter().map(|m| m.weight * m.value).sum();
            assert!((combined - prediction.value).abs() < 1e-12);
        }
    }
    assert!(total > 0);
    assert_eq!(generation(&ensemble.predict(&vector).unwrap()), 200);
}

/// Test: a prediction made before a reweight keeps reporting its own version.
#[test]
fn test_reweight_bumps_model_version() {
    let ensemble = PredictionEnsemble::with_defaults(EnsembleConfig::default());
    let before = ensemble.predict(&vector()).unwrap();

    let generation_after = ensemble.reweight(table(1.0, 0.0));
    let after = ensemble.predict(&vector()).unwrap();

    assert_eq!(generation_after, 1);
    assert_ne!(before.model_version, after.model_version);
    assert_eq!(weights_of(&after), (1.0, 0.0));
    assert_eq!(after.lead_model, "linear_sentiment");
}
