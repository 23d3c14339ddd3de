use crate::domain::features::FeatureVectorId;
use crate::domain::signal::InstrumentKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    /// Signed direction score in [-1, 1]
    Direction,
    /// Expected return over the horizon
    Return,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PredictionTarget {
    pub kind: TargetKind,
    pub horizon_minutes: u32,
}

impl PredictionTarget {
    pub fn direction(horizon_minutes: u32) -> Self {
        Self {
            kind: TargetKind::Direction,
            horizon_minutes,
        }
    }
}

impl Default for PredictionTarget {
    fn default() -> Self {
        Self::direction(60)
    }
}

impl fmt::Display for PredictionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            TargetKind::Direction => "direction",
            TargetKind::Return => "return",
        };
        write!(f, "{}_{}m", kind, self.horizon_minutes)
    }
}

impl FromStr for PredictionTarget {
    type Err = anyhow::Error;

    /// Parses `direction_60m` / `return_1440m`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, horizon) = s
            .trim()
            .split_once('_')
            .ok_or_else(|| anyhow::anyhow!("Invalid target '{}': expected <kind>_<minutes>m", s))?;
        let kind = match kind {
            "direction" => TargetKind::Direction,
            "return" => TargetKind::Return,
            other => anyhow::bail!("Invalid target kind: {}", other),
        };
        let horizon_minutes = horizon
            .strip_suffix('m')
            .unwrap_or(horizon)
            .parse::<u32>()
            .map_err(|e| anyhow::anyhow!("Invalid target horizon '{}': {}", horizon, e))?;
        Ok(Self {
            kind,
            horizon_minutes,
        })
    }
}

/// Output of one ensemble member, as combined into a prediction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberContribution {
    pub name: String,
    pub version: String,
    pub value: f64,
    pub raw_confidence: f64,
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub id: Uuid,
    pub instrument_key: InstrumentKey,
    pub decision_time: DateTime<Utc>,
    pub target: PredictionTarget,
    pub value: f64,
    pub confidence: f64,
    /// P(value > 0) under the ensemble's combined variance
    pub probability_up: f64,
    pub model_version: String,
    pub feature_vector_ref: FeatureVectorId,
    pub members: Vec<MemberContribution>,
    pub lead_model: String,
    pub degraded: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributionMethod {
    Linear,
    ExactShapley,
    SampledShapley,
    /// Weighted combination of member attributions
    Ensemble,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Increases,
    Decreases,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Magnitude {
    Significantly,
    Moderately,
    Slightly,
}

impl Magnitude {
    fn from_abs(importance: f64) -> Self {
        if importance > 0.1 {
            Self::Significantly
        } else if importance > 0.05 {
            Self::Moderately
        } else {
            Self::Slightly
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Factor {
    pub feature: String,
    pub contribution: f64,
    pub direction: Direction,
    pub magnitude: Magnitude,
}

/// Per-feature attribution of a prediction. References the prediction by id
/// only; predictions never point back at explanations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Explanation {
    pub prediction_id: Uuid,
    pub feature_vector_ref: FeatureVectorId,
    pub model_version: String,
    pub baseline_value: f64,
    pub attributions: BTreeMap<String, f64>,
    pub method: AttributionMethod,
    pub generated_at: DateTime<Utc>,
}

impl Explanation {
    pub fn reconstructed_value(&self) -> f64 {
        self.baseline_value + self.attributions.values().sum::<f64>()
    }

    /// Absolute gap between `baseline + Σ attributions` and `value`.
    pub fn residual(&self, value: f64) -> f64 {
        (self.reconstructed_value() - value).abs()
    }

    /// Holds within `rel_tol` relative to max(|value|, 1).
    pub fn is_consistent_with(&self, value: f64, rel_tol: f64) -> bool {
        self.residual(value) <= rel_tol * value.abs().max(1.0)
    }

    pub fn top_factors(&self, n: usize) -> Vec<Factor> {
        let mut sorted: Vec<(&String, &f64)> = self.attributions.iter().collect();
        sorted.sort_by(|a, b| {
            b.1.abs()
                .partial_cmp(&a.1.abs())
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(b.0))
        });
        sorted
            .into_iter()
            .take(n)
            .map(|(feature, &contribution)| Factor {
                feature: feature.clone(),
                contribution,
                direction: if contribution > 0.0 {
                    Direction::Increases
                } else {
                    Direction::Decreases
                },
                magnitude: Magnitude::from_abs(contribution.abs()),
            })
            .collect()
    }

    /// Human-readable summary of the five strongest factors.
    pub fn summary(&self) -> String {
        let factors = self.top_factors(5);
        if factors.is_empty() {
            return "No significant factors identified.".to_string();
        }
        let mut text = String::from("The prediction is primarily influenced by:\n");
        for (i, factor) in factors.iter().enumerate() {
            let readable = factor.feature.replace(['_', '.'], " ");
            let direction = match factor.direction {
                Direction::Increases => "increases",
                Direction::Decreases => "decreases",
            };
            let magnitude = match factor.magnitude {
                Magnitude::Significantly => "significantly",
                Magnitude::Moderately => "moderately",
                Magnitude::Slightly => "slightly",
            };
            text.push_str(&format!(
                "\n{}. {} - {} prediction {} (impact: {:.3})",
                i + 1,
                readable,
                direction,
                magnitude,
                factor.contribution.abs()
            ));
        }
        text
    }
}

/// Mean absolute attribution per feature over a batch, strongest first.
pub fn global_importance(explanations: &[Explanation]) -> Vec<(String, f64)> {
    if explanations.is_empty() {
        return Vec::new();
    }
    let mut totals: HashMap<&str, f64> = HashMap::new();
    for explanation in explanations {
        for (feature, value) in &explanation.attributions {
            *totals.entry(feature.as_str()).or_insert(0.0) += value.abs();
        }
    }
    let n = explanations.len() as f64;
    let mut ranked: Vec<(String, f64)> = totals
        .into_iter()
        .map(|(feature, total)| (feature.to_string(), total / n))
        .collect();
    ranked.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    ranked
}
