//! Feature catalog and missing-data policy for fusion.

use crate::domain::signal::SignalFamily;
use crate::domain::window::FeatureWindow;
use anyhow::{Context, Result};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

/// What to do when a feature's source window is absent or past its ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnMissing {
    /// Substitute the feature's neutral default
    Default,
    /// Leave the feature out of the vector
    Exclude,
    /// Fail assembly with `InsufficientSignal`
    Fail,
}

impl FromStr for OnMissing {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "default" => Ok(Self::Default),
            "exclude" => Ok(Self::Exclude),
            "fail" => Ok(Self::Fail),
            _ => anyhow::bail!(
                "Invalid missing-data rule: {}. Must be 'default', 'exclude' or 'fail'",
                s
            ),
        }
    }
}

/// Derivation of one scalar feature from a window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FeatureTransform {
    /// Field of the latest value
    Latest { field: String },
    /// EWMA mean of a field
    Mean { field: String },
    /// (latest - mean) / std; zero when the window has no dispersion yet
    ZScore { field: String },
    /// latest / mean - 1
    Momentum { field: String },
    /// k-th most recent log return of the primary field
    LagReturn { lag: usize },
}

impl FeatureTransform {
    pub fn evaluate(&self, window: &FeatureWindow) -> Option<f64> {
        let value = match self {
            Self::Latest { field } => window.latest().value.field(field)?,
            Self::Mean { field } => window.stats(field)?.mean,
            Self::ZScore { field } => {
                let latest = window.latest().value.field(field)?;
                let stats = window.stats(field)?;
                let std = stats.std_dev();
                if std < 1e-12 {
                    0.0
                } else {
                    (latest - stats.mean) / std
                }
            }
            Self::Momentum { field } => {
                let latest = window.latest().value.field(field)?;
                let mean = window.stats(field)?.mean;
                if mean.abs() < 1e-12 {
                    return None;
                }
                latest / mean - 1.0
            }
            Self::LagReturn { lag } => window.lag_return(*lag)?,
        };
        value.is_finite().then_some(value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSpec {
    /// `<family>.<feature>`
    pub name: String,
    pub family: SignalFamily,
    pub transform: FeatureTransform,
    pub on_missing: OnMissing,
    /// Neutral value used under `OnMissing::Default`
    pub default: f64,
}

impl FeatureSpec {
    fn new(
        family: SignalFamily,
        feature: &str,
        transform: FeatureTransform,
        on_missing: OnMissing,
        default: f64,
    ) -> Self {
        Self {
            name: format!("{}.{}", family, feature),
            family,
            transform,
            on_missing,
            default,
        }
    }
}

/// Ordered feature catalog plus per-family usability ceilings.
///
/// A window older than its family ceiling is treated as missing, even
/// though the cache still holds it.
#[derive(Debug, Clone, PartialEq)]
pub struct FusionPolicy {
    features: Vec<FeatureSpec>,
    ceilings: HashMap<SignalFamily, Duration>,
}

impl Default for FusionPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

impl FusionPolicy {
    pub fn new(features: Vec<FeatureSpec>, ceilings: HashMap<SignalFamily, Duration>) -> Self {
        Self { features, ceilings }
    }

    /// Built-in catalog. Sentiment and fundamentals fall back to neutral
    /// defaults; price-level technicals are required.
    pub fn standard() -> Self {
        use FeatureTransform::*;
        use OnMissing::*;
        use SignalFamily::*;

        let field = |f: &str| f.to_string();
        let mut features = vec![
            FeatureSpec::new(Sentiment, "score", Latest { field: field("score") }, Default, 0.0),
            FeatureSpec::new(Sentiment, "score_mean", Mean { field: field("score") }, Default, 0.0),
            FeatureSpec::new(Technical, "momentum", Momentum { field: field("price") }, Fail, 0.0),
            FeatureSpec::new(Technical, "price_zscore", ZScore { field: field("price") }, Fail, 0.0),
            FeatureSpec::new(Technical, "volume_zscore", ZScore { field: field("volume") }, Default, 0.0),
        ];
        for lag in 1..=3 {
            features.push(FeatureSpec::new(
                Technical,
                &format!("return_lag_{}", lag),
                LagReturn { lag },
                Default,
                0.0,
            ));
        }
        features.extend([
            FeatureSpec::new(Fundamental, "pe_ratio", Latest { field: field("pe_ratio") }, Default, 20.0),
            FeatureSpec::new(Fundamental, "eps_growth", Latest { field: field("eps_growth") }, Default, 0.0),
            FeatureSpec::new(
                Fundamental,
                "debt_to_equity",
                Latest { field: field("debt_to_equity") },
                Default,
                1.0,
            ),
        ]);

        let ceilings = HashMap::from([
            (Sentiment, Duration::hours(6)),
            (Technical, Duration::minutes(5)),
            (Fundamental, Duration::days(120)),
        ]);
        Self { features, ceilings }
    }

    /// Apply one rule to every feature of a family.
    pub fn with_family_rule(mut self, family: SignalFamily, on_missing: OnMissing) -> Self {
        for spec in self.features.iter_mut().filter(|s| s.family == family) {
            spec.on_missing = on_missing;
        }
        self
    }

    pub fn with_feature_rule(mut self, name: &str, on_missing: OnMissing) -> Self {
        if let Some(spec) = self.features.iter_mut().find(|s| s.name == name) {
            spec.on_missing = on_missing;
        }
        self
    }

    pub fn with_ceiling(mut self, family: SignalFamily, ceiling: Duration) -> Self {
        self.ceilings.insert(family, ceiling);
        self
    }

    pub fn features(&self) -> &[FeatureSpec] {
        &self.features
    }

    pub fn feature(&self, name: &str) -> Option<&FeatureSpec> {
        self.features.iter().find(|s| s.name == name)
    }

    /// Families referenced by at least one feature.
    pub fn families(&self) -> Vec<SignalFamily> {
        SignalFamily::ALL
            .into_iter()
            .filter(|f| self.features.iter().any(|s| s.family == *f))
            .collect()
    }

    /// Missing ceiling means the family never expires for fusion.
    pub fn ceiling(&self, family: SignalFamily) -> Option<Duration> {
        self.ceilings.get(&family).copied()
    }

    /// Layer overrides from a TOML document onto this policy.
    ///
    /// ```toml
    /// [ceilings]
    /// sentiment = 3600
    ///
    /// [families]
    /// fundamental = "exclude"
    ///
    /// [features]
    /// "sentiment.score" = "fail"
    ///
    /// [defaults]
    /// "fundamental.pe_ratio" = 18.0
    /// ```
    pub fn with_overrides_toml(mut self, content: &str) -> Result<Self> {
        let overrides: PolicyOverrides =
            toml::from_str(content).context("Failed to parse fusion policy TOML")?;
        for (family, secs) in overrides.ceilings {
            let ceiling = i64::try_from(secs)
                .ok()
                .and_then(Duration::try_seconds)
                .with_context(|| {
                    format!("Fusion policy ceiling for {} is out of range: {}", family, secs)
                })?;
            self = self.with_ceiling(family, ceiling);
        }
        for (family, rule) in overrides.families {
            self = self.with_family_rule(family, rule);
        }
        for (name, rule) in overrides.features {
            if self.feature(&name).is_none() {
                anyhow::bail!("Fusion policy references unknown feature: {}", name);
            }
            self = self.with_feature_rule(&name, rule);
        }
        for (name, value) in overrides.defaults {
            match self.features.iter_mut().find(|s| s.name == name) {
                Some(spec) => spec.default = value,
                None => anyhow::bail!("Fusion policy references unknown feature: {}", name),
            }
        }
        Ok(self)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PolicyOverrides {
    ceilings: HashMap<SignalFamily, u64>,
    families: HashMap<SignalFamily, OnMissing>,
    features: HashMap<String, OnMissing>,
    defaults: HashMap<String, f64>,
}
