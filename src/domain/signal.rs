use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Canonical instrument identifier (upper-case ticker) as resolved by the
/// instrument registry.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstrumentKey(String);

impl InstrumentKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstrumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InstrumentKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Class of input data with its own cadence and staleness semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalFamily {
    Sentiment,
    Fundamental,
    Technical,
}

impl SignalFamily {
    pub const ALL: [SignalFamily; 3] = [
        SignalFamily::Sentiment,
        SignalFamily::Fundamental,
        SignalFamily::Technical,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sentiment => "sentiment",
            Self::Fundamental => "fundamental",
            Self::Technical => "technical",
        }
    }

    /// Field tracked in the window history (used for lagged returns).
    pub fn primary_field(&self) -> &'static str {
        match self {
            Self::Sentiment => "score",
            Self::Fundamental => "pe_ratio",
            Self::Technical => "price",
        }
    }
}

impl fmt::Display for SignalFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignalFamily {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "sentiment" => Ok(Self::Sentiment),
            "fundamental" | "fundamentals" => Ok(Self::Fundamental),
            "technical" => Ok(Self::Technical),
            _ => anyhow::bail!(
                "Invalid signal family: {}. Must be 'sentiment', 'fundamental' or 'technical'",
                s
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SentimentLabel {
    Positive,
    Negative,
    Neutral,
}

impl SentimentLabel {
    pub fn from_compound(compound: f64) -> Self {
        if compound >= 0.05 {
            Self::Positive
        } else if compound <= -0.05 {
            Self::Negative
        } else {
            Self::Neutral
        }
    }
}

/// Family-typed payload of a normalized signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum SignalValue {
    Sentiment { score: f64, label: SentimentLabel },
    Technical { price: f64, volume: f64 },
    Fundamental { metrics: BTreeMap<String, f64> },
}

impl SignalValue {
    pub fn family(&self) -> SignalFamily {
        match self {
            Self::Sentiment { .. } => SignalFamily::Sentiment,
            Self::Technical { .. } => SignalFamily::Technical,
            Self::Fundamental { .. } => SignalFamily::Fundamental,
        }
    }

    /// Numeric fields carried by the payload.
    pub fn fields(&self) -> Vec<(&str, f64)> {
        match self {
            Self::Sentiment { score, .. } => vec![("score", *score)],
            Self::Technical { price, volume } => vec![("price", *price), ("volume", *volume)],
            Self::Fundamental { metrics } => {
                metrics.iter().map(|(k, v)| (k.as_str(), *v)).collect()
            }
        }
    }

    pub fn field(&self, name: &str) -> Option<f64> {
        match self {
            Self::Sentiment { score, .. } => (name == "score").then_some(*score),
            Self::Technical { price, volume } => match name {
                "price" => Some(*price),
                "volume" => Some(*volume),
                _ => None,
            },
            Self::Fundamental { metrics } => metrics.get(name).copied(),
        }
    }

    pub fn is_finite(&self) -> bool {
        self.fields().iter().all(|(_, v)| v.is_finite())
    }
}

/// A normalized, immutable signal observation.
///
/// Ordering within a family is by `observed_at`; `received_at` is the ingest
/// time stamped by the adapter and is used to bound out-of-order arrival.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalEvent {
    instrument_key: InstrumentKey,
    family: SignalFamily,
    source_id: String,
    observed_at: DateTime<Utc>,
    received_at: DateTime<Utc>,
    value: SignalValue,
    quality: f64,
}

impl SignalEvent {
    pub fn new(
        instrument_key: InstrumentKey,
        source_id: impl Into<String>,
        observed_at: DateTime<Utc>,
        received_at: DateTime<Utc>,
        value: SignalValue,
        quality: f64,
    ) -> Self {
        Self {
            instrument_key,
            family: value.family(),
            source_id: source_id.into(),
            observed_at,
            received_at,
            value,
            quality: clamp_unit(quality),
        }
    }

    pub fn instrument_key(&self) -> &InstrumentKey {
        &self.instrument_key
    }

    pub fn family(&self) -> SignalFamily {
        self.family
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn observed_at(&self) -> DateTime<Utc> {
        self.observed_at
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    pub fn value(&self) -> &SignalValue {
        &self.value
    }

    pub fn quality(&self) -> f64 {
        self.quality
    }
}

/// Clamp to [0, 1]; NaN maps to 0.
pub fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_family_from_str() {
        assert_eq!("Sentiment".parse::<SignalFamily>().unwrap(), SignalFamily::Sentiment);
        assert_eq!(
            "fundamentals".parse::<SignalFamily>().unwrap(),
            SignalFamily::Fundamental
        );
        assert!("weather".parse::<SignalFamily>().is_err());
    }

    #[test]
    fn test_sentiment_label_thresholds() {
        assert_eq!(SentimentLabel::from_compound(0.05), SentimentLabel::Positive);
        assert_eq!(SentimentLabel::from_compound(-0.05), SentimentLabel::Negative);
        assert_eq!(SentimentLabel::from_compound(0.01), SentimentLabel::Neutral);
    }

    #[test]
    fn test_event_clamps_quality() {
        let now = Utc::now();
        let event = SignalEvent::new(
            InstrumentKey::from("AAPL"),
            "tick-1",
            now,
            now,
            SignalValue::Technical {
                price: 10.0,
                volume: 5.0,
            },
            1.7,
        );
        assert_eq!(event.quality(), 1.0);
        assert_eq!(event.family(), SignalFamily::Technical);

        let nan = SignalEvent::new(
            InstrumentKey::from("AAPL"),
            "tick-2",
            now,
            now,
            SignalValue::Technical {
                price: 10.0,
                volume: 5.0,
            },
            f64::NAN,
        );
        assert_eq!(nan.quality(), 0.0);
    }

    #[test]
    fn test_fundamental_fields() {
        let value = SignalValue::Fundamental {
            metrics: BTreeMap::from([
                ("pe_ratio".to_string(), 21.5),
                ("eps_growth".to_string(), 0.12),
            ]),
        };
        assert_eq!(value.field("pe_ratio"), Some(21.5));
        assert_eq!(value.field("debt_to_equity"), None);
        assert_eq!(value.fields().len(), 2);
    }
}
