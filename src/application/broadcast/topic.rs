use crate::domain::prediction::{Explanation, Prediction};
use crate::domain::signal::{InstrumentKey, SignalFamily, SignalValue};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

/// Named stream: `predictions/{instrument}`, `explanations/{instrument}` or
/// `signals/{instrument}/{family}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Topic(String);

impl Topic {
    pub fn predictions(instrument: &InstrumentKey) -> Self {
        Self(format!("predictions/{}", instrument))
    }

    pub fn explanations(instrument: &InstrumentKey) -> Self {
        Self(format!("explanations/{}", instrument))
    }

    pub fn signals(instrument: &InstrumentKey, family: SignalFamily) -> Self {
        Self(format!("signals/{}/{}", instrument, family))
    }

    /// Parse a client-supplied topic name.
    pub fn parse(name: &str) -> Option<Self> {
        let parts: Vec<&str> = name.trim().split('/').collect();
        match parts.as_slice() {
            ["predictions", inst] | ["explanations", inst] if !inst.is_empty() => {
                Some(Self(format!("{}/{}", parts[0], inst.to_uppercase())))
            }
            ["signals", inst, family] if !inst.is_empty() => {
                let family: SignalFamily = family.parse().ok()?;
                Some(Self::signals(&InstrumentKey::new(inst.to_uppercase()), family))
            }
            _ => None,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First path segment, used as a metrics label.
    pub fn kind(&self) -> &str {
        self.0.split('/').next().unwrap_or("")
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SignalUpdate {
    pub instrument_key: InstrumentKey,
    pub family: SignalFamily,
    pub value: SignalValue,
    pub observed_at: DateTime<Utc>,
    pub quality: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum BroadcastPayload {
    Prediction(Prediction),
    Explanation(Explanation),
    Signal(SignalUpdate),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_names() {
        let key = InstrumentKey::from("AAPL");
        assert_eq!(Topic::predictions(&key).as_str(), "predictions/AAPL");
        assert_eq!(
            Topic::signals(&key, SignalFamily::Technical).as_str(),
            "signals/AAPL/technical"
        );
        assert_eq!(Topic::explanations(&key).kind(), "explanations");
    }

    #[test]
    fn test_topic_parse() {
        assert_eq!(
            Topic::parse("predictions/aapl"),
            Some(Topic::predictions(&InstrumentKey::from("AAPL")))
        );
        assert_eq!(
            Topic::parse("signals/msft/Sentiment"),
            Some(Topic::signals(&InstrumentKey::from("MSFT"), SignalFamily::Sentiment))
        );
        assert_eq!(Topic::parse("signals/msft/weather"), None);
        assert_eq!(Topic::parse("orders/AAPL"), None);
        assert_eq!(Topic::parse("predictions/"), None);
    }
}
