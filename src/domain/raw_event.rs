//! Raw payloads handed over by ingestion adapters.
//!
//! Adapters deliver at-least-once, so every field that the normalizer needs is
//! optional here and validated there.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RawEvent {
    NewsArticle {
        id: Option<String>,
        source: Option<String>,
        symbol: Option<String>,
        title: Option<String>,
        #[serde(default)]
        content: Option<String>,
        #[serde(default)]
        url: Option<String>,
        published_at: Option<DateTime<Utc>>,
    },
    SocialPost {
        id: Option<String>,
        platform: Option<String>,
        symbol: Option<String>,
        content: Option<String>,
        #[serde(default)]
        author: Option<String>,
        posted_at: Option<DateTime<Utc>>,
        #[serde(default)]
        likes: u64,
        #[serde(default)]
        shares: u64,
        #[serde(default)]
        comments: u64,
    },
    PriceTick {
        source: Option<String>,
        symbol: Option<String>,
        price: Option<Decimal>,
        volume: Option<Decimal>,
        timestamp: Option<DateTime<Utc>>,
    },
    FundamentalsRow {
        source: Option<String>,
        symbol: Option<String>,
        as_of: Option<DateTime<Utc>>,
        #[serde(default)]
        pe_ratio: Option<f64>,
        #[serde(default)]
        eps_growth: Option<f64>,
        #[serde(default)]
        revenue_growth: Option<f64>,
        #[serde(default)]
        debt_to_equity: Option<f64>,
        #[serde(default)]
        profit_margin: Option<f64>,
    },
}

impl RawEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NewsArticle { .. } => "news_article",
            Self::SocialPost { .. } => "social_post",
            Self::PriceTick { .. } => "price_tick",
            Self::FundamentalsRow { .. } => "fundamentals_row",
        }
    }
}

/// A raw event plus the ingest timestamp stamped by the adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEnvelope {
    pub received_at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: RawEvent,
}

impl RawEnvelope {
    pub fn new(received_at: DateTime<Utc>, event: RawEvent) -> Self {
        Self { received_at, event }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_parses_ndjson_line() {
        let line = r#"{"received_at":"2026-03-02T14:30:00Z","kind":"price_tick","source":"iex","symbol":"msft","price":"412.50","volume":"1200","timestamp":"2026-03-02T14:29:59Z"}"#;
        let envelope: RawEnvelope = serde_json::from_str(line).unwrap();
        assert_eq!(envelope.event.kind(), "price_tick");
        match envelope.event {
            RawEvent::PriceTick { symbol, price, .. } => {
                assert_eq!(symbol.as_deref(), Some("msft"));
                assert_eq!(price, Some(Decimal::new(41250, 2)));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
