//! Raw adapter payload -> `SignalEvent`.
//!
//! Pure and stateless: the same raw event always maps to the same signal
//! (or the same error), so redelivery is harmless.

use crate::domain::errors::NormalizationError;
use crate::domain::ports::{InstrumentRegistry, SentimentScorer};
use crate::domain::raw_event::{RawEnvelope, RawEvent};
use crate::domain::signal::{InstrumentKey, SentimentLabel, SignalEvent, SignalValue};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct NormalizerConfig {
    /// How far `observed_at` may run ahead of `received_at`
    pub max_clock_skew: Duration,
    /// Lower-case source/platform name -> reliability in [0, 1]
    pub source_reliability: HashMap<String, f64>,
    pub default_reliability: f64,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        let source_reliability = [
            ("reuters", 0.95),
            ("bloomberg", 0.95),
            ("sec", 1.0),
            ("iex", 1.0),
            ("polygon", 1.0),
            ("reddit", 0.5),
            ("twitter", 0.45),
            ("stocktwits", 0.5),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
        Self {
            max_clock_skew: Duration::seconds(5),
            source_reliability,
            default_reliability: 0.7,
        }
    }
}

impl NormalizerConfig {
    pub fn reliability(&self, source: &str) -> f64 {
        self.source_reliability
            .get(&source.trim().to_lowercase())
            .copied()
            .unwrap_or(self.default_reliability)
    }
}

pub struct SignalNormalizer {
    registry: Arc<dyn InstrumentRegistry>,
    scorer: Arc<dyn SentimentScorer>,
    config: NormalizerConfig,
}

impl SignalNormalizer {
    pub fn new(
        registry: Arc<dyn InstrumentRegistry>,
        scorer: Arc<dyn SentimentScorer>,
        config: NormalizerConfig,
    ) -> Self {
        Self {
            registry,
            scorer,
            config,
        }
    }

    pub fn normalize(&self, envelope: &RawEnvelope) -> Result<SignalEvent, NormalizationError> {
        let received_at = envelope.received_at;
        match &envelope.event {
            RawEvent::NewsArticle {
                id,
                source,
                symbol,
                title,
                content,
                url,
                published_at,
            } => {
                const KIND: &str = "news_article";
                let source = required(KIND, "source", source.as_deref())?;
                let title = required(KIND, "title", title.as_deref())?;
                let observed_at = published_at
                    .ok_or_else(|| NormalizationError::malformed(KIND, "missing published_at"))?;
                let article_id = id
                    .as_deref()
                    .or(url.as_deref())
                    .filter(|s| !s.trim().is_empty())
                    .ok_or_else(|| NormalizationError::malformed(KIND, "missing id and url"))?;
                let instrument = self.resolve(KIND, symbol.as_deref())?;
                self.check_skew(observed_at, received_at)?;

                let body = content.as_deref().unwrap_or("");
                let score = self.scorer.score_article(title, body).clamp(-1.0, 1.0);
                // Headline-only articles carry less information.
                let base_quality = if body.trim().is_empty() { 0.8 } else { 1.0 };

                Ok(SignalEvent::new(
                    instrument,
                    format!("news:{}:{}", source.to_lowercase(), article_id),
                    observed_at,
                    received_at,
                    SignalValue::Sentiment {
                        score,
                        label: SentimentLabel::from_compound(score),
                    },
                    base_quality * self.config.reliability(source),
                ))
            }
            RawEvent::SocialPost {
                id,
                platform,
                symbol,
                content,
                posted_at,
                likes,
                shares,
                comments,
                ..
            } => {
                const KIND: &str = "social_post";
                let post_id = required(KIND, "id", id.as_deref())?;
                let platform = required(KIND, "platform", platform.as_deref())?;
                let content = required(KIND, "content", content.as_deref())?;
                let observed_at =
                    posted_at.ok_or_else(|| NormalizationError::malformed(KIND, "missing posted_at"))?;
                let instrument = self.resolve(KIND, symbol.as_deref())?;
                self.check_skew(observed_at, received_at)?;

                let score = self.scorer.score(content).clamp(-1.0, 1.0);
                let engagement = *likes as f64 + 2.0 * *shares as f64 + *comments as f64;
                let base_quality = 0.4 + 0.6 * (1.0 - (-engagement / 100.0).exp());

                Ok(SignalEvent::new(
                    instrument,
                    format!("social:{}:{}", platform.to_lowercase(), post_id),
                    observed_at,
                    received_at,
                    SignalValue::Sentiment {
                        score,
                        label: SentimentLabel::from_compound(score),
                    },
                    base_quality * self.config.reliability(platform),
                ))
            }
            RawEvent::PriceTick {
                source,
                symbol,
                price,
                volume,
                timestamp,
            } => {
                const KIND: &str = "price_tick";
                let source = required(KIND, "source", source.as_deref())?;
                let observed_at =
                    timestamp.ok_or_else(|| NormalizationError::malformed(KIND, "missing timestamp"))?;
                let price = decimal_to_f64(KIND, "price", price.as_ref())?
                    .ok_or_else(|| NormalizationError::malformed(KIND, "missing price"))?;
                if price <= 0.0 {
                    return Err(NormalizationError::malformed(
                        KIND,
                        format!("non-positive price {}", price),
                    ));
                }
                let volume = decimal_to_f64(KIND, "volume", volume.as_ref())?.unwrap_or(0.0);
                if volume < 0.0 {
                    return Err(NormalizationError::malformed(
                        KIND,
                        format!("negative volume {}", volume),
                    ));
                }
                let instrument = self.resolve(KIND, symbol.as_deref())?;
                self.check_skew(observed_at, received_at)?;

                Ok(SignalEvent::new(
                    instrument.clone(),
                    format!(
                        "tick:{}:{}:{}",
                        source.to_lowercase(),
                        instrument,
                        observed_at.timestamp_micros()
                    ),
                    observed_at,
                    received_at,
                    SignalValue::Technical { price, volume },
                    self.config.reliability(source),
                ))
            }
            RawEvent::FundamentalsRow {
                source,
                symbol,
                as_of,
                pe_ratio,
                eps_growth,
                revenue_growth,
                debt_to_equity,
                profit_margin,
            } => {
                const KIND: &str = "fundamentals_row";
                let source = required(KIND, "source", source.as_deref())?;
                let observed_at =
                    as_of.ok_or_else(|| NormalizationError::malformed(KIND, "missing as_of"))?;

                let candidates = [
                    ("pe_ratio", *pe_ratio),
                    ("eps_growth", *eps_growth),
                    ("revenue_growth", *revenue_growth),
                    ("debt_to_equity", *debt_to_equity),
                    ("profit_margin", *profit_margin),
                ];
                let mut metrics = BTreeMap::new();
                for (name, value) in candidates {
                    if let Some(v) = value {
                        if !v.is_finite() {
                            return Err(NormalizationError::malformed(
                                KIND,
                                format!("non-finite {}", name),
                            ));
                        }
                        metrics.insert(name.to_string(), v);
                    }
                }
                if metrics.is_empty() {
                    return Err(NormalizationError::malformed(KIND, "no metrics present"));
                }
                let instrument = self.resolve(KIND, symbol.as_deref())?;
                self.check_skew(observed_at, received_at)?;

                let coverage = metrics.len() as f64 / candidates.len() as f64;
                Ok(SignalEvent::new(
                    instrument.clone(),
                    format!(
                        "fundamentals:{}:{}:{}",
                        source.to_lowercase(),
                        instrument,
                        observed_at.timestamp()
                    ),
                    observed_at,
                    received_at,
                    SignalValue::Fundamental { metrics },
                    coverage * self.config.reliability(source),
                ))
            }
        }
    }

    fn resolve(
        &self,
        kind: &'static str,
        symbol: Option<&str>,
    ) -> Result<InstrumentKey, NormalizationError> {
        let symbol = required(kind, "symbol", symbol)?;
        self.registry
            .resolve(symbol)
            .ok_or_else(|| NormalizationError::UnknownInstrument {
                key: symbol.to_string(),
            })
    }

    fn check_skew(
        &self,
        observed_at: DateTime<Utc>,
        received_at: DateTime<Utc>,
    ) -> Result<(), NormalizationError> {
        let skew = observed_at - received_at;
        if skew > self.config.max_clock_skew {
            return Err(NormalizationError::ClockSkew {
                observed_at,
                received_at,
                skew_ms: skew.num_milliseconds(),
            });
        }
        Ok(())
    }
}

fn required<'a>(
    kind: &'static str,
    field: &str,
    value: Option<&'a str>,
) -> Result<&'a str, NormalizationError> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| NormalizationError::malformed(kind, format!("missing {}", field)))
}

fn decimal_to_f64(
    kind: &'static str,
    field: &str,
    value: Option<&Decimal>,
) -> Result<Option<f64>, NormalizationError> {
    match value {
        None => Ok(None),
        Some(d) => d
            .to_f64()
            .filter(|v| v.is_finite())
            .map(Some)
            .ok_or_else(|| NormalizationError::malformed(kind, format!("unrepresentable {}", field))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::signal::SignalFamily;
    use crate::infrastructure::instruments::StaticInstrumentRegistry;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    struct FixedScorer(f64);

    impl SentimentScorer for FixedScorer {
        fn score(&self, _text: &str) -> f64 {
            self.0
        }
    }

    fn normalizer() -> SignalNormalizer {
        let registry = StaticInstrumentRegistry::new(
            vec![InstrumentKey::from("AAPL"), InstrumentKey::from("MSFT")],
            HashMap::from([("APPLE".to_string(), InstrumentKey::from("AAPL"))]),
        );
        SignalNormalizer::new(
            Arc::new(registry),
            Arc::new(FixedScorer(0.6)),
            NormalizerConfig::default(),
        )
    }

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_772_460_000 + secs, 0).unwrap()
    }

    fn tick(symbol: &str, observed: i64, received: i64) -> RawEnvelope {
        RawEnvelope::new(
            t(received),
            RawEvent::PriceTick {
                source: Some("iex".to_string()),
                symbol: Some(symbol.to_string()),
                price: Some(dec!(187.25)),
                volume: Some(dec!(1500)),
                timestamp: Some(t(observed)),
            },
        )
    }

    #[test]
    fn test_price_tick_normalizes() {
        let event = normalizer().normalize(&tick("aapl", 0, 1)).unwrap();
        assert_eq!(event.instrument_key().as_str(), "AAPL");
        assert_eq!(event.family(), SignalFamily::Technical);
        assert_eq!(event.value().field("price"), Some(187.25));
        assert_eq!(event.quality(), 1.0);
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let n = normalizer();
        let raw = tick("AAPL", 0, 1);
        assert_eq!(n.normalize(&raw).unwrap(), n.normalize(&raw).unwrap());
    }

    #[test]
    fn test_unknown_instrument() {
        let err = normalizer().normalize(&tick("ZZZZ", 0, 1)).unwrap_err();
        assert_eq!(
            err,
            NormalizationError::UnknownInstrument {
                key: "ZZZZ".to_string()
            }
        );
    }

    #[test]
    fn test_alias_resolution() {
        let event = normalizer().normalize(&tick("apple", 0, 1)).unwrap();
        assert_eq!(event.instrument_key().as_str(), "AAPL");
    }

    #[test]
    fn test_clock_skew_rejected() {
        // observed 10s after received, tolerance is 5s
        let err = normalizer().normalize(&tick("AAPL", 10, 0)).unwrap_err();
        assert!(matches!(err, NormalizationError::ClockSkew { skew_ms: 10_000, .. }));
        // exactly at the tolerance is accepted
        assert!(normalizer().normalize(&tick("AAPL", 5, 0)).is_ok());
    }

    #[test]
    fn test_news_requires_title() {
        let raw = RawEnvelope::new(
            t(1),
            RawEvent::NewsArticle {
                id: Some("n1".to_string()),
                source: Some("reuters".to_string()),
                symbol: Some("AAPL".to_string()),
                title: None,
                content: None,
                url: None,
                published_at: Some(t(0)),
            },
        );
        let err = normalizer().normalize(&raw).unwrap_err();
        assert_eq!(err.reason_label(), "malformed_payload");
    }

    #[test]
    fn test_news_sentiment_and_quality() {
        let raw = RawEnvelope::new(
            t(1),
            RawEvent::NewsArticle {
                id: None,
                source: Some("Reuters".to_string()),
                symbol: Some("MSFT".to_string()),
                title: Some("Microsoft beats estimates".to_string()),
                content: None,
                url: Some("https://example.com/a".to_string()),
                published_at: Some(t(0)),
            },
        );
        let event = normalizer().normalize(&raw).unwrap();
        assert_eq!(event.family(), SignalFamily::Sentiment);
        assert_eq!(event.value().field("score"), Some(0.6));
        assert!((event.quality() - 0.8 * 0.95).abs() < 1e-12);
        assert_eq!(event.source_id(), "news:reuters:https://example.com/a");
    }

    #[test]
    fn test_social_engagement_raises_quality() {
        let post = |likes: u64| {
            RawEnvelope::new(
                t(1),
                RawEvent::SocialPost {
                    id: Some(format!("p{}", likes)),
                    platform: Some("reddit".to_string()),
                    symbol: Some("AAPL".to_string()),
                    content: Some("AAPL to the moon".to_string()),
                    author: None,
                    posted_at: Some(t(0)),
                    likes,
                    shares: 0,
                    comments: 0,
                },
            )
        };
        let n = normalizer();
        let quiet = n.normalize(&post(0)).unwrap();
        let viral = n.normalize(&post(1000)).unwrap();
        assert!(viral.quality() > quiet.quality());
        assert!(viral.quality() <= 0.5);
    }

    #[test]
    fn test_extreme_engagement_counts() {
        let n = normalizer();
        let post = RawEnvelope::new(
            t(1),
            RawEvent::SocialPost {
                id: Some("huge".to_string()),
                platform: Some("reddit".to_string()),
                symbol: Some("AAPL".to_string()),
                content: Some("AAPL".to_string()),
                author: None,
                posted_at: Some(t(0)),
                likes: u64::MAX,
                shares: u64::MAX,
                comments: u64::MAX,
            },
        );
        let event = n.normalize(&post).unwrap();
        assert!(event.quality().is_finite());
        assert!((0.0..=1.0).contains(&event.quality()));
    }

    #[test]
    fn test_fundamentals_partial_row() {
        let raw = RawEnvelope::new(
            t(1),
            RawEvent::FundamentalsRow {
                source: Some("sec".to_string()),
                symbol: Some("AAPL".to_string()),
                as_of: Some(t(0)),
                pe_ratio: Some(28.5),
                eps_growth: Some(0.12),
                revenue_growth: None,
                debt_to_equity: None,
                profit_margin: None,
            },
        );
        let event = normalizer().normalize(&raw).unwrap();
        assert_eq!(event.value().field("pe_ratio"), Some(28.5));
        assert!((event.quality() - 0.4).abs() < 1e-12);

        let empty = RawEnvelope::new(
            t(1),
            RawEvent::FundamentalsRow {
                source: Some("sec".to_string()),
                symbol: Some("AAPL".to_string()),
                as_of: Some(t(0)),
                pe_ratio: None,
                eps_growth: None,
                revenue_growth: None,
                debt_to_equity: None,
                profit_margin: None,
            },
        );
        assert!(normalizer().normalize(&empty).is_err());
    }

    #[test]
    fn test_non_positive_price_rejected() {
        let raw = RawEnvelope::new(
            t(1),
            RawEvent::PriceTick {
                source: Some("iex".to_string()),
                symbol: Some("AAPL".to_string()),
                price: Some(dec!(0)),
                volume: None,
                timestamp: Some(t(0)),
            },
        );
        assert!(normalizer().normalize(&raw).is_err());
    }
}
