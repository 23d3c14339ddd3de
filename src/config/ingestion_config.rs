//! Ingestion configuration: known instruments, aliases, clock-skew bound and
//! source reliability.

use super::{parse_list, parse_or, parse_pairs};
use crate::application::ingestion::NormalizerConfig;
use crate::domain::signal::InstrumentKey;
use crate::infrastructure::instruments::StaticInstrumentRegistry;
use anyhow::{Context, Result};
use chrono::Duration;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct IngestionEnvConfig {
    pub instruments: Vec<String>,
    /// alias -> canonical symbol
    pub aliases: HashMap<String, String>,
    pub max_clock_skew_ms: i64,
    /// Overrides merged over the built-in reliability table
    pub source_reliability: HashMap<String, f64>,
    pub default_reliability: f64,
    pub queue_capacity: usize,
    pub concurrency: usize,
}

impl Default for IngestionEnvConfig {
    fn default() -> Self {
        Self {
            instruments: ["AAPL", "MSFT", "GOOGL", "AMZN", "NVDA", "TSLA"]
                .into_iter()
                .map(String::from)
                .collect(),
            aliases: HashMap::from([("GOOG".to_string(), "GOOGL".to_string())]),
            max_clock_skew_ms: 5_000,
            source_reliability: HashMap::new(),
            default_reliability: 0.7,
            queue_capacity: 1024,
            concurrency: 8,
        }
    }
}

impl IngestionEnvConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let source_reliability = parse_pairs("SOURCE_RELIABILITY")?
            .into_iter()
            .map(|(source, value)| {
                let reliability = value
                    .parse::<f64>()
                    .context(format!("Failed to parse SOURCE_RELIABILITY for {}", source))?;
                Ok((source.to_lowercase(), reliability))
            })
            .collect::<Result<HashMap<_, _>>>()?;

        let aliases = if std::env::var("INSTRUMENT_ALIASES").is_ok() {
            parse_pairs("INSTRUMENT_ALIASES")?
        } else {
            defaults.aliases
        };

        let max_clock_skew_ms = parse_or("MAX_CLOCK_SKEW_MS", defaults.max_clock_skew_ms)?;
        if max_clock_skew_ms < 0 {
            anyhow::bail!("MAX_CLOCK_SKEW_MS must not be negative");
        }

        Ok(Self {
            instruments: parse_list("INSTRUMENTS").unwrap_or(defaults.instruments),
            aliases,
            max_clock_skew_ms,
            source_reliability,
            default_reliability: parse_or("DEFAULT_SOURCE_RELIABILITY", defaults.default_reliability)?,
            queue_capacity: parse_or("INGEST_QUEUE_CAPACITY", defaults.queue_capacity)?,
            concurrency: parse_or("INGEST_CONCURRENCY", defaults.concurrency)?,
        })
    }

    pub fn registry(&self) -> StaticInstrumentRegistry {
        let aliases = self
            .aliases
            .iter()
            .map(|(alias, target)| (alias.clone(), InstrumentKey::new(target.clone())))
            .collect();
        StaticInstrumentRegistry::new(
            self.instruments.iter().cloned().map(InstrumentKey::new).collect(),
            aliases,
        )
    }

    pub fn normalizer_config(&self) -> NormalizerConfig {
        let mut config = NormalizerConfig {
            max_clock_skew: Duration::milliseconds(self.max_clock_skew_ms),
            default_reliability: self.default_reliability,
            ..NormalizerConfig::default()
        };
        config
            .source_reliability
            .extend(self.source_reliability.iter().map(|(k, v)| (k.clone(), *v)));
        config
    }
}
