//! Configuration module for finsight.
//!
//! Structured configuration loaded from environment variables, organized by
//! concern: ingestion, cache, fusion, ensemble, broadcast, observability and
//! persistence.

mod broadcast_config;
mod cache_config;
mod ensemble_config;
mod fusion_config;
mod ingestion_config;
mod observability_config;
mod persistence_config;

pub use broadcast_config::BroadcastEnvConfig;
pub use cache_config::CacheEnvConfig;
pub use ensemble_config::EnsembleEnvConfig;
pub use fusion_config::FusionEnvConfig;
pub use ingestion_config::IngestionEnvConfig;
pub use observability_config::ObservabilityEnvConfig;
pub use persistence_config::PersistenceEnvConfig;

use anyhow::{Context, Result};
use chrono::Duration;
use std::collections::HashMap;
use std::env;
use std::str::FromStr;

/// Main application configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub ingestion: IngestionEnvConfig,
    pub cache: CacheEnvConfig,
    pub fusion: FusionEnvConfig,
    pub ensemble: EnsembleEnvConfig,
    pub broadcast: BroadcastEnvConfig,
    pub observability: ObservabilityEnvConfig,
    pub persistence: PersistenceEnvConfig,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            ingestion: IngestionEnvConfig::from_env().context("Failed to load ingestion config")?,
            cache: CacheEnvConfig::from_env().context("Failed to load cache config")?,
            fusion: FusionEnvConfig::from_env().context("Failed to load fusion config")?,
            ensemble: EnsembleEnvConfig::from_env().context("Failed to load ensemble config")?,
            broadcast: BroadcastEnvConfig::from_env().context("Failed to load broadcast config")?,
            observability: ObservabilityEnvConfig::from_env()
                .context("Failed to load observability config")?,
            persistence: PersistenceEnvConfig::from_env()
                .context("Failed to load persistence config")?,
        })
    }
}

fn parse_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .context(format!("Failed to parse {}", key)),
        Err(_) => Ok(default),
    }
}

fn parse_optional<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .context(format!("Failed to parse {}", key)),
        _ => Ok(None),
    }
}

/// Whole seconds as a `chrono::Duration`. Negative and out-of-range values
/// are rejected.
fn parse_secs(key: &str, default: Duration) -> Result<Duration> {
    let secs: u64 = parse_or(key, default.num_seconds().max(0).unsigned_abs())?;
    seconds(secs).with_context(|| format!("{} is out of range: {}", key, secs))
}

fn parse_optional_secs(key: &str) -> Result<Option<Duration>> {
    match parse_optional::<u64>(key)? {
        Some(secs) => seconds(secs)
            .map(Some)
            .with_context(|| format!("{} is out of range: {}", key, secs)),
        None => Ok(None),
    }
}

fn seconds(secs: u64) -> Option<Duration> {
    i64::try_from(secs).ok().and_then(Duration::try_seconds)
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse::<bool>()
        .unwrap_or(default)
}

/// Comma-separated list; blank entries are skipped.
fn parse_list(key: &str) -> Option<Vec<String>> {
    env::var(key).ok().map(|raw| {
        raw.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    })
}

/// `key=value,key=value` pairs.
fn parse_pairs(key: &str) -> Result<HashMap<String, String>> {
    let Some(entries) = parse_list(key) else {
        return Ok(HashMap::new());
    };
    entries
        .into_iter()
        .map(|entry| {
            let (k, v) = entry
                .split_once('=')
                .with_context(|| format!("Failed to parse {}: '{}' is not key=value", key, entry))?;
            Ok((k.trim().to_string(), v.trim().to_string()))
        })
        .collect()
}
