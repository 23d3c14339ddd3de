//! Feature cache configuration: per-family staleness thresholds and EWMA
//! spans, history length, eviction and lock budgets.

use super::{parse_or, parse_secs};
use crate::application::market_data::CacheConfig;
use crate::domain::signal::SignalFamily;
use anyhow::Result;

#[derive(Debug, Clone)]
pub struct CacheEnvConfig {
    pub cache: CacheConfig,
    pub sweep_interval_secs: u64,
}

impl Default for CacheEnvConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            sweep_interval_secs: 300,
        }
    }
}

impl CacheEnvConfig {
    pub fn from_env() -> Result<Self> {
        let mut cache = CacheConfig::default();

        // SENTIMENT_STALENESS_SECS, TECHNICAL_SPAN, ...
        for family in SignalFamily::ALL {
            let prefix = family.as_str().to_uppercase();
            let window = cache.family_mut(family);
            window.staleness_threshold =
                parse_secs(&format!("{}_STALENESS_SECS", prefix), window.staleness_threshold)?;
            window.span = parse_or(&format!("{}_SPAN", prefix), window.span)?;
        }

        cache.history_len = parse_or("CACHE_HISTORY_LEN", cache.history_len)?;
        cache.dedup_capacity = parse_or("CACHE_DEDUP_CAPACITY", cache.dedup_capacity)?;
        cache.eviction_ttl = parse_secs("CACHE_EVICTION_TTL_SECS", cache.eviction_ttl)?;
        cache.lock_timeout = std::time::Duration::from_millis(parse_or(
            "CACHE_LOCK_TIMEOUT_MS",
            cache.lock_timeout.as_millis() as u64,
        )?);
        cache.max_attempts = parse_or("CACHE_MAX_ATTEMPTS", cache.max_attempts)?;

        if cache.max_attempts == 0 {
            anyhow::bail!("CACHE_MAX_ATTEMPTS must be at least 1");
        }

        Ok(Self {
            cache,
            sweep_interval_secs: parse_or("CACHE_SWEEP_INTERVAL_SECS", 300)?,
        })
    }
}
