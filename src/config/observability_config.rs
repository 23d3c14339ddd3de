//! Metrics reporting configuration.

use super::{parse_bool, parse_or};
use anyhow::Result;

#[derive(Debug, Clone)]
pub struct ObservabilityEnvConfig {
    /// Push `METRICS_JSON:` snapshots to stdout
    pub enabled: bool,
    /// Seconds between reports
    pub interval_secs: u64,
}

impl Default for ObservabilityEnvConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 60,
        }
    }
}

impl ObservabilityEnvConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let interval_secs = parse_or("OBSERVABILITY_INTERVAL", defaults.interval_secs)?;
        if interval_secs == 0 {
            anyhow::bail!("OBSERVABILITY_INTERVAL must be at least 1 second");
        }
        Ok(Self {
            enabled: parse_bool("OBSERVABILITY_ENABLED", defaults.enabled),
            interval_secs,
        })
    }
}
