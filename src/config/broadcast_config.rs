//! Broadcast and prediction-trigger configuration.

use super::{parse_list, parse_optional, parse_or};
use crate::application::broadcast::BroadcastConfig;
use crate::application::system::scheduler::SchedulerConfig;
use crate::domain::signal::SignalFamily;
use anyhow::{Context, Result};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct BroadcastEnvConfig {
    pub queue_capacity: usize,
    /// Families whose latest-value updates trigger a prediction
    pub trigger_families: Vec<SignalFamily>,
    pub debounce_ms: u64,
    /// Periodic re-prediction of every known instrument
    pub refresh_secs: Option<u64>,
}

impl Default for BroadcastEnvConfig {
    fn default() -> Self {
        Self {
            queue_capacity: BroadcastConfig::default().queue_capacity,
            trigger_families: vec![SignalFamily::Technical],
            debounce_ms: 250,
            refresh_secs: None,
        }
    }
}

impl BroadcastEnvConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let queue_capacity = parse_or("BROADCAST_QUEUE_CAPACITY", defaults.queue_capacity)?;
        if queue_capacity == 0 {
            anyhow::bail!("BROADCAST_QUEUE_CAPACITY must be at least 1");
        }
        let trigger_families = match parse_list("PREDICTION_TRIGGER_FAMILIES") {
            Some(names) => names
                .iter()
                .map(|name| {
                    name.parse::<SignalFamily>()
                        .context("Failed to parse PREDICTION_TRIGGER_FAMILIES")
                })
                .collect::<Result<Vec<_>>>()?,
            None => defaults.trigger_families,
        };

        Ok(Self {
            queue_capacity,
            trigger_families,
            debounce_ms: parse_or("PREDICTION_DEBOUNCE_MS", defaults.debounce_ms)?,
            refresh_secs: parse_optional("PREDICTION_REFRESH_SECS")?,
        })
    }

    pub fn broadcast_config(&self) -> BroadcastConfig {
        BroadcastConfig {
            queue_capacity: self.queue_capacity,
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            debounce: Duration::from_millis(self.debounce_ms),
            always: Vec::new(),
            refresh_interval: self.refresh_secs.filter(|s| *s > 0).map(Duration::from_secs),
        }
    }
}
