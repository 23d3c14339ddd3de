//! Snapshot export configuration.

use super::{parse_bool, parse_or};
use anyhow::Result;
use std::env;

#[derive(Debug, Clone)]
pub struct PersistenceEnvConfig {
    /// Export is disabled when unset
    pub database_url: Option<String>,
    pub export_interval_secs: u64,
    pub export_queue_capacity: usize,
    /// Keep exported records in memory when no database is configured
    pub in_memory_fallback: bool,
}

impl Default for PersistenceEnvConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            export_interval_secs: 60,
            export_queue_capacity: 1024,
            in_memory_fallback: false,
        }
    }
}

impl PersistenceEnvConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            database_url: env::var("DATABASE_URL").ok().filter(|s| !s.trim().is_empty()),
            export_interval_secs: parse_or("EXPORT_INTERVAL_SECS", defaults.export_interval_secs)?
                .max(1),
            export_queue_capacity: parse_or("EXPORT_QUEUE_CAPACITY", defaults.export_queue_capacity)?
                .max(1),
            in_memory_fallback: parse_bool("EXPORT_IN_MEMORY", defaults.in_memory_fallback),
        })
    }
}
