//! Fusion policy configuration.
//!
//! The standard feature catalog is the base; `{FAMILY}_ON_MISSING` and
//! `{FAMILY}_CEILING_SECS` adjust whole families, and `FUSION_POLICY_FILE`
//! points at a TOML document applied last.

use super::parse_optional_secs;
use crate::application::fusion::{FusionPolicy, OnMissing};
use crate::domain::signal::SignalFamily;
use anyhow::{Context, Result};
use chrono::Duration;
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone, Default)]
pub struct FusionEnvConfig {
    pub family_rules: HashMap<SignalFamily, OnMissing>,
    pub ceilings: HashMap<SignalFamily, Duration>,
    pub policy_file: Option<PathBuf>,
}

impl FusionEnvConfig {
    pub fn from_env() -> Result<Self> {
        let mut family_rules = HashMap::new();
        let mut ceilings = HashMap::new();
        for family in SignalFamily::ALL {
            let prefix = family.as_str().to_uppercase();
            let key = format!("{}_ON_MISSING", prefix);
            if let Ok(raw) = env::var(&key) {
                let rule = raw
                    .parse::<OnMissing>()
                    .context(format!("Failed to parse {}", key))?;
                family_rules.insert(family, rule);
            }
            if let Some(ceiling) = parse_optional_secs(&format!("{}_CEILING_SECS", prefix))? {
                ceilings.insert(family, ceiling);
            }
        }

        Ok(Self {
            family_rules,
            ceilings,
            policy_file: env::var("FUSION_POLICY_FILE").ok().map(PathBuf::from),
        })
    }

    pub fn build_policy(&self) -> Result<FusionPolicy> {
        let mut policy = FusionPolicy::standard();
        for (family, rule) in &self.family_rules {
            policy = policy.with_family_rule(*family, *rule);
        }
        for (family, ceiling) in &self.ceilings {
            policy = policy.with_ceiling(*family, *ceiling);
        }
        if let Some(path) = &self.policy_file {
            let content = std::fs::read_to_string(path)
                .context(format!("Failed to read fusion policy {}", path.display()))?;
            policy = policy.with_overrides_toml(&content)?;
        }
        Ok(policy)
    }
}
