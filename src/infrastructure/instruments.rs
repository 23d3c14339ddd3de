use crate::domain::ports::InstrumentRegistry;
use crate::domain::signal::InstrumentKey;
use std::collections::HashMap;

/// Registry backed by a fixed instrument list plus an alias table.
///
/// Lookups are case-insensitive; aliases map onto canonical keys.
#[derive(Debug, Clone, Default)]
pub struct StaticInstrumentRegistry {
    lookup: HashMap<String, InstrumentKey>,
    instruments: Vec<InstrumentKey>,
}

impl StaticInstrumentRegistry {
    pub fn new(instruments: Vec<InstrumentKey>, aliases: HashMap<String, InstrumentKey>) -> Self {
        let mut lookup = HashMap::new();
        let mut canonical = Vec::with_capacity(instruments.len());
        for key in instruments {
            let key = InstrumentKey::new(key.as_str().trim().to_uppercase());
            if lookup.insert(key.as_str().to_string(), key.clone()).is_none() {
                canonical.push(key);
            }
        }
        for (alias, target) in aliases {
            let target = target.as_str().trim().to_uppercase();
            if let Some(key) = lookup.get(&target).cloned() {
                lookup.insert(alias.trim().to_uppercase(), key);
            } else {
                tracing::warn!(
                    "StaticInstrumentRegistry: alias {} points at unknown instrument {}",
                    alias,
                    target
                );
            }
        }
        Self {
            lookup,
            instruments: canonical,
        }
    }
}

impl InstrumentRegistry for StaticInstrumentRegistry {
    fn resolve(&self, raw_key: &str) -> Option<InstrumentKey> {
        self.lookup.get(&raw_key.trim().to_uppercase()).cloned()
    }

    fn instruments(&self) -> Vec<InstrumentKey> {
        self.instruments.clone()
    }
}
