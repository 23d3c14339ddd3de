use crate::domain::signal::InstrumentKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// Content-derived identifier of a feature vector (hex SHA-256).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureVectorId(String);

impl FeatureVectorId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FeatureVectorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Point-in-time feature assembly for one instrument.
///
/// Never mutated after creation: fields are private and the id is derived
/// from the content, so a prediction's `feature_vector_ref` pins the exact
/// inputs an explanation must reuse.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureVector {
    id: FeatureVectorId,
    instrument_key: InstrumentKey,
    decision_time: DateTime<Utc>,
    features: BTreeMap<String, f64>,
    provenance: BTreeMap<String, DateTime<Utc>>,
    degraded: bool,
    defaulted: Vec<String>,
    excluded: Vec<String>,
    stale: Vec<String>,
}

impl FeatureVector {
    pub fn new(
        instrument_key: InstrumentKey,
        decision_time: DateTime<Utc>,
        features: BTreeMap<String, f64>,
        provenance: BTreeMap<String, DateTime<Utc>>,
    ) -> Self {
        Self::with_fallbacks(
            instrument_key,
            decision_time,
            features,
            provenance,
            Vec::new(),
            Vec::new(),
            Vec::new(),
        )
    }

    /// Build a vector carrying the fallback audit trail. `degraded` is set
    /// whenever a feature was defaulted or excluded.
    pub fn with_fallbacks(
        instrument_key: InstrumentKey,
        decision_time: DateTime<Utc>,
        features: BTreeMap<String, f64>,
        provenance: BTreeMap<String, DateTime<Utc>>,
        defaulted: Vec<String>,
        excluded: Vec<String>,
        stale: Vec<String>,
    ) -> Self {
        let degraded = !defaulted.is_empty() || !excluded.is_empty();
        let id = Self::compute_id(&instrument_key, decision_time, &features, &provenance, degraded);
        Self {
            id,
            instrument_key,
            decision_time,
            features,
            provenance,
            degraded,
            defaulted,
            excluded,
            stale,
        }
    }

    fn compute_id(
        instrument_key: &InstrumentKey,
        decision_time: DateTime<Utc>,
        features: &BTreeMap<String, f64>,
        provenance: &BTreeMap<String, DateTime<Utc>>,
        degraded: bool,
    ) -> FeatureVectorId {
        let mut hasher = Sha256::new();
        hasher.update(instrument_key.as_str().as_bytes());
        hasher.update(decision_time.to_rfc3339().as_bytes());
        for (name, value) in features {
            hasher.update(name.as_bytes());
            hasher.update(value.to_bits().to_le_bytes());
        }
        for (name, ts) in provenance {
            hasher.update(name.as_bytes());
            hasher.update(ts.timestamp_micros().to_le_bytes());
        }
        hasher.update([degraded as u8]);
        FeatureVectorId(hex::encode(hasher.finalize()))
    }

    pub fn id(&self) -> &FeatureVectorId {
        &self.id
    }

    pub fn instrument_key(&self) -> &InstrumentKey {
        &self.instrument_key
    }

    pub fn decision_time(&self) -> DateTime<Utc> {
        self.decision_time
    }

    pub fn features(&self) -> &BTreeMap<String, f64> {
        &self.features
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.features.get(name).copied()
    }

    pub fn provenance(&self) -> &BTreeMap<String, DateTime<Utc>> {
        &self.provenance
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn defaulted(&self) -> &[String] {
        &self.defaulted
    }

    pub fn excluded(&self) -> &[String] {
        &self.excluded
    }

    pub fn stale(&self) -> &[String] {
        &self.stale
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }
}
