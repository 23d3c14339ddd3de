use crate::application::fusion::policy::{FusionPolicy, OnMissing};
use crate::application::market_data::FeatureCache;
use crate::application::system::cancel::CancelSignal;
use crate::domain::errors::FusionError;
use crate::domain::features::FeatureVector;
use crate::domain::signal::{InstrumentKey, SignalFamily};
use crate::domain::window::WindowSnapshot;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

/// Assembles point-in-time feature vectors from the cache.
///
/// Read-only with respect to the cache. Cheap to clone; clones share the
/// cache and differ only in policy.
#[derive(Debug, Clone)]
pub struct FusionEngine {
    cache: Arc<FeatureCache>,
    policy: Arc<FusionPolicy>,
}

impl FusionEngine {
    pub fn new(cache: Arc<FeatureCache>, policy: FusionPolicy) -> Self {
        Self {
            cache,
            policy: Arc::new(policy),
        }
    }

    /// Same cache, different missing-data policy.
    pub fn with_policy(&self, policy: FusionPolicy) -> Self {
        Self {
            cache: self.cache.clone(),
            policy: Arc::new(policy),
        }
    }

    pub fn policy(&self) -> &FusionPolicy {
        &self.policy
    }

    pub async fn assemble(
        &self,
        instrument: &InstrumentKey,
        decision_time: DateTime<Utc>,
    ) -> Result<FeatureVector, FusionError> {
        // One consistent snapshot per family; every feature of a family
        // reads the same copy.
        let mut snapshots: HashMap<SignalFamily, Option<WindowSnapshot>> = HashMap::new();
        for family in self.policy.families() {
            let snapshot = self
                .cache
                .read(instrument, family, decision_time)
                .await?
                .filter(|s| self.usable_at(instrument, family, s));
            snapshots.insert(family, snapshot);
        }

        let mut features = BTreeMap::new();
        let mut provenance = BTreeMap::new();
        let mut defaulted = Vec::new();
        let mut excluded = Vec::new();
        let mut stale = Vec::new();
        let mut failing = Vec::new();

        for spec in self.policy.features() {
            let snapshot = snapshots.get(&spec.family).and_then(Option::as_ref);
            let value = snapshot.and_then(|s| spec.transform.evaluate(&s.window));

            match (value, snapshot) {
                (Some(v), Some(s)) => {
                    features.insert(spec.name.clone(), v);
                    provenance.insert(spec.name.clone(), s.window.last_update());
                    if s.stale {
                        stale.push(spec.name.clone());
                    }
                }
                _ => match spec.on_missing {
                    OnMissing::Default => {
                        features.insert(spec.name.clone(), spec.default);
                        provenance.insert(spec.name.clone(), decision_time);
                        defaulted.push(spec.name.clone());
                    }
                    OnMissing::Exclude => excluded.push(spec.name.clone()),
                    OnMissing::Fail => failing.push(spec.name.clone()),
                },
            }
        }

        if !failing.is_empty() {
            debug!(
                "FusionEngine: insufficient signal for {}: {:?}",
                instrument, failing
            );
            return Err(FusionError::InsufficientSignal {
                instrument: instrument.clone(),
                features: failing,
            });
        }

        Ok(FeatureVector::with_fallbacks(
            instrument.clone(),
            decision_time,
            features,
            provenance,
            defaulted,
            excluded,
            stale,
        ))
    }

    /// `assemble` that stops at the next await point once `cancel` fires.
    /// Nothing is written on either path.
    pub async fn assemble_cancellable(
        &self,
        instrument: &InstrumentKey,
        decision_time: DateTime<Utc>,
        cancel: &mut CancelSignal,
    ) -> Result<FeatureVector, FusionError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(FusionError::Cancelled),
            result = self.assemble(instrument, decision_time) => result,
        }
    }

    /// A window that already folded in events observed after the decision
    /// instant cannot be read as of that instant; it counts as missing.
    fn usable_at(
        &self,
        instrument: &InstrumentKey,
        family: SignalFamily,
        snapshot: &WindowSnapshot,
    ) -> bool {
        if snapshot.postdates_as_of() {
            debug!(
                "FusionEngine: {} {} window updated at {} is newer than decision time {}",
                instrument,
                family,
                snapshot.window.last_update(),
                snapshot.as_of
            );
            return false;
        }
        match self.policy.ceiling(family) {
            Some(ceiling) => snapshot.age() <= ceiling,
            None => true,
        }
    }
}
