//! Keyed store of rolling feature windows, one per (instrument, family).
//!
//! The outer map is guarded by a `std::sync::RwLock` and only held for
//! lookups and slot creation; each window sits behind its own
//! `tokio::sync::Mutex` so writers on different keys never contend.
//! Lock acquisition is bounded by a timeout with exponential backoff and
//! gives up with `CacheUnavailable` instead of blocking forever.

use crate::domain::errors::CacheError;
use crate::domain::signal::{InstrumentKey, SignalEvent, SignalFamily};
use crate::domain::window::{ApplyOutcome, FeatureWindow, WindowParams, WindowSnapshot};
use crate::infrastructure::observability::Metrics;
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, RwLock};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FamilyWindowConfig {
    /// A window older than this is flagged stale on read
    pub staleness_threshold: Duration,
    /// EWMA span (events)
    pub span: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    pub sentiment: FamilyWindowConfig,
    pub fundamental: FamilyWindowConfig,
    pub technical: FamilyWindowConfig,
    pub history_len: usize,
    /// Source ids remembered per window for redelivery dedup
    pub dedup_capacity: usize,
    /// Instruments with no update for this long are purged
    pub eviction_ttl: Duration,
    pub lock_timeout: std::time::Duration,
    pub max_attempts: u32,
    pub retry_backoff: std::time::Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            sentiment: FamilyWindowConfig {
                staleness_threshold: Duration::minutes(30),
                span: 20,
            },
            fundamental: FamilyWindowConfig {
                staleness_threshold: Duration::days(7),
                span: 4,
            },
            technical: FamilyWindowConfig {
                staleness_threshold: Duration::seconds(60),
                span: 50,
            },
            history_len: 64,
            dedup_capacity: 256,
            eviction_ttl: Duration::hours(24),
            lock_timeout: std::time::Duration::from_millis(250),
            max_attempts: 4,
            retry_backoff: std::time::Duration::from_millis(10),
        }
    }
}

impl CacheConfig {
    pub fn family(&self, family: SignalFamily) -> &FamilyWindowConfig {
        match family {
            SignalFamily::Sentiment => &self.sentiment,
            SignalFamily::Fundamental => &self.fundamental,
            SignalFamily::Technical => &self.technical,
        }
    }

    pub fn family_mut(&mut self, family: SignalFamily) -> &mut FamilyWindowConfig {
        match family {
            SignalFamily::Sentiment => &mut self.sentiment,
            SignalFamily::Fundamental => &mut self.fundamental,
            SignalFamily::Technical => &mut self.technical,
        }
    }

    pub fn window_params(&self, family: SignalFamily) -> WindowParams {
        WindowParams {
            span: self.family(family).span,
            history_len: self.history_len,
        }
    }
}

/// Result of applying one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheWrite {
    Applied(ApplyOutcome),
    /// Same source id already folded into this window
    Duplicate,
}

type WindowKey = (InstrumentKey, SignalFamily);

#[derive(Default)]
struct WindowSlot {
    window: Option<FeatureWindow>,
    seen_order: VecDeque<String>,
    seen: HashSet<String>,
    /// Set when the sweeper removed this slot from the map; holders of a stale
    /// `Arc` must look the key up again.
    evicted: bool,
}

impl WindowSlot {
    fn remember(&mut self, source_id: &str, capacity: usize) {
        if self.seen.insert(source_id.to_string()) {
            self.seen_order.push_back(source_id.to_string());
        }
        while self.seen_order.len() > capacity.max(1) {
            if let Some(oldest) = self.seen_order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
    }
}

pub struct FeatureCache {
    slots: RwLock<HashMap<WindowKey, Arc<Mutex<WindowSlot>>>>,
    config: CacheConfig,
    metrics: Option<Metrics>,
}

impl std::fmt::Debug for FeatureCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeatureCache")
            .field("slots", &"<RwLock>")
            .field("config", &self.config)
            .finish()
    }
}

impl FeatureCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            config,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Fold a normalized event into its window.
    ///
    /// Non-finite payloads are rejected before any lock is taken; once
    /// validated, the window update cannot fail, so a write is either fully
    /// committed or not started.
    pub async fn apply(&self, event: &SignalEvent) -> Result<CacheWrite, CacheError> {
        let key = (event.instrument_key().clone(), event.family());
        if !event.value().is_finite() {
            return Err(CacheError::NonFinitePayload {
                instrument: key.0,
                family: key.1,
            });
        }
        let params = self.config.window_params(event.family());

        let mut attempts = 0;
        while attempts < self.config.max_attempts {
            attempts += 1;
            let slot = self.slot_or_insert(&key);
            let Some(mut guard) = self.lock_slot(&slot, &key, attempts).await else {
                continue;
            };
            if guard.evicted {
                // Lost a race with the sweeper; retry against a fresh slot.
                continue;
            }
            if guard.seen.contains(event.source_id()) {
                debug!(
                    "FeatureCache: duplicate {} for {}/{}",
                    event.source_id(),
                    key.0,
                    key.1
                );
                if let Some(metrics) = &self.metrics {
                    metrics.events_duplicate_total.inc();
                }
                return Ok(CacheWrite::Duplicate);
            }

            let state = &mut *guard;
            let outcome = match state.window.as_mut() {
                Some(window) => window.apply(event, &params),
                None => {
                    state.window = Some(FeatureWindow::from_event(event, &params));
                    ApplyOutcome::LatestReplaced
                }
            };
            state.remember(event.source_id(), self.config.dedup_capacity);
            return Ok(CacheWrite::Applied(outcome));
        }

        self.unavailable(key, attempts)
    }

    /// Point-in-time copy of a window, or `None` if the key has never been
    /// written (or has been evicted).
    pub async fn read(
        &self,
        instrument: &InstrumentKey,
        family: SignalFamily,
        as_of: DateTime<Utc>,
    ) -> Result<Option<WindowSnapshot>, CacheError> {
        let key = (instrument.clone(), family);
        let threshold = self.config.family(family).staleness_threshold;

        let mut attempts = 0;
        while attempts < self.config.max_attempts {
            attempts += 1;
            let Some(slot) = self.slot(&key) else {
                return Ok(None);
            };
            let Some(guard) = self.lock_slot(&slot, &key, attempts).await else {
                continue;
            };
            if guard.evicted {
                return Ok(None);
            }
            return Ok(guard
                .window
                .clone()
                .map(|window| WindowSnapshot::new(window, as_of, threshold)));
        }

        self.unavailable(key, attempts)
    }

    /// Purge every window of instruments whose newest ingest across all
    /// families is older than the TTL. Returns the evicted instruments.
    pub fn evict_expired(&self, now: DateTime<Utc>) -> Vec<InstrumentKey> {
        // A TTL reaching past the representable range never expires anything.
        let Some(cutoff) = now.checked_sub_signed(self.config.eviction_ttl) else {
            return Vec::new();
        };
        let mut slots = match self.slots.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("FeatureCache: Lock poisoned during eviction, recovering");
                poisoned.into_inner()
            }
        };

        // Newest ingest per instrument; busy slots count as active.
        let mut newest: HashMap<InstrumentKey, Option<DateTime<Utc>>> = HashMap::new();
        for ((instrument, _), slot) in slots.iter() {
            let last = match slot.try_lock() {
                Ok(guard) => guard.window.as_ref().map(|w| w.last_received()),
                Err(_) => Some(now),
            };
            let entry = newest.entry(instrument.clone()).or_insert(None);
            *entry = (*entry).max(last);
        }

        let expired: Vec<InstrumentKey> = newest
            .into_iter()
            .filter(|(_, last)| last.is_none_or(|t| t < cutoff))
            .map(|(instrument, _)| instrument)
            .collect();

        for instrument in &expired {
            for family in SignalFamily::ALL {
                let key = (instrument.clone(), family);
                if let Some(slot) = slots.get(&key) {
                    match slot.try_lock() {
                        Ok(mut guard) => guard.evicted = true,
                        // A writer grabbed it since the scan; leave it for the next sweep.
                        Err(_) => continue,
                    }
                    slots.remove(&key);
                }
            }
        }

        if !expired.is_empty() {
            info!(
                "FeatureCache: evicted {} idle instrument(s): {:?}",
                expired.len(),
                expired
            );
        }
        if let Some(metrics) = &self.metrics {
            metrics.cache_evictions_total.inc_by(expired.len() as u64);
            metrics.cache_windows.set(slots.len() as i64);
        }
        expired
    }

    /// Copies of every live window, for export.
    pub async fn snapshot_all(&self) -> Vec<FeatureWindow> {
        let slots: Vec<Arc<Mutex<WindowSlot>>> = match self.slots.read() {
            Ok(guard) => guard.values().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().values().cloned().collect(),
        };
        let mut windows = Vec::with_capacity(slots.len());
        for slot in slots {
            let guard = slot.lock().await;
            if !guard.evicted
                && let Some(window) = &guard.window
            {
                windows.push(window.clone());
            }
        }
        windows
    }

    pub fn instruments(&self) -> Vec<InstrumentKey> {
        let slots = match self.slots.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut instruments: Vec<InstrumentKey> =
            slots.keys().map(|(instrument, _)| instrument.clone()).collect();
        instruments.sort();
        instruments.dedup();
        instruments
    }

    pub fn len(&self) -> usize {
        match self.slots.read() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slot(&self, key: &WindowKey) -> Option<Arc<Mutex<WindowSlot>>> {
        match self.slots.read() {
            Ok(guard) => guard.get(key).cloned(),
            Err(poisoned) => poisoned.into_inner().get(key).cloned(),
        }
    }

    fn slot_or_insert(&self, key: &WindowKey) -> Arc<Mutex<WindowSlot>> {
        if let Some(slot) = self.slot(key) {
            return slot;
        }
        let mut slots = match self.slots.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("FeatureCache: Lock poisoned during insert, recovering");
                poisoned.into_inner()
            }
        };
        let slot = slots.entry(key.clone()).or_default().clone();
        if let Some(metrics) = &self.metrics {
            metrics.cache_windows.set(slots.len() as i64);
        }
        slot
    }

    async fn lock_slot<'a>(
        &self,
        slot: &'a Mutex<WindowSlot>,
        key: &WindowKey,
        attempt: u32,
    ) -> Option<MutexGuard<'a, WindowSlot>> {
        match tokio::time::timeout(self.config.lock_timeout, slot.lock()).await {
            Ok(guard) => Some(guard),
            Err(_) => {
                warn!(
                    "FeatureCache: lock timeout on {}/{} (attempt {}/{})",
                    key.0, key.1, attempt, self.config.max_attempts
                );
                if let Some(metrics) = &self.metrics {
                    metrics.cache_lock_timeouts_total.inc();
                }
                if attempt < self.config.max_attempts {
                    let backoff = self.config.retry_backoff * 2u32.saturating_pow(attempt - 1);
                    tokio::time::sleep(backoff).await;
                }
                None
            }
        }
    }

    fn unavailable<T>(&self, key: WindowKey, attempts: u32) -> Result<T, CacheError> {
        if let Some(metrics) = &self.metrics {
            metrics.cache_unavailable_total.inc();
        }
        Err(CacheError::CacheUnavailable {
            instrument: key.0,
            family: key.1,
            attempts,
        })
    }

    #[cfg(test)]
    fn hold_slot(&self, instrument: &InstrumentKey, family: SignalFamily) -> Arc<Mutex<WindowSlot>> {
        self.slot_or_insert(&(instrument.clone(), family))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::signal::SignalValue;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_772_460_000 + secs, 0).unwrap()
    }

    fn tick(instrument: &str, source: &str, secs: i64, price: f64) -> SignalEvent {
        SignalEvent::new(
            InstrumentKey::from(instrument),
            source,
            t(secs),
            t(secs),
            SignalValue::Technical {
                price,
                volume: 10.0,
            },
            1.0,
        )
    }

    fn fast_config() -> CacheConfig {
        CacheConfig {
            lock_timeout: std::time::Duration::from_millis(20),
            max_attempts: 3,
            retry_backoff: std::time::Duration::from_millis(1),
            ..CacheConfig::default()
        }
    }

    #[tokio::test]
    async fn test_apply_then_read() {
        let cache = FeatureCache::new(CacheConfig::default());
        let key = InstrumentKey::from("AAPL");
        assert!(cache.read(&key, SignalFamily::Technical, t(0)).await.unwrap().is_none());

        let write = cache.apply(&tick("AAPL", "a", 0, 100.0)).await.unwrap();
        assert_eq!(write, CacheWrite::Applied(ApplyOutcome::LatestReplaced));

        let snapshot = cache
            .read(&key, SignalFamily::Technical, t(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.window.latest().value.field("price"), Some(100.0));
        assert!(!snapshot.stale);
    }

    #[tokio::test]
    async fn test_redelivery_is_deduplicated() {
        let cache = FeatureCache::new(CacheConfig::default());
        let event = tick("AAPL", "a", 0, 100.0);
        cache.apply(&event).await.unwrap();
        assert_eq!(cache.apply(&event).await.unwrap(), CacheWrite::Duplicate);
        let snapshot = cache
            .read(&InstrumentKey::from("AAPL"), SignalFamily::Technical, t(0))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.window.event_count(), 1);
    }

    #[tokio::test]
    async fn test_non_finite_rejected_without_side_effects() {
        let cache = FeatureCache::new(CacheConfig::default());
        let err = cache.apply(&tick("AAPL", "a", 0, f64::NAN)).await.unwrap_err();
        assert!(matches!(err, CacheError::NonFinitePayload { .. }));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_stale_flag_uses_family_threshold() {
        let cache = FeatureCache::new(CacheConfig::default());
        cache.apply(&tick("AAPL", "a", 0, 100.0)).await.unwrap();
        let key = InstrumentKey::from("AAPL");
        let fresh = cache.read(&key, SignalFamily::Technical, t(60)).await.unwrap().unwrap();
        assert!(!fresh.stale);
        let stale = cache.read(&key, SignalFamily::Technical, t(61)).await.unwrap().unwrap();
        assert!(stale.stale);
    }

    #[tokio::test]
    async fn test_held_lock_yields_cache_unavailable() {
        let cache = FeatureCache::new(fast_config());
        let key = InstrumentKey::from("AAPL");
        let slot = cache.hold_slot(&key, SignalFamily::Technical);
        let _held = slot.lock().await;

        let err = cache.apply(&tick("AAPL", "a", 0, 100.0)).await.unwrap_err();
        assert_eq!(
            err,
            CacheError::CacheUnavailable {
                instrument: key.clone(),
                family: SignalFamily::Technical,
                attempts: 3
            }
        );
        // Other keys are unaffected
        assert!(cache.apply(&tick("MSFT", "a", 0, 100.0)).await.is_ok());
    }

    #[tokio::test]
    async fn test_eviction_purges_idle_instrument_across_families() {
        let cache = FeatureCache::new(CacheConfig {
            eviction_ttl: Duration::seconds(100),
            ..CacheConfig::default()
        });
        cache.apply(&tick("AAPL", "a", 0, 100.0)).await.unwrap();
        let sentiment = SignalEvent::new(
            InstrumentKey::from("AAPL"),
            "n1",
            t(0),
            t(0),
            SignalValue::Sentiment {
                score: 0.3,
                label: crate::domain::signal::SentimentLabel::Positive,
            },
            1.0,
        );
        cache.apply(&sentiment).await.unwrap();
        cache.apply(&tick("MSFT", "b", 150, 300.0)).await.unwrap();

        let evicted = cache.evict_expired(t(200));
        assert_eq!(evicted, vec![InstrumentKey::from("AAPL")]);
        assert_eq!(cache.instruments(), vec![InstrumentKey::from("MSFT")]);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_eviction_ttl_beyond_date_range_keeps_everything() {
        let cache = FeatureCache::new(CacheConfig {
            eviction_ttl: Duration::seconds(10_000_000_000_000),
            ..CacheConfig::default()
        });
        cache.apply(&tick("AAPL", "a", 0, 100.0)).await.unwrap();

        assert!(cache.evict_expired(Utc::now()).is_empty());
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_writers_on_one_key() {
        let cache = Arc::new(FeatureCache::new(CacheConfig::default()));
        let mut handles = Vec::new();
        for i in 0..32 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .apply(&tick("AAPL", &format!("s{:02}", i), i, 100.0 + i as f64))
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        let snapshot = cache
            .read(&InstrumentKey::from("AAPL"), SignalFamily::Technical, t(40))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.window.event_count(), 32);
        assert_eq!(snapshot.window.latest().value.field("price"), Some(131.0));
    }
}
