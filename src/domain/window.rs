//! Per (instrument, family) rolling aggregate.
//!
//! Rolling statistics use a count-based exponentially weighted scheme:
//! `alpha = 2 / (span + 1)` with the span fixed per family. Out-of-order
//! events feed the statistics and the history but never replace the latest
//! value, which is always the event with the greatest `(observed_at, source_id)`.

use crate::domain::signal::{InstrumentKey, SignalEvent, SignalFamily, SignalValue};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct RollingStats {
    pub count: u64,
    pub mean: f64,
    pub variance: f64,
}

impl RollingStats {
    pub fn update(&mut self, x: f64, alpha: f64) {
        if self.count == 0 {
            self.mean = x;
            self.variance = 0.0;
        } else {
            let diff = x - self.mean;
            let incr = alpha * diff;
            self.mean += incr;
            self.variance = (1.0 - alpha) * (self.variance + diff * incr);
        }
        self.count += 1;
    }

    pub fn std_dev(&self) -> f64 {
        self.variance.max(0.0).sqrt()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowParams {
    pub span: usize,
    pub history_len: usize,
}

impl WindowParams {
    pub fn alpha(&self) -> f64 {
        2.0 / (self.span.max(1) as f64 + 1.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatestValue {
    pub value: SignalValue,
    pub observed_at: DateTime<Utc>,
    pub source_id: String,
    pub quality: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HistoryPoint {
    pub observed_at: DateTime<Utc>,
    pub value: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    LatestReplaced,
    AggregatesOnly,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureWindow {
    instrument_key: InstrumentKey,
    family: SignalFamily,
    latest: LatestValue,
    stats: BTreeMap<String, RollingStats>,
    history: VecDeque<HistoryPoint>,
    last_update: DateTime<Utc>,
    last_received: DateTime<Utc>,
    event_count: u64,
}

impl FeatureWindow {
    pub fn from_event(event: &SignalEvent, params: &WindowParams) -> Self {
        let mut window = Self {
            instrument_key: event.instrument_key().clone(),
            family: event.family(),
            latest: LatestValue {
                value: event.value().clone(),
                observed_at: event.observed_at(),
                source_id: event.source_id().to_string(),
                quality: event.quality(),
            },
            stats: BTreeMap::new(),
            history: VecDeque::with_capacity(params.history_len),
            last_update: event.observed_at(),
            last_received: event.received_at(),
            event_count: 0,
        };
        window.accumulate(event, params);
        window
    }

    /// Fold one event into the window. The caller guarantees the event
    /// belongs to this window's key.
    pub fn apply(&mut self, event: &SignalEvent, params: &WindowParams) -> ApplyOutcome {
        debug_assert_eq!(event.family(), self.family);
        debug_assert_eq!(event.instrument_key(), &self.instrument_key);

        self.accumulate(event, params);

        let incoming = (event.observed_at(), event.source_id());
        let current = (self.latest.observed_at, self.latest.source_id.as_str());
        if incoming > current {
            self.latest = LatestValue {
                value: event.value().clone(),
                observed_at: event.observed_at(),
                source_id: event.source_id().to_string(),
                quality: event.quality(),
            };
            ApplyOutcome::LatestReplaced
        } else {
            ApplyOutcome::AggregatesOnly
        }
    }

    fn accumulate(&mut self, event: &SignalEvent, params: &WindowParams) {
        let alpha = params.alpha();
        for (field, x) in event.value().fields() {
            self.stats.entry(field.to_string()).or_default().update(x, alpha);
        }

        if let Some(x) = event.value().field(self.family.primary_field()) {
            let point = HistoryPoint {
                observed_at: event.observed_at(),
                value: x,
            };
            // Keep history sorted by event time.
            let pos = self
                .history
                .iter()
                .rposition(|p| p.observed_at <= point.observed_at)
                .map(|i| i + 1)
                .unwrap_or(0);
            self.history.insert(pos, point);
            while self.history.len() > params.history_len.max(1) {
                self.history.pop_front();
            }
        }

        self.last_update = self.last_update.max(event.observed_at());
        self.last_received = self.last_received.max(event.received_at());
        self.event_count += 1;
    }

    pub fn instrument_key(&self) -> &InstrumentKey {
        &self.instrument_key
    }

    pub fn family(&self) -> SignalFamily {
        self.family
    }

    pub fn latest(&self) -> &LatestValue {
        &self.latest
    }

    pub fn field_stats(&self) -> &BTreeMap<String, RollingStats> {
        &self.stats
    }

    pub fn stats(&self, field: &str) -> Option<&RollingStats> {
        self.stats.get(field)
    }

    pub fn history(&self) -> &VecDeque<HistoryPoint> {
        &self.history
    }

    pub fn last_update(&self) -> DateTime<Utc> {
        self.last_update
    }

    pub fn last_received(&self) -> DateTime<Utc> {
        self.last_received
    }

    pub fn event_count(&self) -> u64 {
        self.event_count
    }

    pub fn age(&self, as_of: DateTime<Utc>) -> Duration {
        (as_of - self.last_update).max(Duration::zero())
    }

    /// Stale strictly beyond the threshold; exactly at the threshold it is fresh.
    pub fn is_stale(&self, as_of: DateTime<Utc>, threshold: Duration) -> bool {
        self.age(as_of) > threshold
    }

    /// Log return between the k-th most recent history point and the one before it
    /// (k = 1 is the newest return).
    pub fn lag_return(&self, k: usize) -> Option<f64> {
        let n = self.history.len();
        if k == 0 || n < k + 1 {
            return None;
        }
        let newer = self.history[n - k].value;
        let older = self.history[n - k - 1].value;
        if newer > 0.0 && older > 0.0 {
            Some((newer / older).ln())
        } else {
            None
        }
    }
}

/// Owned, point-in-time copy of a window handed out by the cache.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowSnapshot {
    pub window: FeatureWindow,
    pub as_of: DateTime<Utc>,
    pub stale: bool,
}

impl WindowSnapshot {
    pub fn new(window: FeatureWindow, as_of: DateTime<Utc>, threshold: Duration) -> Self {
        let stale = window.is_stale(as_of, threshold);
        Self {
            window,
            as_of,
            stale,
        }
    }

    pub fn age(&self) -> Duration {
        self.window.age(self.as_of)
    }

    /// True when the window holds events observed after `as_of`.
    pub fn postdates_as_of(&self) -> bool {
        self.window.last_update() > self.as_of
    }
}
