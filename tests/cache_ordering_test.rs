use chrono::{Duration, TimeZone, Utc};
use finsight::application::market_data::{CacheConfig, CacheWrite, FeatureCache};
use finsight::domain::signal::{InstrumentKey, SignalEvent, SignalFamily, SignalValue};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

fn tick(id: &str, minute: i64, price: f64) -> SignalEvent {
    let base = Utc.with_ymd_and_hms(2026, 3, 2, 14, 0, 0).unwrap();
    let observed = base + Duration::minutes(minute);
    SignalEvent::new(
        InstrumentKey::from("AAPL"),
        id,
        observed,
        observed + Duration::seconds(1),
        SignalValue::Technical {
            price,
            volume: 100.0,
        },
        1.0,
    )
}

/// Test: whatever order events arrive in, the latest value is the one with the
/// greatest (observed_at, source_id) and every event is counted once.
#[tokio::test]
async fn test_latest_value_independent_of_arrival_order() {
    let mut events = Vec::new();
    for minute in 0..12 {
        events.push(tick(&format!("iex:{:02}", minute), minute, 100.0 + minute as f64));
    }
    // Same timestamp as the newest tick; wins on source id.
    events.push(tick("polygon:11", 11, 250.0));

    let key = InstrumentKey::from("AAPL");
    for seed in [1_u64, 7, 42, 1337] {
        let mut shuffled = events.clone();
        shuffled.shuffle(&mut StdRng::seed_from_u64(seed));

        let cache = FeatureCache::new(CacheConfig::default());
        for event in &shuffled {
            let write = cache.apply(event).await.unwrap();
            assert!(matches!(write, CacheWrite::Applied(_)));
        }

        let as_of = shuffled[0].observed_at() + Duration::hours(1);
        let snapshot = cache
            .read(&key, SignalFamily::Technical, as_of)
            .await
            .unwrap()
            .expect("window exists");
        let latest = snapshot.window.latest();
        assert_eq!(latest.source_id, "polygon:11", "seed {}", seed);
        assert_eq!(latest.value.field("price"), Some(250.0));
        assert_eq!(snapshot.window.event_count(), events.len() as u64);

        // History stays sorted by event time regardless of arrival order.
        let history = snapshot.window.history();
        assert!(
            history
                .iter()
                .zip(history.iter().skip(1))
                .all(|(a, b)| a.observed_at <= b.observed_at)
        );
    }
}

/// Test: redelivered events are ignored.
#[tokio::test]
async fn test_redelivery_is_deduplicated() {
    let cache = FeatureCache::new(CacheConfig::default());
    let event = tick("iex:00", 0, 100.0);

    cache.apply(&event).await.unwrap();
    assert_eq!(cache.apply(&event).await.unwrap(), CacheWrite::Duplicate);

    let snapshot = cache
        .read(&InstrumentKey::from("AAPL"), SignalFamily::Technical, event.observed_at())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(snapshot.window.event_count(), 1);
}

/// Test: a window is fresh exactly at its staleness threshold and stale just past it.
#[tokio::test]
async fn test_staleness_boundary() {
    let cache = FeatureCache::new(CacheConfig::default());
    let event = tick("iex:00", 0, 100.0);
    cache.apply(&event).await.unwrap();

    let key = InstrumentKey::from("AAPL");
    let threshold = cache.config().technical.staleness_threshold;

    let at_threshold = cache
        .read(&key, SignalFamily::Technical, event.observed_at() + threshold)
        .await
        .unwrap()
        .unwrap();
    assert!(!at_threshold.stale);

    let past = cache
        .read(
            &key,
            SignalFamily::Technical,
            event.observed_at() + threshold + Duration::milliseconds(1),
        )
        .await
        .unwrap()
        .unwrap();
    assert!(past.stale);

    // A decision time before the window's last update clamps to age zero.
    let earlier = cache
        .read(&key, SignalFamily::Technical, event.observed_at() - Duration::minutes(5))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(earlier.age(), Duration::zero());
    assert!(!earlier.stale);
}

/// Test: an unknown key reads as absent rather than failing.
#[tokio::test]
async fn test_unknown_key_reads_none() {
    let cache = FeatureCache::new(CacheConfig::default());
    let read = cache
        .read(&InstrumentKey::from("MSFT"), SignalFamily::Sentiment, Utc::now())
        .await
        .unwrap();
    assert!(read.is_none());
}
