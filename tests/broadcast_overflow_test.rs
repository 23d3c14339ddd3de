use chrono::Utc;
use finsight::application::broadcast::{
    BroadcastConfig, BroadcastManager, BroadcastPayload, SignalUpdate, SubscriptionStatus, Topic,
};
use finsight::domain::signal::{InstrumentKey, SignalFamily, SignalValue};
use std::time::Duration;

fn tick(price: f64) -> BroadcastPayload {
    BroadcastPayload::Signal(SignalUpdate {
        instrument_key: InstrumentKey::from("TSLA"),
        family: SignalFamily::Technical,
        value: SignalValue::Technical {
            price,
            volume: 10.0,
        },
        observed_at: Utc::now(),
        quality: 1.0,
    })
}

fn price_of(payload: &BroadcastPayload) -> f64 {
    match payload {
        BroadcastPayload::Signal(update) => update.value.field("price").unwrap(),
        other => panic!("unexpected payload {:?}", other),
    }
}

/// Test: a subscriber that never reads loses the oldest messages, keeps the
/// newest ones in order, and publishing never blocks on it.
#[tokio::test]
async fn test_slow_subscriber_drops_oldest() {
    let manager = BroadcastManager::new(BroadcastConfig { queue_capacity: 4 });
    let topic = Topic::signals(&InstrumentKey::from("TSLA"), SignalFamily::Technical);
    let mut slow = manager.subscribe("slow", topic.clone());

    let publishing = tokio::time::timeout(Duration::from_secs(1), async {
        for i in 0..10 {
            manager.publish(&topic, tick(100.0 + i as f64));
        }
    });
    publishing.await.expect("publish must not wait on subscribers");

    let mut received = Vec::new();
    while let Some(payload) = slow.try_recv() {
        received.push(price_of(&payload));
    }

    assert_eq!(received, vec![106.0, 107.0, 108.0, 109.0]);
    assert_eq!(slow.dropped(), 6);
    assert_eq!(slow.status(), SubscriptionStatus::Active);
}

/// Test: one lagging subscriber does not affect another that keeps up.
#[tokio::test]
async fn test_fast_subscriber_unaffected_by_slow_one() {
    let manager = BroadcastManager::new(BroadcastConfig { queue_capacity: 4 });
    let topic = Topic::signals(&InstrumentKey::from("TSLA"), SignalFamily::Technical);
    let _slow = manager.subscribe("slow", topic.clone());
    let mut fast = manager.subscribe("fast", topic.clone());

    for i in 0..10 {
        manager.publish(&topic, tick(i as f64));
        let payload = fast.recv().await.unwrap();
        assert_eq!(price_of(&payload), i as f64);
    }
    assert_eq!(fast.dropped(), 0);
}

/// Test: disconnecting closes the client's subscriptions and ends its stream.
#[tokio::test]
async fn test_disconnect_closes_stream() {
    let manager = BroadcastManager::new(BroadcastConfig::default());
    let topic = Topic::predictions(&InstrumentKey::from("TSLA"));
    let mut handle = manager.subscribe("client-1", topic.clone());
    assert_eq!(manager.subscriber_count(&topic), 1);

    assert_eq!(manager.disconnect("client-1"), 1);
    assert_eq!(manager.subscriber_count(&topic), 0);

    let next = tokio::time::timeout(Duration::from_secs(1), handle.recv())
        .await
        .expect("closed subscription returns promptly");
    assert!(next.is_none());
    assert_eq!(handle.status(), SubscriptionStatus::Closed);
}

/// Test: late subscribers can replay the topic's last message.
#[tokio::test]
async fn test_subscribe_with_replay() {
    let manager = BroadcastManager::new(BroadcastConfig::default());
    let topic = Topic::signals(&InstrumentKey::from("TSLA"), SignalFamily::Technical);
    manager.publish(&topic, tick(1.0));
    manager.publish(&topic, tick(2.0));

    let (_handle, last) = manager.subscribe_with_replay("late", topic);
    assert_eq!(price_of(&last.unwrap()), 2.0);
}
