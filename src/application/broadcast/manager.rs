//! Topic fan-out to subscribed clients.
//!
//! Each topic is a `tokio::sync::broadcast` channel whose capacity is the
//! per-subscription queue bound. A subscriber that falls behind loses the
//! oldest messages (the channel overwrites them); the receiver observes
//! `Lagged`, counts the loss and carries on with the next live message.
//! Publishing never waits on a subscriber.

use crate::application::broadcast::topic::{BroadcastPayload, Topic};
use crate::infrastructure::observability::Metrics;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Subscription {
    pub id: Uuid,
    pub client_id: String,
    pub topic: Topic,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastConfig {
    /// Per-subscription queue bound
    pub queue_capacity: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self { queue_capacity: 256 }
    }
}

struct TopicChannel {
    sender: broadcast::Sender<Arc<BroadcastPayload>>,
    last: Option<Arc<BroadcastPayload>>,
}

struct SubscriptionEntry {
    subscription: Subscription,
    status: watch::Sender<SubscriptionStatus>,
}

/// Client-side end of a subscription.
pub struct SubscriptionHandle {
    subscription: Subscription,
    receiver: broadcast::Receiver<Arc<BroadcastPayload>>,
    status: watch::Receiver<SubscriptionStatus>,
    dropped: u64,
    metrics: Option<Metrics>,
}

impl SubscriptionHandle {
    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }

    pub fn id(&self) -> Uuid {
        self.subscription.id
    }

    pub fn status(&self) -> SubscriptionStatus {
        *self.status.borrow()
    }

    /// Messages this subscriber missed because its queue overflowed.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Next message, or `None` once the subscription is closed.
    pub async fn recv(&mut self) -> Option<Arc<BroadcastPayload>> {
        loop {
            if self.status() == SubscriptionStatus::Closed {
                return None;
            }
            tokio::select! {
                biased;
                changed = self.status.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
                message = self.receiver.recv() => match message {
                    Ok(payload) => return Some(payload),
                    Err(RecvError::Lagged(n)) => self.record_lag(n),
                    Err(RecvError::Closed) => return None,
                },
            }
        }
    }

    /// Non-blocking variant of `recv`; `None` when nothing is queued or
    /// the subscription is closed.
    pub fn try_recv(&mut self) -> Option<Arc<BroadcastPayload>> {
        loop {
            if self.status() == SubscriptionStatus::Closed {
                return None;
            }
            match self.receiver.try_recv() {
                Ok(payload) => return Some(payload),
                Err(TryRecvError::Lagged(n)) => self.record_lag(n),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    fn record_lag(&mut self, n: u64) {
        self.dropped += n;
        debug!(
            "Subscription {} on {} lagged, dropped {} oldest message(s)",
            self.subscription.id, self.subscription.topic, n
        );
        if let Some(metrics) = &self.metrics {
            metrics.broadcast_dropped_total.inc_by(n);
        }
    }
}

pub struct BroadcastManager {
    topics: RwLock<HashMap<Topic, TopicChannel>>,
    subscriptions: RwLock<HashMap<Uuid, SubscriptionEntry>>,
    config: BroadcastConfig,
    metrics: Option<Metrics>,
}

impl std::fmt::Debug for BroadcastManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastManager")
            .field("topics", &"<RwLock>")
            .field("subscriptions", &self.connection_count())
            .field("config", &self.config)
            .finish()
    }
}

impl BroadcastManager {
    pub fn new(config: BroadcastConfig) -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            subscriptions: RwLock::new(HashMap::new()),
            config,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn subscribe(&self, client_id: &str, topic: Topic) -> SubscriptionHandle {
        let receiver = {
            let mut topics = self.write_topics();
            self.channel(&mut topics, &topic).sender.subscribe()
        };
        self.register(client_id, topic, receiver)
    }

    /// Subscribe and hand back the topic's most recent message, if any.
    ///
    /// The replayed message and the receiver are taken under one topic lock,
    /// so every later publish reaches the new handle.
    pub fn subscribe_with_replay(
        &self,
        client_id: &str,
        topic: Topic,
    ) -> (SubscriptionHandle, Option<Arc<BroadcastPayload>>) {
        let (receiver, last) = {
            let mut topics = self.write_topics();
            let channel = self.channel(&mut topics, &topic);
            (channel.sender.subscribe(), channel.last.clone())
        };
        (self.register(client_id, topic, receiver), last)
    }

    fn register(
        &self,
        client_id: &str,
        topic: Topic,
        receiver: broadcast::Receiver<Arc<BroadcastPayload>>,
    ) -> SubscriptionHandle {
        let subscription = Subscription {
            id: Uuid::new_v4(),
            client_id: client_id.to_string(),
            topic,
            created_at: Utc::now(),
        };
        let (status_tx, status_rx) = watch::channel(SubscriptionStatus::Active);

        let count = {
            let mut subscriptions = self.write_subscriptions();
            subscriptions.insert(
                subscription.id,
                SubscriptionEntry {
                    subscription: subscription.clone(),
                    status: status_tx,
                },
            );
            subscriptions.len()
        };
        info!(
            "BroadcastManager: {} subscribed to {} ({})",
            client_id, subscription.topic, subscription.id
        );
        if let Some(metrics) = &self.metrics {
            metrics.broadcast_subscriptions.set(count as i64);
        }

        SubscriptionHandle {
            subscription,
            receiver,
            status: status_rx,
            dropped: 0,
            metrics: self.metrics.clone(),
        }
    }

    /// Close one subscription. Returns false if it was unknown.
    pub fn unsubscribe(&self, subscription_id: Uuid) -> bool {
        let removed = self.write_subscriptions().remove(&subscription_id);
        match removed {
            Some(entry) => {
                self.close(entry);
                true
            }
            None => false,
        }
    }

    /// Close every subscription a client holds on one topic.
    pub fn unsubscribe_topic(&self, client_id: &str, topic: &Topic) -> usize {
        self.close_where(|s| s.client_id == client_id && &s.topic == topic)
    }

    /// Close every subscription of a disconnected client.
    pub fn disconnect(&self, client_id: &str) -> usize {
        let closed = self.close_where(|s| s.client_id == client_id);
        if closed > 0 {
            info!(
                "BroadcastManager: client {} disconnected, closed {} subscription(s)",
                client_id, closed
            );
        }
        closed
    }

    /// Deliver to every current subscriber of `topic` and remember it as the
    /// topic's last message. Returns the number of receivers reached.
    pub fn publish(&self, topic: &Topic, payload: BroadcastPayload) -> usize {
        let payload = Arc::new(payload);
        let reached = {
            let mut topics = self.write_topics();
            let channel = self.channel(&mut topics, topic);
            channel.last = Some(payload.clone());
            // Err only means nobody is listening right now.
            channel.sender.send(payload).unwrap_or(0)
        };
        if let Some(metrics) = &self.metrics {
            metrics.inc_published(topic.kind());
        }
        reached
    }

    pub fn last(&self, topic: &Topic) -> Option<Arc<BroadcastPayload>> {
        let topics = match self.topics.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        topics.get(topic).and_then(|c| c.last.clone())
    }

    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.read_subscriptions()
            .values()
            .filter(|e| &e.subscription.topic == topic)
            .count()
    }

    /// Client ids subscribed to a topic, sorted.
    pub fn topic_subscribers(&self, topic: &Topic) -> Vec<String> {
        let mut clients: Vec<String> = self
            .read_subscriptions()
            .values()
            .filter(|e| &e.subscription.topic == topic)
            .map(|e| e.subscription.client_id.clone())
            .collect();
        clients.sort();
        clients.dedup();
        clients
    }

    pub fn client_subscriptions(&self, client_id: &str) -> Vec<Subscription> {
        self.read_subscriptions()
            .values()
            .filter(|e| e.subscription.client_id == client_id)
            .map(|e| e.subscription.clone())
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.read_subscriptions().len()
    }

    fn close_where(&self, predicate: impl Fn(&Subscription) -> bool) -> usize {
        let removed: Vec<SubscriptionEntry> = {
            let mut subscriptions = self.write_subscriptions();
            let ids: Vec<Uuid> = subscriptions
                .values()
                .filter(|e| predicate(&e.subscription))
                .map(|e| e.subscription.id)
                .collect();
            ids.iter().filter_map(|id| subscriptions.remove(id)).collect()
        };
        let count = removed.len();
        for entry in removed {
            self.close(entry);
        }
        count
    }

    fn close(&self, entry: SubscriptionEntry) {
        entry.status.send_replace(SubscriptionStatus::Closed);
        debug!(
            "BroadcastManager: closed {} ({} on {})",
            entry.subscription.id, entry.subscription.client_id, entry.subscription.topic
        );
        if let Some(metrics) = &self.metrics {
            metrics
                .broadcast_subscriptions
                .set(self.connection_count() as i64);
        }
    }

    fn channel<'a>(
        &self,
        topics: &'a mut HashMap<Topic, TopicChannel>,
        topic: &Topic,
    ) -> &'a mut TopicChannel {
        topics.entry(topic.clone()).or_insert_with(|| {
            let (sender, _) = broadcast::channel(self.config.queue_capacity.max(1));
            TopicChannel { sender, last: None }
        })
    }

    fn write_topics(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<Topic, TopicChannel>> {
        match self.topics.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("BroadcastManager: topic lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn read_subscriptions(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, HashMap<Uuid, SubscriptionEntry>> {
        match self.subscriptions.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_subscriptions(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<Uuid, SubscriptionEntry>> {
        match self.subscriptions.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("BroadcastManager: subscription lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}
