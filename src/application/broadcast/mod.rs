pub mod manager;
pub mod topic;

pub use manager::{
    BroadcastConfig, BroadcastManager, Subscription, SubscriptionHandle, SubscriptionStatus,
};
pub use topic::{BroadcastPayload, SignalUpdate, Topic};
