use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::envelope::Envelope;
use crate::error::Result;
use crate::transport::filter::FilterRule;

/// Receiving queue settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueDescription {
    /// Deliveries after which the broker dead-letters on its own.
    pub max_delivery_count: u32,
    /// Peek-lock duration.
    pub lock_duration: Duration,
}

impl Default for QueueDescription {
    fn default() -> Self {
        Self {
            max_delivery_count: 5,
            lock_duration: Duration::from_secs(30),
        }
    }
}

/// Subscription settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionDescription {
    /// Queue that receives everything the subscription's rules admit.
    pub forward_to: Option<String>,
}

/// A named filter rule on a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleDescription {
    pub name: String,
    pub filter: FilterRule,
}

impl RuleDescription {
    pub fn new(name: impl Into<String>, filter: FilterRule) -> Self {
        Self {
            name: name.into(),
            filter,
        }
    }
}

/// Management plane. Every call is create-or-update and safe to repeat.
///
/// Backends may reject concurrent rule mutations on one subscription with
/// `BusError::RateLimited`; issue them one at a time.
#[async_trait]
pub trait ManagementClient: Send + Sync + 'static {
    async fn create_or_update_topic(&self, topic: &str) -> Result<()>;

    async fn create_or_update_queue(&self, queue: &str, description: &QueueDescription)
        -> Result<()>;

    async fn create_or_update_subscription(
        &self,
        topic: &str,
        subscription: &str,
        description: &SubscriptionDescription,
    ) -> Result<()>;

    async fn create_or_update_rule(
        &self,
        topic: &str,
        subscription: &str,
        rule: &RuleDescription,
    ) -> Result<()>;

    /// Remove a rule; `BusError::NotFound` when it does not exist.
    async fn delete_rule(&self, topic: &str, subscription: &str, rule: &str) -> Result<()>;
}

/// A message received under a peek-lock.
#[derive(Debug, Clone)]
pub struct LockedMessage {
    pub lock_token: String,
    /// Deliveries so far, this one included.
    pub delivery_count: u32,
    pub envelope: Envelope,
}

/// Data plane.
///
/// Settling with an unknown or expired lock token fails with
/// `BusError::LeaseLost`.
#[async_trait]
pub trait ServiceBusClient: Send + Sync + 'static {
    /// Publish to a topic; `BusError::NotFound` when the topic is missing.
    async fn send_to_topic(&self, topic: &str, envelope: Envelope) -> Result<()>;

    async fn send_to_queue(&self, queue: &str, envelope: Envelope) -> Result<()>;

    async fn receive(&self, queue: &str, lock_duration: Duration) -> Result<Option<LockedMessage>>;

    async fn complete(&self, queue: &str, lock_token: &str) -> Result<()>;

    /// Release the lock so the message can be received again at once.
    async fn abandon(&self, queue: &str, lock_token: &str) -> Result<()>;

    /// Move the message to the queue's dead-letter sub-queue.
    async fn dead_letter(&self, queue: &str, lock_token: &str, reason: &str) -> Result<()>;
}
