//! In-memory service bus for testing and single-process scenarios.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::client::{
    LockedMessage, ManagementClient, QueueDescription, RuleDescription, ServiceBusClient,
    SubscriptionDescription,
};
use crate::envelope::Envelope;
use crate::error::{BusError, Result};
use crate::transport::filter::{FilterRule, DEFAULT_RULE_NAME};

struct Subscription {
    forward_to: Option<String>,
    rules: BTreeMap<String, FilterRule>,
}

struct StoredMessage {
    envelope: Envelope,
    delivery_count: u32,
    lock_token: Option<String>,
    locked_until: Instant,
}

struct Queue {
    description: QueueDescription,
    messages: Vec<StoredMessage>,
    dead_letters: Vec<(Envelope, String)>,
}

impl Queue {
    fn lock_position(&self, lock_token: &str, now: Instant) -> Result<usize> {
        self.messages
            .iter()
            .position(|m| m.lock_token.as_deref() == Some(lock_token) && m.locked_until > now)
            .ok_or_else(|| BusError::LeaseLost(format!("lock {}", lock_token)))
    }
}

#[derive(Default)]
struct State {
    topics: BTreeMap<String, BTreeMap<String, Subscription>>,
    queues: BTreeMap<String, Queue>,
    rule_mutations: BTreeSet<(String, String)>,
    throttled_calls: usize,
    management_calls: usize,
}

impl State {
    fn queue_mut(&mut self, name: &str) -> Result<&mut Queue> {
        self.queues
            .get_mut(name)
            .ok_or_else(|| BusError::NotFound(format!("queue {}", name)))
    }

    fn subscription_mut(&mut self, topic: &str, subscription: &str) -> Result<&mut Subscription> {
        self.topics
            .get_mut(topic)
            .ok_or_else(|| BusError::NotFound(format!("topic {}", topic)))?
            .get_mut(subscription)
            .ok_or_else(|| BusError::NotFound(format!("subscription {}/{}", topic, subscription)))
    }

    /// Count a management call; fails while throttling is armed.
    fn management_call(&mut self, operation: &str) -> Result<()> {
        self.management_calls += 1;
        if self.throttled_calls > 0 {
            self.throttled_calls -= 1;
            return Err(BusError::RateLimited(format!("{} throttled", operation)));
        }
        Ok(())
    }

    fn enqueue(&mut self, queue: &str, envelope: Envelope) -> Result<()> {
        self.queue_mut(queue)?.messages.push(StoredMessage {
            envelope,
            delivery_count: 0,
            lock_token: None,
            locked_until: Instant::now(),
        });
        Ok(())
    }
}

/// Marks a rule mutation in flight; the mark is cleared when dropped.
struct RuleMutation {
    state: Arc<Mutex<State>>,
    key: (String, String),
}

impl Drop for RuleMutation {
    fn drop(&mut self) {
        self.state.lock().rule_mutations.remove(&self.key);
    }
}

/// Service bus emulated in memory: topics, forwarding subscriptions with
/// filter rules, peek-lock queues and dead-letter sub-queues.
///
/// New subscriptions get a catch-all `$Default` rule, as on the real service.
/// A rule mutation on a subscription that already has one in flight fails
/// with `BusError::RateLimited`. Clones share the same namespace.
#[derive(Clone, Default)]
pub struct InMemoryServiceBus {
    state: Arc<Mutex<State>>,
    rule_latency: Duration,
}

impl InMemoryServiceBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Time a rule mutation stays in flight.
    pub fn with_rule_latency(mut self, latency: Duration) -> Self {
        self.rule_latency = latency;
        self
    }

    /// Fail the next `calls` management calls with `RateLimited`.
    pub fn throttle_next(&self, calls: usize) {
        self.state.lock().throttled_calls = calls;
    }

    /// Management calls received so far, throttled ones included.
    pub fn management_calls(&self) -> usize {
        self.state.lock().management_calls
    }

    pub fn queue_names(&self) -> Vec<String> {
        self.state.lock().queues.keys().cloned().collect()
    }

    pub fn subscription_names(&self, topic: &str) -> Vec<String> {
        self.state
            .lock()
            .topics
            .get(topic)
            .map_or_else(Vec::new, |subs| subs.keys().cloned().collect())
    }

    pub fn queue_description(&self, queue: &str) -> Option<QueueDescription> {
        self.state.lock().queues.get(queue).map(|q| q.description.clone())
    }

    /// Rules installed on a subscription, by name.
    pub fn rules(&self, topic: &str, subscription: &str) -> BTreeMap<String, FilterRule> {
        self.state
            .lock()
            .topics
            .get(topic)
            .and_then(|subs| subs.get(subscription))
            .map_or_else(BTreeMap::new, |sub| sub.rules.clone())
    }

    pub fn forward_to(&self, topic: &str, subscription: &str) -> Option<String> {
        self.state
            .lock()
            .topics
            .get(topic)
            .and_then(|subs| subs.get(subscription))
            .and_then(|sub| sub.forward_to.clone())
    }

    /// Envelopes in a queue, locked or not.
    pub fn messages(&self, queue: &str) -> Vec<Envelope> {
        self.state.lock().queues.get(queue).map_or_else(Vec::new, |q| {
            q.messages.iter().map(|m| m.envelope.clone()).collect()
        })
    }

    /// Envelopes in a queue's dead-letter sub-queue.
    pub fn dead_letters(&self, queue: &str) -> Vec<Envelope> {
        self.state.lock().queues.get(queue).map_or_else(Vec::new, |q| {
            q.dead_letters.iter().map(|(e, _)| e.clone()).collect()
        })
    }

    /// Dead-letter reasons, in order.
    pub fn dead_letter_reasons(&self, queue: &str) -> Vec<String> {
        self.state.lock().queues.get(queue).map_or_else(Vec::new, |q| {
            q.dead_letters.iter().map(|(_, r)| r.clone()).collect()
        })
    }
}

#[async_trait]
impl ManagementClient for InMemoryServiceBus {
    async fn create_or_update_topic(&self, topic: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.management_call("create topic")?;
        state.topics.entry(topic.to_string()).or_default();
        Ok(())
    }

    async fn create_or_update_queue(
        &self,
        queue: &str,
        description: &QueueDescription,
    ) -> Result<()> {
        let mut state = self.state.lock();
        state.management_call("create queue")?;
        state
            .queues
            .entry(queue.to_string())
            .and_modify(|existing| existing.description = description.clone())
            .or_insert_with(|| Queue {
                description: description.clone(),
                messages: Vec::new(),
                dead_letters: Vec::new(),
            });
        Ok(())
    }

    async fn create_or_update_subscription(
        &self,
        topic: &str,
        subscription: &str,
        description: &SubscriptionDescription,
    ) -> Result<()> {
        let mut state = self.state.lock();
        state.management_call("create subscription")?;
        let subscriptions = state
            .topics
            .get_mut(topic)
            .ok_or_else(|| BusError::NotFound(format!("topic {}", topic)))?;
        subscriptions
            .entry(subscription.to_string())
            .and_modify(|existing| existing.forward_to = description.forward_to.clone())
            .or_insert_with(|| Subscription {
                forward_to: description.forward_to.clone(),
                rules: BTreeMap::from([(DEFAULT_RULE_NAME.to_string(), FilterRule::True)]),
            });
        Ok(())
    }

    async fn create_or_update_rule(
        &self,
        topic: &str,
        subscription: &str,
        rule: &RuleDescription,
    ) -> Result<()> {
        let key = (topic.to_string(), subscription.to_string());
        let _mutation = {
            let mut state = self.state.lock();
            state.management_call("create rule")?;
            state.subscription_mut(topic, subscription)?;
            if !state.rule_mutations.insert(key.clone()) {
                return Err(BusError::RateLimited(format!(
                    "concurrent rule mutation on {}/{}",
                    topic, subscription
                )));
            }
            RuleMutation {
                state: Arc::clone(&self.state),
                key,
            }
        };

        if self.rule_latency.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(self.rule_latency).await;
        }

        self.state
            .lock()
            .subscription_mut(topic, subscription)?
            .rules
            .insert(rule.name.clone(), rule.filter.clone());
        Ok(())
    }

    async fn delete_rule(&self, topic: &str, subscription: &str, rule: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.management_call("delete rule")?;
        state
            .subscription_mut(topic, subscription)?
            .rules
            .remove(rule)
            .map(|_| ())
            .ok_or_else(|| BusError::NotFound(format!("rule {} on {}/{}", rule, topic, subscription)))
    }
}

#[async_trait]
impl ServiceBusClient for InMemoryServiceBus {
    async fn send_to_topic(&self, topic: &str, envelope: Envelope) -> Result<()> {
        let mut state = self.state.lock();
        let targets: Vec<String> = state
            .topics
            .get(topic)
            .ok_or_else(|| BusError::NotFound(format!("topic {}", topic)))?
            .values()
            .filter(|sub| sub.rules.values().any(|rule| rule.matches(&envelope.properties)))
            .filter_map(|sub| sub.forward_to.clone())
            .collect();

        for queue in targets {
            if state.queues.contains_key(&queue) {
                state.enqueue(&queue, envelope.clone())?;
            }
        }
        Ok(())
    }

    async fn send_to_queue(&self, queue: &str, envelope: Envelope) -> Result<()> {
        self.state.lock().enqueue(queue, envelope)
    }

    async fn receive(&self, queue: &str, lock_duration: Duration) -> Result<Option<LockedMessage>> {
        let mut state = self.state.lock();
        let now = Instant::now();
        let queue = state.queue_mut(queue)?;
        let max_delivery_count = queue.description.max_delivery_count;

        loop {
            let Some(index) = queue.messages.iter().position(|m| m.locked_until <= now) else {
                return Ok(None);
            };
            // The broker dead-letters on its own once the limit is exceeded.
            if queue.messages[index].delivery_count >= max_delivery_count {
                let message = queue.messages.remove(index);
                queue
                    .dead_letters
                    .push((message.envelope, "MaxDeliveryCountExceeded".to_string()));
                continue;
            }

            let message = &mut queue.messages[index];
            let lock_token = uuid::Uuid::new_v4().to_string();
            message.delivery_count += 1;
            message.lock_token = Some(lock_token.clone());
            message.locked_until = now + lock_duration;
            return Ok(Some(LockedMessage {
                lock_token,
                delivery_count: message.delivery_count,
                envelope: message.envelope.clone(),
            }));
        }
    }

    async fn complete(&self, queue: &str, lock_token: &str) -> Result<()> {
        let mut state = self.state.lock();
        let queue = state.queue_mut(queue)?;
        let index = queue.lock_position(lock_token, Instant::now())?;
        queue.messages.remove(index);
        Ok(())
    }

    async fn abandon(&self, queue: &str, lock_token: &str) -> Result<()> {
        let mut state = self.state.lock();
        let now = Instant::now();
        let queue = state.queue_mut(queue)?;
        let index = queue.lock_position(lock_token, now)?;
        let message = &mut queue.messages[index];
        message.lock_token = None;
        message.locked_until = now;
        Ok(())
    }

    async fn dead_letter(&self, queue: &str, lock_token: &str, reason: &str) -> Result<()> {
        let mut state = self.state.lock();
        let queue = state.queue_mut(queue)?;
        let index = queue.lock_position(lock_token, Instant::now())?;
        let message = queue.messages.remove(index);
        queue.dead_letters.push((message.envelope, reason.to_string()));
        Ok(())
    }
}
