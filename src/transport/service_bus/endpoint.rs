use std::sync::Arc;

use tracing::{debug, info};

use super::client::{ManagementClient, QueueDescription, RuleDescription, SubscriptionDescription};
use crate::error::{BusError, Result};
use crate::transport::filter::{
    FilterRule, COMMAND_FILTER_NAME, DEFAULT_RULE_NAME, EVENT_FILTER_NAME,
};
use crate::transport::retry::{retry_transient, RetryPolicy};

/// Provisions a receiving endpoint on a topic.
///
/// The endpoint is a queue plus a subscription of the same name that forwards
/// into it. The subscription carries exactly two rules:
///
/// - `eventMessageFilter`: the declared event type names, or a never-matching
///   filter when there are none,
/// - `commandMessageFilter`: `DestinationQueue` equal to the queue name.
///
/// Every step is create-or-update and wrapped in the transient retry. Steps
/// run strictly one after another; concurrent rule mutations on one
/// subscription are rejected by the broker.
pub struct ReceivingEndpoint<M> {
    management: Arc<M>,
    topic: String,
    queue: String,
    description: QueueDescription,
    event_type_names: Vec<String>,
    retry: RetryPolicy,
}

impl<M: ManagementClient> ReceivingEndpoint<M> {
    pub fn new(
        management: Arc<M>,
        topic: impl Into<String>,
        queue: impl Into<String>,
        event_type_names: Vec<String>,
    ) -> Self {
        Self {
            management,
            topic: topic.into(),
            queue: queue.into(),
            description: QueueDescription::default(),
            event_type_names,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_queue_description(mut self, description: QueueDescription) -> Self {
        self.description = description;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// The two rules this endpoint installs.
    pub fn rules(&self) -> [RuleDescription; 2] {
        [
            RuleDescription::new(
                EVENT_FILTER_NAME,
                FilterRule::events(self.event_type_names.iter().cloned()),
            ),
            RuleDescription::new(COMMAND_FILTER_NAME, FilterRule::commands_for(self.queue.clone())),
        ]
    }

    pub async fn initialize(&self) -> Result<()> {
        let management = &*self.management;
        let (topic, queue) = (self.topic.as_str(), self.queue.as_str());

        retry_transient(&self.retry, "create or update queue", || {
            management.create_or_update_queue(queue, &self.description)
        })
        .await?;

        let subscription = SubscriptionDescription {
            forward_to: Some(queue.to_string()),
        };
        retry_transient(&self.retry, "create or update subscription", || {
            management.create_or_update_subscription(topic, queue, &subscription)
        })
        .await?;

        let removed = retry_transient(&self.retry, "delete default rule", || {
            management.delete_rule(topic, queue, DEFAULT_RULE_NAME)
        })
        .await;
        match removed {
            Ok(()) => debug!(topic, subscription = queue, "removed default rule"),
            Err(BusError::NotFound(_)) => {}
            Err(err) => return Err(err),
        }

        for rule in self.rules() {
            retry_transient(&self.retry, "create or update rule", || {
                management.create_or_update_rule(topic, queue, &rule)
            })
            .await?;
            debug!(
                topic,
                subscription = queue,
                rule = %rule.name,
                filter = %rule.filter.to_sql(),
                "installed rule"
            );
        }

        info!(
            topic,
            queue,
            event_types = self.event_type_names.len(),
            "receiving endpoint initialized"
        );
        Ok(())
    }
}
