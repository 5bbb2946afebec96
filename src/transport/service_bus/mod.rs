//! Service-bus transport: one topic, one forwarding subscription per
//! receiving endpoint.
//!
//! Routing happens in the broker. Every publish and send goes to the topic;
//! each endpoint's subscription admits the declared event types and the
//! commands addressed to its queue, then forwards them into the endpoint's
//! queue. Poison messages go to the queue's dead-letter sub-queue.
//!
//! ```text
//!                 ┌──────────── topic "bus" ─────────────┐
//!   publish/send ─▶  sub "orders"            sub "billing" │
//!                 │  eventMessageFilter      ...           │
//!                 │  commandMessageFilter                  │
//!                 └──────┬───────────────────────────────┘
//!                        ▼ forward
//!                  queue "orders" ──▶ ReceiveLoop
//!                        │
//!                        ▼ dead-letter
//!                  orders/$deadletterqueue
//! ```

mod client;
mod endpoint;
mod memory;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use client::{
    LockedMessage, ManagementClient, QueueDescription, RuleDescription, ServiceBusClient,
    SubscriptionDescription,
};
pub use endpoint::ReceivingEndpoint;
pub use memory::InMemoryServiceBus;

use super::receiver::{Delivery, ReceiveLoop, ReceiveOutcome, ReceiveStats, ReceivingQueue};
use super::retry::{retry_transient, RetryPolicy};
use super::{MessageTransport, PublishOptions, ReceiveOptions, DEBUG_QUEUE_NAME};
use crate::envelope::{Envelope, MESSAGE_TYPE_KEY};
use crate::error::{BusError, Result};
use crate::executor::MessageHandlerExecutor;
use crate::registry::MessageTypeRegistry;

/// Topic used when none is configured.
pub const DEFAULT_TOPIC_NAME: &str = "bus";

/// Service-bus transport configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceBusOptions {
    pub topic_name: String,
    pub receive: ReceiveOptions,
    pub publish: PublishOptions,
    /// Retry policy for every management call.
    pub retry: RetryPolicy,
}

impl Default for ServiceBusOptions {
    fn default() -> Self {
        Self {
            topic_name: DEFAULT_TOPIC_NAME.to_string(),
            receive: ReceiveOptions::default(),
            publish: PublishOptions::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl ServiceBusOptions {
    pub fn with_topic_name(mut self, topic_name: impl Into<String>) -> Self {
        self.topic_name = topic_name.into();
        self
    }

    pub fn with_receive(mut self, receive: ReceiveOptions) -> Self {
        self.receive = receive;
        self
    }

    pub fn with_publish(mut self, publish: PublishOptions) -> Self {
        self.publish = publish;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn queue_description(&self) -> QueueDescription {
        QueueDescription {
            max_delivery_count: self.receive.max_dequeue_count,
            lock_duration: self.receive.lease_duration,
        }
    }
}

/// A peek-lock receiving queue.
pub struct ServiceBusQueue<C> {
    client: Arc<C>,
    name: String,
}

#[async_trait]
impl<C: ServiceBusClient> ReceivingQueue for ServiceBusQueue<C> {
    type Receipt = String;

    fn name(&self) -> &str {
        &self.name
    }

    async fn receive(&self, lease: Duration) -> Result<Option<Delivery<String>>> {
        Ok(self
            .client
            .receive(&self.name, lease)
            .await?
            .map(|message| Delivery {
                receipt: message.lock_token,
                delivery_count: message.delivery_count,
                envelope: Ok(message.envelope),
            }))
    }

    async fn complete(&self, lock_token: &String) -> Result<()> {
        self.client.complete(&self.name, lock_token).await
    }

    async fn release(&self, lock_token: &String) -> Result<()> {
        self.client.abandon(&self.name, lock_token).await
    }

    async fn quarantine(&self, lock_token: &String, reason: &str) -> Result<()> {
        self.client.dead_letter(&self.name, lock_token, reason).await
    }
}

/// Transport over a service bus namespace.
///
/// ## Example
///
/// ```ignore
/// let namespace = InMemoryServiceBus::new();
/// let options = ServiceBusOptions::default()
///     .with_receive(ReceiveOptions::default().with_queue_name("shipping"))
///     .with_publish(PublishOptions::default().with_send_routes(
///         SendRoutes::new().route::<ChargeCard>("billing"),
///     ));
///
/// let transport = ServiceBusTransport::new(namespace.clone(), namespace, registry, options);
/// ```
pub struct ServiceBusTransport<M: ManagementClient, C: ServiceBusClient> {
    management: Arc<M>,
    client: Arc<C>,
    registry: Arc<MessageTypeRegistry>,
    options: ServiceBusOptions,
    receiver: Option<ReceiveLoop<ServiceBusQueue<C>>>,
}

impl<M: ManagementClient, C: ServiceBusClient> ServiceBusTransport<M, C> {
    pub fn new(
        management: M,
        client: C,
        registry: MessageTypeRegistry,
        options: ServiceBusOptions,
    ) -> Self {
        let client = Arc::new(client);
        let registry = Arc::new(registry);
        let receiver = options.receive.receiving_queue().map(|name| {
            ReceiveLoop::new(
                Arc::new(ServiceBusQueue {
                    client: Arc::clone(&client),
                    name,
                }),
                Arc::clone(&registry),
                options.receive.clone(),
            )
        });
        Self {
            management: Arc::new(management),
            client,
            registry,
            options,
            receiver,
        }
    }

    /// Provisioning steps for this transport's receiving endpoint.
    pub fn receiving_endpoint(&self) -> Option<ReceivingEndpoint<M>> {
        let receiver = self.receiver.as_ref()?;
        let event_type_names = self
            .registry
            .event_type_names()
            .into_iter()
            .map(str::to_string)
            .collect();
        Some(
            ReceivingEndpoint::new(
                Arc::clone(&self.management),
                self.options.topic_name.as_str(),
                receiver.queue().name(),
                event_type_names,
            )
            .with_queue_description(self.options.queue_description())
            .with_retry(self.options.retry.clone()),
        )
    }

    pub fn receive_stats(&self) -> Option<ReceiveStats> {
        self.receiver.as_ref().map(ReceiveLoop::stats)
    }

    /// Run one receive tick without the polling timer.
    pub async fn receive_once(&self, executor: &MessageHandlerExecutor) -> Option<ReceiveOutcome> {
        let receiver = self.receiver.as_ref()?;
        Some(receiver.process_next(executor, &CancellationToken::new()).await)
    }

    async fn send_to_topic(&self, envelope: Envelope) -> Result<()> {
        let topic = self.options.topic_name.as_str();
        let message_type = envelope.message_type().unwrap_or_default().to_string();
        match self.client.send_to_topic(topic, envelope.clone()).await {
            Ok(()) => {
                debug!(topic, message_type = %message_type, "sent to topic");
            }
            Err(BusError::NotFound(_)) => {
                warn!(topic, message_type = %message_type, "skipping send to unprovisioned topic");
                return Ok(());
            }
            Err(err) => return Err(err),
        }

        if self.options.publish.mirror_to_debug_queue {
            if let Err(err) = self.client.send_to_queue(DEBUG_QUEUE_NAME, envelope).await {
                warn!(error = %err, "failed to mirror message to debug queue");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl<M: ManagementClient, C: ServiceBusClient> MessageTransport for ServiceBusTransport<M, C> {
    fn is_publish_and_send_only(&self) -> bool {
        self.receiver.is_none()
    }

    async fn initialize_publishing_endpoint(&self) -> Result<()> {
        let management = &*self.management;
        let topic = self.options.topic_name.as_str();
        retry_transient(&self.options.retry, "create or update topic", || {
            management.create_or_update_topic(topic)
        })
        .await?;

        if self.options.publish.mirror_to_debug_queue {
            let description = QueueDescription::default();
            retry_transient(&self.options.retry, "create or update debug queue", || {
                management.create_or_update_queue(DEBUG_QUEUE_NAME, &description)
            })
            .await?;
        }
        info!(topic, "publishing endpoint initialized");
        Ok(())
    }

    async fn initialize_receiving_endpoint(&self) -> Result<()> {
        match self.receiving_endpoint() {
            Some(endpoint) => endpoint.initialize().await,
            None => Ok(()),
        }
    }

    async fn publish(&self, envelope: Envelope) -> Result<()> {
        if envelope.message_type().is_none() {
            return Err(BusError::MissingProperty(MESSAGE_TYPE_KEY));
        }
        self.send_to_topic(envelope).await
    }

    async fn send(&self, envelope: Envelope) -> Result<()> {
        let queue = self.options.publish.destination_for(&envelope).ok_or_else(|| {
            BusError::NoSendRoute(envelope.message_type().unwrap_or_default().to_string())
        })?;
        self.send_to_topic(envelope.with_destination(queue)).await
    }

    async fn start_receiving(&self, executor: MessageHandlerExecutor) -> Result<()> {
        match &self.receiver {
            Some(receiver) => receiver.start(executor),
            None => {
                debug!("no receiving queue configured; not starting receive loop");
                Ok(())
            }
        }
    }

    fn stop_receiving(&self) {
        if let Some(receiver) = &self.receiver {
            receiver.stop();
        }
    }
}
