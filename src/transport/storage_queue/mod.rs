//! Storage-queue transport: one queue per receiving endpoint.
//!
//! There is no broker-side routing. Each receiving queue advertises the event
//! type names it accepts in its `MessageType` metadata (comma-delimited), and
//! publishers fan out by reading that metadata fresh on every publish.
//! Commands go straight to the queue routed for their type.
//!
//! Queues used by an endpoint named `orders`:
//!
//! ```text
//! orders          receiving queue, metadata MessageType=OrderPlaced,OrderPaid
//! orders-poison   quarantine for messages that exhausted their deliveries
//! debug           optional mirror of everything published or sent
//! ```

mod client;
mod memory;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use client::{QueueClient, QueueMessage};
pub use memory::InMemoryQueueClient;

use super::receiver::{Delivery, ReceiveLoop, ReceiveOutcome, ReceiveStats, ReceivingQueue};
use super::retry::{retry_transient, RetryPolicy};
use super::{
    MessageTransport, PublishOptions, ReceiveOptions, DEBUG_QUEUE_NAME, POISON_QUEUE_SUFFIX,
};
use crate::envelope::{Envelope, MESSAGE_TYPE_KEY};
use crate::error::{BusError, Result};
use crate::executor::MessageHandlerExecutor;
use crate::registry::MessageTypeRegistry;

/// Storage-queue transport configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageQueueOptions {
    pub receive: ReceiveOptions,
    pub publish: PublishOptions,
    /// Queues considered on every publish.
    pub publishing_queues: Vec<String>,
    /// Retry policy for queue creation and metadata writes.
    pub retry: RetryPolicy,
}

impl StorageQueueOptions {
    pub fn with_receive(mut self, receive: ReceiveOptions) -> Self {
        self.receive = receive;
        self
    }

    pub fn with_publish(mut self, publish: PublishOptions) -> Self {
        self.publish = publish;
        self
    }

    pub fn with_publishing_queues<I, S>(mut self, queues: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.publishing_queues = queues.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// A receiving queue and its poison queue.
pub struct StorageQueue<C> {
    client: Arc<C>,
    name: String,
    poison_name: String,
}

impl<C: QueueClient> StorageQueue<C> {
    fn new(client: Arc<C>, name: String) -> Self {
        let poison_name = format!("{}{}", name, POISON_QUEUE_SUFFIX);
        Self {
            client,
            name,
            poison_name,
        }
    }

    pub fn poison_name(&self) -> &str {
        &self.poison_name
    }
}

#[async_trait]
impl<C: QueueClient> ReceivingQueue for StorageQueue<C> {
    type Receipt = QueueMessage;

    fn name(&self) -> &str {
        &self.name
    }

    async fn receive(&self, lease: Duration) -> Result<Option<Delivery<QueueMessage>>> {
        let Some(message) = self.client.get_message(&self.name, lease).await? else {
            return Ok(None);
        };
        Ok(Some(Delivery {
            delivery_count: message.dequeue_count,
            envelope: Envelope::from_wire(&message.content),
            receipt: message,
        }))
    }

    async fn complete(&self, receipt: &QueueMessage) -> Result<()> {
        self.client
            .delete_message(&self.name, &receipt.id, &receipt.pop_receipt)
            .await
    }

    async fn release(&self, receipt: &QueueMessage) -> Result<()> {
        self.client
            .update_visibility(&self.name, &receipt.id, &receipt.pop_receipt, Duration::ZERO)
            .await
            .map(|_| ())
    }

    // Append first, then delete. A crash in between leaves a duplicate in the
    // poison queue rather than losing the message.
    async fn quarantine(&self, receipt: &QueueMessage, reason: &str) -> Result<()> {
        self.client
            .add_message(&self.poison_name, receipt.content.clone())
            .await?;
        self.client
            .delete_message(&self.name, &receipt.id, &receipt.pop_receipt)
            .await?;
        debug!(
            queue = %self.name,
            poison_queue = %self.poison_name,
            message_id = %receipt.id,
            reason,
            "moved message to poison queue"
        );
        Ok(())
    }
}

/// Transport over a storage-queue service.
///
/// ## Example
///
/// ```ignore
/// let registry = MessageTypeRegistry::new().accept::<OrderPlaced>().accept::<ShipOrder>();
/// let options = StorageQueueOptions::default()
///     .with_receive(ReceiveOptions::default().with_queue_name("shipping"))
///     .with_publishing_queues(["shipping", "billing"]);
///
/// let transport = StorageQueueTransport::new(client, registry, options);
/// transport.initialize_receiving_endpoint().await?;
/// transport.start_receiving(executor).await?;
/// ```
pub struct StorageQueueTransport<C: QueueClient> {
    client: Arc<C>,
    registry: Arc<MessageTypeRegistry>,
    options: StorageQueueOptions,
    receiver: Option<ReceiveLoop<StorageQueue<C>>>,
}

impl<C: QueueClient> StorageQueueTransport<C> {
    pub fn new(client: C, registry: MessageTypeRegistry, options: StorageQueueOptions) -> Self {
        let client = Arc::new(client);
        let registry = Arc::new(registry);
        let receiver = options.receive.receiving_queue().map(|name| {
            ReceiveLoop::new(
                Arc::new(StorageQueue::new(Arc::clone(&client), name)),
                Arc::clone(&registry),
                options.receive.clone(),
            )
        });
        Self {
            client,
            registry,
            options,
            receiver,
        }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    /// Counters of the receive loop; `None` for send-only transports.
    pub fn receive_stats(&self) -> Option<ReceiveStats> {
        self.receiver.as_ref().map(ReceiveLoop::stats)
    }

    /// Run one receive tick without the polling timer.
    pub async fn receive_once(
        &self,
        executor: &MessageHandlerExecutor,
    ) -> Option<ReceiveOutcome> {
        let receiver = self.receiver.as_ref()?;
        Some(receiver.process_next(executor, &CancellationToken::new()).await)
    }

    async fn create_queue(&self, queue: &str) -> Result<()> {
        let created = retry_transient(&self.options.retry, "create queue", || {
            self.client.create_if_not_exists(queue)
        })
        .await?;
        if created {
            info!(queue, "created queue");
        }
        Ok(())
    }

    async fn accepted_types(&self, queue: &str) -> Result<Option<String>> {
        match self.client.fetch_metadata(queue).await {
            Ok(mut metadata) => Ok(metadata.remove(MESSAGE_TYPE_KEY)),
            Err(BusError::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn mirror_to_debug_queue(&self, body: &str) {
        if !self.options.publish.mirror_to_debug_queue {
            return;
        }
        if let Err(err) = self
            .client
            .add_message(DEBUG_QUEUE_NAME, body.to_string())
            .await
        {
            warn!(error = %err, "failed to mirror message to debug queue");
        }
    }
}

#[async_trait]
impl<C: QueueClient> MessageTransport for StorageQueueTransport<C> {
    fn is_publish_and_send_only(&self) -> bool {
        self.receiver.is_none()
    }

    async fn initialize_publishing_endpoint(&self) -> Result<()> {
        if self.options.publish.mirror_to_debug_queue {
            self.create_queue(DEBUG_QUEUE_NAME).await?;
        }
        Ok(())
    }

    async fn initialize_receiving_endpoint(&self) -> Result<()> {
        let Some(receiver) = &self.receiver else {
            return Ok(());
        };
        let queue = receiver.queue();
        self.create_queue(queue.name()).await?;
        self.create_queue(queue.poison_name()).await?;

        let accepted = self.registry.event_type_names().join(",");
        let mut metadata = BTreeMap::new();
        metadata.insert(MESSAGE_TYPE_KEY.to_string(), accepted.clone());
        retry_transient(&self.options.retry, "set queue metadata", || {
            self.client.set_metadata(queue.name(), metadata.clone())
        })
        .await?;

        info!(queue = queue.name(), accepted_types = %accepted, "receiving endpoint initialized");
        Ok(())
    }

    async fn publish(&self, envelope: Envelope) -> Result<()> {
        let message_type = envelope
            .message_type()
            .ok_or(BusError::MissingProperty(MESSAGE_TYPE_KEY))?
            .to_string();
        let body = envelope.to_wire()?;

        for queue in &self.options.publishing_queues {
            let queue = queue.to_lowercase();
            if !self.client.exists(&queue).await? {
                warn!(queue = %queue, message_type = %message_type, "skipping unprovisioned queue");
                continue;
            }
            let Some(accepted) = self.accepted_types(&queue).await? else {
                debug!(queue = %queue, "queue advertises no message types");
                continue;
            };
            let accepts = accepted
                .split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .any(|name| name == message_type);
            if accepts {
                self.client.add_message(&queue, body.clone()).await?;
                debug!(queue = %queue, message_type = %message_type, "published");
            }
        }

        self.mirror_to_debug_queue(&body).await;
        Ok(())
    }

    async fn send(&self, envelope: Envelope) -> Result<()> {
        let message_type = envelope.message_type().unwrap_or_default().to_string();
        let queue = self
            .options
            .publish
            .destination_for(&envelope)
            .ok_or_else(|| BusError::NoSendRoute(message_type.clone()))?;

        if !self.client.exists(&queue).await? {
            warn!(queue = %queue, message_type = %message_type, "skipping send to unprovisioned queue");
            return Ok(());
        }

        let body = envelope.with_destination(queue.as_str()).to_wire()?;
        self.client.add_message(&queue, body.clone()).await?;
        debug!(queue = %queue, message_type = %message_type, "sent");

        self.mirror_to_debug_queue(&body).await;
        Ok(())
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
