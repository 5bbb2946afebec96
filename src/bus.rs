//! The application-facing bus.

use tracing::info;

use crate::envelope::{Envelope, PayloadCodec};
use crate::error::{BusError, Result};
use crate::executor::MessageHandlerExecutor;
use crate::message::{Message, MessageKind};
use crate::transport::MessageTransport;

/// Message bus for one service: typed publish and send over a transport,
/// plus the receive loop that feeds the handler executor.
///
/// ## Example
///
/// ```ignore
/// let bus = Bus::new(transport, MessageHandlerExecutor::new(handlers));
/// bus.start().await?;
///
/// bus.publish(&OrderPlaced { id: "o-1".into() }).await?;
/// bus.send(&ChargeCard { order: "o-1".into(), cents: 1999 }).await?;
///
/// bus.stop();
/// ```
pub struct Bus<T: MessageTransport> {
    transport: T,
    executor: MessageHandlerExecutor,
    codec: PayloadCodec,
}

impl<T: MessageTransport> Bus<T> {
    pub fn new(transport: T, executor: MessageHandlerExecutor) -> Self {
        Self {
            transport,
            executor,
            codec: PayloadCodec::default(),
        }
    }

    /// Payload codec for outgoing messages.
    pub fn with_codec(mut self, codec: PayloadCodec) -> Self {
        self.codec = codec;
        self
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn executor(&self) -> &MessageHandlerExecutor {
        &self.executor
    }

    /// Initialize the endpoints and start receiving.
    ///
    /// Safe to call again after [`Bus::stop`]; initialization is idempotent.
    pub async fn start(&self) -> Result<()> {
        self.transport.initialize_publishing_endpoint().await?;
        if self.transport.is_publish_and_send_only() {
            info!("bus started (publish and send only)");
            return Ok(());
        }
        self.transport.initialize_receiving_endpoint().await?;
        self.transport.start_receiving(self.executor.clone()).await?;
        info!("bus started");
        Ok(())
    }

    /// Stop receiving. In-flight handling is cancelled, not drained.
    pub fn stop(&self) {
        self.transport.stop_receiving();
        info!("bus stopped");
    }

    /// Publish an event to every endpoint that accepts its type.
    pub async fn publish<M: Message>(&self, message: &M) -> Result<()> {
        expect_kind::<M>(MessageKind::Event)?;
        let envelope = Envelope::wrap(message, self.codec)?;
        self.transport.publish(envelope).await
    }

    /// Send a command to the queue routed for its type.
    pub async fn send<M: Message>(&self, message: &M) -> Result<()> {
        expect_kind::<M>(MessageKind::Command)?;
        let envelope = Envelope::wrap(message, self.codec)?;
        self.transport.send(envelope).await
    }
}

fn expect_kind<M: Message>(expected: MessageKind) -> Result<()> {
    if M::KIND == expected {
        Ok(())
    } else {
        Err(BusError::WrongMessageKind {
            message_type: M::TYPE_NAME,
            expected,
        })
    }
}
