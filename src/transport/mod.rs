//! Transports move envelopes over concrete infrastructure.
//!
//! Every transport offers the same capability set (initialize publishing,
//! initialize receiving, publish, send, start and stop receiving) and the
//! same guarantees: content-based routing, at-least-once polling receive,
//! immediate redelivery below the dequeue limit, and poison quarantine at it.
//!
//! ## Architecture
//!
//! ```text
//!   Bus ──publish/send──▶ MessageTransport ──▶ infrastructure client
//!                              │
//!                        start_receiving
//!                              ▼
//!                   ReceiveLoop<ReceivingQueue>
//!                   tick ─▶ receive ─▶ unwrap ─▶ MessageHandlerExecutor
//!                                 │
//!                   complete | release | quarantine
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::envelope::Envelope;
use crate::error::Result;
use crate::executor::MessageHandlerExecutor;
use crate::message::Message;

pub mod filter;
pub mod receiver;
pub mod retry;
#[cfg(feature = "service-bus")]
pub mod service_bus;
#[cfg(feature = "storage-queue")]
pub mod storage_queue;

pub use filter::FilterRule;
pub use receiver::{Delivery, ReceiveLoop, ReceiveOutcome, ReceiveStats, ReceivingQueue};
pub use retry::{retry_transient, RetryPolicy};

/// Suffix of the quarantine queue paired with a receiving queue.
pub const POISON_QUEUE_SUFFIX: &str = "-poison";
/// Queue that mirrors every published or sent envelope when enabled.
pub const DEBUG_QUEUE_NAME: &str = "debug";

/// A concrete infrastructure binding.
///
/// Transports own their receiving endpoint's state machine; `start_receiving`
/// and `stop_receiving` may be called from different tasks.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    /// True when no receiving queue is configured.
    fn is_publish_and_send_only(&self) -> bool;

    /// Idempotent setup for the publishing side.
    async fn initialize_publishing_endpoint(&self) -> Result<()>;

    /// Idempotent setup for the receiving side. A no-op for
    /// publish-and-send-only transports.
    async fn initialize_receiving_endpoint(&self) -> Result<()>;

    /// Deliver an event to every endpoint that accepts its type.
    async fn publish(&self, envelope: Envelope) -> Result<()>;

    /// Deliver a command to the single queue routed for its type.
    async fn send(&self, envelope: Envelope) -> Result<()>;

    /// Begin polling the receiving queue.
    async fn start_receiving(&self, executor: MessageHandlerExecutor) -> Result<()>;

    /// Stop polling and cancel in-flight handling. Does not wait for drain.
    fn stop_receiving(&self);
}

/// Receiving endpoint settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiveOptions {
    /// Receiving queue. `None` makes the transport publish-and-send-only.
    pub queue_name: Option<String>,
    /// Deliveries allowed before a failing message is quarantined.
    pub max_dequeue_count: u32,
    /// Visibility timeout (or lock duration) taken on each received message.
    pub lease_duration: Duration,
    /// Fixed interval between receive ticks.
    pub poll_interval: Duration,
}

impl Default for ReceiveOptions {
    fn default() -> Self {
        Self {
            queue_name: None,
            max_dequeue_count: 5,
            lease_duration: Duration::from_secs(30),
            poll_interval: Duration::from_secs(5),
        }
    }
}

impl ReceiveOptions {
    pub fn with_queue_name(mut self, queue_name: impl Into<String>) -> Self {
        self.queue_name = Some(queue_name.into());
        self
    }

    pub fn with_max_dequeue_count(mut self, max_dequeue_count: u32) -> Self {
        self.max_dequeue_count = max_dequeue_count;
        self
    }

    pub fn with_lease_duration(mut self, lease_duration: Duration) -> Self {
        self.lease_duration = lease_duration;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Lower-cased receiving queue name; `None` when unset or blank.
    pub fn receiving_queue(&self) -> Option<String> {
        self.queue_name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_lowercase)
    }
}

/// Destination queue per command type name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SendRoutes {
    routes: BTreeMap<String, String>,
}

impl SendRoutes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route commands of type `M` to `queue`.
    pub fn route<M: Message>(self, queue: impl Into<String>) -> Self {
        self.route_name(M::TYPE_NAME, queue)
    }

    /// Route a type name to `queue`.
    pub fn route_name(mut self, type_name: impl Into<String>, queue: impl Into<String>) -> Self {
        self.routes.insert(type_name.into(), queue.into());
        self
    }

    /// Destination configured for a type name.
    pub fn queue_for(&self, type_name: &str) -> Option<&str> {
        self.routes.get(type_name).map(String::as_str)
    }
}

/// Publishing and sending settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishOptions {
    /// Mirror every publish and send to the `debug` queue.
    pub mirror_to_debug_queue: bool,
    pub send_routes: SendRoutes,
}

impl PublishOptions {
    pub fn with_debug_queue(mut self, enabled: bool) -> Self {
        self.mirror_to_debug_queue = enabled;
        self
    }

    pub fn with_send_routes(mut self, send_routes: SendRoutes) -> Self {
        self.send_routes = send_routes;
        self
    }

    /// Destination for an envelope: its explicit destination property, else
    /// the configured route for its type.
    pub fn destination_for(&self, envelope: &Envelope) -> Option<String> {
        envelope
            .destination()
            .or_else(|| {
                envelope
                    .message_type()
                    .and_then(|type_name| self.send_routes.queue_for(type_name))
            })
            .map(str::to_lowercase)
    }
}
