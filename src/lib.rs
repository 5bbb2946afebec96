//! Transport-agnostic message bus.
//!
//! Application code publishes events and sends commands through [`Bus`];
//! pluggable transports move envelopes over queues and topics. Receiving
//! endpoints poll one message at a time, dispatch it to the single handler
//! registered for its type, and apply a redelivery and poison policy.
//!
//! ## Quick start
//!
//! ```ignore
//! use courier::{Bus, Message, MessageHandlerExecutor, MessageTypeRegistry, ServiceRegistry};
//! use courier::transport::{ReceiveOptions, storage_queue::*};
//!
//! #[derive(Serialize, Deserialize, Message)]
//! struct OrderPlaced { id: String }
//!
//! let handlers = ServiceRegistry::new().add_handler_fn(|event: OrderPlaced| async move {
//!     tracing::info!(order = %event.id, "order placed");
//!     Ok(())
//! });
//!
//! let transport = StorageQueueTransport::new(
//!     InMemoryQueueClient::new(),
//!     MessageTypeRegistry::new().accept::<OrderPlaced>(),
//!     StorageQueueOptions::default()
//!         .with_receive(ReceiveOptions::default().with_queue_name("orders"))
//!         .with_publishing_queues(["orders"]),
//! );
//!
//! let bus = Bus::new(transport, MessageHandlerExecutor::new(handlers));
//! bus.start().await?;
//! bus.publish(&OrderPlaced { id: "o-1".into() }).await?;
//! ```

extern crate self as courier;

mod bus;
mod envelope;
mod error;
pub mod executor;
mod message;
mod registry;
pub mod transport;

pub use bus::Bus;
pub use envelope::{
    Envelope, PayloadCodec, CONTENT_TYPE_KEY, DESTINATION_QUEUE_KEY, MESSAGE_TYPE_KEY,
};
pub use error::{BusError, HandlerError, Result};
pub use executor::{
    handler_fn, DependencyResolver, ExceptionHook, HandlingOutcome, MessageHandler,
    MessageHandlerExecutor, MessageHandlingFailed, ResolverScope, ServiceKey, ServiceRegistry,
};
pub use message::{AnyMessage, Message, MessageKind};
pub use registry::MessageTypeRegistry;
pub use transport::{MessageTransport, PublishOptions, ReceiveOptions, RetryPolicy, SendRoutes};

// Derive macro; shares the name of the trait it implements.
pub use courier_macros::Message;
