//! Application messages and their wire identity.

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::executor::{HandlingOutcome, MessageHandlerExecutor};

/// How a message is routed.
///
/// Events fan out to every endpoint that declares interest in the type name.
/// Commands are addressed to exactly one destination queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    Event,
    Command,
}

/// An application-defined payload that can travel over the bus.
///
/// `TYPE_NAME` is the dispatch and routing key. It is carried out-of-band as
/// the `MessageType` envelope property, so it must stay stable across
/// deployments. Usually implemented with `#[derive(Message)]`.
pub trait Message: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stable type name carried on the wire.
    const TYPE_NAME: &'static str;
    /// Routing kind.
    const KIND: MessageKind;
}

/// A decoded message whose concrete type has been erased.
///
/// Produced by [`MessageTypeRegistry::unwrap`](crate::MessageTypeRegistry::unwrap)
/// so the receive loop can dispatch without knowing the type statically.
pub trait AnyMessage: Send {
    /// Type name of the underlying message.
    fn type_name(&self) -> &'static str;

    /// Hand the message to the executor.
    fn dispatch(
        self: Box<Self>,
        executor: MessageHandlerExecutor,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, Result<HandlingOutcome>>;
}

impl<M: Message> AnyMessage for M {
    fn type_name(&self) -> &'static str {
        M::TYPE_NAME
    }

    fn dispatch(
        self: Box<Self>,
        executor: MessageHandlerExecutor,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, Result<HandlingOutcome>> {
        Box::pin(async move { executor.execute(*self, &cancel).await })
    }
}
