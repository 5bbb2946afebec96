use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;

use crate::error::HandlerError;
use crate::message::Message;

/// Handles messages of one type.
///
/// Exactly one handler is resolved per message type; there is no multicast.
///
/// ## Example
///
/// ```ignore
/// struct ShipOrderHandler { warehouse: Arc<Warehouse> }
///
/// #[async_trait]
/// impl MessageHandler<ShipOrder> for ShipOrderHandler {
///     async fn handle(&self, message: ShipOrder) -> Result<(), HandlerError> {
///         self.warehouse.ship(&message.order_id).await.map_err(HandlerError::other)
///     }
/// }
/// ```
#[async_trait]
pub trait MessageHandler<M: Message>: Send + Sync {
    async fn handle(&self, message: M) -> Result<(), HandlerError>;

    /// Name reported to the exception hook.
    fn handler_type(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// A handler backed by an async closure.
///
/// Created with [`handler_fn`]; lets a plain function stand in for a handler
/// type.
pub struct FnHandler<M, F> {
    f: F,
    _message: PhantomData<fn(M)>,
}

/// Adapt an async closure into a [`MessageHandler`].
pub fn handler_fn<M, F, Fut>(f: F) -> FnHandler<M, F>
where
    M: Message,
    F: Fn(M) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    FnHandler {
        f,
        _message: PhantomData,
    }
}

#[async_trait]
impl<M, F, Fut> MessageHandler<M> for FnHandler<M, F>
where
    M: Message,
    F: Fn(M) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, message: M) -> Result<(), HandlerError> {
        (self.f)(message).await
    }

    fn handler_type(&self) -> &'static str {
        std::any::type_name::<F>()
    }
}
