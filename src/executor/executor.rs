use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::handler::MessageHandler;
use super::resolver::{resolve_handler, DependencyResolver, ResolverScope};
use crate::error::{BusError, HandlerError, Result};
use crate::message::Message;

/// Async callback that observes handler failures.
pub type ExceptionHook =
    Arc<dyn Fn(MessageHandlingFailed) -> BoxFuture<'static, ()> + Send + Sync>;

/// Report handed to the exception hook.
#[derive(Debug, Clone)]
pub struct MessageHandlingFailed {
    /// Name of the handler that failed.
    pub handler_type: &'static str,
    /// Type name of the message being handled.
    pub message_type: &'static str,
    /// The error the handler returned (or the captured panic).
    pub error: Arc<HandlerError>,
}

/// Result of one handling attempt that reached a handler.
#[derive(Debug, Clone)]
pub enum HandlingOutcome {
    /// The handler ran to completion.
    Handled,
    /// The handler returned an error or panicked. The hook has already seen it.
    HandlerFailed(Arc<HandlerError>),
    /// The cancellation token fired before the handler finished.
    Cancelled,
}

impl HandlingOutcome {
    pub fn is_handled(&self) -> bool {
        matches!(self, HandlingOutcome::Handled)
    }
}

/// Disposes the wrapped scope exactly once, on whichever path exits first.
struct ScopeGuard {
    scope: Box<dyn ResolverScope>,
    disposed: bool,
}

impl ScopeGuard {
    fn new(scope: Box<dyn ResolverScope>) -> Self {
        Self {
            scope,
            disposed: false,
        }
    }

    fn resolve<M: Message>(&mut self) -> Option<Arc<dyn MessageHandler<M>>> {
        resolve_handler::<M>(self.scope.as_mut())
    }

    fn dispose(&mut self) {
        if !self.disposed {
            self.disposed = true;
            self.scope.dispose();
        }
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Resolves and invokes the single handler for a message.
///
/// Each call opens a fresh resolver scope, resolves
/// `dyn MessageHandler<M>` inside it, runs the handler and releases the
/// scope. Handler errors and panics never reach the caller as `Err`; they are
/// passed to the exception hook and returned as
/// [`HandlingOutcome::HandlerFailed`]. Only configuration errors (no handler
/// registered) surface as `Err`.
///
/// Cheap to clone; clones share the resolver and hook.
///
/// ## Example
///
/// ```ignore
/// let executor = MessageHandlerExecutor::new(registry)
///     .with_exception_hook(|failed| async move {
///         tracing::error!(handler = failed.handler_type, error = %failed.error, "handler failed");
///     });
///
/// let outcome = executor.execute(ShipOrder { id }, &CancellationToken::new()).await?;
/// ```
#[derive(Clone)]
pub struct MessageHandlerExecutor {
    resolver: Arc<dyn DependencyResolver>,
    hook: ExceptionHook,
}

impl MessageHandlerExecutor {
    pub fn new(resolver: impl DependencyResolver + 'static) -> Self {
        Self::from_shared(Arc::new(resolver))
    }

    /// Build from a resolver that is shared with other components.
    pub fn from_shared(resolver: Arc<dyn DependencyResolver>) -> Self {
        Self {
            resolver,
            hook: Arc::new(|_| futures::future::ready(()).boxed()),
        }
    }

    /// Install the hook that observes handler failures.
    pub fn with_exception_hook<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(MessageHandlingFailed) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.hook = Arc::new(move |failed| hook(failed).boxed());
        self
    }

    /// Handle one message.
    ///
    /// When `cancel` fires first, the scope is released, the handler future
    /// is dropped and `Cancelled` is returned.
    pub async fn execute<M: Message>(
        &self,
        message: M,
        cancel: &CancellationToken,
    ) -> Result<HandlingOutcome> {
        let mut scope = ScopeGuard::new(self.resolver.create_scope());

        let Some(handler) = scope.resolve::<M>() else {
            let handler_type = std::any::type_name::<dyn MessageHandler<M>>();
            error!(
                message_type = M::TYPE_NAME,
                handler_type, "no handler registered for message type"
            );
            return Err(BusError::HandlerNotRegistered {
                message_type: M::TYPE_NAME,
                handler_type,
            });
        };
        let handler_type = handler.handler_type();

        let invocation = AssertUnwindSafe(handler.handle(message)).catch_unwind();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                scope.dispose();
                debug!(message_type = M::TYPE_NAME, handler_type, "handling cancelled");
                return Ok(HandlingOutcome::Cancelled);
            }
            result = invocation => result,
        };
        scope.dispose();

        let error = match result {
            Ok(Ok(())) => {
                debug!(message_type = M::TYPE_NAME, handler_type, "message handled");
                return Ok(HandlingOutcome::Handled);
            }
            Ok(Err(err)) => Arc::new(err),
            Err(panic) => Arc::new(HandlerError::Panicked(panic_message(panic))),
        };

        warn!(
            message_type = M::TYPE_NAME,
            handler_type,
            error = %error,
            "handler failed"
        );
        let failed = MessageHandlingFailed {
            handler_type,
            message_type: M::TYPE_NAME,
            error: Arc::clone(&error),
        };
        // Host hook panics must not unwind the receive loop.
        let report = AssertUnwindSafe(async { (self.hook)(failed).await });
        if let Err(panic) = report.catch_unwind().await {
            error!(
                message_type = M::TYPE_NAME,
                handler_type,
                panic = %panic_message(panic),
                "exception hook panicked"
            );
        }

        Ok(HandlingOutcome::HandlerFailed(error))
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
