//! Dependency resolution for handlers.
//!
//! The executor only depends on the [`DependencyResolver`] /
//! [`ResolverScope`] pair, so any container can sit behind it.
//! [`ServiceRegistry`] is the in-process implementation shipped with the
//! crate.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tracing::trace;

use super::handler::{handler_fn, MessageHandler};
use crate::error::HandlerError;
use crate::message::Message;

/// Identifies a service by type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ServiceKey {
    type_id: TypeId,
    type_name: &'static str,
}

impl ServiceKey {
    /// Key for the service type `T` (usually a trait object).
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

/// Produces resolver scopes.
pub trait DependencyResolver: Send + Sync {
    /// Open a new scope. One scope is used per handling attempt.
    fn create_scope(&self) -> Box<dyn ResolverScope>;
}

/// A resource lifetime boundary for one handler invocation.
pub trait ResolverScope: Send {
    /// Resolve the service registered under `key`.
    ///
    /// Absence (`None`) is distinct from any resolved instance.
    fn resolve(&mut self, key: &ServiceKey) -> Option<Arc<dyn Any + Send + Sync>>;

    /// Release everything resolved in this scope.
    fn dispose(&mut self);
}

/// Resolve the handler for `M` from a scope.
pub(crate) fn resolve_handler<M: Message>(
    scope: &mut dyn ResolverScope,
) -> Option<Arc<dyn MessageHandler<M>>> {
    scope
        .resolve(&ServiceKey::of::<dyn MessageHandler<M>>())?
        .downcast::<Arc<dyn MessageHandler<M>>>()
        .ok()
        .map(|handler| (*handler).clone())
}

type Factory = Arc<dyn Fn() -> Arc<dyn Any + Send + Sync> + Send + Sync>;

/// In-process, scoped service registry.
///
/// Services are registered with factories at startup. Each scope creates an
/// instance lazily on first resolution, reuses it for the rest of the scope,
/// and drops it on dispose.
///
/// ## Example
///
/// ```ignore
/// let registry = ServiceRegistry::new()
///     .add_handler::<ShipOrder, _>(|| ShipOrderHandler::default())
///     .add_handler_fn(|event: OrderPlaced| async move {
///         tracing::info!(order = %event.id, "order placed");
///         Ok(())
///     });
///
/// let executor = MessageHandlerExecutor::new(registry);
/// ```
#[derive(Clone, Default)]
pub struct ServiceRegistry {
    factories: Arc<HashMap<ServiceKey, Factory>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler type for message type `M`.
    pub fn add_handler<M, H>(self, factory: impl Fn() -> H + Send + Sync + 'static) -> Self
    where
        M: Message,
        H: MessageHandler<M> + 'static,
    {
        self.add_factory(ServiceKey::of::<dyn MessageHandler<M>>(), move || {
            let handler: Arc<dyn MessageHandler<M>> = Arc::new(factory());
            Arc::new(handler) as Arc<dyn Any + Send + Sync>
        })
    }

    /// Register an async closure as the handler for message type `M`.
    pub fn add_handler_fn<M, F, Fut>(self, f: F) -> Self
    where
        M: Message,
        F: Fn(M) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.add_handler::<M, _>(move || handler_fn(f.clone()))
    }

    /// Register an arbitrary scoped service.
    pub fn add_scoped<T>(self, factory: impl Fn() -> T + Send + Sync + 'static) -> Self
    where
        T: Send + Sync + 'static,
    {
        self.add_factory(ServiceKey::of::<T>(), move || {
            Arc::new(factory()) as Arc<dyn Any + Send + Sync>
        })
    }

    /// Whether a handler for `M` has been registered.
    pub fn has_handler<M: Message>(&self) -> bool {
        self.factories
            .contains_key(&ServiceKey::of::<dyn MessageHandler<M>>())
    }

    fn add_factory(
        mut self,
        key: ServiceKey,
        factory: impl Fn() -> Arc<dyn Any + Send + Sync> + Send + Sync + 'static,
    ) -> Self {
        Arc::make_mut(&mut self.factories).insert(key, Arc::new(factory));
        self
    }
}

impl DependencyResolver for ServiceRegistry {
    fn create_scope(&self) -> Box<dyn ResolverScope> {
        Box::new(RegistryScope {
            factories: Arc::clone(&self.factories),
            instances: HashMap::new(),
            disposed: false,
        })
    }
}

struct RegistryScope {
    factories: Arc<HashMap<ServiceKey, Factory>>,
    instances: HashMap<ServiceKey, Arc<dyn Any + Send + Sync>>,
    disposed: bool,
}

impl ResolverScope for RegistryScope {
    fn resolve(&mut self, key: &ServiceKey) -> Option<Arc<dyn Any + Send + Sync>> {
        if self.disposed {
            return None;
        }
        if let Some(instance) = self.instances.get(key) {
            return Some(Arc::clone(instance));
        }
        let instance = (self.factories.get(key)?)();
        self.instances.insert(*key, Arc::clone(&instance));
        Some(instance)
    }

    fn dispose(&mut self) {
        if !self.disposed {
            trace!(instances = self.instances.len(), "disposing resolver scope");
            self.instances.clear();
            self.disposed = true;
        }
    }
}
