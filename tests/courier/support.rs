//! Test domain: a fruit stand.
//!
//! - `Apple` is a command handled by a handler type registered directly.
//! - `Banana` is an event handled by a closure (indirect registration).
//! - `RottenApple` is an event whose handler always fails.
//! - `Cherry` is an event nobody handles.
//! - `Stall` is an event whose handler never finishes.

#![allow(dead_code)]

use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use courier::{
    DependencyResolver, HandlerError, Message, MessageHandler, MessageHandlerExecutor,
    MessageHandlingFailed, MessageTypeRegistry, ResolverScope, ServiceKey, ServiceRegistry,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("courier=debug")),
        )
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Message)]
#[message(command)]
pub struct Apple {
    pub variety: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Message)]
pub struct Banana {
    pub ripeness: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Message)]
pub struct RottenApple {
    pub days_old: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Message)]
pub struct Cherry;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Message)]
pub struct Stall;

/// Shared log of what the handlers saw.
#[derive(Clone, Default)]
pub struct Ledger {
    entries: Arc<Mutex<Vec<String>>>,
}

impl Ledger {
    pub fn record(&self, entry: impl Into<String>) {
        self.entries.lock().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().clone()
    }
}

pub struct AppleHandler {
    ledger: Ledger,
}

#[async_trait]
impl MessageHandler<Apple> for AppleHandler {
    async fn handle(&self, message: Apple) -> Result<(), HandlerError> {
        self.ledger.record(format!("apple:{}", message.variety));
        Ok(())
    }
}

pub struct RottenAppleHandler;

#[async_trait]
impl MessageHandler<RottenApple> for RottenAppleHandler {
    async fn handle(&self, _message: RottenApple) -> Result<(), HandlerError> {
        Err(HandlerError::rejected("Rotten Apple"))
    }
}

/// Handlers for every fruit except `Cherry`.
pub fn handlers(ledger: &Ledger) -> ServiceRegistry {
    let apples = ledger.clone();
    let bananas = ledger.clone();
    ServiceRegistry::new()
        .add_handler::<Apple, _>(move || AppleHandler {
            ledger: apples.clone(),
        })
        .add_handler_fn(move |banana: Banana| {
            let ledger = bananas.clone();
            async move {
                ledger.record(format!("banana:{}", banana.ripeness));
                Ok(())
            }
        })
        .add_handler::<RottenApple, _>(|| RottenAppleHandler)
        .add_handler_fn(|_: Stall| async {
            std::future::pending::<()>().await;
            Ok(())
        })
}

/// Every fruit type, as one endpoint's acceptable set.
pub fn all_fruit() -> MessageTypeRegistry {
    MessageTypeRegistry::new()
        .accept::<Apple>()
        .accept::<Banana>()
        .accept::<RottenApple>()
        .accept::<Cherry>()
        .accept::<Stall>()
}

/// Failures seen by the exception hook.
#[derive(Clone, Default)]
pub struct Failures {
    seen: Arc<Mutex<Vec<MessageHandlingFailed>>>,
}

impl Failures {
    pub fn all(&self) -> Vec<MessageHandlingFailed> {
        self.seen.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }
}

/// Executor over [`handlers`] whose hook records into `Failures`.
pub fn executor(ledger: &Ledger) -> (MessageHandlerExecutor, Failures) {
    let failures = Failures::default();
    let sink = failures.clone();
    let executor = MessageHandlerExecutor::new(handlers(ledger)).with_exception_hook(
        move |failed: MessageHandlingFailed| {
            let sink = sink.clone();
            async move { sink.seen.lock().push(failed) }
        },
    );
    (executor, failures)
}

/// Resolver wrapper that counts scope disposals.
pub struct CountingResolver {
    inner: ServiceRegistry,
    disposals: Arc<AtomicUsize>,
}

impl CountingResolver {
    pub fn new(inner: ServiceRegistry) -> (Self, Arc<AtomicUsize>) {
        let disposals = Arc::new(AtomicUsize::new(0));
        (
            Self {
                inner,
                disposals: Arc::clone(&disposals),
            },
            disposals,
        )
    }
}

struct CountingScope {
    inner: Box<dyn ResolverScope>,
    disposals: Arc<AtomicUsize>,
}

impl DependencyResolver for CountingResolver {
    fn create_scope(&self) -> Box<dyn ResolverScope> {
        Box::new(CountingScope {
            inner: self.inner.create_scope(),
            disposals: Arc::clone(&self.disposals),
        })
    }
}

impl ResolverScope for CountingScope {
    fn resolve(&mut self, key: &ServiceKey) -> Option<Arc<dyn Any + Send + Sync>> {
        self.inner.resolve(key)
    }

    fn dispose(&mut self) {
        self.disposals.fetch_add(1, Ordering::SeqCst);
        self.inner.dispose();
    }
}

pub fn disposals(counter: &AtomicUsize) -> usize {
    counter.load(Ordering::SeqCst)
}
