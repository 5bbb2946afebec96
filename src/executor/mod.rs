//! Handler execution: resolve the single handler registered for a message
//! type inside a fresh resolver scope, invoke it, and capture its failures.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 MessageHandlerExecutor                       │
//! │  execute(message, cancel) -> Handled | HandlerFailed | ...  │
//! └─────────────────────────────────────────────────────────────┘
//!          │                                   │
//!          ▼                                   ▼
//! ┌─────────────────────────┐      ┌──────────────────────────┐
//! │   DependencyResolver    │      │      ExceptionHook       │
//! │ create_scope() -> scope │      │ (handler, error) -> ()   │
//! └─────────────────────────┘      └──────────────────────────┘
//!          │
//!          ▼
//! ┌─────────────────────────┐
//! │ ResolverScope            │
//! │ resolve(key) / dispose() │
//! └─────────────────────────┘
//! ```

mod executor;
mod handler;
mod resolver;

pub use executor::{
    ExceptionHook, HandlingOutcome, MessageHandlerExecutor, MessageHandlingFailed,
};
pub use handler::{handler_fn, FnHandler, MessageHandler};
pub use resolver::{DependencyResolver, ResolverScope, ServiceKey, ServiceRegistry};
