//! Error types for the bus, its transports and message handlers.

use std::error::Error;

use thiserror::Error;

use crate::message::MessageKind;

/// Result type alias for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors raised by the bus, the handler executor and the transports.
///
/// Variants fall into three groups:
/// - configuration errors (a deployment mismatch, never retried),
/// - transient infrastructure errors (retried with backoff),
/// - everything else the infrastructure can report.
#[derive(Debug, Error)]
pub enum BusError {
    /// No handler was resolved for the message type.
    #[error("the handler {handler_type} for message type {message_type} is not registered")]
    HandlerNotRegistered {
        /// Type name of the message being dispatched
        message_type: &'static str,
        /// Handler service that was looked up
        handler_type: &'static str,
    },

    /// The envelope names a message type the endpoint does not accept.
    #[error("unrecognized message type: {0}")]
    UnrecognizedMessageType(String),

    /// The envelope is missing a required property.
    #[error("envelope is missing the {0} property")]
    MissingProperty(&'static str),

    /// No destination queue is configured for a command type.
    #[error("no send route configured for message type {0}")]
    NoSendRoute(String),

    /// An event was sent or a command was published.
    #[error("message type {message_type} is not a {expected:?}")]
    WrongMessageKind {
        message_type: &'static str,
        expected: MessageKind,
    },

    /// Payload or envelope (de)serialization failed.
    #[error("codec error: {0}")]
    Codec(String),

    /// The infrastructure throttled the request (e.g. HTTP 429).
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// An infrastructure call did not complete in time.
    #[error("infrastructure call timed out: {0}")]
    Timeout(String),

    /// The queue, topic or subscription does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The message was already removed or its lease was lost.
    #[error("message lease lost: {0}")]
    LeaseLost(String),

    /// The receive loop is already running.
    #[error("transport is already receiving messages")]
    AlreadyReceiving,

    /// Any other infrastructure failure.
    #[error("infrastructure error: {0}")]
    Infrastructure(String),
}

impl BusError {
    /// Whether a retry with backoff may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, BusError::RateLimited(_) | BusError::Timeout(_))
    }

    /// Whether the error indicates a deployment mismatch rather than a fault.
    ///
    /// Configuration errors are fatal to the single operation and are never
    /// retried.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            BusError::HandlerNotRegistered { .. }
                | BusError::UnrecognizedMessageType(_)
                | BusError::MissingProperty(_)
                | BusError::NoSendRoute(_)
                | BusError::WrongMessageKind { .. }
                | BusError::Codec(_)
        )
    }
}

impl From<serde_json::Error> for BusError {
    fn from(err: serde_json::Error) -> Self {
        BusError::Codec(err.to_string())
    }
}

impl From<bitcode::Error> for BusError {
    fn from(err: bitcode::Error) -> Self {
        BusError::Codec(err.to_string())
    }
}

impl From<base64::DecodeError> for BusError {
    fn from(err: base64::DecodeError) -> Self {
        BusError::Codec(err.to_string())
    }
}

/// Error returned by message handlers.
///
/// Handler failures never propagate to the receive loop as a crash; the
/// executor captures them and reports them through the exception hook.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Business logic rejected the message.
    #[error("{0}")]
    Rejected(String),
    /// The handler panicked while processing the message.
    #[error("handler panicked: {0}")]
    Panicked(String),
    /// Any other error raised by the handler.
    #[error(transparent)]
    Other(Box<dyn Error + Send + Sync>),
}

impl HandlerError {
    /// Create a rejection with the given reason.
    pub fn rejected(reason: impl Into<String>) -> Self {
        HandlerError::Rejected(reason.into())
    }

    /// Wrap an arbitrary error.
    pub fn other(err: impl Into<Box<dyn Error + Send + Sync>>) -> Self {
        HandlerError::Other(err.into())
    }
}

impl From<BusError> for HandlerError {
    fn from(err: BusError) -> Self {
        HandlerError::Other(Box::new(err))
    }
}
