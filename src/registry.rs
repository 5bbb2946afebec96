//! The set of message types a receiving endpoint accepts.
//!
//! Built once at startup with explicit `accept::<M>()` calls, then shared
//! read-only. It plays two roles:
//! - it advertises the endpoint's acceptable event type names (queue
//!   metadata, subscription filters),
//! - it maps a type name back to a decoder so an envelope can be turned into
//!   a typed message without runtime type inspection.

use std::collections::BTreeMap;

use crate::envelope::Envelope;
use crate::error::{BusError, Result};
use crate::message::{AnyMessage, Message, MessageKind};

type Decoder = fn(&Envelope) -> Result<Box<dyn AnyMessage>>;

struct Registration {
    kind: MessageKind,
    decode: Decoder,
}

fn decode_as<M: Message>(envelope: &Envelope) -> Result<Box<dyn AnyMessage>> {
    let message: M = envelope.decode()?;
    Ok(Box::new(message))
}

/// Static type-name → decoder table for one receiving endpoint.
///
/// ## Example
///
/// ```ignore
/// let registry = MessageTypeRegistry::new()
///     .accept::<OrderPlaced>()
///     .accept::<ChargeCard>();
///
/// assert_eq!(registry.event_type_names(), vec!["OrderPlaced"]);
/// let message = registry.unwrap(&envelope)?;
/// ```
#[derive(Default)]
pub struct MessageTypeRegistry {
    registrations: BTreeMap<&'static str, Registration>,
}

impl MessageTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept messages of type `M` on this endpoint.
    pub fn accept<M: Message>(mut self) -> Self {
        self.registrations.insert(
            M::TYPE_NAME,
            Registration {
                kind: M::KIND,
                decode: decode_as::<M>,
            },
        );
        self
    }

    /// Whether the type name is accepted.
    pub fn contains(&self, type_name: &str) -> bool {
        self.registrations.contains_key(type_name)
    }

    /// Accepted event type names, sorted.
    pub fn event_type_names(&self) -> Vec<&'static str> {
        self.names_of(MessageKind::Event)
    }

    /// Accepted command type names, sorted.
    pub fn command_type_names(&self) -> Vec<&'static str> {
        self.names_of(MessageKind::Command)
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Reconstruct the typed message carried by an envelope.
    ///
    /// Fails with `UnrecognizedMessageType` when the type name is not
    /// accepted here; such a message cannot be dispatched.
    pub fn unwrap(&self, envelope: &Envelope) -> Result<Box<dyn AnyMessage>> {
        let type_name = envelope
            .message_type()
            .ok_or(BusError::MissingProperty(crate::envelope::MESSAGE_TYPE_KEY))?;
        let registration = self
            .registrations
            .get(type_name)
            .ok_or_else(|| BusError::UnrecognizedMessageType(type_name.to_string()))?;
        (registration.decode)(envelope)
    }

    fn names_of(&self, kind: MessageKind) -> Vec<&'static str> {
        self.registrations
            .iter()
            .filter(|(_, registration)| registration.kind == kind)
            .map(|(name, _)| *name)
            .collect()
    }
}
