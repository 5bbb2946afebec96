//! The wire unit: serialized payload plus routing metadata.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{BusError, Result};
use crate::message::Message;

/// Property carrying the message type name.
pub const MESSAGE_TYPE_KEY: &str = "MessageType";
/// Property carrying the payload content type.
pub const CONTENT_TYPE_KEY: &str = "ContentType";
/// Property carrying the destination queue of a command.
pub const DESTINATION_QUEUE_KEY: &str = "DestinationQueue";

/// Payload serialization format.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PayloadCodec {
    /// `serde_json` text.
    #[default]
    Json,
    /// `bitcode` binary.
    Bitcode,
}

impl PayloadCodec {
    /// Content type written to the envelope.
    pub fn content_type(&self) -> &'static str {
        match self {
            PayloadCodec::Json => "application/json",
            PayloadCodec::Bitcode => "application/x-bitcode",
        }
    }

    /// Look up a codec by content type.
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        match content_type {
            "application/json" => Some(PayloadCodec::Json),
            "application/x-bitcode" => Some(PayloadCodec::Bitcode),
            _ => None,
        }
    }

    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        match self {
            PayloadCodec::Json => Ok(serde_json::to_vec(value)?),
            PayloadCodec::Bitcode => Ok(bitcode::serialize(value)?),
        }
    }

    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        match self {
            PayloadCodec::Json => Ok(serde_json::from_slice(bytes)?),
            PayloadCodec::Bitcode => Ok(bitcode::deserialize(bytes)?),
        }
    }
}

/// Serialized message plus out-of-band properties.
///
/// Every envelope in transit carries exactly one `MessageType` property.
/// Commands additionally carry `DestinationQueue`.
///
/// ## Example
///
/// ```ignore
/// let envelope = Envelope::wrap(&OrderPlaced { id: "o-1".into() }, PayloadCodec::Json)?;
/// assert_eq!(envelope.message_type(), Some("OrderPlaced"));
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Unique identifier for this envelope
    pub id: String,
    /// Serialized message payload
    #[serde(with = "payload_serde")]
    pub payload: Vec<u8>,
    /// Routing and type metadata (user properties)
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl Envelope {
    /// Create an envelope from raw parts.
    pub fn new(message_type: impl Into<String>, payload: Vec<u8>) -> Self {
        let mut properties = BTreeMap::new();
        properties.insert(MESSAGE_TYPE_KEY.to_string(), message_type.into());
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            payload,
            properties,
        }
    }

    /// Serialize a message and tag it with its type name.
    pub fn wrap<M: Message>(message: &M, codec: PayloadCodec) -> Result<Self> {
        let payload = codec.encode(message)?;
        Ok(Self::new(M::TYPE_NAME, payload).with_property(CONTENT_TYPE_KEY, codec.content_type()))
    }

    /// Decode the payload as `M`, using the codec named by the envelope.
    pub fn decode<M: Message>(&self) -> Result<M> {
        self.codec()?.decode(&self.payload)
    }

    /// Add a property.
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Address the envelope to a destination queue.
    pub fn with_destination(self, queue: impl Into<String>) -> Self {
        self.with_property(DESTINATION_QUEUE_KEY, queue)
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// The carried message type name.
    pub fn message_type(&self) -> Option<&str> {
        self.property(MESSAGE_TYPE_KEY)
    }

    /// The destination hint, set on commands.
    pub fn destination(&self) -> Option<&str> {
        self.property(DESTINATION_QUEUE_KEY)
    }

    /// Codec named by the `ContentType` property; JSON when absent.
    pub fn codec(&self) -> Result<PayloadCodec> {
        match self.property(CONTENT_TYPE_KEY) {
            None => Ok(PayloadCodec::Json),
            Some(content_type) => PayloadCodec::from_content_type(content_type).ok_or_else(|| {
                BusError::Codec(format!("unsupported content type: {}", content_type))
            }),
        }
    }

    /// Serialize the whole envelope into a queue message body.
    pub fn to_wire(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a queue message body produced by [`Envelope::to_wire`].
    pub fn from_wire(body: &str) -> Result<Self> {
        Ok(serde_json::from_str(body)?)
    }
}

mod payload_serde {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(payload: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        STANDARD.encode(payload).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
