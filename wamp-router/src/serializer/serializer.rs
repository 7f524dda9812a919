use std::fmt::Debug;

use anyhow::{
    Error,
    Result,
};

use crate::{
    core::uri::Uri,
    message::message::Message,
};

/// The type of serializer to use.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SerializerType {
    /// Serializes messages to and from JavaScript Object Notation.
    Json,
    /// Serializes messages to and from the MessagePack format.
    MessagePack,
}

impl SerializerType {
    /// The protocol URI used during protocol negotiation.
    pub fn uri(&self) -> Uri {
        match self {
            Self::Json => Uri::from_known("wamp.2.json"),
            Self::MessagePack => Uri::from_known("wamp.2.msgpack"),
        }
    }

    /// Whether serialized messages are binary rather than text.
    pub fn is_binary(&self) -> bool {
        match self {
            Self::Json => false,
            Self::MessagePack => true,
        }
    }
}

impl TryFrom<&str> for SerializerType {
    type Error = Error;
    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "wamp.2.json" => Ok(Self::Json),
            "wamp.2.msgpack" => Ok(Self::MessagePack),
            _ => Err(Error::msg(format!("unsupported serializer: {value}"))),
        }
    }
}

/// A serializer, which serializes and deserializes WAMP messages to a well-known format that can be
/// passed over wire.
///
/// Does not implement message batching.
pub trait Serializer: Send + Debug {
    /// Serializes the given message to bytes.
    fn serialize(&self, value: &Message) -> Result<Vec<u8>>;

    /// Deserializes bytes to a message.
    fn deserialize(&self, bytes: &[u8]) -> Result<Message>;
}

/// A serializer implemented for JavaScript Object Notation.
#[derive(Debug, Default)]
pub struct JsonSerializer {}

impl Serializer for JsonSerializer {
    fn serialize(&self, value: &Message) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(Error::new)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Message> {
        serde_json::from_slice(bytes).map_err(Error::new)
    }
}

/// A serializer implemented for MessagePack.
#[derive(Debug, Default)]
pub struct MessagePackSerializer {}

impl Serializer for MessagePackSerializer {
    fn serialize(&self, value: &Message) -> Result<Vec<u8>> {
        rmp_serde::to_vec(value).map_err(Error::new)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Message> {
        rmp_serde::from_slice(bytes).map_err(Error::new)
    }
}

/// Creates a new [`Serializer`] for the given type.
pub fn new_serializer(serializer_type: SerializerType) -> Box<dyn Serializer> {
    match serializer_type {
        SerializerType::Json => Box::new(JsonSerializer::default()),
        SerializerType::MessagePack => Box::new(MessagePackSerializer::default()),
    }
}
