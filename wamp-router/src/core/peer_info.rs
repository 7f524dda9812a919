use std::fmt::Display;

use crate::core::types::{
    Dictionary,
    Value,
};

/// The type of connection a peer is communicating over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionType {
    /// WebSocket connection from a remote address.
    Remote(String),
    /// Direct connection within the same process.
    Direct,
}

impl ConnectionType {
    /// Transport information reported by the session meta API.
    pub fn transport_details(&self) -> Dictionary {
        match self {
            Self::Remote(addr) => Dictionary::from_iter([
                ("type".to_owned(), Value::from("websocket")),
                ("peer".to_owned(), Value::from(addr.as_str())),
            ]),
            Self::Direct => Dictionary::from_iter([("type".to_owned(), Value::from("direct"))]),
        }
    }
}

impl Default for ConnectionType {
    fn default() -> Self {
        Self::Remote(String::default())
    }
}

impl Display for ConnectionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Remote(addr) => write!(f, "remote connection from {addr}"),
            Self::Direct => write!(f, "direct connection"),
        }
    }
}
