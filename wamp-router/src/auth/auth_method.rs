use std::{
    fmt::Display,
    str::FromStr,
};

use serde_string_enum::{
    DeserializeStringEnum,
    SerializeStringEnum,
};

/// Authentication methods a peer may offer in HELLO.
///
/// The router does not implement any of these schemes. A selected method is only passed back to
/// the injected security hooks.
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash, SerializeStringEnum, DeserializeStringEnum)]
pub enum AuthMethod {
    /// No authentication. The session joins immediately.
    #[default]
    Anonymous,
    /// Ticket-based authentication.
    Ticket,
    /// WAMP Challenge-Response Authentication.
    WampCra,
    /// WAMP Salted Challenge Response Authentication Mechanism.
    WampScram,
    /// Public-key authentication.
    Cryptosign,
    /// Any other method name.
    Other(String),
}

impl AuthMethod {
    /// Checks if the method joins without a challenge.
    pub fn is_anonymous(&self) -> bool {
        matches!(self, Self::Anonymous)
    }
}

impl From<&str> for AuthMethod {
    fn from(value: &str) -> Self {
        match value {
            "anonymous" => Self::Anonymous,
            "ticket" => Self::Ticket,
            "wampcra" => Self::WampCra,
            "wamp-scram" => Self::WampScram,
            "cryptosign" => Self::Cryptosign,
            _ => Self::Other(value.to_owned()),
        }
    }
}

impl FromStr for AuthMethod {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from(s))
    }
}

impl Display for AuthMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Anonymous => write!(f, "anonymous"),
            Self::Ticket => write!(f, "ticket"),
            Self::WampCra => write!(f, "wampcra"),
            Self::WampScram => write!(f, "wamp-scram"),
            Self::Cryptosign => write!(f, "cryptosign"),
            Self::Other(method) => write!(f, "{method}"),
        }
    }
}
