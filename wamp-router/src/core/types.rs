use serde::{
    Deserialize,
    Serialize,
};

/// Type alias for hash maps used across the library.
pub type HashMap<K, V> = std::collections::HashMap<K, V, ahash::RandomState>;

/// Type alias for hash sets used across the library.
pub type HashSet<V> = std::collections::HashSet<V, ahash::RandomState>;

pub type Integer = u64;

pub type Dictionary = HashMap<String, Value>;

pub type List = Vec<Value>;

/// A WAMP value.
///
/// Application payloads are forwarded through the router untouched, so every type that can appear
/// in a JSON or MessagePack document is representable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Integer(Integer),
    SignedInteger(i64),
    Float(f64),
    String(String),
    List(List),
    Dictionary(Dictionary),
}

impl Value {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<Integer> {
        match self {
            Self::Integer(value) => Some(*value),
            Self::SignedInteger(value) => Integer::try_from(*value).ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(value) => Some(value.as_str()),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&List> {
        match self {
            Self::List(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_dictionary(&self) -> Option<&Dictionary> {
        match self {
            Self::Dictionary(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl From<Integer> for Value {
    fn from(value: Integer) -> Self {
        Self::Integer(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        match Integer::try_from(value) {
            Ok(value) => Self::Integer(value),
            Err(_) => Self::SignedInteger(value),
        }
    }
}

impl From<usize> for Value {
    fn from(value: usize) -> Self {
        Self::Integer(value as Integer)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<Dictionary> for Value {
    fn from(value: Dictionary) -> Self {
        Self::Dictionary(value)
    }
}

impl From<List> for Value {
    fn from(value: List) -> Self {
        Self::List(value)
    }
}

impl<T> From<Option<T>> for Value
where
    T: Into<Value>,
{
    fn from(value: Option<T>) -> Self {
        match value {
            Some(value) => value.into(),
            None => Self::Null,
        }
    }
}
