use std::{
    fmt::Display,
    sync::atomic::{
        AtomicU64,
        Ordering,
    },
};

use serde::{
    Deserialize,
    Serialize,
    de::{
        Unexpected,
        Visitor,
    },
};
use thiserror::Error;

use crate::core::types::Value;

/// An integer ID, used for identification of resources and requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[repr(transparent)]
#[serde(transparent)]
pub struct Id(u64);

impl Id {
    /// The minimum allowable value of an ID.
    pub const MIN: Id = Id(1);

    /// The maximum allowable value of an ID.
    pub const MAX: Id = Id(1 << 53);

    /// The raw integer value.
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl Default for Id {
    fn default() -> Self {
        Id::MIN
    }
}

impl Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl From<Id> for Value {
    fn from(value: Id) -> Self {
        Value::Integer(value.0)
    }
}

/// Error for an ID being out of range.
#[derive(Debug, Error)]
#[error("{value} is out of range for IDs")]
pub struct IdOutOfRange {
    value: u64,
}

impl TryFrom<u64> for Id {
    type Error = IdOutOfRange;
    fn try_from(value: u64) -> Result<Self, Self::Error> {
        if value < Self::MIN.0 || value > Self::MAX.0 {
            Err(IdOutOfRange { value })
        } else {
            Ok(Id(value))
        }
    }
}

impl TryFrom<&Value> for Id {
    type Error = anyhow::Error;
    fn try_from(value: &Value) -> Result<Self, Self::Error> {
        match value.as_integer() {
            Some(value) => Ok(Id::try_from(value)?),
            None => Err(Self::Error::msg(format!("expected an id, got {value:?}"))),
        }
    }
}

struct IdVisitor;

impl<'de> Visitor<'de> for IdVisitor {
    type Value = Id;

    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            "an unsigned integer in the range [{}, {}]",
            Id::MIN,
            Id::MAX
        )
    }

    fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        Id::try_from(v).map_err(|_| E::invalid_value(Unexpected::Unsigned(v), &self))
    }

    fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        u64::try_from(v)
            .ok()
            .and_then(|v| Id::try_from(v).ok())
            .ok_or_else(|| E::invalid_value(Unexpected::Signed(v), &self))
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_u64(IdVisitor)
    }
}

/// An ID allocator.
///
/// Allocation is synchronous so that IDs can be generated while a realm is locked.
pub trait IdAllocator: Send + Sync {
    /// Generates a new ID.
    fn generate_id(&self) -> Id;

    /// Resets the allocator to its initial state.
    fn reset(&self);
}

/// An ID allocator that generates IDs from a random sequence.
///
/// Used for global-scoped IDs: sessions and publications.
#[derive(Debug, Default)]
pub struct RandomIdAllocator {}

impl IdAllocator for RandomIdAllocator {
    fn generate_id(&self) -> Id {
        let id = (rand::random::<u64>() & (Id::MAX.0 - 1)) + 1;
        Id(id)
    }

    fn reset(&self) {}
}

/// An ID allocator that generates IDs sequentially.
///
/// Used for router-scoped IDs: registrations, subscriptions and invocations.
#[derive(Debug)]
pub struct SequentialIdAllocator {
    next: AtomicU64,
}

impl Default for SequentialIdAllocator {
    fn default() -> Self {
        Self {
            next: AtomicU64::new(Id::MIN.0),
        }
    }
}

impl IdAllocator for SequentialIdAllocator {
    fn generate_id(&self) -> Id {
        let id = self
            .next
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |id| {
                Some(if id >= Id::MAX.0 { Id::MIN.0 } else { id + 1 })
            })
            .unwrap_or_else(|id| id);
        Id(id)
    }

    fn reset(&self) {
        self.next.store(Id::MIN.0, Ordering::Relaxed);
    }
}
