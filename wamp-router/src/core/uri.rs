use std::{
    fmt::Display,
    sync::LazyLock,
};

use regex::Regex;
use serde::{
    Deserialize,
    Serialize,
};
use thiserror::Error;

use crate::core::types::Value;

/// Error for an invalid URI.
#[derive(Debug, Error)]
#[error("invalid URI")]
pub struct InvalidUri;

/// Validates a strict URI.
pub fn validate_strict_uri<S>(uri: S) -> Result<(), InvalidUri>
where
    S: AsRef<str>,
{
    static RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"^([0-9a-z_]+\.)*([0-9a-z_]+)$").unwrap());
    if !RE.is_match(uri.as_ref()) {
        return Err(InvalidUri);
    }
    Ok(())
}

/// A uniform resource identifier, used in many aspects of WAMP messaging for identifying resources,
/// such as realms, topics, and procedures.
///
/// The router does not enforce URI syntax on incoming messages. Registrations and subscriptions
/// using the wildcard match policy contain empty components, so the same type is used for every
/// URI.
#[derive(Debug, Default, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
#[serde(transparent)]
pub struct Uri(String);

impl Uri {
    /// Constructs a URI directly from a value known to be valid, skipping validation.
    pub fn from_known<S>(value: S) -> Self
    where
        S: Into<String>,
    {
        Self(value.into())
    }

    /// Constructs a strict URI, validating its syntax.
    pub fn strict<S>(value: S) -> Result<Self, InvalidUri>
    where
        S: Into<String>,
    {
        let value = value.into();
        validate_strict_uri(&value)?;
        Ok(Self(value))
    }

    /// Splits the URI into its components.
    pub fn split(&self) -> impl Iterator<Item = &str> {
        self.0.split('.')
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Uri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl AsRef<str> for Uri {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Uri {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for Uri {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<Uri> for String {
    fn from(value: Uri) -> Self {
        value.0
    }
}

impl From<Uri> for Value {
    fn from(value: Uri) -> Self {
        Value::String(value.0)
    }
}

impl From<&Uri> for Value {
    fn from(value: &Uri) -> Self {
        Value::String(value.0.clone())
    }
}

#[cfg(test)]
mod uri_test {
    use crate::core::uri::{
        Uri,
        validate_strict_uri,
    };

    #[test]
    fn validates_strict_uris() {
        assert_matches::assert_matches!(validate_strict_uri("com"), Ok(()));
        assert_matches::assert_matches!(validate_strict_uri("com123"), Ok(()));
        assert_matches::assert_matches!(validate_strict_uri("wamp.close.killed"), Ok(()));
        assert_matches::assert_matches!(validate_strict_uri("com.myapp.TOPIC"), Err(_));
        assert_matches::assert_matches!(validate_strict_uri("com.myapp.topic_123-@!!"), Err(_));
        assert_matches::assert_matches!(validate_strict_uri("com.1"), Ok(()));
        assert_matches::assert_matches!(validate_strict_uri("."), Err(_));
        assert_matches::assert_matches!(validate_strict_uri("com..topic"), Err(_));
        assert_matches::assert_matches!(validate_strict_uri(".com.myapp.topic1"), Err(_));
        assert_matches::assert_matches!(validate_strict_uri("com.myapp#"), Err(_));
    }

    #[test]
    fn deserializes_without_validation() {
        assert_matches::assert_matches!(serde_json::from_str::<Uri>(r#""com..Topic""#), Ok(uri) => {
            assert_eq!(uri.as_ref(), "com..Topic");
        });
    }

    #[test]
    fn constructs_strict_uri() {
        assert_matches::assert_matches!(Uri::strict("wamp.close.normal"), Ok(_));
        assert_matches::assert_matches!(Uri::strict("not a uri"), Err(_));
    }
}
