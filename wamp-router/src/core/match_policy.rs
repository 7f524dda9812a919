use std::{
    cmp::Ordering,
    fmt::Display,
};

use crate::core::uri::Uri;

/// How a procedure registration or subscription should be matched against a URI.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatchPolicy {
    /// The URI must be equal to the registered URI.
    #[default]
    Exact,
    /// The registered URI must be a string prefix of the URI.
    Prefix,
    /// The registered URI and the URI have the same number of components, and every non-empty
    /// registered component is equal to the corresponding component of the URI.
    Wildcard,
}

impl MatchPolicy {
    /// Order in which match policies are tried when routing a call.
    pub const ESCALATION: [MatchPolicy; 3] = [Self::Exact, Self::Prefix, Self::Wildcard];

    /// Checks if the registered `pattern` matches the `uri` under this policy.
    pub fn matches(&self, pattern: &Uri, uri: &Uri) -> bool {
        match self {
            Self::Exact => pattern == uri,
            Self::Prefix => uri.as_ref().starts_with(pattern.as_ref()),
            Self::Wildcard => wildcard_matches(pattern, uri),
        }
    }

    /// Compares two registered patterns that both match the same URI.
    ///
    /// [`Ordering::Greater`] means `a` is preferred over `b`.
    pub fn preference(&self, a: &Uri, b: &Uri) -> Ordering {
        match self {
            Self::Exact => Ordering::Equal,
            Self::Prefix => a.as_ref().len().cmp(&b.as_ref().len()),
            Self::Wildcard => wildcard_preference(a, b),
        }
    }

    /// Selects the best entry matching `uri` out of the given patterns.
    ///
    /// Ties keep the entry that appeared first.
    pub fn best_match<'a, T, I>(&self, uri: &Uri, candidates: I) -> Option<T>
    where
        I: IntoIterator<Item = (&'a Uri, T)>,
    {
        candidates
            .into_iter()
            .filter(|(pattern, _)| self.matches(pattern, uri))
            .fold(None::<(&'a Uri, T)>, |best, (pattern, value)| match best {
                Some((best_pattern, best_value)) => {
                    if self.preference(pattern, best_pattern) == Ordering::Greater {
                        Some((pattern, value))
                    } else {
                        Some((best_pattern, best_value))
                    }
                }
                None => Some((pattern, value)),
            })
            .map(|(_, value)| value)
    }
}

fn wildcard_matches(pattern: &Uri, uri: &Uri) -> bool {
    let mut pattern = pattern.split();
    let mut uri = uri.split();
    loop {
        match (pattern.next(), uri.next()) {
            (Some(expected), Some(actual)) => {
                if !expected.is_empty() && expected != actual {
                    return false;
                }
            }
            (None, None) => return true,
            _ => return false,
        }
    }
}

fn wildcard_preference(a: &Uri, b: &Uri) -> Ordering {
    for (a, b) in a.split().zip(b.split()) {
        if a == b {
            continue;
        }
        return match (a.is_empty(), b.is_empty()) {
            (false, true) => Ordering::Greater,
            (true, false) => Ordering::Less,
            _ => Ordering::Equal,
        };
    }
    Ordering::Equal
}

impl TryFrom<&str> for MatchPolicy {
    type Error = anyhow::Error;
    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "exact" => Ok(Self::Exact),
            "prefix" => Ok(Self::Prefix),
            "wildcard" => Ok(Self::Wildcard),
            _ => Err(Self::Error::msg(format!("invalid match policy: {value}"))),
        }
    }
}

impl From<MatchPolicy> for &'static str {
    fn from(value: MatchPolicy) -> Self {
        match value {
            MatchPolicy::Exact => "exact",
            MatchPolicy::Prefix => "prefix",
            MatchPolicy::Wildcard => "wildcard",
        }
    }
}

impl Display for MatchPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str((*self).into())
    }
}
