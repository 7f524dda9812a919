//! Options attached to individual WAMP requests.
//!
//! Each request type has its own structure with documented defaults. Options are validated once,
//! when the request enters the router, so that routing code never reads the raw dictionary.

use anyhow::Result;

use crate::core::{
    cancel::CallCancelMode,
    error::BasicError,
    id::Id,
    invocation_policy::InvocationPolicy,
    match_policy::MatchPolicy,
    types::{
        Dictionary,
        HashSet,
        Value,
    },
};

fn get<'a>(options: &'a Dictionary, key: &str) -> Option<&'a Value> {
    options.get(key).filter(|value| !value.is_null())
}

fn invalid(key: &str, expected: &str) -> anyhow::Error {
    BasicError::InvalidArgument(format!("option {key} must be {expected}")).into()
}

fn get_bool(options: &Dictionary, key: &str) -> Result<Option<bool>> {
    get(options, key)
        .map(|value| value.as_bool().ok_or_else(|| invalid(key, "a boolean")))
        .transpose()
}

fn get_str<'a>(options: &'a Dictionary, key: &str) -> Result<Option<&'a str>> {
    get(options, key)
        .map(|value| value.as_str().ok_or_else(|| invalid(key, "a string")))
        .transpose()
}

fn get_ids(options: &Dictionary, key: &str) -> Result<Option<HashSet<Id>>> {
    get(options, key)
        .map(|value| {
            value
                .as_list()
                .ok_or_else(|| invalid(key, "a list of ids"))?
                .iter()
                .map(|id| Id::try_from(id).map_err(|_| invalid(key, "a list of ids")))
                .collect::<Result<HashSet<_>>>()
        })
        .transpose()
}

fn get_strings(options: &Dictionary, key: &str) -> Result<Option<HashSet<String>>> {
    get(options, key)
        .map(|value| {
            value
                .as_list()
                .ok_or_else(|| invalid(key, "a list of strings"))?
                .iter()
                .map(|value| {
                    value
                        .as_str()
                        .map(|value| value.to_owned())
                        .ok_or_else(|| invalid(key, "a list of strings"))
                })
                .collect::<Result<HashSet<_>>>()
        })
        .transpose()
}

fn get_match_policy(options: &Dictionary) -> Result<MatchPolicy> {
    match get_str(options, "match")? {
        Some(value) => MatchPolicy::try_from(value)
            .map_err(|err| BasicError::InvalidArgument(err.to_string()).into()),
        None => Ok(MatchPolicy::default()),
    }
}

/// Options for registering a procedure.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RegisterOptions {
    /// How the procedure URI is matched against calls. Defaults to exact.
    pub match_policy: MatchPolicy,
    /// How a callee is selected when the procedure is shared. Defaults to single.
    pub invocation_policy: InvocationPolicy,
    /// Whether the caller's identity is disclosed to this callee. Defaults to false.
    pub disclose_caller: bool,
}

impl TryFrom<&Dictionary> for RegisterOptions {
    type Error = anyhow::Error;
    fn try_from(value: &Dictionary) -> Result<Self, Self::Error> {
        let invocation_policy = match get_str(value, "invoke")? {
            Some(invoke) => InvocationPolicy::try_from(invoke)
                .map_err(|err| BasicError::InvalidArgument(err.to_string()))?,
            None => InvocationPolicy::default(),
        };
        Ok(Self {
            match_policy: get_match_policy(value)?,
            invocation_policy,
            disclose_caller: get_bool(value, "disclose_caller")?.unwrap_or_default(),
        })
    }
}

/// Options for calling a procedure.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CallOptions {
    /// Whether the caller accepts progressive results. Defaults to false.
    pub receive_progress: bool,
    /// Whether the caller asks for its identity to be disclosed to the callee. Defaults to false.
    pub disclose_me: bool,
}

impl TryFrom<&Dictionary> for CallOptions {
    type Error = anyhow::Error;
    fn try_from(value: &Dictionary) -> Result<Self, Self::Error> {
        Ok(Self {
            receive_progress: get_bool(value, "receive_progress")?.unwrap_or_default(),
            disclose_me: get_bool(value, "disclose_me")?.unwrap_or_default(),
        })
    }
}

/// Options for canceling a call.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CancelOptions {
    /// Requested cancel mode. Defaults to skip.
    pub mode: CallCancelMode,
}

impl TryFrom<&Dictionary> for CancelOptions {
    type Error = anyhow::Error;
    fn try_from(value: &Dictionary) -> Result<Self, Self::Error> {
        let mode = match get_str(value, "mode")? {
            Some(mode) => CallCancelMode::try_from(mode)?,
            None => CallCancelMode::default(),
        };
        Ok(Self { mode })
    }
}

/// Options for yielding an invocation result.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct YieldOptions {
    /// Whether the result is progressive, keeping the invocation open. Defaults to false.
    pub progress: bool,
}

impl TryFrom<&Dictionary> for YieldOptions {
    type Error = anyhow::Error;
    fn try_from(value: &Dictionary) -> Result<Self, Self::Error> {
        Ok(Self {
            progress: get_bool(value, "progress")?.unwrap_or_default(),
        })
    }
}

/// Options for subscribing to a topic.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// How the topic URI is matched against publications. Defaults to exact.
    pub match_policy: MatchPolicy,
    /// Whether the publisher's identity is disclosed to this subscriber. Defaults to false.
    pub disclose_publisher: bool,
}

impl TryFrom<&Dictionary> for SubscribeOptions {
    type Error = anyhow::Error;
    fn try_from(value: &Dictionary) -> Result<Self, Self::Error> {
        Ok(Self {
            match_policy: get_match_policy(value)?,
            disclose_publisher: get_bool(value, "disclose_publisher")?.unwrap_or_default(),
        })
    }
}

/// Options for publishing an event.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PublishOptions {
    /// Whether the publisher receives PUBLISHED. Defaults to false.
    pub acknowledge: bool,
    /// Whether the publisher is excluded from receiving the event. Unset means excluded.
    pub exclude_me: Option<bool>,
    /// Blocked session IDs.
    pub exclude: Option<HashSet<Id>>,
    /// Blocked authenticated IDs.
    pub exclude_authid: Option<HashSet<String>>,
    /// Blocked authenticated roles.
    pub exclude_authrole: Option<HashSet<String>>,
    /// Allowed session IDs.
    pub eligible: Option<HashSet<Id>>,
    /// Allowed authenticated IDs.
    pub eligible_authid: Option<HashSet<String>>,
    /// Allowed authenticated roles.
    pub eligible_authrole: Option<HashSet<String>>,
    /// Whether the publisher asks for its identity to be disclosed. Defaults to false.
    pub disclose_me: bool,
}

impl PublishOptions {
    /// Whether the publisher should be skipped during fan-out.
    pub fn excludes_publisher(&self) -> bool {
        self.exclude_me.unwrap_or(true)
    }

    /// Whether any whitelist was given.
    pub fn has_eligibility_lists(&self) -> bool {
        [
            self.eligible.as_ref().map(|list| list.is_empty()),
            self.eligible_authid.as_ref().map(|list| list.is_empty()),
            self.eligible_authrole.as_ref().map(|list| list.is_empty()),
        ]
        .into_iter()
        .any(|empty| empty == Some(false))
    }
}

impl TryFrom<&Dictionary> for PublishOptions {
    type Error = anyhow::Error;
    fn try_from(value: &Dictionary) -> Result<Self, Self::Error> {
        Ok(Self {
            acknowledge: get_bool(value, "acknowledge")?.unwrap_or_default(),
            exclude_me: get_bool(value, "exclude_me")?,
            exclude: get_ids(value, "exclude")?,
            exclude_authid: get_strings(value, "exclude_authid")?,
            exclude_authrole: get_strings(value, "exclude_authrole")?,
            eligible: get_ids(value, "eligible")?,
            eligible_authid: get_strings(value, "eligible_authid")?,
            eligible_authrole: get_strings(value, "eligible_authrole")?,
            disclose_me: get_bool(value, "disclose_me")?.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod options_test {
    use crate::core::{
        cancel::CallCancelMode,
        id::Id,
        invocation_policy::InvocationPolicy,
        match_policy::MatchPolicy,
        options::{
            CancelOptions,
            PublishOptions,
            RegisterOptions,
            SubscribeOptions,
        },
        types::{
            Dictionary,
            HashSet,
        },
    };

    fn dictionary(json: &str) -> Dictionary {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn register_options_use_defaults() {
        assert_matches::assert_matches!(RegisterOptions::try_from(&Dictionary::default()), Ok(options) => {
            assert_eq!(options, RegisterOptions {
                match_policy: MatchPolicy::Exact,
                invocation_policy: InvocationPolicy::Single,
                disclose_caller: false,
            });
        });
    }

    #[test]
    fn reads_register_options() {
        assert_matches::assert_matches!(
            RegisterOptions::try_from(&dictionary(r#"{"match": "prefix", "invoke": "load", "disclose_caller": true}"#)),
            Ok(options) => {
                assert_eq!(options, RegisterOptions {
                    match_policy: MatchPolicy::Prefix,
                    invocation_policy: InvocationPolicy::Load,
                    disclose_caller: true,
                });
            }
        );
    }

    #[test]
    fn rejects_invalid_register_options() {
        assert_matches::assert_matches!(
            RegisterOptions::try_from(&dictionary(r#"{"invoke": "sometimes"}"#)),
            Err(err) => {
                assert_eq!(err.to_string(), "invalid invocation policy: sometimes");
            }
        );
        assert_matches::assert_matches!(
            SubscribeOptions::try_from(&dictionary(r#"{"match": 1}"#)),
            Err(err) => {
                assert_eq!(err.to_string(), "option match must be a string");
            }
        );
    }

    #[test]
    fn reads_cancel_mode() {
        assert_matches::assert_matches!(
            CancelOptions::try_from(&dictionary(r#"{"mode": "killnowait"}"#)),
            Ok(CancelOptions { mode: CallCancelMode::KillNoWait })
        );
        assert_matches::assert_matches!(
            CancelOptions::try_from(&dictionary(r#"{"mode": "later"}"#)),
            Err(_)
        );
    }

    #[test]
    fn reads_publish_lists() {
        assert_matches::assert_matches!(
            PublishOptions::try_from(&dictionary(r#"{
                "acknowledge": true,
                "exclude_me": false,
                "exclude": [1, 2],
                "eligible_authrole": ["admin"]
            }"#)),
            Ok(options) => {
                assert!(options.acknowledge);
                assert!(!options.excludes_publisher());
                assert_eq!(options.exclude, Some(HashSet::from_iter([
                    Id::try_from(1).unwrap(),
                    Id::try_from(2).unwrap(),
                ])));
                assert_eq!(options.eligible_authrole, Some(HashSet::from_iter(["admin".to_owned()])));
                assert!(options.has_eligibility_lists());
            }
        );
        assert_matches::assert_matches!(
            PublishOptions::try_from(&Dictionary::default()),
            Ok(options) => {
                assert!(options.excludes_publisher());
                assert!(!options.has_eligibility_lists());
            }
        );
        assert_matches::assert_matches!(
            PublishOptions::try_from(&dictionary(r#"{"exclude": ["a"]}"#)),
            Err(_)
        );
    }
}
