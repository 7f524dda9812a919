use std::fmt::Display;

use crate::core::types::{
    Dictionary,
    HashMap,
    HashSet,
    Value,
};

/// A role a peer can take on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PeerRole {
    // Calls RPC endpoints.
    Caller,
    // Registers RPC endpoints.
    Callee,
    // Publishes events to topics.
    Publisher,
    // Subscribes to events for topics.
    Subscriber,
}

impl TryFrom<&str> for PeerRole {
    type Error = anyhow::Error;
    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "caller" => Ok(Self::Caller),
            "callee" => Ok(Self::Callee),
            "publisher" => Ok(Self::Publisher),
            "subscriber" => Ok(Self::Subscriber),
            _ => Err(Self::Error::msg(format!("invalid peer role: {value}"))),
        }
    }
}

impl From<PeerRole> for &'static str {
    fn from(value: PeerRole) -> Self {
        match value {
            PeerRole::Caller => "caller",
            PeerRole::Callee => "callee",
            PeerRole::Publisher => "publisher",
            PeerRole::Subscriber => "subscriber",
        }
    }
}

impl Display for PeerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str((*self).into())
    }
}

/// A role a router can take on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RouterRole {
    // Supports RPC calls.
    Dealer,
    // Supports pub/sub.
    Broker,
}

impl RouterRole {
    /// Advanced features announced for the role.
    pub fn features(&self) -> &'static [&'static str] {
        match self {
            Self::Broker => &[
                "publisher_exclusion",
                "publisher_identification",
                "pattern_based_subscription",
                "subscriber_blackwhite_listing",
                "subscription_meta_api",
                "session_meta_api",
            ],
            Self::Dealer => &[
                "progressive_call_results",
                "call_canceling",
                "caller_identification",
                "shared_registration",
                "pattern_based_registration",
                "call_reroute",
                "registration_meta_api",
                "session_meta_api",
            ],
        }
    }

    /// The details entry announcing the role to peers.
    pub fn details(&self) -> Value {
        let features = self
            .features()
            .iter()
            .map(|feature| ((*feature).to_owned(), Value::Bool(true)))
            .collect::<Dictionary>();
        Value::Dictionary(Dictionary::from_iter([(
            "features".to_owned(),
            Value::Dictionary(features),
        )]))
    }
}

impl TryFrom<&str> for RouterRole {
    type Error = anyhow::Error;
    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "dealer" => Ok(Self::Dealer),
            "broker" => Ok(Self::Broker),
            _ => Err(Self::Error::msg(format!("invalid router role: {value}"))),
        }
    }
}

impl From<RouterRole> for &'static str {
    fn from(value: RouterRole) -> Self {
        match value {
            RouterRole::Dealer => "dealer",
            RouterRole::Broker => "broker",
        }
    }
}

impl Display for RouterRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str((*self).into())
    }
}

/// The roles and advanced features a peer announced in its HELLO message.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PeerRoles {
    roles: HashMap<PeerRole, HashSet<String>>,
}

impl PeerRoles {
    /// Reads the `roles` entry of HELLO details.
    ///
    /// Unknown roles and malformed entries are ignored.
    pub fn from_details(details: &Dictionary) -> Self {
        let roles = match details.get("roles").and_then(Value::as_dictionary) {
            Some(roles) => roles,
            None => return Self::default(),
        };
        let roles = roles
            .iter()
            .filter_map(|(role, value)| {
                let role = PeerRole::try_from(role.as_str()).ok()?;
                let features = value
                    .as_dictionary()
                    .and_then(|value| value.get("features"))
                    .and_then(Value::as_dictionary)
                    .map(|features| {
                        features
                            .iter()
                            .filter(|(_, enabled)| enabled.as_bool().unwrap_or(false))
                            .map(|(feature, _)| feature.clone())
                            .collect()
                    })
                    .unwrap_or_default();
                Some((role, features))
            })
            .collect();
        Self { roles }
    }

    /// Checks if the peer announced the role.
    pub fn has_role(&self, role: PeerRole) -> bool {
        self.roles.contains_key(&role)
    }

    /// Checks if the peer announced support for a feature under the role.
    pub fn supports(&self, role: PeerRole, feature: &str) -> bool {
        self.roles
            .get(&role)
            .is_some_and(|features| features.contains(feature))
    }
}
