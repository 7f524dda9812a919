const ANONYMOUS_ID: &str = "anonymous";
const ANONYMOUS_ROLE: &str = "anonymous";

/// The identity of an authenticated peer.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Identity {
    /// The authentication ID the peer was actually authenticated as.
    pub id: String,
    /// The authentication role the peer was authenticated for.
    pub role: String,
}

impl Identity {
    /// The identity given to peers that join without credentials.
    ///
    /// The peer may still report its own authentication ID.
    pub fn anonymous(offered_id: Option<&str>) -> Self {
        Self {
            id: offered_id.unwrap_or(ANONYMOUS_ID).to_owned(),
            role: ANONYMOUS_ROLE.to_owned(),
        }
    }
}

/// Where a session's identity came from, reported to peers as `authprovider`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum AuthProvider {
    /// The identity was assigned without any verification.
    #[default]
    Static,
    /// The identity was produced by a credential verifier.
    Dynamic,
}

impl From<AuthProvider> for &'static str {
    fn from(value: AuthProvider) -> Self {
        match value {
            AuthProvider::Static => "static",
            AuthProvider::Dynamic => "dynamic",
        }
    }
}

#[cfg(test)]
mod identity_test {
    use crate::auth::identity::Identity;

    #[test]
    fn anonymous_identity_keeps_offered_id() {
        assert_eq!(
            Identity::anonymous(None),
            Identity {
                id: "anonymous".to_owned(),
                role: "anonymous".to_owned(),
            }
        );
        assert_eq!(
            Identity::anonymous(Some("alice")),
            Identity {
                id: "alice".to_owned(),
                role: "anonymous".to_owned(),
            }
        );
    }
}
