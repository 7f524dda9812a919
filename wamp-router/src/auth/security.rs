//! Pluggable security hooks consulted by router sessions.
//!
//! The router owns no authentication or authorization logic of its own. Each session calls these
//! hooks at fixed points of its state machine and treats a returned error as fatal to the session.

use std::fmt::Display;

use anyhow::Result;
use async_trait::async_trait;

use crate::{
    auth::{
        auth_method::AuthMethod,
        identity::Identity,
    },
    core::{
        types::{
            Dictionary,
            Value,
        },
        uri::Uri,
    },
};

/// Details about a session, as seen by the security hooks.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SessionDetails {
    /// The realm requested in HELLO.
    pub realm: Uri,
    /// The HELLO details, unmodified.
    pub details: Dictionary,
    /// Authentication ID offered by the peer.
    pub authid: Option<String>,
    /// Authentication role offered by the peer.
    pub authrole: Option<String>,
    /// Authentication methods offered by the peer, in order of preference.
    pub authmethods: Vec<AuthMethod>,
    /// Authentication method selected for the session, once known.
    pub authmethod: Option<AuthMethod>,
    /// Identity the session joined with, once joined.
    pub identity: Option<Identity>,
}

impl SessionDetails {
    /// Reads the offered authentication information out of HELLO details.
    pub fn from_hello(realm: Uri, details: Dictionary) -> Self {
        let authid = details
            .get("authid")
            .and_then(Value::as_str)
            .map(|authid| authid.to_owned());
        let authrole = details
            .get("authrole")
            .and_then(Value::as_str)
            .map(|authrole| authrole.to_owned());
        let authmethods = details
            .get("authmethods")
            .and_then(Value::as_list)
            .map(|methods| {
                methods
                    .iter()
                    .filter_map(Value::as_str)
                    .map(AuthMethod::from)
                    .collect()
            })
            .unwrap_or_default();
        Self {
            realm,
            details,
            authid,
            authrole,
            authmethods,
            authmethod: None,
            identity: None,
        }
    }
}

/// The authentication method chosen for a new session.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct AuthMethodSelection {
    /// The selected method. Anything other than anonymous sends a CHALLENGE.
    pub method: AuthMethod,
    /// Extra data sent with the CHALLENGE.
    pub extra: Dictionary,
}

/// An action that must be authorized before the router performs it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthAction {
    Register,
    Call,
    Subscribe,
    Publish,
}

impl From<AuthAction> for &'static str {
    fn from(value: AuthAction) -> Self {
        match value {
            AuthAction::Register => "register",
            AuthAction::Call => "call",
            AuthAction::Subscribe => "subscribe",
            AuthAction::Publish => "publish",
        }
    }
}

impl Display for AuthAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str((*self).into())
    }
}

/// Selects the authentication method for a session that sent HELLO.
#[async_trait]
pub trait AuthMethodSelector: Send + Sync {
    async fn select(&self, details: &SessionDetails) -> Result<AuthMethodSelection>;
}

/// Verifies the credentials a peer sent in AUTHENTICATE.
///
/// On success, the returned identity becomes the session's authentication ID and role.
#[async_trait]
pub trait CredentialVerifier: Send + Sync {
    async fn verify(
        &self,
        details: &SessionDetails,
        signature: &str,
        extra: &Dictionary,
    ) -> Result<Identity>;
}

/// Authorizes individual actions of a joined session.
///
/// `Ok(false)` denies the action. An error closes the session.
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(
        &self,
        details: &SessionDetails,
        action: AuthAction,
        uri: Option<&Uri>,
    ) -> Result<bool>;
}

/// Selects anonymous authentication for every session.
#[derive(Debug, Default)]
pub struct AnonymousAuthMethodSelector {}

#[async_trait]
impl AuthMethodSelector for AnonymousAuthMethodSelector {
    async fn select(&self, _: &SessionDetails) -> Result<AuthMethodSelection> {
        Ok(AuthMethodSelection::default())
    }
}

/// Accepts every credential, granting the identity the peer offered.
#[derive(Debug, Default)]
pub struct AcceptAllCredentialVerifier {}

#[async_trait]
impl CredentialVerifier for AcceptAllCredentialVerifier {
    async fn verify(&self, details: &SessionDetails, _: &str, _: &Dictionary) -> Result<Identity> {
        let mut identity = Identity::anonymous(details.authid.as_deref());
        if let Some(role) = &details.authrole {
            identity.role = role.clone();
        }
        Ok(identity)
    }
}

/// Allows every action.
#[derive(Debug, Default)]
pub struct AllowAllAuthorizer {}

#[async_trait]
impl Authorizer for AllowAllAuthorizer {
    async fn authorize(&self, _: &SessionDetails, _: AuthAction, _: Option<&Uri>) -> Result<bool> {
        Ok(true)
    }
}

/// The set of security hooks injected into a router.
pub struct SecurityPolicies {
    pub auth_method_selector: Box<dyn AuthMethodSelector>,
    pub credential_verifier: Box<dyn CredentialVerifier>,
    pub authorizer: Box<dyn Authorizer>,
}

impl Default for SecurityPolicies {
    fn default() -> Self {
        Self {
            auth_method_selector: Box::new(AnonymousAuthMethodSelector::default()),
            credential_verifier: Box::new(AcceptAllCredentialVerifier::default()),
            authorizer: Box::new(AllowAllAuthorizer::default()),
        }
    }
}

#[cfg(test)]
mod security_test {
    use crate::{
        auth::{
            auth_method::AuthMethod,
            security::SessionDetails,
        },
        core::{
            types::Dictionary,
            uri::Uri,
        },
    };

    #[test]
    fn reads_offered_authentication_from_hello() {
        let details: Dictionary = serde_json::from_str(
            r#"{"authid": "alice", "authmethods": ["ticket", "x-token", 3], "roles": {}}"#,
        )
        .unwrap();
        let session_details = SessionDetails::from_hello(Uri::from("com.test"), details);
        assert_eq!(session_details.authid, Some("alice".to_owned()));
        assert_eq!(session_details.authrole, None);
        assert_eq!(
            session_details.authmethods,
            vec![AuthMethod::Ticket, AuthMethod::Other("x-token".to_owned())]
        );
    }
}
