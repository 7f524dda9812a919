use anyhow::Error;
use thiserror::Error;

use crate::core::uri::{
    InvalidUri,
    Uri,
};

/// A basic error that occurs while processing a WAMP message.
#[derive(Debug, Error)]
pub enum BasicError {
    /// A generic resource was not found.
    ///
    /// WAMP defines standard URIs for not finding specific resource types. This error should only
    /// be used when the standard URI cannot be used.
    #[error("{0}")]
    NotFound(String),
    /// An invalid argument was passed.
    #[error("{0}")]
    InvalidArgument(String),
    /// Some internal error occurred.
    #[error("{0}")]
    Internal(String),
}

impl BasicError {
    /// The trailing URI component for the error.
    pub fn uri_component(&self) -> &str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::Internal(_) => "internal",
        }
    }
}

/// An interaction error that occurs while processing a WAMP message.
///
/// Interaction errors are clearly defined in the WAMP standard and are reserved for errors that
/// peers must be able to parse easily.
#[derive(Debug, Error)]
pub enum InteractionError {
    /// The incoming message violates the WAMP protocol.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    /// The procedure being called does not exist.
    #[error("no such procedure")]
    NoSuchProcedure,
    /// The registration being referenced does not exist.
    #[error("no such registration")]
    NoSuchRegistration,
    /// The subscription being referenced does not exist.
    #[error("no such subscription")]
    NoSuchSubscription,
    /// The realm being referenced does not exist.
    #[error("no such realm")]
    NoSuchRealm,
    /// The session being referenced does not exist.
    #[error("no such session")]
    NoSuchSession,
    /// The role being referenced does not exist.
    #[error("no such role")]
    NoSuchRole,
    /// Authentication or authorization of the peer could not be completed.
    #[error("authorization failed: {0}")]
    AuthorizationFailed(String),
    /// The peer is not allowed to perform the action.
    #[error("not authorized")]
    NotAuthorized,
    /// The procedure being registered already exists.
    #[error("procedure already exists")]
    ProcedureAlreadyExists,
    /// The procedure is registered with a different invocation policy.
    #[error("procedure exists with different invocation policy")]
    ProcedureExistsWithDifferentInvocationPolicy,
    /// The callee failed to process the invocation.
    #[error("callee failure")]
    CalleeFailure,
    /// The session is ending after a GOODBYE from the peer.
    #[error("goodbye and out")]
    GoodbyeAndOut,
    /// A URI argument is malformed.
    #[error("invalid uri")]
    InvalidUri,
    /// The call was canceled.
    #[error("canceled")]
    Canceled,
    /// An option is not allowed for the request.
    #[error("option not allowed: {0}")]
    OptionNotAllowed(String),
    /// The peer asked for its identity to be disclosed, which the router disallows.
    #[error("option disallowed: disclose_me")]
    OptionDisallowedDiscloseMe,
    /// The underlying connection failed.
    #[error("network failure")]
    NetworkFailure,
    /// The callee cannot serve the invocation right now.
    #[error("unavailable")]
    Unavailable,
    /// Every callee of the procedure is unavailable.
    #[error("no available callee")]
    NoAvailableCallee,
}

impl InteractionError {
    /// The trailing URI component for the error.
    pub fn uri_component(&self) -> &str {
        match self {
            Self::ProtocolViolation(_) => "protocol_violation",
            Self::NoSuchProcedure => "no_such_procedure",
            Self::NoSuchRegistration => "no_such_registration",
            Self::NoSuchSubscription => "no_such_subscription",
            Self::NoSuchRealm => "no_such_realm",
            Self::NoSuchSession => "no_such_session",
            Self::NoSuchRole => "no_such_role",
            Self::AuthorizationFailed(_) => "authorization_failed",
            Self::NotAuthorized => "not_authorized",
            Self::ProcedureAlreadyExists => "procedure_already_exists",
            Self::ProcedureExistsWithDifferentInvocationPolicy => {
                "procedure_exists_with_different_invocation_policy"
            }
            Self::CalleeFailure => "callee_failure",
            Self::GoodbyeAndOut => "goodbye_and_out",
            Self::InvalidUri => "invalid_uri",
            Self::Canceled => "canceled",
            Self::OptionNotAllowed(_) => "option_not_allowed",
            Self::OptionDisallowedDiscloseMe => "option_disallowed.disclose_me",
            Self::NetworkFailure => "network_failure",
            Self::Unavailable => "unavailable",
            Self::NoAvailableCallee => "no_available_callee",
        }
    }

    /// The full error URI.
    pub fn uri(&self) -> Uri {
        Uri::from_known(format!("wamp.error.{}", self.uri_component()))
    }
}

impl Uri {
    /// The error URI describing the given error.
    ///
    /// Errors that are not typed WAMP errors are reported as internal errors.
    pub fn for_error(error: &Error) -> Self {
        if let Some(error) = error.downcast_ref::<InteractionError>() {
            return error.uri();
        }
        let component = if let Some(error) = error.downcast_ref::<BasicError>() {
            error.uri_component()
        } else if error.downcast_ref::<InvalidUri>().is_some() {
            InteractionError::InvalidUri.uri_component()
        } else {
            "internal"
        };
        Self::from_known(format!("wamp.error.{component}"))
    }

    /// Checks if the URI is the given interaction error.
    pub fn is_error(&self, error: &InteractionError) -> bool {
        self.as_ref()
            .strip_prefix("wamp.error.")
            .is_some_and(|component| component == error.uri_component())
    }
}

#[cfg(test)]
mod error_test {
    use anyhow::Error;

    use crate::core::{
        error::{
            BasicError,
            InteractionError,
        },
        uri::{
            InvalidUri,
            Uri,
        },
    };

    #[test]
    fn maps_errors_to_uris() {
        assert_eq!(
            Uri::for_error(&InteractionError::NoSuchProcedure.into()).as_ref(),
            "wamp.error.no_such_procedure"
        );
        assert_eq!(
            Uri::for_error(&InteractionError::ProcedureExistsWithDifferentInvocationPolicy.into())
                .as_ref(),
            "wamp.error.procedure_exists_with_different_invocation_policy"
        );
        assert_eq!(
            Uri::for_error(&InteractionError::OptionDisallowedDiscloseMe.into()).as_ref(),
            "wamp.error.option_disallowed.disclose_me"
        );
        assert_eq!(
            Uri::for_error(&BasicError::InvalidArgument("bad".to_owned()).into()).as_ref(),
            "wamp.error.invalid_argument"
        );
        assert_eq!(
            Uri::for_error(&InvalidUri.into()).as_ref(),
            "wamp.error.invalid_uri"
        );
        assert_eq!(
            Uri::for_error(&Error::msg("something else")).as_ref(),
            "wamp.error.internal"
        );
    }

    #[test]
    fn maps_errors_through_context() {
        let error = Error::from(InteractionError::NotAuthorized).context("failed to publish");
        assert_eq!(Uri::for_error(&error).as_ref(), "wamp.error.not_authorized");
    }

    #[test]
    fn compares_uri_to_error() {
        assert!(Uri::from("wamp.error.unavailable").is_error(&InteractionError::Unavailable));
        assert!(!Uri::from("com.myapp.unavailable").is_error(&InteractionError::Unavailable));
    }
}
