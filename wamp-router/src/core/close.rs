use crate::core::{
    error::InteractionError,
    uri::Uri,
};

/// The reason for closing a WAMP session.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub enum CloseReason {
    #[default]
    Normal,
    SystemShutdown,
    CloseRealm,
    Killed,
    GoodbyeAndOut,
    /// A reason supplied by an application, such as through `wamp.session.kill`.
    Custom(Uri),
}

impl CloseReason {
    /// URI for the close reason.
    pub fn uri(&self) -> Uri {
        let component = match self {
            Self::Normal => "normal",
            Self::SystemShutdown => "system_shutdown",
            Self::CloseRealm => "close_realm",
            Self::Killed => "killed",
            Self::GoodbyeAndOut => return InteractionError::GoodbyeAndOut.uri(),
            Self::Custom(uri) => return uri.clone(),
        };
        Uri::from_known(format!("wamp.close.{component}"))
    }
}
