use anyhow::Error;

use crate::{
    core::{
        close::CloseReason,
        id::Id,
        types::{
            Dictionary,
            Integer,
            Value,
        },
        uri::Uri,
    },
    message::message::{
        AbortMessage,
        ErrorMessage,
        GoodbyeMessage,
        Message,
    },
};

fn details_for_error(error: &Error) -> Dictionary {
    Dictionary::from_iter([("message".to_owned(), Value::String(format!("{error:#}")))])
}

/// An ABORT message describing the given error.
pub fn abort_message_for_error(error: &Error) -> Message {
    Message::Abort(AbortMessage {
        details: details_for_error(error),
        reason: Uri::for_error(error),
    })
}

/// A GOODBYE message closing the session for the given reason.
pub fn goodbye_with_close_reason(close_reason: CloseReason) -> Message {
    goodbye_with_close_reason_and_message(close_reason, None)
}

/// A GOODBYE message closing the session for the given reason, with an optional human-readable
/// message.
pub fn goodbye_with_close_reason_and_message(
    close_reason: CloseReason,
    message: Option<String>,
) -> Message {
    let details = match message {
        Some(message) => Dictionary::from_iter([("message".to_owned(), Value::String(message))]),
        None => Dictionary::default(),
    };
    Message::Goodbye(GoodbyeMessage {
        details,
        reason: close_reason.uri(),
    })
}

/// The GOODBYE reply to a peer-initiated GOODBYE.
pub fn goodbye_and_out() -> Message {
    goodbye_with_close_reason(CloseReason::GoodbyeAndOut)
}

/// An ERROR message answering the request with the given error.
pub fn error_for_request(message: &Message, error: &Error) -> Message {
    error_for_request_id(message.tag(), message.request_id().unwrap_or_default(), error)
}

/// An ERROR message answering a request of the given type, by request ID.
pub fn error_for_request_id(request_type: Integer, request: Id, error: &Error) -> Message {
    Message::Error(ErrorMessage {
        request_type,
        request,
        details: details_for_error(error),
        error: Uri::for_error(error),
        ..Default::default()
    })
}

#[cfg(test)]
mod common_test {
    use anyhow::Error;

    use crate::{
        core::{
            error::InteractionError,
            id::Id,
            types::Value,
        },
        message::{
            common::{
                abort_message_for_error,
                error_for_request,
                goodbye_and_out,
            },
            message::{
                Message,
                UnregisterMessage,
            },
        },
    };

    #[test]
    fn builds_error_for_request() {
        let request = Message::Unregister(UnregisterMessage {
            request: Id::try_from(12).unwrap(),
            registered_registration: Id::try_from(99).unwrap(),
        });
        assert_matches::assert_matches!(
            error_for_request(&request, &InteractionError::NoSuchRegistration.into()),
            Message::Error(message) => {
                assert_eq!(message.request_type, Message::UNREGISTER_TAG);
                assert_eq!(message.request, Id::try_from(12).unwrap());
                assert_eq!(message.error.as_ref(), "wamp.error.no_such_registration");
                assert_eq!(message.details.get("message"), Some(&Value::from("no such registration")));
            }
        );
    }

    #[test]
    fn builds_closing_messages() {
        assert_matches::assert_matches!(
            abort_message_for_error(&Error::from(InteractionError::ProtocolViolation("bad".to_owned()))),
            Message::Abort(message) => {
                assert_eq!(message.reason.as_ref(), "wamp.error.protocol_violation");
            }
        );
        assert_matches::assert_matches!(goodbye_and_out(), Message::Goodbye(message) => {
            assert_eq!(message.reason.as_ref(), "wamp.error.goodbye_and_out");
        });
    }
}
