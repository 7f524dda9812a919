mod common;

use assert_matches::assert_matches;
use common::{
    TestPeer,
    dictionary,
    start_default_router,
    stop_router,
    string,
};
use pretty_assertions::assert_eq;
use wamp_router::{
    core::{
        error::InteractionError,
        id::Id,
        types::{
            Dictionary,
            Value,
        },
        uri::Uri,
    },
    message::message::{
        CancelMessage,
        ErrorMessage,
        Message,
        RegisterMessage,
    },
};

fn unavailable(invocation: Id) -> Message {
    Message::Error(ErrorMessage {
        request_type: Message::INVOCATION_TAG,
        request: invocation,
        details: Dictionary::default(),
        error: InteractionError::Unavailable.uri(),
        arguments: Vec::default(),
        arguments_keyword: Dictionary::default(),
    })
}

#[tokio::test]
async fn routes_call_to_callee_and_result_to_caller() {
    test_utils::setup::setup_test_environment();

    let router_handle = start_default_router().await;
    let (mut callee, _) = TestPeer::join(&router_handle).await;
    let registration = callee.register("com.test.echo", Dictionary::default()).await;

    let (mut caller, _) = TestPeer::join(&router_handle).await;
    let request = caller
        .call("com.test.echo", Dictionary::default(), vec![string("hello")])
        .await;

    let invocation = assert_matches!(callee.recv().await, Message::Invocation(invocation) => {
        assert_eq!(invocation.registered_registration, registration);
        assert_eq!(invocation.call_arguments, vec![string("hello")]);
        assert_eq!(invocation.details, Dictionary::default());
        invocation.request
    });
    callee
        .yield_result(invocation, Dictionary::default(), vec![string("hello")])
        .await;

    assert_matches!(caller.recv().await, Message::Result(result) => {
        assert_eq!(result.call_request, request);
        assert_eq!(result.yield_arguments, vec![string("hello")]);
    });

    // The invocation is finished, so a second answer goes nowhere.
    callee
        .yield_result(invocation, Dictionary::default(), vec![string("again")])
        .await;
    caller.assert_silent().await;
    callee.assert_silent().await;

    stop_router(router_handle).await;
}

#[tokio::test]
async fn fails_call_to_missing_procedure() {
    test_utils::setup::setup_test_environment();

    let router_handle = start_default_router().await;
    let (mut caller, _) = TestPeer::join(&router_handle).await;
    let request = caller
        .call("com.test.missing", Dictionary::default(), Vec::default())
        .await;

    assert_matches!(caller.recv().await, Message::Error(error) => {
        assert_eq!(error.request_type, Message::CALL_TAG);
        assert_eq!(error.request, request);
        assert_eq!(error.error, InteractionError::NoSuchProcedure.uri());
    });

    stop_router(router_handle).await;
}

#[tokio::test]
async fn rejects_duplicate_single_registration() {
    test_utils::setup::setup_test_environment();

    let router_handle = start_default_router().await;
    let (mut first, _) = TestPeer::join(&router_handle).await;
    first.register("com.test.single", Dictionary::default()).await;

    let (mut second, _) = TestPeer::join(&router_handle).await;
    let request = second.request();
    second
        .send(Message::Register(RegisterMessage {
            request,
            options: Dictionary::default(),
            procedure: Uri::from("com.test.single"),
        }))
        .await;
    assert_matches!(second.recv().await, Message::Error(error) => {
        assert_eq!(error.request_type, Message::REGISTER_TAG);
        assert_eq!(error.request, request);
        assert_eq!(error.error, InteractionError::ProcedureAlreadyExists.uri());
    });

    stop_router(router_handle).await;
}

#[tokio::test]
async fn kill_cancels_call_and_interrupts_callee() {
    test_utils::setup::setup_test_environment();

    let router_handle = start_default_router().await;
    let (mut callee, _) = TestPeer::join(&router_handle).await;
    callee.register("com.test.slow", Dictionary::default()).await;

    let (mut caller, _) = TestPeer::join(&router_handle).await;
    let request = caller
        .call("com.test.slow", Dictionary::default(), Vec::default())
        .await;
    let invocation = assert_matches!(callee.recv().await, Message::Invocation(invocation) => invocation.request);

    caller
        .send(Message::Cancel(CancelMessage {
            call_request: request,
            options: dictionary(r#"{"mode": "kill"}"#),
        }))
        .await;
    assert_matches!(caller.recv().await, Message::Error(error) => {
        assert_eq!(error.request, request);
        assert_eq!(error.error, InteractionError::Canceled.uri());
    });
    assert_matches!(callee.recv().await, Message::Interrupt(interrupt) => {
        assert_eq!(interrupt.invocation_request, invocation);
        assert_eq!(interrupt.options.get("mode"), Some(&Value::from("kill")));
    });

    // The callee's late answer is swallowed.
    callee
        .yield_result(invocation, Dictionary::default(), Vec::default())
        .await;
    caller.assert_silent().await;

    stop_router(router_handle).await;
}

#[tokio::test]
async fn reroutes_unavailable_callee_until_none_remain() {
    test_utils::setup::setup_test_environment();

    let router_handle = start_default_router().await;
    let options = dictionary(r#"{"invoke": "first"}"#);
    let (mut first, _) = TestPeer::join(&router_handle).await;
    first.register("com.test.shared", options.clone()).await;
    let (mut second, _) = TestPeer::join(&router_handle).await;
    second.register("com.test.shared", options).await;

    let (mut caller, _) = TestPeer::join(&router_handle).await;
    let request = caller
        .call("com.test.shared", Dictionary::default(), vec![string("x")])
        .await;

    let invocation = assert_matches!(first.recv().await, Message::Invocation(invocation) => invocation.request);
    first.send(unavailable(invocation)).await;

    let rerouted = assert_matches!(second.recv().await, Message::Invocation(invocation) => {
        assert_eq!(invocation.call_arguments, vec![string("x")]);
        invocation.request
    });
    assert_eq!(rerouted, invocation);
    second.send(unavailable(rerouted)).await;

    assert_matches!(caller.recv().await, Message::Error(error) => {
        assert_eq!(error.request, request);
        assert_eq!(error.error, InteractionError::NoAvailableCallee.uri());
    });
    first.assert_silent().await;

    stop_router(router_handle).await;
}

#[tokio::test]
async fn fails_pending_call_when_callee_leaves() {
    test_utils::setup::setup_test_environment();

    let router_handle = start_default_router().await;
    let (mut callee, _) = TestPeer::join(&router_handle).await;
    callee.register("com.test.flaky", Dictionary::default()).await;

    let (mut caller, _) = TestPeer::join(&router_handle).await;
    let request = caller
        .call("com.test.flaky", Dictionary::default(), Vec::default())
        .await;
    assert_matches!(callee.recv().await, Message::Invocation(_));
    drop(callee);

    assert_matches!(caller.recv().await, Message::Error(error) => {
        assert_eq!(error.request, request);
        assert_eq!(error.error, InteractionError::NoSuchProcedure.uri());
    });

    let request = caller
        .call("com.test.flaky", Dictionary::default(), Vec::default())
        .await;
    assert_matches!(caller.recv().await, Message::Error(error) => {
        assert_eq!(error.request, request);
        assert_eq!(error.error, InteractionError::NoSuchProcedure.uri());
    });

    stop_router(router_handle).await;
}

#[tokio::test]
async fn aborts_yield_with_invalid_options() {
    test_utils::setup::setup_test_environment();

    let router_handle = start_default_router().await;
    let (mut callee, _) = TestPeer::join(&router_handle).await;
    callee
        .yield_result(
            common::id(1),
            dictionary(r#"{"progress": "yes"}"#),
            Vec::default(),
        )
        .await;

    assert_matches!(callee.recv().await, Message::Abort(abort) => {
        assert!(abort.reason.is_error(&InteractionError::ProtocolViolation(String::default())));
    });
    callee.assert_closed().await;

    stop_router(router_handle).await;
}
