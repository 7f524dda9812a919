mod common;

use assert_matches::assert_matches;
use common::{
    REALM,
    TestPeer,
    all_roles,
    dictionary,
    start_default_router,
    start_router,
    stop_router,
};
use pretty_assertions::assert_eq;
use wamp_router::{
    auth::security::SecurityPolicies,
    core::{
        error::InteractionError,
        types::{
            Dictionary,
            Value,
        },
        uri::Uri,
    },
    message::message::{
        HelloMessage,
        Message,
        SubscribeMessage,
    },
    router::RouterConfig,
};

#[tokio::test]
async fn welcomes_anonymous_peer() {
    test_utils::setup::setup_test_environment();

    let router_handle = start_default_router().await;
    let mut peer = TestPeer::connect(&router_handle);
    peer.send(Message::Hello(HelloMessage {
        realm: Uri::from(REALM),
        details: all_roles(),
    }))
    .await;

    assert_matches!(peer.recv().await, Message::Welcome(welcome) => {
        assert_eq!(welcome.details.get("realm"), Some(&Value::from(REALM)));
        assert_eq!(welcome.details.get("authid"), Some(&Value::from("anonymous")));
        assert_eq!(welcome.details.get("authrole"), Some(&Value::from("anonymous")));
        assert_eq!(welcome.details.get("authmethod"), Some(&Value::from("anonymous")));
        assert_eq!(welcome.details.get("authprovider"), Some(&Value::from("static")));
        assert_matches!(welcome.details.get("agent"), Some(Value::String(agent)) => {
            assert!(agent.starts_with("wamp-router"));
        });
        assert_matches!(welcome.details.get("roles").and_then(Value::as_dictionary), Some(roles) => {
            assert!(roles.contains_key("broker"));
            assert!(roles.contains_key("dealer"));
        });
    });

    stop_router(router_handle).await;
}

#[tokio::test]
async fn keeps_offered_authid_for_anonymous_peer() {
    test_utils::setup::setup_test_environment();

    let router_handle = start_default_router().await;
    let mut peer = TestPeer::connect(&router_handle);
    peer.send(Message::Hello(HelloMessage {
        realm: Uri::from(REALM),
        details: dictionary(r#"{"roles": {"caller": {}}, "authid": "alice"}"#),
    }))
    .await;

    assert_matches!(peer.recv().await, Message::Welcome(welcome) => {
        assert_eq!(welcome.details.get("authid"), Some(&Value::from("alice")));
        assert_eq!(welcome.details.get("authrole"), Some(&Value::from("anonymous")));
    });

    stop_router(router_handle).await;
}

#[tokio::test]
async fn answers_goodbye_and_closes() {
    test_utils::setup::setup_test_environment();

    let router_handle = start_default_router().await;
    let (mut peer, _) = TestPeer::join(&router_handle).await;
    peer.goodbye().await;

    assert_matches!(peer.recv().await, Message::Goodbye(goodbye) => {
        assert_eq!(goodbye.reason, InteractionError::GoodbyeAndOut.uri());
    });
    peer.assert_closed().await;

    stop_router(router_handle).await;
}

#[tokio::test]
async fn aborts_message_before_hello() {
    test_utils::setup::setup_test_environment();

    let router_handle = start_default_router().await;
    let mut peer = TestPeer::connect(&router_handle);
    peer.send(Message::Subscribe(SubscribeMessage {
        request: common::id(1),
        options: Dictionary::default(),
        topic: Uri::from("com.test.topic"),
    }))
    .await;

    assert_matches!(peer.recv().await, Message::Abort(abort) => {
        assert!(abort.reason.is_error(&InteractionError::ProtocolViolation(String::default())));
    });
    peer.assert_closed().await;

    stop_router(router_handle).await;
}

#[tokio::test]
async fn aborts_second_hello() {
    test_utils::setup::setup_test_environment();

    let router_handle = start_default_router().await;
    let (mut peer, _) = TestPeer::join(&router_handle).await;
    peer.send(Message::Hello(HelloMessage {
        realm: Uri::from(REALM),
        details: all_roles(),
    }))
    .await;

    assert_matches!(peer.recv().await, Message::Abort(abort) => {
        assert!(abort.reason.is_error(&InteractionError::ProtocolViolation(String::default())));
    });
    peer.assert_closed().await;

    stop_router(router_handle).await;
}

#[tokio::test]
async fn aborts_unknown_realm_without_auto_creation() {
    test_utils::setup::setup_test_environment();

    let config = RouterConfig {
        auto_create_realms: false,
        ..Default::default()
    };
    let router_handle = start_router(config, SecurityPolicies::default()).await;
    let mut peer = TestPeer::connect(&router_handle);
    peer.send(Message::Hello(HelloMessage {
        realm: Uri::from("com.test.missing"),
        details: all_roles(),
    }))
    .await;

    assert_matches!(peer.recv().await, Message::Abort(abort) => {
        assert_eq!(abort.reason, InteractionError::NoSuchRealm.uri());
    });
    peer.assert_closed().await;

    stop_router(router_handle).await;
}

#[tokio::test]
async fn creates_unknown_realm_on_demand() {
    test_utils::setup::setup_test_environment();

    let router_handle = start_router(RouterConfig::default(), SecurityPolicies::default()).await;
    let mut peer = TestPeer::connect(&router_handle);
    peer.send(Message::Hello(HelloMessage {
        realm: Uri::from("com.test.created"),
        details: all_roles(),
    }))
    .await;

    assert_matches!(peer.recv().await, Message::Welcome(welcome) => {
        assert_eq!(welcome.details.get("realm"), Some(&Value::from("com.test.created")));
    });

    stop_router(router_handle).await;
}

#[tokio::test]
async fn rejects_caller_disclosure_when_disallowed() {
    test_utils::setup::setup_test_environment();

    let mut config = RouterConfig {
        allow_caller_disclosure: false,
        ..Default::default()
    };
    config.realms.push(wamp_router::router::RealmConfig {
        name: "test".to_owned(),
        uri: Uri::from(REALM),
    });
    let router_handle = start_router(config, SecurityPolicies::default()).await;
    let (mut callee, _) = TestPeer::join(&router_handle).await;
    callee
        .register("com.test.procedure", Dictionary::default())
        .await;

    let (mut caller, _) = TestPeer::join(&router_handle).await;
    let request = caller
        .call(
            "com.test.procedure",
            dictionary(r#"{"disclose_me": true}"#),
            Vec::default(),
        )
        .await;
    assert_matches!(caller.recv().await, Message::Error(error) => {
        assert_eq!(error.request_type, Message::CALL_TAG);
        assert_eq!(error.request, request);
        assert_eq!(error.error, InteractionError::OptionDisallowedDiscloseMe.uri());
    });
    callee.assert_silent().await;

    stop_router(router_handle).await;
}

#[tokio::test]
async fn shutdown_says_goodbye_to_joined_sessions() {
    test_utils::setup::setup_test_environment();

    let router_handle = start_default_router().await;
    let (mut peer, _) = TestPeer::join(&router_handle).await;
    router_handle.cancel().unwrap();

    assert_matches!(peer.recv().await, Message::Goodbye(goodbye) => {
        assert_eq!(goodbye.reason, Uri::from("wamp.close.system_shutdown"));
    });
    peer.assert_closed().await;
    router_handle.join().await.unwrap();
}
