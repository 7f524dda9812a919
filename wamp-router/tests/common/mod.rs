#![allow(dead_code)]

use std::time::Duration;

use anyhow::{
    Error,
    Result,
};
use futures_util::{
    SinkExt,
    StreamExt,
};
use wamp_router::{
    auth::security::SecurityPolicies,
    core::{
        id::Id,
        stream::{
            MessageStream,
            StreamMessage,
        },
        types::{
            Dictionary,
            List,
            Value,
        },
        uri::Uri,
    },
    message::message::{
        CallMessage,
        GoodbyeMessage,
        HelloMessage,
        Message,
        PublishMessage,
        RegisterMessage,
        SubscribeMessage,
        YieldMessage,
    },
    router::{
        RealmConfig,
        RouterConfig,
        RouterHandle,
        new_web_socket_router,
    },
};

pub const REALM: &str = "com.test.realm";

const RECEIVE_TIMEOUT: Duration = Duration::from_secs(2);
const SILENCE_TIMEOUT: Duration = Duration::from_millis(100);

pub fn id(value: u64) -> Id {
    Id::try_from(value).unwrap()
}

pub fn dictionary(json: &str) -> Dictionary {
    serde_json::from_str(json).unwrap()
}

pub async fn start_router(config: RouterConfig, security_policies: SecurityPolicies) -> RouterHandle {
    let router = new_web_socket_router(config, security_policies).unwrap();
    router.start().await.unwrap()
}

pub async fn start_default_router() -> RouterHandle {
    let mut config = RouterConfig::default();
    config.realms.push(RealmConfig {
        name: "test".to_owned(),
        uri: Uri::from(REALM),
    });
    start_router(config, SecurityPolicies::default()).await
}

pub async fn stop_router(router_handle: RouterHandle) {
    router_handle.cancel().unwrap();
    router_handle.join().await.unwrap();
}

/// A peer talking raw WAMP messages to the router over a direct connection.
pub struct TestPeer {
    stream: Box<dyn MessageStream>,
    next_request: u64,
}

impl TestPeer {
    pub fn connect(router_handle: &RouterHandle) -> Self {
        Self {
            stream: router_handle.direct_connect().stream(),
            next_request: 0,
        }
    }

    /// Connects and joins the test realm as a peer with every role.
    pub async fn join(router_handle: &RouterHandle) -> (Self, Id) {
        Self::join_with_details(router_handle, all_roles()).await
    }

    pub async fn join_with_details(router_handle: &RouterHandle, details: Dictionary) -> (Self, Id) {
        let mut peer = Self::connect(router_handle);
        peer.send(Message::Hello(HelloMessage {
            realm: Uri::from(REALM),
            details,
        }))
        .await;
        let session = match peer.recv().await {
            Message::Welcome(welcome) => welcome.session,
            message => panic!("expected WELCOME, got {message:?}"),
        };
        (peer, session)
    }

    pub fn request(&mut self) -> Id {
        self.next_request += 1;
        id(self.next_request)
    }

    pub async fn send(&mut self, message: Message) {
        self.stream
            .send(StreamMessage::Message(message))
            .await
            .unwrap();
    }

    pub async fn try_recv(&mut self) -> Result<Option<Message>> {
        match tokio::time::timeout(RECEIVE_TIMEOUT, self.stream.next()).await {
            Ok(Some(Ok(StreamMessage::Message(message)))) => Ok(Some(message)),
            Ok(Some(Ok(StreamMessage::Ping(_)))) => Err(Error::msg("unexpected ping")),
            Ok(Some(Err(err))) => Err(err),
            Ok(None) => Ok(None),
            Err(_) => Err(Error::msg("timed out waiting for message")),
        }
    }

    pub async fn recv(&mut self) -> Message {
        match self.try_recv().await {
            Ok(Some(message)) => message,
            Ok(None) => panic!("connection closed"),
            Err(err) => panic!("{err:#}"),
        }
    }

    /// Asserts that the router closed the connection.
    pub async fn assert_closed(&mut self) {
        assert_matches::assert_matches!(self.try_recv().await, Ok(None));
    }

    /// Asserts that no message arrives for a short while.
    pub async fn assert_silent(&mut self) {
        assert_matches::assert_matches!(
            tokio::time::timeout(SILENCE_TIMEOUT, self.stream.next()).await,
            Err(_)
        );
    }

    pub async fn register(&mut self, procedure: &str, options: Dictionary) -> Id {
        let request = self.request();
        self.send(Message::Register(RegisterMessage {
            request,
            options,
            procedure: Uri::from(procedure),
        }))
        .await;
        match self.recv().await {
            Message::Registered(registered) => {
                assert_eq!(registered.register_request, request);
                registered.registration
            }
            message => panic!("expected REGISTERED, got {message:?}"),
        }
    }

    pub async fn subscribe(&mut self, topic: &str, options: Dictionary) -> Id {
        let request = self.request();
        self.send(Message::Subscribe(SubscribeMessage {
            request,
            options,
            topic: Uri::from(topic),
        }))
        .await;
        match self.recv().await {
            Message::Subscribed(subscribed) => {
                assert_eq!(subscribed.subscribe_request, request);
                subscribed.subscription
            }
            message => panic!("expected SUBSCRIBED, got {message:?}"),
        }
    }

    /// Sends a CALL, returning its request ID.
    pub async fn call(&mut self, procedure: &str, options: Dictionary, arguments: List) -> Id {
        let request = self.request();
        self.send(Message::Call(CallMessage {
            request,
            options,
            procedure: Uri::from(procedure),
            arguments,
            arguments_keyword: Dictionary::default(),
        }))
        .await;
        request
    }

    /// Sends a PUBLISH, returning its request ID.
    pub async fn publish(&mut self, topic: &str, options: Dictionary, arguments: List) -> Id {
        let request = self.request();
        self.send(Message::Publish(PublishMessage {
            request,
            options,
            topic: Uri::from(topic),
            arguments,
            arguments_keyword: Dictionary::default(),
        }))
        .await;
        request
    }

    pub async fn yield_result(&mut self, invocation: Id, options: Dictionary, arguments: List) {
        self.send(Message::Yield(YieldMessage {
            invocation_request: invocation,
            options,
            arguments,
            arguments_keyword: Dictionary::default(),
        }))
        .await;
    }

    pub async fn goodbye(&mut self) {
        self.send(Message::Goodbye(GoodbyeMessage {
            details: Dictionary::default(),
            reason: Uri::from("wamp.close.normal"),
        }))
        .await;
    }
}

/// HELLO details announcing every client role, with call canceling for callees.
pub fn all_roles() -> Dictionary {
    dictionary(
        r#"{
            "roles": {
                "caller": {},
                "callee": { "features": { "call_canceling": true } },
                "publisher": {},
                "subscriber": {}
            }
        }"#,
    )
}

pub fn string(value: &str) -> Value {
    Value::from(value)
}
