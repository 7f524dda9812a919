mod common;

use anyhow::Result;
use assert_matches::assert_matches;
use common::{
    start_default_router,
    stop_router,
};
use futures_util::{
    SinkExt,
    StreamExt,
};
use pretty_assertions::assert_eq;
use serde_json::json;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream,
    WebSocketStream,
    connect_async,
    tungstenite::{
        Message,
        client::IntoClientRequest,
        http::{
            HeaderValue,
            header::SEC_WEBSOCKET_PROTOCOL,
        },
    },
};
use wamp_router::router::RouterHandle;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn connect(router_handle: &RouterHandle, protocols: &'static str) -> Result<(Socket, String)> {
    let mut request = format!("ws://{}", router_handle.local_addr()).into_client_request()?;
    request
        .headers_mut()
        .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(protocols));
    let (socket, response) = connect_async(request).await?;
    let protocol = response
        .headers()
        .get(SEC_WEBSOCKET_PROTOCOL)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_owned();
    Ok((socket, protocol))
}

async fn recv_json(socket: &mut Socket) -> serde_json::Value {
    loop {
        match socket.next().await {
            Some(Ok(Message::Text(text))) => return serde_json::from_str(text.as_str()).unwrap(),
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            message => panic!("expected text frame, got {message:?}"),
        }
    }
}

#[tokio::test]
async fn joins_over_json_web_socket() {
    test_utils::setup::setup_test_environment();

    let router_handle = start_default_router().await;
    let (mut socket, protocol) = connect(&router_handle, "wamp.2.cbor, wamp.2.json")
        .await
        .unwrap();
    assert_eq!(protocol, "wamp.2.json");

    let hello = json!([1, common::REALM, {"roles": {"caller": {}}}]);
    socket
        .send(Message::text(hello.to_string()))
        .await
        .unwrap();

    let welcome = recv_json(&mut socket).await;
    assert_eq!(welcome[0], json!(2));
    assert!(welcome[1].as_u64().is_some_and(|id| id > 0));
    assert_eq!(welcome[2]["realm"], json!(common::REALM));
    assert_eq!(welcome[2]["authrole"], json!("anonymous"));

    let goodbye = json!([6, {}, "wamp.close.close_realm"]);
    socket
        .send(Message::text(goodbye.to_string()))
        .await
        .unwrap();
    assert_eq!(
        recv_json(&mut socket).await,
        json!([6, {}, "wamp.error.goodbye_and_out"])
    );

    stop_router(router_handle).await;
}

#[tokio::test]
async fn aborts_malformed_message() {
    test_utils::setup::setup_test_environment();

    let router_handle = start_default_router().await;
    let (mut socket, _) = connect(&router_handle, "wamp.2.json").await.unwrap();

    socket.send(Message::text("[1, ")).await.unwrap();
    let abort = recv_json(&mut socket).await;
    assert_eq!(abort[0], json!(3));
    assert_eq!(abort[2], json!("wamp.error.protocol_violation"));

    stop_router(router_handle).await;
}

#[tokio::test]
async fn rejects_unsupported_protocol() {
    test_utils::setup::setup_test_environment();

    let router_handle = start_default_router().await;
    assert_matches!(connect(&router_handle, "wamp.2.cbor").await, Err(_));

    stop_router(router_handle).await;
}
