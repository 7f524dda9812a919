//! Negotiation of how the router and a freshly connected peer talk WAMP.
//!
//! Sessions are only established afterwards, over the accepted stream.

use anyhow::{
    Error,
    Result,
};
use async_trait::async_trait;
use log::debug;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream,
    WebSocketStream,
    tungstenite::{
        handshake::server::{
            Callback,
            ErrorResponse,
            Request,
            Response,
        },
        http::{
            HeaderValue,
            StatusCode,
            header::SEC_WEBSOCKET_PROTOCOL,
        },
    },
};

use crate::{
    router::router::{
        RouterConfig,
        RouterContext,
    },
    serializer::serializer::SerializerType,
};

/// A negotiated stream and the serializer the peer agreed to.
pub struct Acceptance<S> {
    pub stream: S,
    pub serializer: SerializerType,
}

/// Upgrades a raw TCP connection into a stream that carries WAMP messages.
#[async_trait]
pub trait Acceptor<S> {
    /// Fails if the peer offers no serializer the router allows.
    async fn accept(
        &self,
        context: &RouterContext<S>,
        stream: MaybeTlsStream<TcpStream>,
    ) -> Result<Acceptance<S>>;
}

/// Hands out one [`Acceptor`] per incoming connection.
pub trait AcceptorFactory<S>: Send {
    fn new_acceptor(&self) -> Box<dyn Acceptor<S> + Send>;
}

/// Picks the WAMP subprotocol for a WebSocket handshake.
///
/// The peer's order of preference wins among the serializers the router allows.
struct WebSocketWampNegotiator {
    allowed: Vec<SerializerType>,
    selected: Option<SerializerType>,
}

impl WebSocketWampNegotiator {
    fn new(config: &RouterConfig) -> Self {
        Self {
            allowed: config.serializers.iter().copied().collect(),
            selected: None,
        }
    }

    fn select(&self, offered: &str) -> Option<SerializerType> {
        offered
            .split(',')
            .filter_map(|protocol| SerializerType::try_from(protocol.trim()).ok())
            .find(|serializer| self.allowed.contains(serializer))
    }

    fn reject_response<S>(message: S) -> ErrorResponse
    where
        S: Into<String>,
    {
        let mut response = ErrorResponse::new(Some(message.into()));
        *response.status_mut() = StatusCode::BAD_REQUEST;
        response
    }

    fn callback(&mut self) -> impl Callback + use<'_> {
        |request: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
            let selected = request
                .headers()
                .get(SEC_WEBSOCKET_PROTOCOL)
                .and_then(|protocols| protocols.to_str().ok())
                .and_then(|protocols| self.select(protocols));
            let selected = match selected {
                Some(selected) => selected,
                None => return Err(Self::reject_response("no supported protocol")),
            };
            let header = match HeaderValue::from_str(selected.uri().as_str()) {
                Ok(header) => header,
                Err(_) => return Err(Self::reject_response("failed to create response header")),
            };
            response
                .headers_mut()
                .insert(SEC_WEBSOCKET_PROTOCOL, header);
            self.selected = Some(selected);
            Ok(response)
        }
    }
}

#[derive(Default)]
struct WebSocketAcceptor {}

#[async_trait]
impl Acceptor<WebSocketStream<MaybeTlsStream<TcpStream>>> for WebSocketAcceptor {
    async fn accept(
        &self,
        context: &RouterContext<WebSocketStream<MaybeTlsStream<TcpStream>>>,
        stream: MaybeTlsStream<TcpStream>,
    ) -> Result<Acceptance<WebSocketStream<MaybeTlsStream<TcpStream>>>> {
        let mut negotiator = WebSocketWampNegotiator::new(&context.router().config);
        let stream = tokio_tungstenite::accept_hdr_async(stream, negotiator.callback()).await?;
        let serializer = negotiator
            .selected
            .ok_or_else(|| Error::msg("expected protocol after negotiation"))?;
        debug!("Negotiated WebSocket subprotocol {}", serializer.uri());
        Ok(Acceptance { stream, serializer })
    }
}

/// A factory for an [`Acceptor`] for WebSocket connections.
#[derive(Default)]
pub struct WebSocketAcceptorFactory {}

impl AcceptorFactory<WebSocketStream<MaybeTlsStream<TcpStream>>> for WebSocketAcceptorFactory {
    fn new_acceptor(&self) -> Box<dyn Acceptor<WebSocketStream<MaybeTlsStream<TcpStream>>> + Send> {
        Box::new(WebSocketAcceptor::default())
    }
}
