//! Framing of serialized WAMP messages over a network stream.

use std::{
    pin::Pin,
    task,
};

use anyhow::{
    Error,
    Result,
};
use futures_util::{
    Sink,
    SinkExt,
    Stream,
    StreamExt,
};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream,
    WebSocketStream,
    tungstenite::Message,
};

use crate::serializer::serializer::SerializerType;

/// A frame read from or written to a [`Transport`].
#[derive(Debug)]
pub enum TransportData {
    /// Keep-alive payload, echoed back to the peer as-is.
    Ping(Vec<u8>),
    /// One serialized WAMP message.
    Message(Vec<u8>),
}

/// A framed byte channel to a single peer.
///
/// A frame that cannot carry a WAMP message under the negotiated serializer is yielded as an error.
pub trait Transport:
    Send + Stream<Item = Result<TransportData>> + Sink<TransportData, Error = Error> + Unpin
{
}

/// Wraps each accepted stream in a [`Transport`].
pub trait TransportFactory<S>: Send + Sync {
    fn new_transport(&self, stream: S, serializer_type: SerializerType) -> Box<dyn Transport>;
}

/// WAMP over WebSocket.
///
/// Text frames carry JSON and binary frames carry MessagePack. A frame of the wrong kind for the
/// negotiated serializer is an error.
pub struct WebSocketTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    binary: bool,
}

impl WebSocketTransport {
    fn frame_data(&self, message: Message) -> Option<Result<TransportData>> {
        match message {
            Message::Ping(data) => Some(Ok(TransportData::Ping(data.to_vec()))),
            Message::Text(text) if !self.binary => {
                Some(Ok(TransportData::Message(text.as_bytes().to_vec())))
            }
            Message::Binary(data) if self.binary => {
                Some(Ok(TransportData::Message(data.to_vec())))
            }
            Message::Text(_) => Some(Err(Error::msg("expected binary frame"))),
            Message::Binary(_) => Some(Err(Error::msg("expected text frame"))),
            Message::Pong(_) | Message::Frame(_) | Message::Close(_) => None,
        }
    }

    fn message(&self, data: TransportData) -> Result<Message> {
        Ok(match data {
            TransportData::Ping(data) => Message::Pong(data.into()),
            TransportData::Message(data) if self.binary => Message::Binary(data.into()),
            TransportData::Message(data) => Message::Text(String::from_utf8(data)?.into()),
        })
    }
}

impl Transport for WebSocketTransport {}

impl Stream for WebSocketTransport {
    type Item = Result<TransportData>;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<Option<Self::Item>> {
        loop {
            let message = match futures_util::ready!(self.stream.poll_next_unpin(cx)) {
                Some(Ok(Message::Close(_))) | None => return task::Poll::Ready(None),
                Some(Ok(message)) => message,
                Some(Err(err)) => return task::Poll::Ready(Some(Err(err.into()))),
            };
            if let Some(data) = self.frame_data(message) {
                return task::Poll::Ready(Some(data));
            }
        }
    }
}

impl Sink<TransportData> for WebSocketTransport {
    type Error = Error;

    fn poll_ready(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<Result<(), Self::Error>> {
        self.stream.poll_ready_unpin(cx).map_err(Error::new)
    }

    fn start_send(mut self: Pin<&mut Self>, item: TransportData) -> Result<(), Self::Error> {
        let message = self.message(item)?;
        self.stream.start_send_unpin(message).map_err(Error::new)
    }

    fn poll_flush(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<Result<(), Self::Error>> {
        self.stream.poll_flush_unpin(cx).map_err(Error::new)
    }

    fn poll_close(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<Result<(), Self::Error>> {
        self.stream.poll_close_unpin(cx).map_err(Error::new)
    }
}

#[derive(Default)]
pub struct WebSocketTransportFactory {}

impl TransportFactory<WebSocketStream<MaybeTlsStream<TcpStream>>> for WebSocketTransportFactory {
    fn new_transport(
        &self,
        stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
        serializer_type: SerializerType,
    ) -> Box<dyn Transport> {
        Box::new(WebSocketTransport {
            stream,
            binary: serializer_type.is_binary(),
        })
    }
}
