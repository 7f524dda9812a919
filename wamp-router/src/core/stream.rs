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
use tokio::sync::mpsc::{
    UnboundedReceiver,
    UnboundedSender,
};

use crate::{
    core::peer_info::ConnectionType,
    message::message::Message,
    serializer::serializer::Serializer,
    transport::{
        Transport,
        TransportData,
    },
};

/// An item flowing through a [`MessageStream`].
#[derive(Debug, Clone, PartialEq)]
pub enum StreamMessage {
    Ping(Vec<u8>),
    Message(Message),
}

/// A bidirectional stream of WAMP messages.
pub trait MessageStream:
    Send + Stream<Item = Result<StreamMessage>> + Sink<StreamMessage, Error = Error> + Unpin
{
    /// The type of stream, mostly for logging.
    fn message_stream_type(&self) -> &'static str;

    /// The type of connection the stream communicates over.
    fn connection_type(&self) -> ConnectionType;
}

/// A [`MessageStream`] over a serialized [`Transport`].
pub struct TransportMessageStream {
    transport: Box<dyn Transport>,
    serializer: Box<dyn Serializer>,
    connection_type: ConnectionType,
}

impl TransportMessageStream {
    pub fn new(
        transport: Box<dyn Transport>,
        serializer: Box<dyn Serializer>,
        connection_type: ConnectionType,
    ) -> Self {
        Self {
            transport,
            serializer,
            connection_type,
        }
    }
}

impl MessageStream for TransportMessageStream {
    fn message_stream_type(&self) -> &'static str {
        "transport"
    }

    fn connection_type(&self) -> ConnectionType {
        self.connection_type.clone()
    }
}

impl Stream for TransportMessageStream {
    type Item = Result<StreamMessage>;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<Option<Self::Item>> {
        match futures_util::ready!(self.transport.poll_next_unpin(cx)) {
            Some(Ok(TransportData::Ping(data))) => {
                task::Poll::Ready(Some(Ok(StreamMessage::Ping(data))))
            }
            Some(Ok(TransportData::Message(data))) => {
                let message = self.serializer.deserialize(&data)?;
                task::Poll::Ready(Some(Ok(StreamMessage::Message(message))))
            }
            Some(Err(err)) => task::Poll::Ready(Some(Err(err))),
            None => task::Poll::Ready(None),
        }
    }
}

impl Sink<StreamMessage> for TransportMessageStream {
    type Error = Error;

    fn poll_ready(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<Result<(), Self::Error>> {
        self.transport.poll_ready_unpin(cx)
    }

    fn start_send(mut self: Pin<&mut Self>, item: StreamMessage) -> Result<(), Self::Error> {
        let data = match item {
            StreamMessage::Ping(data) => TransportData::Ping(data),
            StreamMessage::Message(message) => {
                TransportData::Message(self.serializer.serialize(&message)?)
            }
        };
        self.transport.start_send_unpin(data)
    }

    fn poll_flush(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<Result<(), Self::Error>> {
        self.transport.poll_flush_unpin(cx)
    }

    fn poll_close(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<Result<(), Self::Error>> {
        self.transport.poll_close_unpin(cx)
    }
}

/// A [`MessageStream`] that passes messages over in-process channels, skipping serialization.
///
/// Both ends of a direct connection are a [`DirectMessageStream`]. Closing one end ends the
/// stream on the other.
pub struct DirectMessageStream {
    message_tx: Option<UnboundedSender<Message>>,
    message_rx: UnboundedReceiver<Message>,
}

impl DirectMessageStream {
    pub fn new(message_tx: UnboundedSender<Message>, message_rx: UnboundedReceiver<Message>) -> Self {
        Self {
            message_tx: Some(message_tx),
            message_rx,
        }
    }
}

impl MessageStream for DirectMessageStream {
    fn message_stream_type(&self) -> &'static str {
        "direct"
    }

    fn connection_type(&self) -> ConnectionType {
        ConnectionType::Direct
    }
}

impl Stream for DirectMessageStream {
    type Item = Result<StreamMessage>;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<Option<Self::Item>> {
        self.message_rx
            .poll_recv(cx)
            .map(|message| message.map(|message| Ok(StreamMessage::Message(message))))
    }
}

impl Sink<StreamMessage> for DirectMessageStream {
    type Error = Error;

    fn poll_ready(
        self: Pin<&mut Self>,
        _: &mut task::Context<'_>,
    ) -> task::Poll<Result<(), Self::Error>> {
        task::Poll::Ready(Ok(()))
    }

    fn start_send(mut self: Pin<&mut Self>, item: StreamMessage) -> Result<(), Self::Error> {
        let message = match item {
            // Direct connections have no keep-alive.
            StreamMessage::Ping(_) => return Ok(()),
            StreamMessage::Message(message) => message,
        };
        match &self.message_tx {
            Some(message_tx) => message_tx.send(message).map_err(Error::new),
            None => Err(Error::msg("direct message stream is closed")),
        }
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        _: &mut task::Context<'_>,
    ) -> task::Poll<Result<(), Self::Error>> {
        task::Poll::Ready(Ok(()))
    }

    fn poll_close(
        mut self: Pin<&mut Self>,
        _: &mut task::Context<'_>,
    ) -> task::Poll<Result<(), Self::Error>> {
        self.message_tx.take();
        task::Poll::Ready(Ok(()))
    }
}
