use anyhow::{
    Error,
    Result,
};
use futures_util::{
    SinkExt,
    StreamExt,
};
use log::{
    debug,
    error,
};
use tokio::{
    sync::{
        broadcast,
        mpsc::{
            UnboundedReceiver,
            UnboundedSender,
            unbounded_channel,
        },
    },
    task::JoinHandle,
};

use crate::{
    core::{
        error::InteractionError,
        peer_info::ConnectionType,
        stream::{
            MessageStream,
            StreamMessage,
        },
    },
    message::{
        common::abort_message_for_error,
        message::Message,
    },
};

/// A handle to an asynchronously-running [`Service`].
pub struct ServiceHandle {
    start_handle: JoinHandle<()>,
    cancel_tx: broadcast::Sender<()>,
    message_tx: UnboundedSender<Message>,
}

impl ServiceHandle {
    /// Joins the task running the service.
    pub async fn join(self) -> Result<()> {
        self.start_handle.await.map_err(Error::new)
    }

    /// Cancels the service.
    ///
    /// Messages already handed to the service are written out before the stream closes.
    pub fn cancel(&self) -> Result<()> {
        self.cancel_tx.send(()).map(|_| ()).map_err(Error::new)
    }

    /// The message transmission channel.
    pub fn message_tx(&self) -> UnboundedSender<Message> {
        self.message_tx.clone()
    }
}

/// The core asynchronous service that sends and receives WAMP messages over an underlying
/// [`MessageStream`].
///
/// Received messages are passed to a channel for the connection to process. The service answers
/// pings on its own.
///
/// Canceling the service *does not* inject an ABORT message. A session that wishes to end must
/// send its final frame before canceling the service. The only message the service writes on its
/// own is an ABORT for input that cannot be parsed.
pub struct Service {
    name: String,
    stream: Box<dyn MessageStream>,
    message_tx: UnboundedSender<Message>,
    message_rx: Option<UnboundedReceiver<Message>>,
    cancel_tx: broadcast::Sender<()>,
    cancel_rx: broadcast::Receiver<()>,

    user_message_tx: UnboundedSender<Message>,
    user_message_rx: UnboundedReceiver<Message>,
}

impl Service {
    /// Creates a new service over the given message stream.
    pub fn new(name: String, stream: Box<dyn MessageStream>) -> Self {
        let (message_tx, message_rx) = unbounded_channel();
        let (cancel_tx, cancel_rx) = broadcast::channel(1);
        let (user_message_tx, user_message_rx) = unbounded_channel();
        Self {
            name,
            stream,
            message_tx,
            message_rx: Some(message_rx),
            cancel_tx,
            cancel_rx,
            user_message_tx,
            user_message_rx,
        }
    }

    /// The type of connection the service communicates over.
    pub fn connection_type(&self) -> ConnectionType {
        self.stream.connection_type()
    }

    /// Takes the receiver channel for incoming messages.
    ///
    /// The channel closes when the underlying stream ends.
    pub fn take_message_rx(&mut self) -> Option<UnboundedReceiver<Message>> {
        self.message_rx.take()
    }

    /// Starts the service asynchronously.
    ///
    /// This method takes ownership of the service. All future interactions with the service should
    /// be made through the returned handle.
    pub fn start(self) -> ServiceHandle {
        let cancel_tx = self.cancel_tx.clone();
        let message_tx = self.user_message_tx.clone();
        let start_handle = tokio::spawn(self.run());
        ServiceHandle {
            start_handle,
            cancel_tx,
            message_tx,
        }
    }

    async fn run(mut self) {
        if let Err(err) = self.service_loop().await {
            error!("Service {} failed: {err:#}", self.name);
        }
        // Ignore errors with the stream, since it may already be closed.
        self.stream.close().await.ok();
        debug!("Service {} ended", self.name);
    }

    async fn service_loop(&mut self) -> Result<()> {
        loop {
            tokio::select! {
                message = self.stream.next() => {
                    match message {
                        Some(Ok(StreamMessage::Ping(data))) => {
                            self.stream.send(StreamMessage::Ping(data)).await?;
                        }
                        Some(Ok(StreamMessage::Message(message))) => {
                            if self.message_tx.send(message).is_err() {
                                return Ok(());
                            }
                        }
                        Some(Err(err)) => {
                            // The peer sent something that is not a WAMP message. Nothing
                            // downstream can recover the session, so abort at this layer.
                            let abort = abort_message_for_error(
                                &InteractionError::ProtocolViolation(format!("{err:#}")).into(),
                            );
                            self.stream.send(StreamMessage::Message(abort)).await.ok();
                            return Err(err);
                        }
                        None => return Ok(()),
                    }
                }
                message = self.user_message_rx.recv() => {
                    match message {
                        Some(message) => self.stream.send(StreamMessage::Message(message)).await?,
                        None => return Err(Error::msg("user message stream closed")),
                    }
                }
                _ = self.cancel_rx.recv() => {
                    while let Ok(message) = self.user_message_rx.try_recv() {
                        self.stream.send(StreamMessage::Message(message)).await?;
                    }
                    return Ok(());
                }
            }
        }
    }
}
