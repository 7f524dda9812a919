use anyhow::{
    Error,
    Result,
};
use log::{
    error,
    info,
};
use tokio::sync::mpsc::{
    UnboundedReceiver,
    UnboundedSender,
    unbounded_channel,
};
use uuid::Uuid;

use crate::{
    core::{
        id::IdAllocator,
        peer_info::ConnectionType,
        service::Service,
    },
    message::message::Message,
    router::{
        router::RouterContext,
        session::Session,
    },
};

/// A connection from a router to a peer.
///
/// On its own, a connection is not very meaningful. When started, it uses a WAMP [`Service`] to
/// send and receive messages on an underlying transport. Messages drive a single [`Session`],
/// which handles all interactions with the router. The connection ends with the session.
#[derive(Debug)]
pub struct Connection {
    uuid: Uuid,
}

impl Connection {
    /// Creates a new connection.
    pub fn new() -> Self {
        Self {
            uuid: Uuid::new_v4(),
        }
    }

    /// The unique identifier of the connection.
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    // Starts the connection on the runtime.
    pub fn start<S>(self, context: RouterContext<S>, service: Service) {
        tokio::spawn(self.run(context, service));
    }

    async fn run<S>(self, context: RouterContext<S>, mut service: Service) {
        let connection_type = service.connection_type();
        let service_message_rx = match service.take_message_rx() {
            Some(message_rx) => message_rx,
            None => {
                error!("Service for connection {} has no message channel", self.uuid);
                return;
            }
        };

        let service_handle = service.start();
        self.run_session(
            &context,
            connection_type,
            service_handle.message_tx(),
            service_message_rx,
        )
        .await;

        if let Err(err) = service_handle.cancel() {
            error!(
                "Failed to cancel service for connection {}: {err}",
                self.uuid
            );
        }

        if let Err(err) = service_handle.join().await {
            error!("Failed to join service for connection {}: {err}", self.uuid);
        }
    }

    async fn run_session<S>(
        &self,
        context: &RouterContext<S>,
        connection_type: ConnectionType,
        service_message_tx: UnboundedSender<Message>,
        mut service_message_rx: UnboundedReceiver<Message>,
    ) {
        let session_id = context.router().id_allocator.generate_id();
        let (message_tx, message_rx) = unbounded_channel();
        let mut session = Session::new(
            session_id,
            connection_type,
            message_tx,
            service_message_tx,
        );

        info!(
            "Started router session {} for connection {}",
            session_id, self.uuid
        );

        if let Err(err) = self
            .session_loop(context, &mut session, message_rx, &mut service_message_rx)
            .await
        {
            error!(
                "Router session {} for connection {} failed: {err:#}",
                session_id, self.uuid
            );
        }

        session.end().await;
        info!(
            "Router session {} for connection {} finished",
            session_id, self.uuid
        );
    }

    async fn session_loop<S>(
        &self,
        context: &RouterContext<S>,
        session: &mut Session,
        mut message_rx: UnboundedReceiver<Message>,
        service_message_rx: &mut UnboundedReceiver<Message>,
    ) -> Result<()> {
        let mut router_end_rx = context.router().end_rx();
        let mut shutting_down = false;

        while !session.finished() {
            tokio::select! {
                // Received a message from the peer.
                message = service_message_rx.recv() => {
                    let message = match message {
                        Some(message) => message,
                        None => {
                            info!("Connection {} closed by peer", self.uuid);
                            return Ok(());
                        }
                    };
                    let message_name = message.message_name();
                    if let Err(err) = session.handle_message(context, message).await {
                        // The session queued an ABORT, which ends the loop once written.
                        error!(
                            "Router session {} failed to handle {message_name} message: {err:#}",
                            session.id()
                        );
                    }
                }
                // Received a message from the session or some part of the router.
                message = message_rx.recv() => {
                    let message = match message {
                        Some(message) => message,
                        None => return Err(Error::msg("session message channel closed")),
                    };
                    let message_name = message.message_name();
                    if let Err(err) = session.send_message(message) {
                        return Err(err.context(format!("failed to send {message_name} message")));
                    }
                }
                // Router ended, so the session must end too.
                _ = router_end_rx.recv(), if !shutting_down => {
                    shutting_down = true;
                    session.shut_down()?;
                }
            }
        }

        Ok(())
    }
}
