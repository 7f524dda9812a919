use std::{
    net::{
        IpAddr,
        Ipv4Addr,
        SocketAddr,
    },
    sync::Arc,
    time::Duration,
};

use anyhow::{
    Error,
    Result,
};
use futures_util::lock::Mutex;
use log::{
    debug,
    error,
    info,
    warn,
};
use tokio::{
    net::{
        TcpListener,
        TcpStream,
    },
    sync::{
        broadcast,
        mpsc::unbounded_channel,
    },
    task::JoinHandle,
};
use tokio_tungstenite::{
    MaybeTlsStream,
    WebSocketStream,
};
use uuid::Uuid;

use crate::{
    auth::security::SecurityPolicies,
    core::{
        close::CloseReason,
        id::{
            IdAllocator,
            RandomIdAllocator,
        },
        peer_info::ConnectionType,
        roles::RouterRole,
        service::Service,
        stream::{
            DirectMessageStream,
            MessageStream,
            TransportMessageStream,
        },
        types::HashSet,
    },
    router::{
        acceptor::{
            AcceptorFactory,
            WebSocketAcceptorFactory,
        },
        connection::Connection,
        realm::{
            RealmConfig,
            RealmManager,
        },
    },
    serializer::serializer::{
        SerializerType,
        new_serializer,
    },
    transport::{
        TransportFactory,
        WebSocketTransportFactory,
    },
};

const DEFAULT_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "-", env!("CARGO_PKG_VERSION"));

// How long shutdown waits for sessions to say goodbye.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Configuration for a [`Router`].
#[derive(Debug)]
pub struct RouterConfig {
    /// IP address the router starts on.
    pub address: IpAddr,
    /// Network port the router starts on.
    ///
    /// Port 0 picks an ephemeral port, available through [`RouterHandle::local_addr`].
    pub port: u16,
    /// Agent name, communicated to peers.
    pub agent: String,
    /// Roles implemented by the router.
    pub roles: HashSet<RouterRole>,
    /// Allowed serializers.
    ///
    /// The actual serializer will be selected when the connection with the router is established.
    pub serializers: HashSet<SerializerType>,
    /// Realms available on the router from the start.
    pub realms: Vec<RealmConfig>,
    /// Whether realms are created when a peer asks to join one that does not exist.
    pub auto_create_realms: bool,
    /// Whether callers may ask for their identity to be disclosed to callees.
    pub allow_caller_disclosure: bool,
    /// Whether publishers may ask for their identity to be disclosed to subscribers.
    pub allow_publisher_disclosure: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            address: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            port: 0,
            agent: DEFAULT_AGENT.to_owned(),
            roles: HashSet::from_iter([RouterRole::Broker, RouterRole::Dealer]),
            serializers: HashSet::from_iter([SerializerType::Json, SerializerType::MessagePack]),
            realms: Vec::default(),
            auto_create_realms: true,
            allow_caller_disclosure: true,
            allow_publisher_disclosure: true,
        }
    }
}

/// A direct connection made to a router, managed externally in the same process.
pub struct DirectConnection {
    uuid: Uuid,
    stream: Box<dyn MessageStream>,
}

impl DirectConnection {
    /// The unique identifier of the connection.
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// The peer end of the connection.
    pub fn stream(self) -> Box<dyn MessageStream> {
        self.stream
    }
}

/// A handle to an asynchronously-running [`Router`].
///
/// The router's ownership is transferred away when it starts. This handle allows interaction with
/// the router as it is running asynchronously.
pub struct RouterHandle {
    direct_connect_fn: Box<dyn Fn() -> DirectConnection + Send + Sync>,
    start_handle: JoinHandle<()>,
    local_addr: SocketAddr,
    cancel_tx: broadcast::Sender<()>,
}

impl RouterHandle {
    /// Joins the router task, effectively waiting for the router to stop altogether.
    pub async fn join(self) -> Result<()> {
        self.start_handle.await.map_err(Error::new)
    }

    /// Cancels the router.
    ///
    /// Every session is closed with `wamp.close.system_shutdown`. Cancellation is asynchronous.
    /// Use [`Self::join`] to wait for the router to stop.
    pub fn cancel(&self) -> Result<()> {
        self.cancel_tx.send(()).map(|_| ()).map_err(Error::new)
    }

    /// The local address of the router.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Starts a direct connection to the router.
    pub fn direct_connect(&self) -> DirectConnection {
        (self.direct_connect_fn)()
    }
}

/// Shared ownership of a started [`Router`], cloned into every task the router spawns.
pub struct RouterContext<S>
where
    S: 'static,
{
    router: Arc<Router<S>>,
}

impl<S> RouterContext<S> {
    pub fn new(router: Router<S>) -> Self {
        Self {
            router: Arc::new(router),
        }
    }

    pub fn router(&self) -> &Router<S> {
        &self.router
    }
}

impl<S> Clone for RouterContext<S> {
    fn clone(&self) -> Self {
        Self {
            router: self.router.clone(),
        }
    }
}

/// A WAMP router (a.k.a., server) that accepts incoming connections and handles sessions.
pub struct Router<S> {
    /// The router configuration when created.
    pub(crate) config: RouterConfig,

    /// Security hooks consulted by sessions.
    pub(crate) security_policies: SecurityPolicies,

    /// Realm manager.
    pub(crate) realm_manager: RealmManager,

    /// The factory for acceptors.
    pub(crate) acceptor_factory: Mutex<Box<dyn AcceptorFactory<S>>>,

    /// The factory for transports.
    pub(crate) transport_factory: Mutex<Box<dyn TransportFactory<S>>>,

    // Allocator for session IDs, which are global.
    pub(crate) id_allocator: Box<dyn IdAllocator>,

    cancel_tx: broadcast::Sender<()>,
    end_tx: broadcast::Sender<()>,
    _end_rx: broadcast::Receiver<()>,
}

impl<S> Router<S> {
    /// Receiver channel for determining when the router ends.
    pub(crate) fn end_rx(&self) -> broadcast::Receiver<()> {
        self.end_tx.subscribe()
    }
}

impl<S> Router<S>
where
    S: Send + 'static,
{
    /// Creates a new [`Router`].
    pub fn new(
        config: RouterConfig,
        security_policies: SecurityPolicies,
        acceptor_factory: Box<dyn AcceptorFactory<S>>,
        transport_factory: Box<dyn TransportFactory<S>>,
    ) -> Result<Self> {
        let realm_manager = RealmManager::new(&config.realms, config.auto_create_realms);
        let (cancel_tx, _) = broadcast::channel(1);
        let (end_tx, end_rx) = broadcast::channel(1);
        Ok(Self {
            config,
            security_policies,
            realm_manager,
            acceptor_factory: Mutex::new(acceptor_factory),
            transport_factory: Mutex::new(transport_factory),
            id_allocator: Box::new(RandomIdAllocator::default()),
            cancel_tx,
            end_tx,
            _end_rx: end_rx,
        })
    }

    /// Starts the router asynchronously.
    ///
    /// The returned handle can be used to interact with the router since its ownership is
    /// transferred away.
    pub async fn start(self) -> Result<RouterHandle, Error> {
        let addr = format!("{}:{}", self.config.address, self.config.port);
        info!(
            "Starting router {} at {addr}: {:?}",
            self.config.agent, self.config
        );
        let listener = TcpListener::bind(&addr).await?;
        let local_addr = listener.local_addr()?;

        let cancel_tx = self.cancel_tx.clone();
        let context = RouterContext::new(self);
        let start_handle = tokio::spawn(Self::handle_connections(context.clone(), listener));

        Ok(RouterHandle {
            start_handle,
            local_addr,
            cancel_tx,
            direct_connect_fn: Box::new(move || Self::direct_connect(&context)),
        })
    }

    async fn handle_connections(context: RouterContext<S>, listener: TcpListener) {
        Self::connection_loop(&context, listener).await;
        Self::shut_down(&context).await;
        if let Err(err) = context.router().end_tx.send(()) {
            error!("Failed to write to end_tx channel after router connection loop ended: {err}");
        }
    }

    async fn connection_loop(context: &RouterContext<S>, listener: TcpListener) {
        let mut cancel_rx = context.router().cancel_tx.subscribe();

        loop {
            tokio::select! {
                accept = listener.accept() => {
                    let (stream, addr) = match accept {
                        Ok((stream, addr)) => (stream, addr),
                        Err(err) => {
                            error!("Failed to accept TCP connection: {err}");
                            break;
                        }
                    };
                    tokio::spawn(Self::handle_connection(
                        context.clone(),
                        addr,
                        MaybeTlsStream::Plain(stream),
                    ));
                }
                _ = cancel_rx.recv() => {
                    info!("Router {} canceled", context.router().config.agent);
                    break;
                }
            }
        }
    }

    async fn handle_connection(
        context: RouterContext<S>,
        addr: SocketAddr,
        stream: MaybeTlsStream<TcpStream>,
    ) {
        if let Err(err) = Self::start_connection(&context, addr, stream).await {
            error!("Failed to start handling connection from {addr}: {err:#}");
        }
    }

    async fn start_connection(
        context: &RouterContext<S>,
        addr: SocketAddr,
        stream: MaybeTlsStream<TcpStream>,
    ) -> Result<()> {
        debug!("Incoming TCP connection from {addr}");
        let acceptor = context
            .router()
            .acceptor_factory
            .lock()
            .await
            .new_acceptor();
        let acceptance = acceptor.accept(context, stream).await?;
        debug!("WAMP connection established with {addr}");

        let serializer = new_serializer(acceptance.serializer);
        let transport = context
            .router()
            .transport_factory
            .lock()
            .await
            .new_transport(acceptance.stream, acceptance.serializer);

        Self::start_connection_over_stream(
            context,
            Box::new(TransportMessageStream::new(
                transport,
                serializer,
                ConnectionType::Remote(addr.to_string()),
            )),
        );
        Ok(())
    }

    fn start_connection_over_stream(
        context: &RouterContext<S>,
        stream: Box<dyn MessageStream>,
    ) -> Uuid {
        let connection = Connection::new();
        let uuid = connection.uuid();
        info!(
            "Created connection {uuid} over {}",
            stream.message_stream_type()
        );

        let service = Service::new(uuid.to_string(), stream);
        connection.start(context.clone(), service);
        uuid
    }

    async fn shut_down(context: &RouterContext<S>) {
        let mut sessions = Vec::new();
        for realm in context.router().realm_manager.realms().await {
            sessions.extend(realm.lock().await.shut_down(CloseReason::SystemShutdown));
        }

        // Sessions leave their realms on their own. Wait outside of any realm lock.
        let closed = futures_util::future::join_all(
            sessions.iter().map(|session| session.closed()),
        );
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, closed).await.is_err() {
            warn!(
                "Timed out waiting for {} sessions to close during shutdown",
                sessions.len()
            );
        }
    }

    fn direct_connect(context: &RouterContext<S>) -> DirectConnection {
        let (router_to_peer_tx, router_to_peer_rx) = unbounded_channel();
        let (peer_to_router_tx, peer_to_router_rx) = unbounded_channel();
        let router_stream = DirectMessageStream::new(router_to_peer_tx, peer_to_router_rx);
        let peer_stream = DirectMessageStream::new(peer_to_router_tx, router_to_peer_rx);
        let uuid = Self::start_connection_over_stream(context, Box::new(router_stream));
        DirectConnection {
            uuid,
            stream: Box::new(peer_stream),
        }
    }
}

/// A [`Router`] that accepts incoming WebSocket connections.
pub type WebSocketRouter = Router<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Creates a new [`WebSocketRouter`].
pub fn new_web_socket_router(
    config: RouterConfig,
    security_policies: SecurityPolicies,
) -> Result<WebSocketRouter> {
    Router::new(
        config,
        security_policies,
        Box::new(WebSocketAcceptorFactory::default()),
        Box::new(WebSocketTransportFactory::default()),
    )
}
