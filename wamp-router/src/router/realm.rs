use std::sync::Arc;

use anyhow::Result;
use futures_util::lock::Mutex;
use log::{
    debug,
    info,
};

use crate::{
    auth::{
        auth_method::AuthMethod,
        identity::{
            AuthProvider,
            Identity,
        },
    },
    core::{
        cancel::CallCancelMode,
        close::CloseReason,
        error::InteractionError,
        id::{
            Id,
            IdAllocator,
            RandomIdAllocator,
            SequentialIdAllocator,
        },
        peer_info::ConnectionType,
        roles::{
            PeerRole,
            PeerRoles,
        },
        types::{
            Dictionary,
            HashMap,
            Value,
        },
        uri::Uri,
    },
    message::message::{
        InterruptMessage,
        Message,
    },
    router::{
        meta,
        procedure::ProcedureManager,
        rpc::Invocation,
        session::SessionHandle,
        topic::TopicManager,
    },
};

/// Configuration for a realm.
#[derive(Debug, Clone)]
pub struct RealmConfig {
    /// Name of the realm, mostly for logging.
    pub name: String,
    /// URI for peers to connect to the realm.
    pub uri: Uri,
}

/// Identity and capabilities of a session that joined a realm.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: Id,
    pub identity: Identity,
    pub authmethod: AuthMethod,
    pub authprovider: AuthProvider,
    pub connection_type: ConnectionType,
    pub roles: PeerRoles,
}

impl SessionInfo {
    /// Checks if the peer accepts INTERRUPT messages for its invocations.
    pub fn supports_call_canceling(&self) -> bool {
        self.roles.supports(PeerRole::Callee, "call_canceling")
    }

    /// Details of the session, as reported by the meta API.
    pub fn details(&self) -> Dictionary {
        Dictionary::from_iter([
            ("session".to_owned(), Value::from(self.id)),
            ("authid".to_owned(), Value::from(self.identity.id.as_str())),
            ("authrole".to_owned(), Value::from(self.identity.role.as_str())),
            ("authmethod".to_owned(), Value::from(self.authmethod.to_string())),
            (
                "authprovider".to_owned(),
                Value::from(<&'static str>::from(self.authprovider)),
            ),
            (
                "transport".to_owned(),
                Value::from(self.connection_type.transport_details()),
            ),
        ])
    }
}

/// A single session on a realm.
pub struct RealmSession {
    pub handle: SessionHandle,
    pub info: SessionInfo,
}

/// A realm, which is a scoped area for peer sessions and resources.
///
/// WAMP sessions cannot communicate across realms. All routing state of the realm lives here and is
/// only mutated while the realm is locked, so every operation is atomic with respect to other
/// sessions.
pub struct Realm {
    /// The realm configuration when created.
    pub config: RealmConfig,

    /// Sessions in the realm.
    pub sessions: HashMap<Id, RealmSession>,

    /// Procedure manager for RPC functionality.
    pub procedure_manager: ProcedureManager,

    /// Topic manager for pub/sub functionality.
    pub topic_manager: TopicManager,

    /// In-flight invocations, by invocation request ID.
    pub(crate) invocations: HashMap<Id, Invocation>,

    /// In-flight calls, by caller and call request ID, pointing to the current invocation.
    pub(crate) calls: HashMap<(Id, Id), Id>,

    // Allocator for publication IDs.
    pub(crate) global_ids: RandomIdAllocator,

    // Allocator for registration, subscription and invocation IDs.
    pub(crate) realm_ids: SequentialIdAllocator,
}

impl Realm {
    /// Creates a new realm, with all meta procedures registered.
    pub fn new(config: RealmConfig) -> Self {
        let mut realm = Self {
            config,
            sessions: HashMap::default(),
            procedure_manager: ProcedureManager::default(),
            topic_manager: TopicManager::default(),
            invocations: HashMap::default(),
            calls: HashMap::default(),
            global_ids: RandomIdAllocator::default(),
            realm_ids: SequentialIdAllocator::default(),
        };
        for procedure in meta::procedure_names() {
            let id = realm.realm_ids.generate_id();
            realm
                .procedure_manager
                .register_meta(id, Uri::from_known(procedure));
        }
        realm
    }

    /// The URI for accessing the realm.
    pub fn uri(&self) -> &Uri {
        &self.config.uri
    }

    /// Sends a message to a session in the realm.
    ///
    /// Returns false if the session is gone, in which case the message is dropped.
    pub(crate) fn send(&self, session: Id, message: Message) -> bool {
        match self.sessions.get(&session) {
            Some(session) => session.handle.send(message),
            None => {
                debug!(
                    "Dropped {} message for session {session}, which is not in realm {}",
                    message.message_name(),
                    self.uri()
                );
                false
            }
        }
    }

    /// Adds a session to the realm.
    pub fn join(&mut self, session: RealmSession) {
        info!(
            "Session {} joined realm {} as {}",
            session.info.id,
            self.uri(),
            session.info.identity.id
        );
        let details = session.info.details();
        self.sessions.insert(session.info.id, session);
        self.publish_meta_event(meta::SESSION_ON_JOIN, vec![Value::from(details)]);
    }

    /// Removes a session from the realm, releasing everything it holds.
    ///
    /// Callers waiting on the session's invocations receive an error. Invocations the session is
    /// waiting on are retired without a reply.
    pub fn leave(&mut self, session: Id) {
        let info = match self.sessions.remove(&session) {
            Some(session) => session.info,
            None => return,
        };

        let mut invocations = self
            .invocations
            .values()
            .filter(|invocation| invocation.callee == session || invocation.caller == session)
            .map(|invocation| invocation.id)
            .collect::<Vec<_>>();
        invocations.sort();
        for id in invocations {
            let invocation = match self.retire_invocation(id) {
                Some(invocation) => invocation,
                None => continue,
            };
            if invocation.caller == session {
                let callee_cancels = self
                    .sessions
                    .get(&invocation.callee)
                    .is_some_and(|callee| callee.info.supports_call_canceling());
                if callee_cancels && !invocation.killed {
                    self.send(
                        invocation.callee,
                        Message::Interrupt(InterruptMessage {
                            invocation_request: invocation.id,
                            options: Invocation::interrupt_options(CallCancelMode::KillNoWait),
                        }),
                    );
                }
            } else if !invocation.killed {
                self.send(
                    invocation.caller,
                    invocation.error_message(&InteractionError::NoSuchProcedure.into()),
                );
            }
        }

        for outcome in self.procedure_manager.remove_session(session) {
            self.publish_registration_removed(session, outcome);
        }
        for outcome in self.topic_manager.remove_session(session) {
            self.publish_subscription_removed(session, outcome);
        }

        info!("Session {session} left realm {}", self.uri());
        self.publish_meta_event(
            meta::SESSION_ON_LEAVE,
            vec![
                Value::from(session),
                Value::from(info.identity.id),
                Value::from(info.identity.role),
            ],
        );
    }

    /// Shuts down the realm by closing every session.
    ///
    /// Returns handles to the closed sessions, so that the caller can wait for them to end without
    /// holding the realm.
    pub fn shut_down(&mut self, close_reason: CloseReason) -> Vec<SessionHandle> {
        info!("Shutting down realm {}", self.uri());
        self.sessions
            .values()
            .map(|session| {
                session.handle.close(close_reason.clone(), None);
                session.handle.clone()
            })
            .collect()
    }
}

/// A manager for all realms owned by a router.
pub struct RealmManager {
    realms: Mutex<HashMap<Uri, Arc<Mutex<Realm>>>>,
    auto_create: bool,
}

impl RealmManager {
    /// Creates a manager with the configured realms.
    ///
    /// If `auto_create` is set, realms that are not configured are created on first use.
    pub fn new(realms: &[RealmConfig], auto_create: bool) -> Self {
        let realms = realms
            .iter()
            .map(|config| {
                (
                    config.uri.clone(),
                    Arc::new(Mutex::new(Realm::new(config.clone()))),
                )
            })
            .collect();
        Self {
            realms: Mutex::new(realms),
            auto_create,
        }
    }

    /// Looks up a realm by URI.
    pub async fn get(&self, uri: &Uri) -> Option<Arc<Mutex<Realm>>> {
        self.realms.lock().await.get(uri).cloned()
    }

    /// Looks up a realm by URI, creating it if allowed.
    pub async fn get_or_create(&self, uri: &Uri) -> Result<Arc<Mutex<Realm>>> {
        let mut realms = self.realms.lock().await;
        if let Some(realm) = realms.get(uri) {
            return Ok(realm.clone());
        }
        if !self.auto_create {
            return Err(InteractionError::NoSuchRealm.into());
        }
        info!("Creating realm {uri}");
        let realm = Arc::new(Mutex::new(Realm::new(RealmConfig {
            name: uri.to_string(),
            uri: uri.clone(),
        })));
        realms.insert(uri.clone(), realm.clone());
        Ok(realm)
    }

    /// All realms.
    pub async fn realms(&self) -> Vec<Arc<Mutex<Realm>>> {
        self.realms.lock().await.values().cloned().collect()
    }
}
