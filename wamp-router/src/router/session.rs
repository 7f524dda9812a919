use std::{
    fmt::Display,
    sync::Arc,
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
use tokio::sync::{
    mpsc::UnboundedSender,
    watch,
};

use crate::{
    auth::{
        auth_method::AuthMethod,
        identity::{
            AuthProvider,
            Identity,
        },
        security::{
            AuthAction,
            SessionDetails,
        },
    },
    core::{
        close::CloseReason,
        error::InteractionError,
        id::Id,
        options::{
            CallOptions,
            CancelOptions,
            PublishOptions,
            RegisterOptions,
            SubscribeOptions,
            YieldOptions,
        },
        peer_info::ConnectionType,
        roles::PeerRoles,
        types::{
            Dictionary,
            Integer,
            Value,
        },
        uri::Uri,
    },
    message::{
        common::{
            abort_message_for_error,
            error_for_request_id,
            goodbye_and_out,
            goodbye_with_close_reason,
            goodbye_with_close_reason_and_message,
        },
        message::{
            AbortMessage,
            AuthenticateMessage,
            CallMessage,
            CancelMessage,
            ChallengeMessage,
            ErrorMessage,
            HelloMessage,
            Message,
            PublishMessage,
            RegisterMessage,
            SubscribeMessage,
            UnregisterMessage,
            UnsubscribeMessage,
            WelcomeMessage,
            YieldMessage,
        },
    },
    router::{
        realm::{
            Realm,
            RealmSession,
            SessionInfo,
        },
        router::RouterContext,
    },
};

/// A handle to a router session, held by the realm the session joined.
///
/// Messages sent over the handle are written to the peer in order, after any message the session
/// itself already queued.
#[derive(Clone)]
pub struct SessionHandle {
    id: Id,
    message_tx: UnboundedSender<Message>,
    closed_rx: watch::Receiver<bool>,
}

impl SessionHandle {
    pub fn new(
        id: Id,
        message_tx: UnboundedSender<Message>,
        closed_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            id,
            message_tx,
            closed_rx,
        }
    }

    /// The session ID.
    pub fn id(&self) -> Id {
        self.id
    }

    /// Sends a message to the peer.
    ///
    /// Returns false if the session is gone, in which case the message is dropped.
    pub fn send(&self, message: Message) -> bool {
        match self.message_tx.send(message) {
            Ok(()) => true,
            Err(err) => {
                debug!(
                    "Dropped {} message for closed session {}",
                    err.0.message_name(),
                    self.id
                );
                false
            }
        }
    }

    /// Closes the session with a GOODBYE message.
    pub fn close(&self, close_reason: CloseReason, message: Option<String>) -> bool {
        self.send(goodbye_with_close_reason_and_message(close_reason, message))
    }

    /// Waits for the session to leave its realm and end.
    pub async fn closed(&self) {
        let mut closed_rx = self.closed_rx.clone();
        // An error means the session was dropped, which is just as closed.
        closed_rx.wait_for(|closed| *closed).await.ok();
    }
}

struct ChallengingState {
    details: SessionDetails,
}

struct JoinedState {
    details: SessionDetails,
}

#[derive(Default)]
enum SessionState {
    #[default]
    Unauthenticated,
    Challenging(ChallengingState),
    Joined(JoinedState),
    Closed,
}

impl SessionState {
    fn name(&self) -> &'static str {
        match self {
            Self::Unauthenticated => "unauthenticated",
            Self::Challenging(_) => "challenging",
            Self::Joined(_) => "joined",
            Self::Closed => "closed",
        }
    }

    fn is_same_state(&self, other: &Self) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }

    fn allowed_state_transition(&self, next: &Self) -> bool {
        match (self, next) {
            (Self::Unauthenticated, Self::Challenging(_)) => true,
            (Self::Unauthenticated, Self::Joined(_)) => true,
            (Self::Challenging(_), Self::Unauthenticated) => true,
            (Self::Challenging(_), Self::Joined(_)) => true,
            (_, Self::Closed) => true,
            _ => false,
        }
    }
}

impl Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// The router end of a WAMP session.
///
/// Handles WAMP messages in a state machine. All routing state lives in the realm the session
/// joins, so the session only tracks its own progress through the protocol.
///
/// Outgoing messages are queued on a channel shared with the [`SessionHandle`], and the owning
/// connection writes them out through [`Session::send_message`].
pub struct Session {
    id: Id,
    connection_type: ConnectionType,
    state: SessionState,
    realm: Option<Arc<Mutex<Realm>>>,
    message_tx: UnboundedSender<Message>,
    service_message_tx: UnboundedSender<Message>,
    final_message_sent: bool,
    closed_tx: watch::Sender<bool>,
}

impl Session {
    /// Creates a new session over a service.
    pub fn new(
        id: Id,
        connection_type: ConnectionType,
        message_tx: UnboundedSender<Message>,
        service_message_tx: UnboundedSender<Message>,
    ) -> Self {
        let (closed_tx, _) = watch::channel(false);
        Self {
            id,
            connection_type,
            state: SessionState::default(),
            realm: None,
            message_tx,
            service_message_tx,
            final_message_sent: false,
            closed_tx,
        }
    }

    /// The session ID.
    pub fn id(&self) -> Id {
        self.id
    }

    /// Generates a handle to the session, which can be saved separately from the session's
    /// lifecycle.
    pub fn session_handle(&self) -> SessionHandle {
        SessionHandle::new(self.id, self.message_tx.clone(), self.closed_tx.subscribe())
    }

    /// Checks if the session has written its final message.
    ///
    /// Nothing else is written to the peer afterwards.
    pub fn finished(&self) -> bool {
        self.final_message_sent
    }

    fn transition_state(&mut self, next: SessionState) -> Result<()> {
        if self.state.is_same_state(&next) {
            return Ok(());
        }
        if !self.state.allowed_state_transition(&next) {
            return Err(Error::msg(format!(
                "invalid state transition from {} to {}",
                self.state, next
            )));
        }
        debug!(
            "Session {} moved from {} to {}",
            self.id, self.state, next
        );
        self.state = next;
        Ok(())
    }

    fn send(&self, message: Message) -> Result<()> {
        self.message_tx.send(message).map_err(Error::new)
    }

    /// Writes a queued message out to the peer.
    ///
    /// An ABORT or GOODBYE is the last message written. Everything after it is dropped.
    pub fn send_message(&mut self, message: Message) -> Result<()> {
        if self.final_message_sent {
            debug!(
                "Dropped {} message for session {}, which already closed",
                message.message_name(),
                self.id
            );
            return Ok(());
        }
        if message.is_closing() {
            if let Some(reason) = message.reason() {
                info!("Closing session {} with reason {reason}", self.id);
            }
            self.final_message_sent = true;
            self.transition_state(SessionState::Closed)?;
        }
        self.service_message_tx.send(message).map_err(Error::new)
    }

    /// Closes the session because the router is shutting down.
    pub fn shut_down(&mut self) -> Result<()> {
        let message = match self.state {
            SessionState::Joined(_) => goodbye_with_close_reason(CloseReason::SystemShutdown),
            _ => Message::Abort(AbortMessage {
                details: Dictionary::default(),
                reason: CloseReason::SystemShutdown.uri(),
            }),
        };
        self.transition_state(SessionState::Closed)?;
        self.send(message)
    }

    /// Removes the session from its realm and marks it as closed.
    ///
    /// Must be called before the session is dropped, so that everything it holds in the realm is
    /// released.
    pub async fn end(&mut self) {
        if let Some(realm) = self.realm.take() {
            realm.lock().await.leave(self.id);
        }
        self.transition_state(SessionState::Closed).ok();
        self.closed_tx.send_replace(true);
    }

    /// Handles a message over the session state machine.
    ///
    /// An error is fatal to the session. The peer is sent an ABORT describing it.
    pub async fn handle_message<S>(
        &mut self,
        context: &RouterContext<S>,
        message: Message,
    ) -> Result<()> {
        debug!("Received message for session {}: {message:?}", self.id);
        if let Err(err) = self.handle_message_on_state_machine(context, message).await {
            self.transition_state(SessionState::Closed)?;
            self.send(abort_message_for_error(&err))?;
            return Err(err);
        }
        Ok(())
    }

    async fn handle_message_on_state_machine<S>(
        &mut self,
        context: &RouterContext<S>,
        message: Message,
    ) -> Result<()> {
        if let Message::Abort(abort) = &message {
            warn!("Session {} aborted by peer: {}", self.id, abort.reason);
            self.final_message_sent = true;
            return self.transition_state(SessionState::Closed);
        }

        match self.state {
            SessionState::Unauthenticated => self.handle_unauthenticated(context, message).await,
            SessionState::Challenging(_) => self.handle_challenging(context, message).await,
            SessionState::Joined(_) => self.handle_joined(context, message).await,
            SessionState::Closed => {
                debug!(
                    "Ignoring {} message on closed session {}",
                    message.message_name(),
                    self.id
                );
                Ok(())
            }
        }
    }

    async fn handle_unauthenticated<S>(
        &mut self,
        context: &RouterContext<S>,
        message: Message,
    ) -> Result<()> {
        match message {
            Message::Hello(message) => self.handle_hello(context, message).await,
            _ => Err(InteractionError::ProtocolViolation(format!(
                "received {} message before HELLO",
                message.message_name()
            ))
            .into()),
        }
    }

    async fn handle_hello<S>(
        &mut self,
        context: &RouterContext<S>,
        message: HelloMessage,
    ) -> Result<()> {
        let mut details = SessionDetails::from_hello(message.realm, message.details);
        let selection = context
            .router()
            .security_policies
            .auth_method_selector
            .select(&details)
            .await
            .map_err(|err| {
                error!("Failed to select auth method for session {}: {err:#}", self.id);
                InteractionError::AuthorizationFailed(format!("{err:#}"))
            })?;

        if selection.method.is_anonymous() {
            let identity = Identity::anonymous(details.authid.as_deref());
            return self
                .join(
                    context,
                    details,
                    identity,
                    AuthMethod::Anonymous,
                    AuthProvider::Static,
                )
                .await;
        }

        debug!(
            "Challenging session {} with auth method {}",
            self.id, selection.method
        );
        details.authmethod = Some(selection.method.clone());
        self.transition_state(SessionState::Challenging(ChallengingState { details }))?;
        self.send(Message::Challenge(ChallengeMessage {
            auth_method: selection.method.to_string(),
            extra: selection.extra,
        }))
    }

    async fn handle_challenging<S>(
        &mut self,
        context: &RouterContext<S>,
        message: Message,
    ) -> Result<()> {
        match message {
            Message::Authenticate(message) => self.handle_authenticate(context, message).await,
            // The peer may start over with different details. The pending challenge is dropped.
            Message::Hello(message) => {
                debug!("Session {} restarted authentication with HELLO", self.id);
                self.transition_state(SessionState::Unauthenticated)?;
                self.handle_hello(context, message).await
            }
            _ => Err(InteractionError::ProtocolViolation(format!(
                "received {} message while waiting for AUTHENTICATE",
                message.message_name()
            ))
            .into()),
        }
    }

    async fn handle_authenticate<S>(
        &mut self,
        context: &RouterContext<S>,
        message: AuthenticateMessage,
    ) -> Result<()> {
        let details = match &self.state {
            SessionState::Challenging(state) => state.details.clone(),
            _ => return Err(Error::msg("session is not in the challenging state")),
        };
        let identity = context
            .router()
            .security_policies
            .credential_verifier
            .verify(&details, &message.signature, &message.extra)
            .await
            .map_err(|err| {
                warn!("Failed to authenticate session {}: {err:#}", self.id);
                InteractionError::AuthorizationFailed(format!("{err:#}"))
            })?;
        let authmethod = details.authmethod.clone().unwrap_or_default();
        self.join(
            context,
            details,
            identity,
            authmethod,
            AuthProvider::Dynamic,
        )
        .await
    }

    /// Joins the realm requested in HELLO, creating it if allowed.
    ///
    /// Realms are only resolved once the peer is authenticated.
    async fn join<S>(
        &mut self,
        context: &RouterContext<S>,
        mut details: SessionDetails,
        identity: Identity,
        authmethod: AuthMethod,
        authprovider: AuthProvider,
    ) -> Result<()> {
        let realm = context
            .router()
            .realm_manager
            .get_or_create(&details.realm)
            .await?;
        details.authmethod = Some(authmethod.clone());
        details.identity = Some(identity.clone());
        let info = SessionInfo {
            id: self.id,
            identity,
            authmethod,
            authprovider,
            connection_type: self.connection_type.clone(),
            roles: PeerRoles::from_details(&details.details),
        };
        let welcome_details = Self::welcome_details(context, &details.realm, &info);

        self.transition_state(SessionState::Joined(JoinedState { details }))?;
        // WELCOME is queued before the realm can send anything else to the session.
        self.send(Message::Welcome(WelcomeMessage {
            session: self.id,
            details: welcome_details,
        }))?;
        realm.lock().await.join(RealmSession {
            handle: self.session_handle(),
            info,
        });
        self.realm = Some(realm);
        Ok(())
    }

    fn welcome_details<S>(context: &RouterContext<S>, realm: &Uri, info: &SessionInfo) -> Dictionary {
        let config = &context.router().config;
        let roles = config
            .roles
            .iter()
            .map(|role| (<&'static str>::from(*role).to_owned(), role.details()))
            .collect::<Dictionary>();
        Dictionary::from_iter([
            ("realm".to_owned(), Value::from(realm)),
            ("agent".to_owned(), Value::from(config.agent.as_str())),
            ("authid".to_owned(), Value::from(info.identity.id.as_str())),
            ("authrole".to_owned(), Value::from(info.identity.role.as_str())),
            ("authmethod".to_owned(), Value::from(info.authmethod.to_string())),
            (
                "authprovider".to_owned(),
                Value::from(<&'static str>::from(info.authprovider)),
            ),
            ("roles".to_owned(), Value::Dictionary(roles)),
        ])
    }

    async fn handle_joined<S>(
        &mut self,
        context: &RouterContext<S>,
        message: Message,
    ) -> Result<()> {
        match message {
            Message::Goodbye(message) => {
                info!(
                    "Session {} said goodbye with reason {}",
                    self.id, message.reason
                );
                self.transition_state(SessionState::Closed)?;
                self.send(goodbye_and_out())
            }
            Message::Register(message) => {
                let request = message.request;
                if let Err(err) = self.handle_register(context, message).await {
                    return self.fail_request(Message::REGISTER_TAG, request, err);
                }
                Ok(())
            }
            Message::Unregister(message) => {
                let request = message.request;
                if let Err(err) = self.handle_unregister(context, message).await {
                    return self.fail_request(Message::UNREGISTER_TAG, request, err);
                }
                Ok(())
            }
            Message::Call(message) => {
                let request = message.request;
                if let Err(err) = self.handle_call(context, message).await {
                    return self.fail_request(Message::CALL_TAG, request, err);
                }
                Ok(())
            }
            Message::Cancel(message) => self.handle_cancel(context, message).await,
            Message::Yield(message) => self.handle_yield(context, message).await,
            Message::Error(message) => self.handle_error(context, message).await,
            Message::Subscribe(message) => {
                let request = message.request;
                if let Err(err) = self.handle_subscribe(context, message).await {
                    return self.fail_request(Message::SUBSCRIBE_TAG, request, err);
                }
                Ok(())
            }
            Message::Unsubscribe(message) => {
                let request = message.request;
                if let Err(err) = self.handle_unsubscribe(context, message).await {
                    return self.fail_request(Message::UNSUBSCRIBE_TAG, request, err);
                }
                Ok(())
            }
            Message::Publish(message) => {
                // Publications only report errors when acknowledged, and never close the session.
                let request = message.request;
                let acknowledge = message
                    .options
                    .get("acknowledge")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                if let Err(err) = self.handle_publish(context, message).await {
                    if acknowledge {
                        return self.send(error_for_request_id(Message::PUBLISH_TAG, request, &err));
                    }
                    debug!(
                        "Dropped error for unacknowledged publication {request} of session {}: {err:#}",
                        self.id
                    );
                }
                Ok(())
            }
            _ => Err(InteractionError::ProtocolViolation(format!(
                "received {} message on a joined session",
                message.message_name()
            ))
            .into()),
        }
    }

    fn is_fatal(err: &Error) -> bool {
        matches!(
            err.downcast_ref::<InteractionError>(),
            Some(InteractionError::ProtocolViolation(_) | InteractionError::AuthorizationFailed(_))
        )
    }

    fn fail_request(&self, request_type: Integer, request: Id, err: Error) -> Result<()> {
        if Self::is_fatal(&err) {
            return Err(err);
        }
        debug!("Request {request} of session {} failed: {err:#}", self.id);
        self.send(error_for_request_id(request_type, request, &err))
    }

    fn joined_realm(&self) -> Result<Arc<Mutex<Realm>>> {
        self.realm
            .clone()
            .ok_or_else(|| Error::msg("session has not joined a realm"))
    }

    async fn authorize<S>(
        &self,
        context: &RouterContext<S>,
        action: AuthAction,
        uri: Option<&Uri>,
    ) -> Result<()> {
        let details = match &self.state {
            SessionState::Joined(state) => &state.details,
            _ => return Err(Error::msg("session is not in the joined state")),
        };
        let allowed = context
            .router()
            .security_policies
            .authorizer
            .authorize(details, action, uri)
            .await
            .map_err(|err| {
                error!("Failed to authorize session {}: {err:#}", self.id);
                InteractionError::AuthorizationFailed(format!("{err:#}"))
            })?;
        if !allowed {
            warn!(
                "Session {} is not authorized to {action} {}",
                self.id,
                uri.map(Uri::as_str).unwrap_or("an unknown resource")
            );
            return Err(InteractionError::NotAuthorized.into());
        }
        Ok(())
    }

    /// Authorizes a message that continues a flow already authorized for the session.
    ///
    /// A denial here is a protocol violation rather than a request error.
    async fn authorize_continuation<S>(
        &self,
        context: &RouterContext<S>,
        action: AuthAction,
        uri: Option<&Uri>,
    ) -> Result<()> {
        self.authorize(context, action, uri).await.map_err(|err| {
            match err.downcast_ref::<InteractionError>() {
                Some(InteractionError::NotAuthorized) => InteractionError::ProtocolViolation(
                    format!("session is not authorized to {action}"),
                )
                .into(),
                _ => err,
            }
        })
    }

    async fn handle_register<S>(
        &self,
        context: &RouterContext<S>,
        message: RegisterMessage,
    ) -> Result<()> {
        let options = RegisterOptions::try_from(&message.options)?;
        self.authorize(context, AuthAction::Register, Some(&message.procedure))
            .await?;
        self.joined_realm()?.lock().await.register(
            self.id,
            message.request,
            message.procedure,
            &options,
        )
    }

    async fn handle_unregister<S>(
        &self,
        context: &RouterContext<S>,
        message: UnregisterMessage,
    ) -> Result<()> {
        let realm = self.joined_realm()?;
        let procedure = realm
            .lock()
            .await
            .procedure_manager
            .get(message.registered_registration)
            .map(|registration| registration.uri.clone());
        self.authorize(context, AuthAction::Register, procedure.as_ref())
            .await?;
        realm
            .lock()
            .await
            .unregister(self.id, message.request, message.registered_registration)
    }

    async fn handle_call<S>(&self, context: &RouterContext<S>, message: CallMessage) -> Result<()> {
        let options = CallOptions::try_from(&message.options)?;
        if options.disclose_me && !context.router().config.allow_caller_disclosure {
            return Err(InteractionError::OptionDisallowedDiscloseMe.into());
        }
        self.authorize(context, AuthAction::Call, Some(&message.procedure))
            .await?;
        self.joined_realm()?.lock().await.call(
            self.id,
            message.request,
            message.procedure,
            options,
            message.arguments,
            message.arguments_keyword,
        )
    }

    async fn handle_cancel<S>(
        &self,
        context: &RouterContext<S>,
        message: CancelMessage,
    ) -> Result<()> {
        let options = CancelOptions::try_from(&message.options).map_err(|err| {
            InteractionError::ProtocolViolation(format!("invalid CANCEL options: {err:#}"))
        })?;
        let realm = self.joined_realm()?;
        let procedure = realm
            .lock()
            .await
            .call_procedure(self.id, message.call_request)
            .cloned();
        self.authorize_continuation(context, AuthAction::Call, procedure.as_ref())
            .await?;
        realm
            .lock()
            .await
            .cancel(self.id, message.call_request, &options);
        Ok(())
    }

    async fn handle_yield<S>(
        &self,
        context: &RouterContext<S>,
        message: YieldMessage,
    ) -> Result<()> {
        let options = YieldOptions::try_from(&message.options).map_err(|err| {
            InteractionError::ProtocolViolation(format!("invalid YIELD options: {err:#}"))
        })?;
        let realm = self.joined_realm()?;
        let procedure = realm
            .lock()
            .await
            .invocation_procedure(self.id, message.invocation_request)
            .cloned();
        self.authorize_continuation(context, AuthAction::Register, procedure.as_ref())
            .await?;
        realm.lock().await.yield_result(
            self.id,
            message.invocation_request,
            &options,
            message.arguments,
            message.arguments_keyword,
        );
        Ok(())
    }

    async fn handle_error<S>(
        &self,
        context: &RouterContext<S>,
        message: ErrorMessage,
    ) -> Result<()> {
        if message.request_type != Message::INVOCATION_TAG {
            return Err(InteractionError::ProtocolViolation(format!(
                "received ERROR message for request type {}",
                message.request_type
            ))
            .into());
        }
        let realm = self.joined_realm()?;
        let procedure = realm
            .lock()
            .await
            .invocation_procedure(self.id, message.request)
            .cloned();
        self.authorize_continuation(context, AuthAction::Register, procedure.as_ref())
            .await?;
        realm.lock().await.error_result(
            self.id,
            message.request,
            message.details,
            message.error,
            message.arguments,
            message.arguments_keyword,
        );
        Ok(())
    }

    async fn handle_subscribe<S>(
        &self,
        context: &RouterContext<S>,
        message: SubscribeMessage,
    ) -> Result<()> {
        let options = SubscribeOptions::try_from(&message.options)?;
        self.authorize(context, AuthAction::Subscribe, Some(&message.topic))
            .await?;
        self.joined_realm()?.lock().await.subscribe(
            self.id,
            message.request,
            message.topic,
            &options,
        )
    }

    async fn handle_unsubscribe<S>(
        &self,
        context: &RouterContext<S>,
        message: UnsubscribeMessage,
    ) -> Result<()> {
        let realm = self.joined_realm()?;
        let topic = realm
            .lock()
            .await
            .topic_manager
            .get(message.subscribed_subscription)
            .map(|subscription| subscription.uri.clone());
        self.authorize(context, AuthAction::Subscribe, topic.as_ref())
            .await?;
        realm
            .lock()
            .await
            .unsubscribe(self.id, message.request, message.subscribed_subscription)
    }

    async fn handle_publish<S>(
        &self,
        context: &RouterContext<S>,
        message: PublishMessage,
    ) -> Result<()> {
        let options = PublishOptions::try_from(&message.options)?;
        if options.disclose_me && !context.router().config.allow_publisher_disclosure {
            return Err(InteractionError::OptionDisallowedDiscloseMe.into());
        }
        self.authorize(context, AuthAction::Publish, Some(&message.topic))
            .await?;
        self.joined_realm()?.lock().await.publish(
            self.id,
            message.request,
            message.topic,
            &options,
            message.arguments,
            message.arguments_keyword,
        )
    }
}
