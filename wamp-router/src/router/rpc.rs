use anyhow::{
    Error,
    Result,
};
use log::{
    debug,
    warn,
};

use crate::{
    core::{
        cancel::CallCancelMode,
        error::InteractionError,
        id::{
            Id,
            IdAllocator,
        },
        match_policy::MatchPolicy,
        options::{
            CallOptions,
            CancelOptions,
            RegisterOptions,
            YieldOptions,
        },
        types::{
            Dictionary,
            HashSet,
            List,
            Value,
        },
        uri::Uri,
    },
    message::{
        common::error_for_request_id,
        message::{
            ErrorMessage,
            InterruptMessage,
            InvocationMessage,
            Message,
            RegisteredMessage,
            ResultMessage,
            UnregisteredMessage,
        },
    },
    router::{
        meta::{
            self,
            MetaCall,
        },
        procedure::{
            Participant,
            UnregisterOutcome,
        },
        realm::Realm,
    },
};

/// An in-flight invocation of a procedure on a callee.
///
/// The invocation outlives individual callees: when a callee reports that it is unavailable, the
/// same invocation is retargeted to another callee of the procedure.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub id: Id,
    pub caller: Id,
    pub call_request: Id,
    pub callee: Id,
    pub registration: Id,
    pub procedure: Uri,
    pub options: CallOptions,
    pub arguments: List,
    pub arguments_keyword: Dictionary,
    /// Callees that already reported they are unavailable.
    pub tried: HashSet<Id>,
    /// Whether the caller canceled the call and the callee was interrupted.
    ///
    /// The final answer of a killed invocation is discarded.
    pub killed: bool,
}

impl Invocation {
    pub fn interrupt_options(mode: CallCancelMode) -> Dictionary {
        Dictionary::from_iter([(
            "mode".to_owned(),
            Value::from(<&'static str>::from(mode)),
        )])
    }

    /// An ERROR message for the caller, answering the call.
    pub fn error_message(&self, error: &Error) -> Message {
        error_for_request_id(Message::CALL_TAG, self.call_request, error)
    }
}

impl Realm {
    /// Registers a procedure for a callee.
    pub fn register(
        &mut self,
        session: Id,
        request: Id,
        procedure: Uri,
        options: &RegisterOptions,
    ) -> Result<()> {
        if meta::is_meta_uri(&procedure) {
            return Err(InteractionError::NotAuthorized.into());
        }
        let outcome =
            self.procedure_manager
                .register(&self.realm_ids, session, procedure, options)?;
        if outcome.created {
            if let Some(registration) = self.procedure_manager.get(outcome.registration) {
                let details = registration.details();
                self.publish_meta_event(
                    meta::REGISTRATION_ON_CREATE,
                    vec![Value::from(session), Value::from(details)],
                );
            }
        }
        self.send(
            session,
            Message::Registered(RegisteredMessage {
                register_request: request,
                registration: outcome.registration,
            }),
        );
        self.publish_meta_event(
            meta::REGISTRATION_ON_REGISTER,
            vec![Value::from(session), Value::from(outcome.registration)],
        );
        Ok(())
    }

    /// Unregisters a callee from a procedure.
    pub fn unregister(&mut self, session: Id, request: Id, registration: Id) -> Result<()> {
        let outcome = self.procedure_manager.unregister(session, registration)?;
        self.publish_meta_event(
            meta::REGISTRATION_ON_UNREGISTER,
            vec![Value::from(session), Value::from(registration)],
        );
        self.send(
            session,
            Message::Unregistered(UnregisteredMessage {
                unregister_request: request,
            }),
        );
        if outcome.deleted {
            self.publish_meta_event(
                meta::REGISTRATION_ON_DELETE,
                vec![Value::from(session), Value::from(registration)],
            );
        }
        Ok(())
    }

    /// Publishes the meta events for a callee that was removed without asking.
    pub(crate) fn publish_registration_removed(&mut self, session: Id, outcome: UnregisterOutcome) {
        self.publish_meta_event(
            meta::REGISTRATION_ON_UNREGISTER,
            vec![Value::from(session), Value::from(outcome.registration)],
        );
        if outcome.deleted {
            self.publish_meta_event(
                meta::REGISTRATION_ON_DELETE,
                vec![Value::from(session), Value::from(outcome.registration)],
            );
        }
    }

    /// Calls a procedure.
    ///
    /// Meta procedures are answered immediately. Other procedures are sent to a callee as an
    /// INVOCATION, and the caller is answered once the callee yields.
    pub fn call(
        &mut self,
        caller: Id,
        request: Id,
        procedure: Uri,
        options: CallOptions,
        arguments: List,
        arguments_keyword: Dictionary,
    ) -> Result<()> {
        let forbidden = HashSet::default();
        let registration = self
            .procedure_manager
            .match_registration(&procedure, &forbidden)
            .ok_or(InteractionError::NoSuchProcedure)?;
        let callee = match self
            .procedure_manager
            .select_callee(registration, &forbidden)
            .ok_or(InteractionError::NoSuchProcedure)?
        {
            Participant::Meta => {
                let (arguments, arguments_keyword) = self.call_meta(
                    &procedure,
                    &MetaCall {
                        caller,
                        arguments: &arguments,
                        arguments_keyword: &arguments_keyword,
                    },
                )?;
                self.send(
                    caller,
                    Message::Result(ResultMessage {
                        call_request: request,
                        details: Dictionary::default(),
                        yield_arguments: arguments,
                        yield_arguments_keyword: arguments_keyword,
                    }),
                );
                return Ok(());
            }
            Participant::Session(callee) => callee,
        };

        let invocation = Invocation {
            id: self.realm_ids.generate_id(),
            caller,
            call_request: request,
            callee,
            registration,
            procedure,
            options,
            arguments,
            arguments_keyword,
            tried: HashSet::default(),
            killed: false,
        };
        self.dispatch(invocation)
    }

    fn invocation_message(&self, invocation: &Invocation) -> Message {
        let registration = self.procedure_manager.get(invocation.registration);
        let mut details = Dictionary::default();
        if registration.is_some_and(|registration| registration.match_policy != MatchPolicy::Exact)
        {
            details.insert("procedure".to_owned(), Value::from(&invocation.procedure));
        }
        if invocation.options.receive_progress {
            details.insert("receive_progress".to_owned(), Value::Bool(true));
        }
        let disclose_caller = invocation.options.disclose_me
            || registration
                .and_then(|registration| registration.callee(invocation.callee))
                .is_some_and(|callee| callee.disclose_caller);
        if disclose_caller {
            if let Some(caller) = self.sessions.get(&invocation.caller) {
                details.insert("caller".to_owned(), Value::from(invocation.caller));
                details.insert(
                    "caller_authid".to_owned(),
                    Value::from(caller.info.identity.id.as_str()),
                );
                details.insert(
                    "caller_authrole".to_owned(),
                    Value::from(caller.info.identity.role.as_str()),
                );
            }
        }
        Message::Invocation(InvocationMessage {
            request: invocation.id,
            registered_registration: invocation.registration,
            details,
            call_arguments: invocation.arguments.clone(),
            call_arguments_keyword: invocation.arguments_keyword.clone(),
        })
    }

    /// Sends the invocation to its callee and tracks it until the callee answers.
    ///
    /// If the callee cannot be reached, the invocation moves on to the next eligible callee.
    fn dispatch(&mut self, mut invocation: Invocation) -> Result<()> {
        loop {
            let message = self.invocation_message(&invocation);
            if self.send(invocation.callee, message) {
                self.procedure_manager
                    .acquire(invocation.registration, invocation.callee);
                self.calls
                    .insert((invocation.caller, invocation.call_request), invocation.id);
                self.invocations.insert(invocation.id, invocation);
                return Ok(());
            }
            invocation.tried.insert(invocation.callee);
            self.retarget(&mut invocation)?;
        }
    }

    /// Points the invocation at a callee that has not been tried yet.
    fn retarget(&mut self, invocation: &mut Invocation) -> Result<()> {
        let registration = self
            .procedure_manager
            .match_registration(&invocation.procedure, &invocation.tried)
            .ok_or(InteractionError::NoAvailableCallee)?;
        let callee = self
            .procedure_manager
            .select_callee(registration, &invocation.tried)
            .and_then(|participant| participant.session())
            .ok_or(InteractionError::NoAvailableCallee)?;
        debug!(
            "Rerouting invocation {} of {} from callee {} to callee {callee}",
            invocation.id, invocation.procedure, invocation.callee
        );
        invocation.registration = registration;
        invocation.callee = callee;
        Ok(())
    }

    /// Stops tracking an invocation, releasing its load on the callee.
    pub(crate) fn retire_invocation(&mut self, id: Id) -> Option<Invocation> {
        let invocation = self.invocations.remove(&id)?;
        self.procedure_manager
            .release(invocation.registration, invocation.callee);
        let call = (invocation.caller, invocation.call_request);
        if self.calls.get(&call) == Some(&id) {
            self.calls.remove(&call);
        }
        Some(invocation)
    }

    fn interrupt(&self, invocation: &Invocation, mode: CallCancelMode) {
        self.send(
            invocation.callee,
            Message::Interrupt(InterruptMessage {
                invocation_request: invocation.id,
                options: Invocation::interrupt_options(mode),
            }),
        );
    }

    /// Cancels a call on behalf of its caller.
    ///
    /// Unknown calls are ignored, since the call may have finished concurrently.
    pub fn cancel(&mut self, caller: Id, request: Id, options: &CancelOptions) {
        let id = match self.calls.get(&(caller, request)) {
            Some(id) => *id,
            None => {
                debug!("Ignoring CANCEL for unknown call {request} of session {caller}");
                return;
            }
        };
        let callee = match self.invocations.get(&id) {
            Some(invocation) => invocation.callee,
            None => {
                self.calls.remove(&(caller, request));
                return;
            }
        };
        let mode = if self
            .sessions
            .get(&callee)
            .is_some_and(|callee| callee.info.supports_call_canceling())
        {
            options.mode
        } else {
            CallCancelMode::Skip
        };
        debug!("Canceling call {request} of session {caller} with mode {mode}");

        self.calls.remove(&(caller, request));
        self.send(
            caller,
            error_for_request_id(
                Message::CALL_TAG,
                request,
                &InteractionError::Canceled.into(),
            ),
        );
        match mode {
            CallCancelMode::Kill => {
                if let Some(invocation) = self.invocations.get_mut(&id) {
                    invocation.killed = true;
                }
                if let Some(invocation) = self.invocations.get(&id) {
                    self.interrupt(invocation, mode);
                }
            }
            CallCancelMode::KillNoWait => {
                if let Some(invocation) = self.retire_invocation(id) {
                    self.interrupt(&invocation, mode);
                }
            }
            CallCancelMode::Skip => {
                self.retire_invocation(id);
            }
        }
    }

    fn current_invocation(&self, callee: Id, id: Id) -> Option<&Invocation> {
        self.invocations
            .get(&id)
            .filter(|invocation| invocation.callee == callee)
    }

    /// The procedure a pending call of the caller is for.
    pub fn call_procedure(&self, caller: Id, request: Id) -> Option<&Uri> {
        self.calls
            .get(&(caller, request))
            .and_then(|id| self.invocations.get(id))
            .map(|invocation| &invocation.procedure)
    }

    /// The procedure an invocation sent to the callee is for.
    pub fn invocation_procedure(&self, callee: Id, id: Id) -> Option<&Uri> {
        self.current_invocation(callee, id)
            .map(|invocation| &invocation.procedure)
    }

    /// Forwards a result yielded by a callee to the caller.
    ///
    /// Results for invocations that are unknown or that belong to another callee are ignored.
    pub fn yield_result(
        &mut self,
        callee: Id,
        id: Id,
        options: &YieldOptions,
        arguments: List,
        arguments_keyword: Dictionary,
    ) {
        let invocation = match self.current_invocation(callee, id) {
            Some(invocation) => invocation,
            None => {
                debug!("Ignoring YIELD for unknown invocation {id} of session {callee}");
                return;
            }
        };
        if invocation.killed {
            if !options.progress {
                self.retire_invocation(id);
            }
            return;
        }

        let caller_present = self.sessions.contains_key(&invocation.caller);
        if options.progress && !invocation.options.receive_progress {
            warn!("Ignoring progressive YIELD for invocation {id}, which did not ask for progress");
            if !caller_present {
                if let Some(invocation) = self.retire_invocation(id) {
                    self.interrupt(&invocation, CallCancelMode::KillNoWait);
                }
            }
            return;
        }

        let details = if options.progress {
            Dictionary::from_iter([("progress".to_owned(), Value::Bool(true))])
        } else {
            Dictionary::default()
        };
        let delivered = self.send(
            invocation.caller,
            Message::Result(ResultMessage {
                call_request: invocation.call_request,
                details,
                yield_arguments: arguments,
                yield_arguments_keyword: arguments_keyword,
            }),
        );
        if !options.progress {
            self.retire_invocation(id);
        } else if !delivered {
            if let Some(invocation) = self.retire_invocation(id) {
                self.interrupt(&invocation, CallCancelMode::KillNoWait);
            }
        }
    }

    /// Forwards an error returned by a callee to the caller.
    ///
    /// A callee that is unavailable causes the invocation to be rerouted to another callee. The
    /// caller only sees an error when no other callee is left.
    pub fn error_result(
        &mut self,
        callee: Id,
        id: Id,
        details: Dictionary,
        error: Uri,
        arguments: List,
        arguments_keyword: Dictionary,
    ) {
        if self.current_invocation(callee, id).is_none() {
            debug!("Ignoring ERROR for unknown invocation {id} of session {callee}");
            return;
        }
        let mut invocation = match self.retire_invocation(id) {
            Some(invocation) => invocation,
            None => return,
        };
        if invocation.killed {
            return;
        }

        if error.is_error(&InteractionError::Unavailable) {
            invocation.tried.insert(callee);
            let caller = invocation.caller;
            let call_request = invocation.call_request;
            let rerouted = match self.retarget(&mut invocation) {
                Ok(()) => self.dispatch(invocation),
                Err(err) => Err(err),
            };
            if let Err(err) = rerouted {
                debug!("Failed to reroute call {call_request} of session {caller}: {err}");
                self.send(
                    caller,
                    error_for_request_id(Message::CALL_TAG, call_request, &err),
                );
            }
            return;
        }

        self.send(
            invocation.caller,
            Message::Error(ErrorMessage {
                request_type: Message::CALL_TAG,
                request: invocation.call_request,
                details,
                error,
                arguments,
                arguments_keyword,
            }),
        );
    }
}
