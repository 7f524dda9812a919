//! The meta API of a realm.
//!
//! Meta procedures are registered on every realm under a virtual callee that never appears on a
//! connection. Calls to them are answered directly from realm state. Meta events describe session,
//! registration and subscription lifecycle changes and are published by the realm itself.

use std::sync::LazyLock;

use anyhow::Result;
use log::info;

use crate::{
    core::{
        close::CloseReason,
        error::{
            BasicError,
            InteractionError,
        },
        id::Id,
        match_policy::MatchPolicy,
        types::{
            Dictionary,
            HashMap,
            HashSet,
            List,
            Value,
        },
        uri::Uri,
    },
    router::{
        procedure::Registration,
        realm::{
            Realm,
            RealmSession,
        },
        topic::Subscription,
    },
};

pub const SESSION_ON_JOIN: &str = "wamp.session.on_join";
pub const SESSION_ON_LEAVE: &str = "wamp.session.on_leave";
pub const REGISTRATION_ON_CREATE: &str = "wamp.registration.on_create";
pub const REGISTRATION_ON_REGISTER: &str = "wamp.registration.on_register";
pub const REGISTRATION_ON_UNREGISTER: &str = "wamp.registration.on_unregister";
pub const REGISTRATION_ON_DELETE: &str = "wamp.registration.on_delete";
pub const SUBSCRIPTION_ON_CREATE: &str = "wamp.subscription.on_create";
pub const SUBSCRIPTION_ON_SUBSCRIBE: &str = "wamp.subscription.on_subscribe";
pub const SUBSCRIPTION_ON_UNSUBSCRIBE: &str = "wamp.subscription.on_unsubscribe";
pub const SUBSCRIPTION_ON_DELETE: &str = "wamp.subscription.on_delete";

/// Checks if the URI is reserved for the meta API.
pub fn is_meta_uri(uri: &Uri) -> bool {
    uri.as_str().starts_with("wamp.")
}

/// A call to a meta procedure.
pub struct MetaCall<'a> {
    pub caller: Id,
    pub arguments: &'a List,
    pub arguments_keyword: &'a Dictionary,
}

impl MetaCall<'_> {
    fn argument(&self, index: usize) -> Option<&Value> {
        self.arguments.get(index).filter(|value| !value.is_null())
    }

    fn id_argument(&self, index: usize) -> Result<Option<Id>> {
        self.argument(index)
            .map(|value| {
                Id::try_from(value).map_err(|_| {
                    BasicError::InvalidArgument(format!("argument {index} must be an id")).into()
                })
            })
            .transpose()
    }

    fn str_argument(&self, index: usize) -> Result<Option<&str>> {
        self.argument(index)
            .map(|value| {
                value.as_str().ok_or_else(|| {
                    BasicError::InvalidArgument(format!("argument {index} must be a string"))
                        .into()
                })
            })
            .transpose()
    }

    fn strings_argument(&self, index: usize) -> Result<Option<HashSet<&str>>> {
        self.argument(index)
            .map(|value| {
                value
                    .as_list()
                    .and_then(|list| list.iter().map(Value::as_str).collect::<Option<_>>())
                    .ok_or_else(|| {
                        BasicError::InvalidArgument(format!(
                            "argument {index} must be a list of strings"
                        ))
                        .into()
                    })
            })
            .transpose()
    }

    /// The close reason and message for killing sessions.
    fn kill_reason(&self) -> Result<(CloseReason, Option<String>)> {
        let reason = match self.arguments_keyword.get("reason") {
            None | Some(Value::Null) => CloseReason::Normal,
            Some(Value::String(reason)) => CloseReason::Custom(
                Uri::strict(reason.as_str()).map_err(|_| InteractionError::InvalidUri)?,
            ),
            Some(_) => return Err(InteractionError::InvalidUri.into()),
        };
        let message = self
            .arguments_keyword
            .get("message")
            .and_then(Value::as_str)
            .map(|message| message.to_owned());
        Ok((reason, message))
    }
}

/// A meta procedure, answering with the arguments of the RESULT message.
pub type MetaProcedure = fn(&Realm, &MetaCall<'_>) -> Result<(List, Dictionary)>;

static PROCEDURES: LazyLock<HashMap<&'static str, MetaProcedure>> = LazyLock::new(|| {
    HashMap::from_iter([
        ("wamp.session.count", session_count as MetaProcedure),
        ("wamp.session.list", session_list),
        ("wamp.session.get", session_get),
        ("wamp.session.kill", session_kill),
        ("wamp.session.kill_by_authid", session_kill_by_authid),
        ("wamp.session.kill_by_authrole", session_kill_by_authrole),
        ("wamp.session.kill_all", session_kill_all),
        ("wamp.registration.list", registration_list),
        ("wamp.registration.lookup", registration_lookup),
        ("wamp.registration.match", registration_match),
        ("wamp.registration.get", registration_get),
        ("wamp.registration.list_callees", registration_list_callees),
        ("wamp.registration.count_callees", registration_count_callees),
        ("wamp.subscription.list", subscription_list),
        ("wamp.subscription.lookup", subscription_lookup),
        ("wamp.subscription.match", subscription_match),
        ("wamp.subscription.get", subscription_get),
        ("wamp.subscription.list_subscribers", subscription_list_subscribers),
        ("wamp.subscription.count_subscribers", subscription_count_subscribers),
    ])
});

/// Names of all meta procedures, in a stable order.
pub fn procedure_names() -> Vec<&'static str> {
    let mut names = PROCEDURES.keys().copied().collect::<Vec<_>>();
    names.sort();
    names
}

impl Realm {
    /// Calls a meta procedure.
    pub fn call_meta(&self, procedure: &Uri, call: &MetaCall<'_>) -> Result<(List, Dictionary)> {
        let procedure = PROCEDURES
            .get(procedure.as_str())
            .ok_or(InteractionError::NoSuchProcedure)?;
        procedure(self, call)
    }
}

fn single(value: impl Into<Value>) -> Result<(List, Dictionary)> {
    Ok((vec![value.into()], Dictionary::default()))
}

fn sorted_ids(ids: impl Iterator<Item = Id>) -> Value {
    let mut ids = ids.collect::<Vec<_>>();
    ids.sort();
    Value::List(ids.into_iter().map(Value::from).collect())
}

fn match_option(call: &MetaCall<'_>) -> MatchPolicy {
    call.arguments_keyword
        .get("match")
        .and_then(Value::as_str)
        .and_then(|value| MatchPolicy::try_from(value).ok())
        .unwrap_or_default()
}

fn sessions_with_roles<'a>(
    realm: &'a Realm,
    call: &MetaCall<'_>,
) -> Result<impl Iterator<Item = &'a RealmSession>> {
    let authroles = call
        .strings_argument(0)?
        .filter(|authroles| !authroles.is_empty())
        .map(|authroles| {
            authroles
                .into_iter()
                .map(|authrole| authrole.to_owned())
                .collect::<HashSet<_>>()
        });
    Ok(realm.sessions.values().filter(move |session| {
        authroles
            .as_ref()
            .is_none_or(|authroles| authroles.contains(&session.info.identity.role))
    }))
}

fn session_count(realm: &Realm, call: &MetaCall<'_>) -> Result<(List, Dictionary)> {
    single(sessions_with_roles(realm, call)?.count())
}

fn session_list(realm: &Realm, call: &MetaCall<'_>) -> Result<(List, Dictionary)> {
    single(sorted_ids(
        sessions_with_roles(realm, call)?.map(|session| session.info.id),
    ))
}

fn session_get(realm: &Realm, call: &MetaCall<'_>) -> Result<(List, Dictionary)> {
    let session = call
        .id_argument(0)?
        .and_then(|id| realm.sessions.get(&id))
        .ok_or(InteractionError::NoSuchSession)?;
    single(session.info.details())
}

/// Closes every session matching the predicate, except the caller.
fn kill_sessions<F>(realm: &Realm, call: &MetaCall<'_>, predicate: F) -> Result<usize>
where
    F: Fn(&RealmSession) -> bool,
{
    let (reason, message) = call.kill_reason()?;
    let mut count = 0;
    for session in realm.sessions.values() {
        if session.info.id == call.caller || !predicate(session) {
            continue;
        }
        info!(
            "Killing session {} on realm {} with reason {}",
            session.info.id,
            realm.uri(),
            reason.uri()
        );
        session.handle.close(reason.clone(), message.clone());
        count += 1;
    }
    Ok(count)
}

fn session_kill(realm: &Realm, call: &MetaCall<'_>) -> Result<(List, Dictionary)> {
    let id = call
        .id_argument(0)?
        .ok_or_else(|| BasicError::InvalidArgument("missing session id".to_owned()))?;
    if id == call.caller || !realm.sessions.contains_key(&id) {
        return Err(InteractionError::NoSuchSession.into());
    }
    single(kill_sessions(realm, call, |session| session.info.id == id)?)
}

fn session_kill_by_authid(realm: &Realm, call: &MetaCall<'_>) -> Result<(List, Dictionary)> {
    let authid = call
        .str_argument(0)?
        .ok_or_else(|| BasicError::InvalidArgument("missing authid".to_owned()))?;
    single(kill_sessions(realm, call, |session| {
        session.info.identity.id == authid
    })?)
}

fn session_kill_by_authrole(realm: &Realm, call: &MetaCall<'_>) -> Result<(List, Dictionary)> {
    let authrole = call
        .str_argument(0)?
        .ok_or_else(|| BasicError::InvalidArgument("missing authrole".to_owned()))?;
    single(kill_sessions(realm, call, |session| {
        session.info.identity.role == authrole
    })?)
}

fn session_kill_all(realm: &Realm, call: &MetaCall<'_>) -> Result<(List, Dictionary)> {
    single(kill_sessions(realm, call, |_| true)?)
}

fn registration_list(realm: &Realm, _: &MetaCall<'_>) -> Result<(List, Dictionary)> {
    let lists = MatchPolicy::ESCALATION.map(|match_policy| {
        (
            <&'static str>::from(match_policy).to_owned(),
            sorted_ids(
                realm
                    .procedure_manager
                    .registrations()
                    .filter(|registration| {
                        !registration.is_meta() && registration.match_policy == match_policy
                    })
                    .map(|registration| registration.id),
            ),
        )
    });
    single(Dictionary::from_iter(lists))
}

fn visible_registration(realm: &Realm, id: Option<Id>) -> Option<Id> {
    id.filter(|id| {
        realm
            .procedure_manager
            .get(*id)
            .is_some_and(|registration| !registration.is_meta())
    })
}

fn registration_lookup(realm: &Realm, call: &MetaCall<'_>) -> Result<(List, Dictionary)> {
    let id = call.str_argument(0)?.and_then(|uri| {
        realm
            .procedure_manager
            .lookup(&Uri::from(uri), match_option(call))
    });
    single(visible_registration(realm, id))
}

fn registration_match(realm: &Realm, call: &MetaCall<'_>) -> Result<(List, Dictionary)> {
    let id = call.str_argument(0)?.and_then(|uri| {
        realm
            .procedure_manager
            .match_registration(&Uri::from(uri), &HashSet::default())
    });
    single(visible_registration(realm, id))
}

fn registration_argument<'a>(
    realm: &'a Realm,
    call: &MetaCall<'_>,
) -> Result<&'a Registration> {
    visible_registration(realm, call.id_argument(0)?)
        .and_then(|id| realm.procedure_manager.get(id))
        .ok_or_else(|| InteractionError::NoSuchRegistration.into())
}

fn registration_get(realm: &Realm, call: &MetaCall<'_>) -> Result<(List, Dictionary)> {
    single(registration_argument(realm, call)?.details())
}

fn registration_list_callees(realm: &Realm, call: &MetaCall<'_>) -> Result<(List, Dictionary)> {
    single(sorted_ids(
        registration_argument(realm, call)?.callee_sessions(),
    ))
}

fn registration_count_callees(realm: &Realm, call: &MetaCall<'_>) -> Result<(List, Dictionary)> {
    single(registration_argument(realm, call)?.callees.len())
}

fn subscription_list(realm: &Realm, _: &MetaCall<'_>) -> Result<(List, Dictionary)> {
    let lists = MatchPolicy::ESCALATION.map(|match_policy| {
        (
            <&'static str>::from(match_policy).to_owned(),
            sorted_ids(
                realm
                    .topic_manager
                    .subscriptions()
                    .filter(|subscription| subscription.match_policy == match_policy)
                    .map(|subscription| subscription.id),
            ),
        )
    });
    single(Dictionary::from_iter(lists))
}

fn subscription_lookup(realm: &Realm, call: &MetaCall<'_>) -> Result<(List, Dictionary)> {
    let id = call.str_argument(0)?.and_then(|uri| {
        realm
            .topic_manager
            .lookup(&Uri::from(uri), match_option(call))
    });
    single(id)
}

fn subscription_match(realm: &Realm, call: &MetaCall<'_>) -> Result<(List, Dictionary)> {
    let ids = call
        .str_argument(0)?
        .map(|uri| realm.topic_manager.matching(&Uri::from(uri)))
        .unwrap_or_default();
    single(Value::List(ids.into_iter().map(Value::from).collect()))
}

fn subscription_argument<'a>(
    realm: &'a Realm,
    call: &MetaCall<'_>,
) -> Result<&'a Subscription> {
    call.id_argument(0)?
        .and_then(|id| realm.topic_manager.get(id))
        .ok_or_else(|| InteractionError::NoSuchSubscription.into())
}

fn subscription_get(realm: &Realm, call: &MetaCall<'_>) -> Result<(List, Dictionary)> {
    single(subscription_argument(realm, call)?.details())
}

fn subscription_list_subscribers(
    realm: &Realm,
    call: &MetaCall<'_>,
) -> Result<(List, Dictionary)> {
    single(sorted_ids(
        subscription_argument(realm, call)?
            .subscribers
            .iter()
            .map(|subscriber| subscriber.session),
    ))
}

fn subscription_count_subscribers(
    realm: &Realm,
    call: &MetaCall<'_>,
) -> Result<(List, Dictionary)> {
    single(subscription_argument(realm, call)?.subscribers.len())
}
