use anyhow::Result;
use chrono::{
    DateTime,
    Utc,
};
use log::debug;
use rand::seq::IndexedRandom;

use crate::core::{
    error::InteractionError,
    id::{
        Id,
        IdAllocator,
    },
    invocation_policy::InvocationPolicy,
    match_policy::MatchPolicy,
    options::RegisterOptions,
    types::{
        Dictionary,
        HashMap,
        HashSet,
        Value,
    },
    uri::Uri,
};

/// The owner of a callee or subscriber slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Participant {
    /// The realm itself, answering meta procedures and publishing meta events.
    ///
    /// Never reachable over a connection.
    Meta,
    /// A joined session.
    Session(Id),
}

impl Participant {
    /// The session ID, if the participant is a session.
    pub fn session(&self) -> Option<Id> {
        match self {
            Self::Meta => None,
            Self::Session(id) => Some(*id),
        }
    }
}

/// A single callee of a registration.
#[derive(Debug, Clone)]
pub struct Callee {
    pub participant: Participant,
    /// Whether the caller's identity is always disclosed to this callee.
    pub disclose_caller: bool,
    /// Number of invocations currently outstanding on this callee.
    pub load: usize,
}

/// A procedure registration, shared by one or more callees.
#[derive(Debug, Clone)]
pub struct Registration {
    pub id: Id,
    pub uri: Uri,
    pub match_policy: MatchPolicy,
    pub invocation_policy: InvocationPolicy,
    pub created: DateTime<Utc>,
    pub callees: Vec<Callee>,
    next_round_robin: usize,
}

impl Registration {
    /// Checks if the registration is owned by the realm's meta API.
    pub fn is_meta(&self) -> bool {
        self.callees
            .iter()
            .any(|callee| callee.participant == Participant::Meta)
    }

    /// Session IDs of all callees.
    pub fn callee_sessions(&self) -> impl Iterator<Item = Id> + '_ {
        self.callees
            .iter()
            .filter_map(|callee| callee.participant.session())
    }

    pub fn callee(&self, session: Id) -> Option<&Callee> {
        self.callees
            .iter()
            .find(|callee| callee.participant == Participant::Session(session))
    }

    fn callee_index(&self, session: Id) -> Option<usize> {
        self.callees
            .iter()
            .position(|callee| callee.participant == Participant::Session(session))
    }

    fn eligible(callee: &Callee, forbidden: &HashSet<Id>) -> bool {
        callee
            .participant
            .session()
            .is_none_or(|session| !forbidden.contains(&session))
    }

    fn has_eligible_callee(&self, forbidden: &HashSet<Id>) -> bool {
        self.callees
            .iter()
            .any(|callee| Self::eligible(callee, forbidden))
    }

    /// Selects the callee for the next invocation, according to the invocation policy.
    ///
    /// Round-robin state advances only when a callee is selected.
    fn select(&mut self, forbidden: &HashSet<Id>) -> Option<Participant> {
        let eligible = self
            .callees
            .iter()
            .enumerate()
            .filter(|(_, callee)| Self::eligible(callee, forbidden))
            .map(|(i, _)| i)
            .collect::<Vec<_>>();
        let index = match self.invocation_policy {
            InvocationPolicy::Single | InvocationPolicy::First => eligible.first().copied(),
            InvocationPolicy::Last => eligible.last().copied(),
            InvocationPolicy::Random => eligible.choose(&mut rand::rng()).copied(),
            InvocationPolicy::Load => eligible
                .iter()
                .copied()
                .min_by_key(|i| self.callees[*i].load),
            InvocationPolicy::RoundRobin => {
                let len = self.callees.len();
                let index = (0..len)
                    .map(|offset| (self.next_round_robin + offset) % len)
                    .find(|i| eligible.contains(i));
                if let Some(index) = index {
                    self.next_round_robin = (index + 1) % len;
                }
                index
            }
        };
        index.map(|i| self.callees[i].participant)
    }

    fn remove_callee(&mut self, index: usize) {
        self.callees.remove(index);
        if index < self.next_round_robin {
            self.next_round_robin -= 1;
        }
        if self.next_round_robin >= self.callees.len() {
            self.next_round_robin = 0;
        }
    }

    /// Details of the registration, as reported by the meta API.
    pub fn details(&self) -> Dictionary {
        Dictionary::from_iter([
            ("id".to_owned(), Value::from(self.id)),
            ("created".to_owned(), Value::from(self.created.to_rfc3339())),
            ("uri".to_owned(), Value::from(&self.uri)),
            (
                "match".to_owned(),
                Value::from(<&'static str>::from(self.match_policy)),
            ),
            (
                "invoke".to_owned(),
                Value::from(<&'static str>::from(self.invocation_policy)),
            ),
        ])
    }
}

/// The result of adding a callee to a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterOutcome {
    pub registration: Id,
    /// Whether the registration was created for this callee.
    pub created: bool,
}

/// The result of removing a callee from a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnregisterOutcome {
    pub registration: Id,
    /// Whether the registration was deleted because it has no more callees.
    pub deleted: bool,
}

/// A manager for all procedure registrations owned by a realm.
#[derive(Debug, Default)]
pub struct ProcedureManager {
    registrations: HashMap<Id, Registration>,
    by_uri: HashMap<MatchPolicy, HashMap<Uri, Id>>,
}

impl ProcedureManager {
    /// Looks up a registration by ID.
    pub fn get(&self, id: Id) -> Option<&Registration> {
        self.registrations.get(&id)
    }

    /// All registrations.
    pub fn registrations(&self) -> impl Iterator<Item = &Registration> {
        self.registrations.values()
    }

    /// Looks up the registration with exactly the given URI and match policy.
    pub fn lookup(&self, uri: &Uri, match_policy: MatchPolicy) -> Option<Id> {
        self.by_uri
            .get(&match_policy)
            .and_then(|registrations| registrations.get(uri))
            .copied()
    }

    fn insert(&mut self, registration: Registration) {
        self.by_uri
            .entry(registration.match_policy)
            .or_default()
            .insert(registration.uri.clone(), registration.id);
        self.registrations.insert(registration.id, registration);
    }

    fn delete(&mut self, id: Id) {
        if let Some(registration) = self.registrations.remove(&id) {
            if let Some(registrations) = self.by_uri.get_mut(&registration.match_policy) {
                registrations.remove(&registration.uri);
            }
        }
    }

    /// Registers a procedure owned by the meta API.
    pub fn register_meta(&mut self, id: Id, uri: Uri) {
        self.insert(Registration {
            id,
            uri,
            match_policy: MatchPolicy::Exact,
            invocation_policy: InvocationPolicy::Single,
            created: Utc::now(),
            callees: vec![Callee {
                participant: Participant::Meta,
                disclose_caller: false,
                load: 0,
            }],
            next_round_robin: 0,
        });
    }

    /// Adds a session as a callee of the procedure, creating the registration if needed.
    pub fn register(
        &mut self,
        id_allocator: &dyn IdAllocator,
        session: Id,
        uri: Uri,
        options: &RegisterOptions,
    ) -> Result<RegisterOutcome> {
        let callee = Callee {
            participant: Participant::Session(session),
            disclose_caller: options.disclose_caller,
            load: 0,
        };
        let registration = match self
            .lookup(&uri, options.match_policy)
            .and_then(|id| self.registrations.get_mut(&id))
        {
            Some(registration) => registration,
            None => {
                let id = id_allocator.generate_id();
                self.insert(Registration {
                    id,
                    uri,
                    match_policy: options.match_policy,
                    invocation_policy: options.invocation_policy,
                    created: Utc::now(),
                    callees: vec![callee],
                    next_round_robin: 0,
                });
                return Ok(RegisterOutcome {
                    registration: id,
                    created: true,
                });
            }
        };

        if registration.is_meta() {
            return Err(InteractionError::NotAuthorized.into());
        }
        if registration.callee(session).is_some() {
            return Err(InteractionError::ProcedureAlreadyExists.into());
        }
        if registration.invocation_policy == InvocationPolicy::Single {
            return Err(InteractionError::ProcedureAlreadyExists.into());
        }
        if registration.invocation_policy != options.invocation_policy {
            return Err(InteractionError::ProcedureExistsWithDifferentInvocationPolicy.into());
        }
        registration.callees.push(callee);
        Ok(RegisterOutcome {
            registration: registration.id,
            created: false,
        })
    }

    /// Removes a session as a callee of the registration.
    pub fn unregister(&mut self, session: Id, id: Id) -> Result<UnregisterOutcome> {
        let registration = self
            .registrations
            .get_mut(&id)
            .ok_or(InteractionError::NoSuchRegistration)?;
        let index = registration
            .callee_index(session)
            .ok_or(InteractionError::NoSuchRegistration)?;
        registration.remove_callee(index);
        let deleted = registration.callees.is_empty();
        if deleted {
            self.delete(id);
        }
        Ok(UnregisterOutcome {
            registration: id,
            deleted,
        })
    }

    /// Removes a session from every registration it is a callee of.
    pub fn remove_session(&mut self, session: Id) -> Vec<UnregisterOutcome> {
        let mut ids = self
            .registrations
            .values()
            .filter(|registration| registration.callee(session).is_some())
            .map(|registration| registration.id)
            .collect::<Vec<_>>();
        ids.sort();
        ids.into_iter()
            .filter_map(|id| self.unregister(session, id).ok())
            .collect()
    }

    /// Finds the registration a call to `uri` is routed to.
    ///
    /// Match policies are tried in escalation order, and the first policy with a match wins.
    /// Registrations whose callees are all forbidden are skipped.
    pub fn match_registration(&self, uri: &Uri, forbidden: &HashSet<Id>) -> Option<Id> {
        let eligible = |id: &Id| {
            self.registrations
                .get(id)
                .is_some_and(|registration| registration.has_eligible_callee(forbidden))
        };
        MatchPolicy::ESCALATION.iter().find_map(|match_policy| {
            let registrations = self.by_uri.get(match_policy)?;
            match match_policy {
                MatchPolicy::Exact => registrations.get(uri).copied().filter(eligible),
                _ => match_policy.best_match(
                    uri,
                    registrations
                        .iter()
                        .filter(|(_, id)| eligible(*id))
                        .map(|(pattern, id)| (pattern, *id)),
                ),
            }
        })
    }

    /// Selects the callee of the registration that receives the next invocation.
    pub fn select_callee(&mut self, id: Id, forbidden: &HashSet<Id>) -> Option<Participant> {
        let participant = self.registrations.get_mut(&id)?.select(forbidden);
        debug!("Selected callee {participant:?} for registration {id}");
        participant
    }

    fn callee_mut(&mut self, id: Id, session: Id) -> Option<&mut Callee> {
        self.registrations
            .get_mut(&id)?
            .callees
            .iter_mut()
            .find(|callee| callee.participant == Participant::Session(session))
    }

    /// Records a new outstanding invocation on a callee.
    pub fn acquire(&mut self, id: Id, session: Id) {
        if let Some(callee) = self.callee_mut(id, session) {
            callee.load += 1;
        }
    }

    /// Records the end of an outstanding invocation on a callee.
    pub fn release(&mut self, id: Id, session: Id) {
        if let Some(callee) = self.callee_mut(id, session) {
            callee.load = callee.load.saturating_sub(1);
        }
    }
}

#[cfg(test)]
mod procedure_test {
    use crate::{
        core::{
            error::InteractionError,
            id::{
                Id,
                SequentialIdAllocator,
            },
            invocation_policy::InvocationPolicy,
            match_policy::MatchPolicy,
            options::RegisterOptions,
            types::HashSet,
            uri::Uri,
        },
        router::procedure::{
            Participant,
            ProcedureManager,
        },
    };

    fn id(value: u64) -> Id {
        Id::try_from(value).unwrap()
    }

    fn options(match_policy: MatchPolicy, invocation_policy: InvocationPolicy) -> RegisterOptions {
        RegisterOptions {
            match_policy,
            invocation_policy,
            disclose_caller: false,
        }
    }

    fn assert_interaction_error(result: anyhow::Result<impl std::fmt::Debug>, expected: InteractionError) {
        assert_matches::assert_matches!(result, Err(err) => {
            assert_eq!(err.to_string(), expected.to_string());
        });
    }

    #[test]
    fn matches_exact_registration_only_for_equal_uri() {
        let ids = SequentialIdAllocator::default();
        let mut manager = ProcedureManager::default();
        let registration = manager
            .register(&ids, id(1), Uri::from("com.test.echo"), &RegisterOptions::default())
            .unwrap()
            .registration;
        let forbidden = HashSet::default();
        assert_eq!(
            manager.match_registration(&Uri::from("com.test.echo"), &forbidden),
            Some(registration)
        );
        assert_eq!(
            manager.match_registration(&Uri::from("com.test.echo2"), &forbidden),
            None
        );
    }

    #[test]
    fn prefers_longest_prefix_and_escalates_from_exact() {
        let ids = SequentialIdAllocator::default();
        let mut manager = ProcedureManager::default();
        let short = manager
            .register(&ids, id(1), Uri::from("com.test"), &options(MatchPolicy::Prefix, InvocationPolicy::Single))
            .unwrap()
            .registration;
        let long = manager
            .register(&ids, id(2), Uri::from("com.test.a"), &options(MatchPolicy::Prefix, InvocationPolicy::Single))
            .unwrap()
            .registration;
        let wildcard = manager
            .register(&ids, id(3), Uri::from("com..b"), &options(MatchPolicy::Wildcard, InvocationPolicy::Single))
            .unwrap()
            .registration;
        let exact = manager
            .register(&ids, id(4), Uri::from("com.test.b"), &RegisterOptions::default())
            .unwrap()
            .registration;

        let forbidden = HashSet::default();
        assert_eq!(manager.match_registration(&Uri::from("com.test.abc"), &forbidden), Some(long));
        assert_eq!(manager.match_registration(&Uri::from("com.test.x"), &forbidden), Some(short));
        assert_eq!(manager.match_registration(&Uri::from("com.test.b"), &forbidden), Some(exact));
        assert_eq!(manager.match_registration(&Uri::from("com.other.b"), &forbidden), Some(wildcard));
        assert_eq!(manager.match_registration(&Uri::from("org.test"), &forbidden), None);

        // A registration with only forbidden callees is skipped.
        let forbidden = HashSet::from_iter([id(2)]);
        assert_eq!(manager.match_registration(&Uri::from("com.test.abc"), &forbidden), Some(short));
    }

    #[test]
    fn single_registration_rejects_second_callee() {
        let ids = SequentialIdAllocator::default();
        let mut manager = ProcedureManager::default();
        let registration = manager
            .register(&ids, id(1), Uri::from("com.test.echo"), &RegisterOptions::default())
            .unwrap()
            .registration;
        assert_interaction_error(
            manager.register(&ids, id(2), Uri::from("com.test.echo"), &RegisterOptions::default()),
            InteractionError::ProcedureAlreadyExists,
        );
        assert_matches::assert_matches!(manager.get(registration), Some(registration) => {
            assert_eq!(registration.callee_sessions().collect::<Vec<_>>(), vec![id(1)]);
        });
    }

    #[test]
    fn shared_registration_requires_same_invocation_policy() {
        let ids = SequentialIdAllocator::default();
        let mut manager = ProcedureManager::default();
        let uri = Uri::from("com.test.shared");
        let roundrobin = options(MatchPolicy::Exact, InvocationPolicy::RoundRobin);
        let registration = manager.register(&ids, id(1), uri.clone(), &roundrobin).unwrap();
        assert!(registration.created);
        assert_matches::assert_matches!(manager.register(&ids, id(2), uri.clone(), &roundrobin), Ok(outcome) => {
            assert_eq!(outcome.registration, registration.registration);
            assert!(!outcome.created);
        });
        assert_interaction_error(
            manager.register(&ids, id(2), uri.clone(), &roundrobin),
            InteractionError::ProcedureAlreadyExists,
        );
        assert_interaction_error(
            manager.register(&ids, id(3), uri.clone(), &options(MatchPolicy::Exact, InvocationPolicy::Random)),
            InteractionError::ProcedureExistsWithDifferentInvocationPolicy,
        );
    }

    #[test]
    fn meta_registrations_cannot_be_joined() {
        let ids = SequentialIdAllocator::default();
        let mut manager = ProcedureManager::default();
        manager.register_meta(id(100), Uri::from("wamp.session.count"));
        assert_interaction_error(
            manager.register(&ids, id(1), Uri::from("wamp.session.count"), &RegisterOptions::default()),
            InteractionError::NotAuthorized,
        );
    }

    #[test]
    fn round_robin_rotates_through_callees() {
        let ids = SequentialIdAllocator::default();
        let mut manager = ProcedureManager::default();
        let uri = Uri::from("com.test.rr");
        let roundrobin = options(MatchPolicy::Exact, InvocationPolicy::RoundRobin);
        let registration = manager.register(&ids, id(1), uri.clone(), &roundrobin).unwrap().registration;
        manager.register(&ids, id(2), uri.clone(), &roundrobin).unwrap();
        manager.register(&ids, id(3), uri.clone(), &roundrobin).unwrap();

        let forbidden = HashSet::default();
        let selected = (0..6)
            .map(|_| manager.select_callee(registration, &forbidden))
            .collect::<Vec<_>>();
        assert_eq!(
            selected,
            [1, 2, 3, 1, 2, 3]
                .into_iter()
                .map(|session| Some(Participant::Session(id(session))))
                .collect::<Vec<_>>()
        );

        // Rotation is at 3 after selecting 1 and 2. Removing 1 must not skip or repeat.
        manager.select_callee(registration, &forbidden);
        manager.select_callee(registration, &forbidden);
        manager.unregister(id(1), registration).unwrap();
        assert_eq!(
            manager.select_callee(registration, &forbidden),
            Some(Participant::Session(id(3)))
        );
        assert_eq!(
            manager.select_callee(registration, &forbidden),
            Some(Participant::Session(id(2)))
        );
    }

    #[test]
    fn selects_by_position_and_load() {
        let ids = SequentialIdAllocator::default();
        let mut manager = ProcedureManager::default();
        let forbidden = HashSet::default();

        let uri = Uri::from("com.test.last");
        let last = options(MatchPolicy::Exact, InvocationPolicy::Last);
        let registration = manager.register(&ids, id(1), uri.clone(), &last).unwrap().registration;
        manager.register(&ids, id(2), uri.clone(), &last).unwrap();
        assert_eq!(
            manager.select_callee(registration, &forbidden),
            Some(Participant::Session(id(2)))
        );
        assert_eq!(
            manager.select_callee(registration, &HashSet::from_iter([id(2)])),
            Some(Participant::Session(id(1)))
        );

        let uri = Uri::from("com.test.load");
        let load = options(MatchPolicy::Exact, InvocationPolicy::Load);
        let registration = manager.register(&ids, id(1), uri.clone(), &load).unwrap().registration;
        manager.register(&ids, id(2), uri.clone(), &load).unwrap();
        manager.acquire(registration, id(1));
        assert_eq!(
            manager.select_callee(registration, &forbidden),
            Some(Participant::Session(id(2)))
        );
        manager.acquire(registration, id(2));
        manager.acquire(registration, id(2));
        manager.release(registration, id(1));
        assert_eq!(
            manager.select_callee(registration, &forbidden),
            Some(Participant::Session(id(1)))
        );
    }

    #[test]
    fn removing_last_callee_deletes_registration() {
        let ids = SequentialIdAllocator::default();
        let mut manager = ProcedureManager::default();
        let uri = Uri::from("com.test.first");
        let first = options(MatchPolicy::Exact, InvocationPolicy::First);
        let registration = manager.register(&ids, id(1), uri.clone(), &first).unwrap().registration;
        manager.register(&ids, id(2), uri.clone(), &first).unwrap();

        assert_interaction_error(manager.unregister(id(3), registration), InteractionError::NoSuchRegistration);
        assert_matches::assert_matches!(manager.unregister(id(1), registration), Ok(outcome) => {
            assert!(!outcome.deleted);
        });
        assert_eq!(
            manager.remove_session(id(2)).into_iter().map(|outcome| outcome.deleted).collect::<Vec<_>>(),
            vec![true]
        );
        assert!(manager.get(registration).is_none());
        assert_eq!(manager.lookup(&uri, MatchPolicy::Exact), None);
    }
}
