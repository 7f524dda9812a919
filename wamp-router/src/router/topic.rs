use anyhow::Result;
use chrono::{
    DateTime,
    Utc,
};

use crate::core::{
    error::InteractionError,
    id::{
        Id,
        IdAllocator,
    },
    match_policy::MatchPolicy,
    options::SubscribeOptions,
    types::{
        Dictionary,
        HashMap,
        Value,
    },
    uri::Uri,
};

/// A single subscriber of a subscription.
#[derive(Debug, Clone)]
pub struct Subscriber {
    pub session: Id,
    /// Whether the publisher's identity is always disclosed to this subscriber.
    pub disclose_publisher: bool,
}

/// A topic subscription, shared by any number of subscribers.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: Id,
    pub uri: Uri,
    pub match_policy: MatchPolicy,
    pub created: DateTime<Utc>,
    pub subscribers: Vec<Subscriber>,
}

impl Subscription {
    pub fn subscriber(&self, session: Id) -> Option<&Subscriber> {
        self.subscribers
            .iter()
            .find(|subscriber| subscriber.session == session)
    }

    /// Details of the subscription, as reported by the meta API.
    pub fn details(&self) -> Dictionary {
        Dictionary::from_iter([
            ("id".to_owned(), Value::from(self.id)),
            ("created".to_owned(), Value::from(self.created.to_rfc3339())),
            ("uri".to_owned(), Value::from(&self.uri)),
            (
                "match".to_owned(),
                Value::from(<&'static str>::from(self.match_policy)),
            ),
        ])
    }
}

/// The result of subscribing to a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscribeOutcome {
    pub subscription: Id,
    /// Whether the subscription was created for this subscriber.
    pub created: bool,
    /// Whether the session was added as a new subscriber.
    ///
    /// False when the session was already subscribed.
    pub added: bool,
}

/// The result of unsubscribing from a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnsubscribeOutcome {
    pub subscription: Id,
    /// Whether the subscription was deleted because it has no more subscribers.
    pub deleted: bool,
}

/// A manager for all topic subscriptions owned by a realm.
#[derive(Debug, Default)]
pub struct TopicManager {
    subscriptions: HashMap<Id, Subscription>,
    by_uri: HashMap<MatchPolicy, HashMap<Uri, Id>>,
}

impl TopicManager {
    /// Looks up a subscription by ID.
    pub fn get(&self, id: Id) -> Option<&Subscription> {
        self.subscriptions.get(&id)
    }

    /// All subscriptions.
    pub fn subscriptions(&self) -> impl Iterator<Item = &Subscription> {
        self.subscriptions.values()
    }

    /// Looks up the subscription with exactly the given URI and match policy.
    pub fn lookup(&self, uri: &Uri, match_policy: MatchPolicy) -> Option<Id> {
        self.by_uri
            .get(&match_policy)
            .and_then(|subscriptions| subscriptions.get(uri))
            .copied()
    }

    /// Subscribes a session to a topic, creating the subscription if needed.
    ///
    /// Subscribing twice to the same subscription is not an error.
    pub fn subscribe(
        &mut self,
        id_allocator: &dyn IdAllocator,
        session: Id,
        uri: Uri,
        options: &SubscribeOptions,
    ) -> SubscribeOutcome {
        let subscriber = Subscriber {
            session,
            disclose_publisher: options.disclose_publisher,
        };
        let subscription = match self
            .lookup(&uri, options.match_policy)
            .and_then(|id| self.subscriptions.get_mut(&id))
        {
            Some(subscription) => subscription,
            None => {
                let id = id_allocator.generate_id();
                self.by_uri
                    .entry(options.match_policy)
                    .or_default()
                    .insert(uri.clone(), id);
                self.subscriptions.insert(
                    id,
                    Subscription {
                        id,
                        uri,
                        match_policy: options.match_policy,
                        created: Utc::now(),
                        subscribers: vec![subscriber],
                    },
                );
                return SubscribeOutcome {
                    subscription: id,
                    created: true,
                    added: true,
                };
            }
        };

        let added = subscription.subscriber(session).is_none();
        if added {
            subscription.subscribers.push(subscriber);
        }
        SubscribeOutcome {
            subscription: subscription.id,
            created: false,
            added,
        }
    }

    /// Removes a session as a subscriber of the subscription.
    pub fn unsubscribe(&mut self, session: Id, id: Id) -> Result<UnsubscribeOutcome> {
        let subscription = self
            .subscriptions
            .get_mut(&id)
            .ok_or(InteractionError::NoSuchSubscription)?;
        let index = subscription
            .subscribers
            .iter()
            .position(|subscriber| subscriber.session == session)
            .ok_or(InteractionError::NoSuchSubscription)?;
        subscription.subscribers.remove(index);
        let deleted = subscription.subscribers.is_empty();
        if deleted {
            if let Some(subscription) = self.subscriptions.remove(&id) {
                if let Some(subscriptions) = self.by_uri.get_mut(&subscription.match_policy) {
                    subscriptions.remove(&subscription.uri);
                }
            }
        }
        Ok(UnsubscribeOutcome {
            subscription: id,
            deleted,
        })
    }

    /// Removes a session from every subscription it is subscribed to.
    pub fn remove_session(&mut self, session: Id) -> Vec<UnsubscribeOutcome> {
        let mut ids = self
            .subscriptions
            .values()
            .filter(|subscription| subscription.subscriber(session).is_some())
            .map(|subscription| subscription.id)
            .collect::<Vec<_>>();
        ids.sort();
        ids.into_iter()
            .filter_map(|id| self.unsubscribe(session, id).ok())
            .collect()
    }

    /// Finds every subscription that receives a publication to `uri`.
    ///
    /// Unlike call routing, all match policies are considered together.
    pub fn matching(&self, uri: &Uri) -> Vec<Id> {
        let mut ids = MatchPolicy::ESCALATION
            .iter()
            .flat_map(|match_policy| {
                self.by_uri
                    .get(match_policy)
                    .into_iter()
                    .flat_map(move |subscriptions| {
                        subscriptions
                            .iter()
                            .filter(move |(pattern, _)| match_policy.matches(pattern, uri))
                            .map(|(_, id)| *id)
                    })
            })
            .collect::<Vec<_>>();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod topic_test {
    use crate::{
        core::{
            error::InteractionError,
            id::{
                Id,
                SequentialIdAllocator,
            },
            match_policy::MatchPolicy,
            options::SubscribeOptions,
            uri::Uri,
        },
        router::topic::TopicManager,
    };

    fn id(value: u64) -> Id {
        Id::try_from(value).unwrap()
    }

    fn options(match_policy: MatchPolicy) -> SubscribeOptions {
        SubscribeOptions {
            match_policy,
            disclose_publisher: false,
        }
    }

    #[test]
    fn duplicate_subscribe_returns_existing_subscription() {
        let ids = SequentialIdAllocator::default();
        let mut manager = TopicManager::default();
        let uri = Uri::from("com.test.topic");
        let first = manager.subscribe(&ids, id(1), uri.clone(), &SubscribeOptions::default());
        assert!(first.created);
        assert!(first.added);

        let second = manager.subscribe(&ids, id(1), uri.clone(), &SubscribeOptions::default());
        assert_eq!(second.subscription, first.subscription);
        assert!(!second.created);
        assert!(!second.added);

        let other = manager.subscribe(&ids, id(2), uri.clone(), &SubscribeOptions::default());
        assert_eq!(other.subscription, first.subscription);
        assert!(other.added);
        assert_eq!(
            manager
                .get(first.subscription)
                .map(|subscription| subscription.subscribers.len()),
            Some(2)
        );
    }

    #[test]
    fn matches_all_policies_together() {
        let ids = SequentialIdAllocator::default();
        let mut manager = TopicManager::default();
        let exact = manager
            .subscribe(&ids, id(1), Uri::from("com.test.topic"), &options(MatchPolicy::Exact))
            .subscription;
        let prefix = manager
            .subscribe(&ids, id(1), Uri::from("com.test"), &options(MatchPolicy::Prefix))
            .subscription;
        let wildcard = manager
            .subscribe(&ids, id(2), Uri::from("com..topic"), &options(MatchPolicy::Wildcard))
            .subscription;
        manager.subscribe(&ids, id(2), Uri::from("org"), &options(MatchPolicy::Prefix));

        assert_eq!(
            manager.matching(&Uri::from("com.test.topic")),
            vec![exact, prefix, wildcard]
        );
        assert_eq!(manager.matching(&Uri::from("com.test.other")), vec![prefix]);
        assert_eq!(manager.matching(&Uri::from("net.test")), Vec::<Id>::new());
    }

    #[test]
    fn unsubscribing_last_subscriber_deletes_subscription() {
        let ids = SequentialIdAllocator::default();
        let mut manager = TopicManager::default();
        let uri = Uri::from("com.test.topic");
        let subscription = manager
            .subscribe(&ids, id(1), uri.clone(), &SubscribeOptions::default())
            .subscription;
        manager.subscribe(&ids, id(2), uri.clone(), &SubscribeOptions::default());

        assert_matches::assert_matches!(manager.unsubscribe(id(3), subscription), Err(err) => {
            assert_eq!(err.to_string(), InteractionError::NoSuchSubscription.to_string());
        });
        assert_matches::assert_matches!(manager.unsubscribe(id(1), subscription), Ok(outcome) => {
            assert!(!outcome.deleted);
        });
        assert_eq!(
            manager
                .remove_session(id(2))
                .into_iter()
                .map(|outcome| outcome.deleted)
                .collect::<Vec<_>>(),
            vec![true]
        );
        assert!(manager.get(subscription).is_none());
        assert_eq!(manager.lookup(&uri, MatchPolicy::Exact), None);
    }
}
