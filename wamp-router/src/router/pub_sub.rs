use std::hash::Hash;

use anyhow::Result;
use log::debug;

use crate::{
    core::{
        error::InteractionError,
        id::{
            Id,
            IdAllocator,
        },
        match_policy::MatchPolicy,
        options::{
            PublishOptions,
            SubscribeOptions,
        },
        types::{
            Dictionary,
            HashSet,
            List,
            Value,
        },
        uri::Uri,
    },
    message::message::{
        EventMessage,
        Message,
        PublishedMessage,
        SubscribedMessage,
        UnsubscribedMessage,
    },
    router::{
        meta,
        realm::{
            Realm,
            SessionInfo,
        },
        topic::UnsubscribeOutcome,
    },
};

/// The publisher of an event.
#[derive(Clone, Copy)]
enum Publisher<'a> {
    /// The realm's meta API, which is never excluded or disclosed.
    Meta,
    Session(&'a SessionInfo),
}

fn contains<T>(list: &Option<HashSet<T>>, value: &T) -> bool
where
    T: Eq + Hash,
{
    list.as_ref().is_some_and(|list| list.contains(value))
}

/// Checks if the subscriber receives the event, according to the exclusion and eligibility lists.
///
/// Every list names subscribers, never the publisher. A publisher whose own session, authid or
/// authrole appears in `exclude*` still reaches other subscribers. Only `exclude_me` drops the
/// publisher's own copy.
fn admits(options: &PublishOptions, publisher: Id, subscriber: &SessionInfo) -> bool {
    if subscriber.id == publisher && options.excludes_publisher() {
        return false;
    }
    if contains(&options.exclude, &subscriber.id)
        || contains(&options.exclude_authid, &subscriber.identity.id)
        || contains(&options.exclude_authrole, &subscriber.identity.role)
    {
        return false;
    }
    if options.has_eligibility_lists() {
        return contains(&options.eligible, &subscriber.id)
            || contains(&options.eligible_authid, &subscriber.identity.id)
            || contains(&options.eligible_authrole, &subscriber.identity.role);
    }
    true
}

impl Realm {
    /// Subscribes a session to a topic.
    pub fn subscribe(
        &mut self,
        session: Id,
        request: Id,
        topic: Uri,
        options: &SubscribeOptions,
    ) -> Result<()> {
        let outcome = self
            .topic_manager
            .subscribe(&self.realm_ids, session, topic, options);
        if outcome.created {
            if let Some(subscription) = self.topic_manager.get(outcome.subscription) {
                let details = subscription.details();
                self.publish_meta_event(
                    meta::SUBSCRIPTION_ON_CREATE,
                    vec![Value::from(session), Value::from(details)],
                );
            }
        }
        self.send(
            session,
            Message::Subscribed(SubscribedMessage {
                subscribe_request: request,
                subscription: outcome.subscription,
            }),
        );
        if outcome.added {
            self.publish_meta_event(
                meta::SUBSCRIPTION_ON_SUBSCRIBE,
                vec![Value::from(session), Value::from(outcome.subscription)],
            );
        }
        Ok(())
    }

    /// Unsubscribes a session from a subscription.
    pub fn unsubscribe(&mut self, session: Id, request: Id, subscription: Id) -> Result<()> {
        let outcome = self.topic_manager.unsubscribe(session, subscription)?;
        self.send(
            session,
            Message::Unsubscribed(UnsubscribedMessage {
                unsubscribe_request: request,
            }),
        );
        self.publish_subscription_removed(session, outcome);
        Ok(())
    }

    pub(crate) fn publish_subscription_removed(
        &mut self,
        session: Id,
        outcome: UnsubscribeOutcome,
    ) {
        self.publish_meta_event(
            meta::SUBSCRIPTION_ON_UNSUBSCRIBE,
            vec![Value::from(session), Value::from(outcome.subscription)],
        );
        if outcome.deleted {
            self.publish_meta_event(
                meta::SUBSCRIPTION_ON_DELETE,
                vec![Value::from(session), Value::from(outcome.subscription)],
            );
        }
    }

    /// Publishes an event to every matching subscription.
    pub fn publish(
        &mut self,
        session: Id,
        request: Id,
        topic: Uri,
        options: &PublishOptions,
        arguments: List,
        arguments_keyword: Dictionary,
    ) -> Result<()> {
        if meta::is_meta_uri(&topic) {
            return Err(InteractionError::NotAuthorized.into());
        }
        let publisher = self
            .sessions
            .get(&session)
            .map(|publisher| Publisher::Session(&publisher.info))
            .ok_or(InteractionError::NoSuchSession)?;
        let publication = self.global_ids.generate_id();
        self.fan_out(
            publisher,
            publication,
            &topic,
            options,
            &arguments,
            &arguments_keyword,
        );
        if options.acknowledge {
            self.send(
                session,
                Message::Published(PublishedMessage {
                    publish_request: request,
                    publication,
                }),
            );
        }
        Ok(())
    }

    /// Publishes an event from the realm's meta API.
    pub(crate) fn publish_meta_event(&self, topic: &str, arguments: List) {
        let publication = self.global_ids.generate_id();
        self.fan_out(
            Publisher::Meta,
            publication,
            &Uri::from_known(topic),
            &PublishOptions::default(),
            &arguments,
            &Dictionary::default(),
        );
    }

    fn fan_out(
        &self,
        publisher: Publisher<'_>,
        publication: Id,
        topic: &Uri,
        options: &PublishOptions,
        arguments: &List,
        arguments_keyword: &Dictionary,
    ) {
        let mut delivered = 0;
        for subscription in self.topic_manager.matching(topic) {
            let subscription = match self.topic_manager.get(subscription) {
                Some(subscription) => subscription,
                None => continue,
            };
            for subscriber in &subscription.subscribers {
                let info = match self.sessions.get(&subscriber.session) {
                    Some(session) => &session.info,
                    None => continue,
                };
                let mut details = Dictionary::default();
                if let Publisher::Session(publisher) = publisher {
                    if !admits(options, publisher.id, info) {
                        continue;
                    }
                    if options.disclose_me || subscriber.disclose_publisher {
                        details.insert("publisher".to_owned(), Value::from(publisher.id));
                        details.insert(
                            "publisher_authid".to_owned(),
                            Value::from(publisher.identity.id.as_str()),
                        );
                        details.insert(
                            "publisher_authrole".to_owned(),
                            Value::from(publisher.identity.role.as_str()),
                        );
                    }
                }
                if subscription.match_policy != MatchPolicy::Exact {
                    details.insert("topic".to_owned(), Value::from(topic));
                }
                if self.send(
                    subscriber.session,
                    Message::Event(EventMessage {
                        subscribed_subscription: subscription.id,
                        published_publication: publication,
                        details,
                        publish_arguments: arguments.clone(),
                        publish_arguments_keyword: arguments_keyword.clone(),
                    }),
                ) {
                    delivered += 1;
                }
            }
        }
        debug!("Publication {publication} to {topic} delivered {delivered} events");
    }
}
