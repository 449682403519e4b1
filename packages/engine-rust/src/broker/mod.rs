//! Publish-subscribe broker.
//!
//! The broker is a PUBSUB [`Handler`]: register it on a [`ClientContext`]
//! for each operation it brokers. It keeps two tables:
//!
//! - subscriptions, keyed by `<subscriber uri>/<subscription id>`, each
//!   holding the subscriber's REGISTER transaction through which every
//!   NOTIFY is sent;
//! - publishers, keyed by URI, each holding the declared entity keys and the
//!   PUBLISH_REGISTER transaction used for PUBLISH_ERROR.
//!
//! A publish is validated (header and value list lengths agree, publisher
//! registered, every key declared), then fanned out: each subscription gets
//! at most one NOTIFY carrying exactly the matching updates, in publish
//! order. Matching happens under a read lock; notifications are sent after
//! the lock is released.

mod local;
mod matching;
mod value_handler;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use mal_core::{
    codes, Body, EntityKey, Identifier, InteractionType, Interaction, MalError,
    Message, OperationKey, PubSubStage, Subscription, Uri, UpdateHeader,
};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::client_context::ClientContext;
use crate::error::EngineResult;
use crate::handler::Handler;
use crate::transaction::{PublisherTransaction, SubscriberTransaction, Transaction};

pub use local::LocalBroker;
pub use matching::UpdateOrigin;
use matching::SubscriptionFilter;
pub use value_handler::{MultiValueListHandler, UpdateValueHandler, ValueListHandler};

type ValueHandlerFactory = dyn Fn() -> Box<dyn UpdateValueHandler> + Send + Sync;

struct BrokerSub {
    subscription_id: Identifier,
    filter: SubscriptionFilter,
    transaction: SubscriberTransaction,
}

struct BrokerPub {
    entity_keys: Vec<EntityKey>,
    transaction: PublisherTransaction,
}

/// A NOTIFY ready to be sent.
pub(crate) struct PendingNotify {
    subscriber: SubscriberTransaction,
    body: Body,
}

/// Publish-subscribe broker. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

struct BrokerInner {
    subs: RwLock<HashMap<String, BrokerSub>>,
    pubs: RwLock<HashMap<Uri, BrokerPub>>,
    value_handlers: Box<ValueHandlerFactory>,
}

impl Broker {
    /// A broker whose value lists are staged by handlers built with `factory`.
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn() -> Box<dyn UpdateValueHandler> + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(BrokerInner {
                subs: RwLock::new(HashMap::new()),
                pubs: RwLock::new(HashMap::new()),
                value_handlers: Box::new(factory),
            }),
        }
    }

    /// A broker for services publishing one value list.
    #[must_use]
    pub fn with_value_list() -> Self {
        Self::new(|| Box::new(ValueListHandler::default()))
    }

    /// A broker for services publishing `lists` parallel value lists.
    #[must_use]
    pub fn with_value_lists(lists: usize) -> Self {
        Self::new(move || Box::new(MultiValueListHandler::new(lists)))
    }

    /// Registers this broker as the PUBSUB handler of `key` on `ctx`.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::DuplicateHandler` if `key` is already handled.
    pub fn attach(&self, ctx: &ClientContext, key: OperationKey) -> EngineResult<()> {
        ctx.register_handler(InteractionType::PubSub, key, self.clone())
    }

    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.inner.subs.read().len()
    }

    #[must_use]
    pub fn publisher_count(&self) -> usize {
        self.inner.pubs.read().len()
    }

    pub(crate) fn new_value_handler(&self) -> Box<dyn UpdateValueHandler> {
        (self.inner.value_handlers)()
    }

    // -- subscribers --

    async fn on_register(&self, message: Message, transaction: SubscriberTransaction) -> anyhow::Result<()> {
        let mut body = message.body.clone();
        body.reset(false);
        let subscription: Subscription = body.decode_required().map_err(MalError::from)?;
        let key = subscription_key(&message.uri_from, &subscription.subscription_id);
        debug!(subscriber = %message.uri_from, id = %subscription.subscription_id, "subscription registered");

        let sub = BrokerSub {
            subscription_id: subscription.subscription_id,
            filter: SubscriptionFilter::new(UpdateOrigin::from_message(&message), subscription.entities),
            transaction: transaction.clone(),
        };
        // Re-registering the same id replaces the previous filter atomically.
        if let Some(previous) = self.inner.subs.write().insert(key, sub) {
            previous.transaction.close();
        }
        metrics::gauge!("mal_broker_subscriptions").set(self.subscription_count() as f64);

        transaction.ack_register(Body::new(), false).await?;
        Ok(())
    }

    async fn on_deregister(&self, message: Message, transaction: SubscriberTransaction) -> anyhow::Result<()> {
        let mut body = message.body.clone();
        body.reset(false);
        let ids: Vec<Identifier> = body
            .decode_parameter()
            .map_err(MalError::from)?
            .unwrap_or_default();
        {
            let mut subs = self.inner.subs.write();
            for id in &ids {
                if let Some(removed) = subs.remove(&subscription_key(&message.uri_from, id)) {
                    removed.transaction.close();
                    debug!(subscriber = %message.uri_from, %id, "subscription removed");
                }
            }
        }
        metrics::gauge!("mal_broker_subscriptions").set(self.subscription_count() as f64);

        transaction.ack_deregister(Body::new(), false).await?;
        Ok(())
    }

    // -- publishers --

    async fn on_publish_register(&self, message: Message, transaction: PublisherTransaction) -> anyhow::Result<()> {
        let mut body = message.body.clone();
        body.reset(false);
        let entity_keys: Vec<EntityKey> = body
            .decode_parameter()
            .map_err(MalError::from)?
            .unwrap_or_default();
        info!(publisher = %message.uri_from, keys = entity_keys.len(), "publisher registered");

        let registration = BrokerPub {
            entity_keys,
            transaction: transaction.clone(),
        };
        if let Some(previous) = self.inner.pubs.write().insert(message.uri_from.clone(), registration) {
            previous.transaction.close();
        }
        transaction.ack_register(Body::new(), false).await?;
        Ok(())
    }

    async fn on_publish_deregister(&self, message: Message, transaction: PublisherTransaction) -> anyhow::Result<()> {
        if let Some(previous) = self.inner.pubs.write().remove(&message.uri_from) {
            previous.transaction.close();
            info!(publisher = %message.uri_from, "publisher deregistered");
        }
        transaction.ack_deregister(Body::new(), false).await?;
        Ok(())
    }

    async fn on_publish(&self, message: Message, transaction: PublisherTransaction) -> anyhow::Result<()> {
        metrics::counter!("mal_broker_publishes_total").increment(1);
        match self.prepare_publish(&message) {
            Ok(notifications) => {
                self.deliver(notifications).await;
            }
            Err(error) => {
                warn!(publisher = %message.uri_from, %error, "publish rejected");
                metrics::counter!("mal_broker_publish_errors_total").increment(1);
                let registered = self
                    .inner
                    .pubs
                    .read()
                    .get(&message.uri_from)
                    .map(|publisher| publisher.transaction.clone());
                registered
                    .unwrap_or(transaction)
                    .publish_error(&error)
                    .await?;
            }
        }
        Ok(())
    }

    fn prepare_publish(&self, message: &Message) -> Result<Vec<PendingNotify>, MalError> {
        let mut body = message.body.clone();
        body.reset(false);
        let headers: Vec<UpdateHeader> = body.decode_parameter()?.unwrap_or_default();
        let mut values = self.new_value_handler();
        values.decode_update_value_list(&mut body)?;
        check_lengths(&headers, &*values)?;

        {
            let pubs = self.inner.pubs.read();
            let Some(publisher) = pubs.get(&message.uri_from) else {
                return Err(MalError::with_message(
                    codes::INCORRECT_STATE,
                    "publisher not registered",
                ));
            };
            let undeclared: Vec<String> = headers
                .iter()
                .filter(|header| !publisher.entity_keys.iter().any(|p| p.matches(&header.key)))
                .map(|header| header.key.to_string())
                .collect();
            if !undeclared.is_empty() {
                return Err(MalError::unknown(format!(
                    "keys not registered for publishing: {}",
                    undeclared.join(", ")
                )));
            }
        }

        self.fan_out(&UpdateOrigin::from_message(message), &headers, &mut *values)
    }

    /// Builds one NOTIFY per subscription that matches at least one update.
    pub(crate) fn fan_out(
        &self,
        origin: &UpdateOrigin,
        headers: &[UpdateHeader],
        values: &mut dyn UpdateValueHandler,
    ) -> Result<Vec<PendingNotify>, MalError> {
        let subs = self.inner.subs.read();
        let mut notifications = Vec::new();
        for sub in subs.values() {
            values.reset_values();
            let mut matched = Vec::new();
            for (index, header) in headers.iter().enumerate() {
                if sub.filter.matches(origin, &header.key) {
                    matched.push(header.clone());
                    values.append_value(index);
                }
            }
            if matched.is_empty() {
                continue;
            }
            let mut body = Body::new();
            body.encode_parameter(&sub.subscription_id)?;
            body.encode_parameter(&matched)?;
            values.encode_notify_values(&mut body);
            notifications.push(PendingNotify {
                subscriber: sub.transaction.clone(),
                body,
            });
        }
        values.reset_values();
        Ok(notifications)
    }

    /// Sends the notifications; returns how many were delivered.
    pub(crate) async fn deliver(&self, notifications: Vec<PendingNotify>) -> usize {
        let mut delivered = 0;
        for PendingNotify { subscriber, body } in notifications {
            match subscriber.notify(body, false).await {
                Ok(()) => delivered += 1,
                Err(e) => warn!(subscriber = %subscriber.initiator(), error = %e, "notify failed"),
            }
        }
        metrics::counter!("mal_broker_notifies_total").increment(delivered as u64);
        delivered
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("subscriptions", &self.subscription_count())
            .field("publishers", &self.publisher_count())
            .finish_non_exhaustive()
    }
}

pub(crate) fn check_lengths(headers: &[UpdateHeader], values: &dyn UpdateValueHandler) -> Result<(), MalError> {
    if headers.len() == values.update_count() {
        Ok(())
    } else {
        Err(MalError::unknown(format!(
            "bad header/value list lengths: {} headers, {} values",
            headers.len(),
            values.update_count()
        )))
    }
}

fn subscription_key(subscriber: &Uri, id: &Identifier) -> String {
    format!("{subscriber}/{id}")
}

#[async_trait]
impl Handler for Broker {
    async fn handle(&self, message: Message, transaction: Transaction) -> anyhow::Result<()> {
        match (message.interaction, transaction) {
            (Interaction::PubSub(PubSubStage::Register), Transaction::Subscriber(tx)) => {
                self.on_register(message, tx).await
            }
            (Interaction::PubSub(PubSubStage::Deregister), Transaction::Subscriber(tx)) => {
                self.on_deregister(message, tx).await
            }
            (Interaction::PubSub(PubSubStage::PublishRegister), Transaction::Publisher(tx)) => {
                self.on_publish_register(message, tx).await
            }
            (Interaction::PubSub(PubSubStage::Publish), Transaction::Publisher(tx)) => {
                self.on_publish(message, tx).await
            }
            (Interaction::PubSub(PubSubStage::PublishDeregister), Transaction::Publisher(tx)) => {
                self.on_publish_deregister(message, tx).await
            }
            (interaction, _) => Err(MalError::with_message(
                codes::UNSUPPORTED_OPERATION,
                format!("broker cannot handle {interaction}"),
            )
            .into()),
        }
    }
}
