//! Per-service endpoint: transaction registry, handler registry and header
//! defaults.
//!
//! A [`ClientContext`] is registered in its [`Context`] at
//! `<context uri>/<service>`. Inbound messages split two ways:
//!
//! - initiating stages go to the [`Handler`] registered for the message's
//!   [`OperationKey`], together with a fresh [`Transaction`];
//! - every other stage is a continuation and goes to the consumer operation
//!   registered under the message's transaction id.
//!
//! Both lookups are exact-key maps. A miss is logged and counted; a missing
//! handler is also answered with UNSUPPORTED_OPERATION.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use mal_core::{
    codes, Blob, Body, Identifier, Interaction, InteractionType, MalError, Message, MessageHeader,
    OperationKey, QoSLevel, SessionType, Uri,
};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, warn};

use crate::config::DispatchPolicy;
use crate::context::{Context, Endpoint};
use crate::error::{EngineError, EngineResult};
use crate::handler::Handler;
use crate::transaction::Transaction;

/// What the dispatch side pushes into an operation's queue.
#[derive(Debug)]
pub(crate) enum Delivery {
    Message(Message),
    /// Carries the id of the wait it targets.
    Interrupt(u64),
    Shutdown,
}

pub(crate) type DeliveryTx = mpsc::UnboundedSender<Delivery>;

struct HandlerEntry {
    interaction_type: InteractionType,
    handler: Arc<dyn Handler>,
}

/// Handle to a service endpoint. Cheap to clone.
#[derive(Clone)]
pub struct ClientContext {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    context: Context,
    uri: Uri,
    header: RwLock<MessageHeader>,
    next_tid: AtomicU64,
    operations: DashMap<u64, DeliveryTx>,
    handlers: DashMap<OperationKey, Arc<HandlerEntry>>,
    permits: Option<Arc<Semaphore>>,
    closed: AtomicBool,
    endpoint: Arc<dyn Endpoint>,
}

impl ClientContext {
    /// Creates the endpoint `<context uri>/<service>` and registers it.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::DuplicateEndpoint` if the service name is taken
    /// in `context`, or `EngineError::Shutdown` if the context is closing.
    pub fn new(context: &Context, service: &str) -> EngineResult<Self> {
        let uri = context.new_uri(service);
        let permits = match context.config().dispatch {
            DispatchPolicy::Serial => None,
            DispatchPolicy::Concurrent { max_in_flight } => {
                Some(Arc::new(Semaphore::new(max_in_flight.max(1))))
            }
        };
        let inner = Arc::new_cyclic(|weak| ClientInner {
            context: context.clone(),
            uri: uri.clone(),
            header: RwLock::new(MessageHeader::default()),
            next_tid: AtomicU64::new(1),
            operations: DashMap::new(),
            handlers: DashMap::new(),
            permits,
            closed: AtomicBool::new(false),
            endpoint: Arc::new(ClientEndpoint {
                inner: Weak::clone(weak),
            }),
        });
        context.register_endpoint(uri, Arc::clone(&inner.endpoint))?;
        Ok(Self { inner })
    }

    #[must_use]
    pub fn uri(&self) -> &Uri {
        &self.inner.uri
    }

    #[must_use]
    pub fn context(&self) -> &Context {
        &self.inner.context
    }

    /// Allocates a transaction id, unique within this endpoint.
    #[must_use]
    pub fn transaction_id(&self) -> u64 {
        self.inner.next_tid.fetch_add(1, Ordering::Relaxed)
    }

    // -- header defaults stamped on every initiated message --

    #[must_use]
    pub fn header(&self) -> MessageHeader {
        self.inner.header.read().clone()
    }

    pub fn set_header(&self, header: MessageHeader) {
        *self.inner.header.write() = header;
    }

    pub fn set_domain(&self, domain: Vec<Identifier>) {
        self.inner.header.write().domain = domain;
    }

    pub fn set_network_zone(&self, zone: Identifier) {
        self.inner.header.write().network_zone = zone;
    }

    pub fn set_session(&self, session: SessionType, name: Identifier) {
        let mut header = self.inner.header.write();
        header.session = session;
        header.session_name = name;
    }

    pub fn set_qos_level(&self, qos_level: QoSLevel) {
        self.inner.header.write().qos_level = qos_level;
    }

    pub fn set_priority(&self, priority: u32) {
        self.inner.header.write().priority = priority;
    }

    pub fn set_authentication_id(&self, id: Blob) {
        self.inner.header.write().authentication_id = id;
    }

    /// Registers the provider handler for `key`.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::DuplicateHandler` if `key` already has one.
    pub fn register_handler(
        &self,
        interaction_type: InteractionType,
        key: OperationKey,
        handler: impl Handler,
    ) -> EngineResult<()> {
        match self.inner.handlers.entry(key) {
            Entry::Occupied(_) => Err(EngineError::DuplicateHandler { key }),
            Entry::Vacant(slot) => {
                debug!(uri = %self.inner.uri, %key, %interaction_type, "handler registered");
                slot.insert(Arc::new(HandlerEntry {
                    interaction_type,
                    handler: Arc::new(handler),
                }));
                Ok(())
            }
        }
    }

    /// Removes the handler for `key`; returns whether one was registered.
    pub fn deregister_handler(&self, key: OperationKey) -> bool {
        self.inner.handlers.remove(&key).is_some()
    }

    /// Closes the endpoint: it is unregistered from its context and every
    /// pending operation fails with `EngineError::Shutdown`. Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner
            .context
            .unregister_endpoint_if(&self.inner.uri, &self.inner.endpoint);
        self.inner.shutdown_operations();
        debug!(uri = %self.inner.uri, "client context closed");
    }

    // -- crate-internal plumbing for operations and transactions --

    pub(crate) fn register_op(&self, tid: u64, tx: DeliveryTx) -> EngineResult<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(EngineError::Shutdown);
        }
        match self.inner.operations.entry(tid) {
            Entry::Occupied(_) => Err(EngineError::DuplicateTransaction { tid }),
            Entry::Vacant(slot) => {
                slot.insert(tx);
                Ok(())
            }
        }
    }

    pub(crate) fn deregister_op(&self, tid: u64) -> EngineResult<()> {
        self.inner
            .operations
            .remove(&tid)
            .map(|_| ())
            .ok_or(EngineError::UnknownTransaction { tid })
    }

    /// Builds an initiating message stamped with this endpoint's header.
    pub(crate) fn new_message(
        &self,
        uri_to: Uri,
        operation: OperationKey,
        interaction: Interaction,
        transaction_id: u64,
        body: Body,
    ) -> Message {
        Message {
            uri_from: self.inner.uri.clone(),
            uri_to,
            timestamp: now_millis(),
            header: self.header(),
            interaction,
            operation,
            transaction_id,
            is_error_message: false,
            body,
        }
    }

    pub(crate) async fn transmit(&self, message: Message) -> EngineResult<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(EngineError::Shutdown);
        }
        self.inner.context.send(message).await
    }

    // -- inbound routing --

    async fn route(&self, message: Message) -> EngineResult<()> {
        if message.starts_interaction() {
            self.dispatch_initiation(message).await
        } else {
            self.dispatch_continuation(message)
        }
    }

    fn dispatch_continuation(&self, message: Message) -> EngineResult<()> {
        let tid = message.transaction_id;
        let sender = self
            .inner
            .operations
            .get(&tid)
            .map(|entry| entry.value().clone());
        let Some(sender) = sender else {
            warn!(
                uri = %self.inner.uri,
                tid,
                interaction = %message.interaction,
                from = %message.uri_from,
                "no operation registered for transaction"
            );
            metrics::counter!("mal_routing_failures_total", "reason" => "unknown_transaction")
                .increment(1);
            return Err(EngineError::UnknownTransaction { tid });
        };
        sender
            .send(Delivery::Message(message))
            .map_err(|_| EngineError::UnknownTransaction { tid })
    }

    async fn dispatch_initiation(&self, message: Message) -> EngineResult<()> {
        let key = message.operation;
        let entry = self
            .inner
            .handlers
            .get(&key)
            .map(|entry| Arc::clone(entry.value()));

        let Some(entry) = entry else {
            warn!(
                uri = %self.inner.uri,
                %key,
                interaction = %message.interaction,
                from = %message.uri_from,
                "no handler registered for operation"
            );
            metrics::counter!("mal_routing_failures_total", "reason" => "unknown_operation")
                .increment(1);
            let error = MalError::with_message(codes::UNSUPPORTED_OPERATION, key.to_string());
            self.reject(&message, &error).await;
            return Err(EngineError::UnknownOperation { key });
        };

        if entry.interaction_type != message.interaction_type() {
            warn!(
                uri = %self.inner.uri,
                %key,
                registered = %entry.interaction_type,
                received = %message.interaction,
                "interaction pattern does not match handler"
            );
            let error = MalError::with_message(
                codes::UNSUPPORTED_OPERATION,
                format!("{key} is a {} operation", entry.interaction_type),
            );
            self.reject(&message, &error).await;
            return Err(EngineError::UnexpectedStage {
                expected: entry.interaction_type.to_string(),
                actual: message.interaction,
            });
        }

        metrics::counter!("mal_handler_invocations_total", "pattern" => message.interaction_type().to_string())
            .increment(1);
        let transaction = Transaction::from_message(self.clone(), &message);
        let handler = Arc::clone(&entry.handler);
        // PUBSUB stages run on the dispatch task, in arrival order.
        let permits = match &self.inner.permits {
            Some(permits) if message.interaction_type() != InteractionType::PubSub => Arc::clone(permits),
            _ => {
                run_handler(handler, message, transaction).await;
                return Ok(());
            }
        };
        // Acquired off the dispatch task; replies keep flowing while every permit is held.
        tokio::spawn(async move {
            let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                return;
            };
            let slot = HandlerSlot {
                permits,
                held: Mutex::new(Some(permit)),
            };
            HANDLER_SLOT
                .scope(slot, run_handler(handler, message, transaction))
                .await;
        });
        Ok(())
    }

    async fn reject(&self, message: &Message, error: &MalError) {
        if let Some(reply) = message.error_reply(error) {
            if let Err(e) = self.transmit(reply).await {
                debug!(error = %e, "could not send rejection");
            }
        }
    }
}

impl std::fmt::Debug for ClientContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientContext")
            .field("uri", &self.inner.uri)
            .field("operations", &self.inner.operations.len())
            .field("handlers", &self.inner.handlers.len())
            .finish_non_exhaustive()
    }
}

tokio::task_local! {
    static HANDLER_SLOT: HandlerSlot;
}

/// The dispatch permit of a handler running under `DispatchPolicy::Concurrent`.
struct HandlerSlot {
    permits: Arc<Semaphore>,
    held: Mutex<Option<OwnedSemaphorePermit>>,
}

/// Awaits `wait` with the calling handler's permit released, then takes a
/// permit back. Outside a concurrent handler this is a plain await.
pub(crate) async fn while_suspended<T>(wait: impl Future<Output = T>) -> T {
    let released = HANDLER_SLOT.try_with(|slot| {
        slot.held.lock().take();
        Arc::clone(&slot.permits)
    });
    let Ok(permits) = released else {
        return wait.await;
    };
    let output = wait.await;
    if let Ok(permit) = permits.acquire_owned().await {
        let _ = HANDLER_SLOT.try_with(|slot| *slot.held.lock() = Some(permit));
    }
    output
}

/// Runs one handler; a failure is reported on the transaction's open slot.
async fn run_handler(handler: Arc<dyn Handler>, message: Message, transaction: Transaction) {
    let tid = message.transaction_id;
    let key = message.operation;
    let slot = transaction.clone();
    if let Err(failure) = handler.handle(message, transaction).await {
        warn!(tid, %key, error = %failure, "handler failed");
        if slot.is_open() {
            if let Err(e) = slot.return_error(failure).await {
                error!(tid, %key, error = %e, "could not report handler failure");
            }
        }
    }
}

impl ClientInner {
    fn shutdown_operations(&self) {
        let pending: Vec<DeliveryTx> = self
            .operations
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.operations.clear();
        for tx in pending {
            let _ = tx.send(Delivery::Shutdown);
        }
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        // A later client context may have taken over the service name.
        self.context.unregister_endpoint_if(&self.uri, &self.endpoint);
    }
}

/// The context's view of a client context. Holds it weakly so that dropping
/// every handle releases the endpoint.
struct ClientEndpoint {
    inner: Weak<ClientInner>,
}

#[async_trait]
impl Endpoint for ClientEndpoint {
    async fn on_message(&self, message: Message) -> EngineResult<()> {
        let inner = self.inner.upgrade().ok_or(EngineError::Shutdown)?;
        ClientContext { inner }.route(message).await
    }

    async fn on_close(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.closed.store(true, Ordering::Release);
            inner.shutdown_operations();
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}
