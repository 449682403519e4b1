//! Consumer-side interaction state machines.
//!
//! Each operation allocates a transaction id from its [`ClientContext`] and
//! registers a private delivery queue under it. Replies for that id are
//! pushed into the queue by the context's dispatch task and consumed by the
//! blocking calls below, so an operation observes its stages in order.
//!
//! Errors surface at the earliest point they are known: a protocol error on
//! an acknowledgement is returned by the call that waited for it and ends
//! the operation. Later calls on that operation return the same error.
//!
//! Dropping an operation that is not FINAL releases its transaction id.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use mal_core::{
    AbstractElement, Body, Element, EntityKey, Identifier, Interaction, InvokeStage, MalError,
    Message, OperationKey, ProgressStage, PubSubStage, RequestStage, SubmitStage, Subscription,
    UpdateHeader, Uri,
};
use tokio::sync::mpsc;
use tracing::debug;

use crate::client_context::{while_suspended, ClientContext, Delivery, DeliveryTx};
use crate::error::{EngineError, EngineResult};

/// Consumer operation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationStatus {
    /// Nothing sent yet under the current transaction id.
    Created,
    /// The initiating message is out; waiting for the first reply.
    Initiated,
    /// INVOKE or PROGRESS acknowledged.
    Acknowledged,
    /// At least one PROGRESS update received.
    Progressing,
    /// REGISTER or PUBLISH_REGISTER sent.
    RegisterInitiated,
    /// The broker accepted the registration.
    Registered,
    /// A registration replacing the current one is in flight.
    ReregisterInitiated,
    /// DEREGISTER or PUBLISH_DEREGISTER sent.
    DeregisterInitiated,
    /// The interaction ended; only `reset` or `close` apply.
    Final,
    /// Released for good.
    Closed,
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "CREATED",
            Self::Initiated => "INITIATED",
            Self::Acknowledged => "ACKNOWLEDGED",
            Self::Progressing => "PROGRESSING",
            Self::RegisterInitiated => "REGISTER_INITIATED",
            Self::Registered => "REGISTERED",
            Self::ReregisterInitiated => "REREGISTER_INITIATED",
            Self::DeregisterInitiated => "DEREGISTER_INITIATED",
            Self::Final => "FINAL",
            Self::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

/// Wakes a blocked call on an operation with `EngineError::Interrupted`.
///
/// Obtained from [`Operation::interrupter`]; usable from any task. An
/// interrupt with no call waiting is dropped.
#[derive(Debug, Clone)]
pub struct Interrupter {
    tx: DeliveryTx,
    waiting: Arc<AtomicU64>,
}

impl Interrupter {
    pub fn interrupt(&self) {
        let wait = self.waiting.load(Ordering::Acquire);
        if wait != 0 {
            let _ = self.tx.send(Delivery::Interrupt(wait));
        }
    }
}

/// Marks the operation idle again when a wait ends or is cancelled.
struct WaitGuard(Arc<AtomicU64>);

impl Drop for WaitGuard {
    fn drop(&mut self) {
        self.0.store(0, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// Shared core
// ---------------------------------------------------------------------------

/// State shared by every consumer operation.
pub struct OperationCore {
    ctx: ClientContext,
    uri_to: Uri,
    key: OperationKey,
    tid: u64,
    status: OperationStatus,
    tx: DeliveryTx,
    rx: mpsc::UnboundedReceiver<Delivery>,
    error: Option<MalError>,
    /// Id of the wait in progress, 0 when no call is blocked.
    waiting: Arc<AtomicU64>,
    next_wait: u64,
    shut_down: bool,
}

impl OperationCore {
    fn new(ctx: &ClientContext, uri_to: Uri, key: OperationKey) -> EngineResult<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let tid = ctx.transaction_id();
        ctx.register_op(tid, tx.clone())?;
        Ok(Self {
            ctx: ctx.clone(),
            uri_to,
            key,
            tid,
            status: OperationStatus::Created,
            tx,
            rx,
            error: None,
            waiting: Arc::new(AtomicU64::new(0)),
            next_wait: 0,
            shut_down: false,
        })
    }

    fn expect(&self, operation: &'static str, allowed: &[OperationStatus]) -> EngineResult<()> {
        if self.shut_down {
            return Err(EngineError::Shutdown);
        }
        if allowed.contains(&self.status) {
            return Ok(());
        }
        // A protocol failure is reported again to every later call.
        if let Some(error) = &self.error {
            return Err(EngineError::Protocol(error.clone()));
        }
        Err(EngineError::InvalidState {
            operation,
            status: self.status.to_string(),
        })
    }

    /// Sends a message of this transaction and moves to `next`.
    async fn transmit(&mut self, interaction: Interaction, body: Body, next: OperationStatus) -> EngineResult<()> {
        let message = self
            .ctx
            .new_message(self.uri_to.clone(), self.key, interaction, self.tid, body);
        match self.ctx.transmit(message).await {
            Ok(()) => {
                self.status = next;
                Ok(())
            }
            Err(e) => {
                self.finish();
                Err(e)
            }
        }
    }

    async fn receive(&mut self) -> EngineResult<Message> {
        if self.shut_down {
            return Err(EngineError::Shutdown);
        }
        self.next_wait += 1;
        let wait = self.next_wait;
        self.waiting.store(wait, Ordering::Release);
        let _idle = WaitGuard(Arc::clone(&self.waiting));
        let rx = &mut self.rx;
        let delivery = while_suspended(async move {
            loop {
                match rx.recv().await {
                    // Sent for an earlier wait that has already ended.
                    Some(Delivery::Interrupt(id)) if id != wait => {}
                    other => break other,
                }
            }
        })
        .await;
        match delivery {
            Some(Delivery::Message(message)) => Ok(message),
            Some(Delivery::Interrupt(_)) => Err(EngineError::Interrupted),
            Some(Delivery::Shutdown) | None => {
                self.shut_down();
                Err(EngineError::Shutdown)
            }
        }
    }

    /// The context is gone: every later call fails with `EngineError::Shutdown`.
    fn shut_down(&mut self) {
        self.shut_down = true;
        self.finish();
    }

    /// Waits for `expected`; an error message or any other stage ends the operation.
    async fn await_stage(&mut self, expected: Interaction) -> EngineResult<Message> {
        let message = self.receive().await?;
        if message.is_error_message {
            return Err(self.fail(message));
        }
        if message.interaction != expected {
            return Err(self.unexpected(expected.to_string(), message));
        }
        Ok(message)
    }

    fn fail(&mut self, mut message: Message) -> EngineError {
        let error = MalError::from_body(&mut message.body).unwrap_or_else(MalError::from);
        debug!(tid = self.tid, key = %self.key, %error, "operation failed");
        self.error = Some(error.clone());
        self.finish();
        EngineError::Protocol(error)
    }

    fn unexpected(&mut self, expected: String, message: Message) -> EngineError {
        self.finish();
        EngineError::UnexpectedStage {
            expected,
            actual: message.interaction,
        }
    }

    /// Enters FINAL and releases the transaction id.
    fn finish(&mut self) {
        if matches!(self.status, OperationStatus::Final | OperationStatus::Closed) {
            return;
        }
        self.status = OperationStatus::Final;
        if let Err(e) = self.ctx.deregister_op(self.tid) {
            debug!(tid = self.tid, error = %e, "transaction already released");
        }
    }

    fn reset(&mut self) -> EngineResult<()> {
        if self.status != OperationStatus::Final {
            return Err(EngineError::InvalidState {
                operation: "reset",
                status: self.status.to_string(),
            });
        }
        while self.rx.try_recv().is_ok() {}
        let tid = self.ctx.transaction_id();
        self.ctx.register_op(tid, self.tx.clone())?;
        self.tid = tid;
        self.status = OperationStatus::Created;
        self.error = None;
        Ok(())
    }

    fn close(&mut self) {
        if self.status == OperationStatus::Closed {
            return;
        }
        if self.status != OperationStatus::Final {
            let _ = self.ctx.deregister_op(self.tid);
        }
        self.status = OperationStatus::Closed;
    }
}

impl Drop for OperationCore {
    fn drop(&mut self) {
        self.close();
    }
}

fn readable(mut body: Body) -> Body {
    body.reset(false);
    body
}

/// Operations common to every consumer pattern.
pub trait Operation {
    #[doc(hidden)]
    fn core(&self) -> &OperationCore;
    #[doc(hidden)]
    fn core_mut(&mut self) -> &mut OperationCore;

    /// The transaction id of the current interaction.
    fn transaction_id(&self) -> u64 {
        self.core().tid
    }

    fn status(&self) -> OperationStatus {
        self.core().status
    }

    /// The protocol error that ended the last interaction, if any.
    fn last_error(&self) -> Option<&MalError> {
        self.core().error.as_ref()
    }

    /// A handle that interrupts the blocked call, if any.
    fn interrupter(&self) -> Interrupter {
        Interrupter {
            tx: self.core().tx.clone(),
            waiting: Arc::clone(&self.core().waiting),
        }
    }

    /// Prepares a FINAL operation for a new interaction under a fresh
    /// transaction id.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::InvalidState` unless FINAL.
    fn reset(&mut self) -> EngineResult<()> {
        self.core_mut().reset()
    }

    /// Releases the transaction id. Idempotent.
    fn close(&mut self) {
        self.core_mut().close();
    }
}

macro_rules! consumer_operation {
    ($name:ident) => {
        impl Operation for $name {
            fn core(&self) -> &OperationCore {
                &self.core
            }

            fn core_mut(&mut self) -> &mut OperationCore {
                &mut self.core
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("uri_to", &self.core.uri_to)
                    .field("key", &self.core.key)
                    .field("tid", &self.core.tid)
                    .field("status", &self.core.status)
                    .finish_non_exhaustive()
            }
        }
    };
}

// ---------------------------------------------------------------------------
// SEND, SUBMIT, REQUEST
// ---------------------------------------------------------------------------

/// Fire and forget.
pub struct SendOperation {
    core: OperationCore,
}
consumer_operation!(SendOperation);

impl SendOperation {
    /// # Errors
    ///
    /// Fails if the transaction id cannot be registered.
    pub fn new(ctx: &ClientContext, uri_to: Uri, key: OperationKey) -> EngineResult<Self> {
        Ok(Self {
            core: OperationCore::new(ctx, uri_to, key)?,
        })
    }

    /// Transmits `body`; the operation is FINAL afterwards.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::InvalidState` unless CREATED, or the transport error.
    pub async fn send(&mut self, body: Body) -> EngineResult<()> {
        self.core.expect("send", &[OperationStatus::Created])?;
        self.core
            .transmit(Interaction::Send, body, OperationStatus::Initiated)
            .await?;
        self.core.finish();
        Ok(())
    }
}

pub struct SubmitOperation {
    core: OperationCore,
}
consumer_operation!(SubmitOperation);

impl SubmitOperation {
    /// # Errors
    ///
    /// Fails if the transaction id cannot be registered.
    pub fn new(ctx: &ClientContext, uri_to: Uri, key: OperationKey) -> EngineResult<Self> {
        Ok(Self {
            core: OperationCore::new(ctx, uri_to, key)?,
        })
    }

    /// Submits `body` and waits for the acknowledgement.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Protocol` when the provider acknowledges with an
    /// error, `EngineError::Interrupted` or `EngineError::Shutdown` when the
    /// wait is cut short.
    pub async fn submit(&mut self, body: Body) -> EngineResult<()> {
        self.core.expect("submit", &[OperationStatus::Created])?;
        self.core
            .transmit(
                Interaction::Submit(SubmitStage::Submit),
                body,
                OperationStatus::Initiated,
            )
            .await?;
        self.core
            .await_stage(Interaction::Submit(SubmitStage::Ack))
            .await?;
        self.core.finish();
        Ok(())
    }
}

pub struct RequestOperation {
    core: OperationCore,
}
consumer_operation!(RequestOperation);

impl RequestOperation {
    /// # Errors
    ///
    /// Fails if the transaction id cannot be registered.
    pub fn new(ctx: &ClientContext, uri_to: Uri, key: OperationKey) -> EngineResult<Self> {
        Ok(Self {
            core: OperationCore::new(ctx, uri_to, key)?,
        })
    }

    /// Sends `body` and returns the response body, positioned for reading.
    ///
    /// # Errors
    ///
    /// As [`SubmitOperation::submit`].
    pub async fn request(&mut self, body: Body) -> EngineResult<Body> {
        self.core.expect("request", &[OperationStatus::Created])?;
        self.core
            .transmit(
                Interaction::Request(RequestStage::Request),
                body,
                OperationStatus::Initiated,
            )
            .await?;
        let response = self
            .core
            .await_stage(Interaction::Request(RequestStage::Response))
            .await?;
        self.core.finish();
        Ok(readable(response.body))
    }
}

// ---------------------------------------------------------------------------
// INVOKE, PROGRESS
// ---------------------------------------------------------------------------

pub struct InvokeOperation {
    core: OperationCore,
}
consumer_operation!(InvokeOperation);

impl InvokeOperation {
    /// # Errors
    ///
    /// Fails if the transaction id cannot be registered.
    pub fn new(ctx: &ClientContext, uri_to: Uri, key: OperationKey) -> EngineResult<Self> {
        Ok(Self {
            core: OperationCore::new(ctx, uri_to, key)?,
        })
    }

    /// Sends `body` and returns the acknowledgement body.
    ///
    /// An error acknowledgement ends the operation; [`Self::get_response`]
    /// then returns the same error.
    ///
    /// # Errors
    ///
    /// As [`SubmitOperation::submit`].
    pub async fn invoke(&mut self, body: Body) -> EngineResult<Body> {
        self.core.expect("invoke", &[OperationStatus::Created])?;
        self.core
            .transmit(
                Interaction::Invoke(InvokeStage::Invoke),
                body,
                OperationStatus::Initiated,
            )
            .await?;
        let ack = self
            .core
            .await_stage(Interaction::Invoke(InvokeStage::Ack))
            .await?;
        self.core.status = OperationStatus::Acknowledged;
        Ok(readable(ack.body))
    }

    /// Waits for the response body.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Protocol` for an error response (or an earlier
    /// error acknowledgement), `EngineError::InvalidState` before
    /// [`Self::invoke`] completed.
    pub async fn get_response(&mut self) -> EngineResult<Body> {
        self.core
            .expect("get_response", &[OperationStatus::Acknowledged])?;
        let response = self
            .core
            .await_stage(Interaction::Invoke(InvokeStage::Response))
            .await?;
        self.core.finish();
        Ok(readable(response.body))
    }
}

pub struct ProgressOperation {
    core: OperationCore,
    response: Option<Body>,
}
consumer_operation!(ProgressOperation);

impl ProgressOperation {
    /// # Errors
    ///
    /// Fails if the transaction id cannot be registered.
    pub fn new(ctx: &ClientContext, uri_to: Uri, key: OperationKey) -> EngineResult<Self> {
        Ok(Self {
            core: OperationCore::new(ctx, uri_to, key)?,
            response: None,
        })
    }

    /// Sends `body` and returns the acknowledgement body.
    ///
    /// # Errors
    ///
    /// As [`SubmitOperation::submit`].
    pub async fn progress(&mut self, body: Body) -> EngineResult<Body> {
        self.core.expect("progress", &[OperationStatus::Created])?;
        self.response = None;
        self.core
            .transmit(
                Interaction::Progress(ProgressStage::Progress),
                body,
                OperationStatus::Initiated,
            )
            .await?;
        let ack = self
            .core
            .await_stage(Interaction::Progress(ProgressStage::Ack))
            .await?;
        self.core.status = OperationStatus::Acknowledged;
        Ok(readable(ack.body))
    }

    /// Returns the next update body, or `None` once the response has
    /// arrived. The response is kept for [`Self::get_response`].
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Protocol` for an error update or response.
    pub async fn get_update(&mut self) -> EngineResult<Option<Body>> {
        if self.response.is_some() {
            return Ok(None);
        }
        self.core.expect(
            "get_update",
            &[OperationStatus::Acknowledged, OperationStatus::Progressing],
        )?;
        let message = self.core.receive().await?;
        if message.is_error_message {
            return Err(self.core.fail(message));
        }
        match message.interaction {
            Interaction::Progress(ProgressStage::Update) => {
                self.core.status = OperationStatus::Progressing;
                Ok(Some(readable(message.body)))
            }
            Interaction::Progress(ProgressStage::Response) => {
                self.response = Some(readable(message.body));
                self.core.finish();
                Ok(None)
            }
            _ => Err(self.core.unexpected("PROGRESS/Update or PROGRESS/Response".to_string(), message)),
        }
    }

    /// Returns the response body. Updates still pending are discarded.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Protocol` for an error update or response.
    pub async fn get_response(&mut self) -> EngineResult<Body> {
        if let Some(response) = self.response.take() {
            return Ok(response);
        }
        self.core.expect(
            "get_response",
            &[OperationStatus::Acknowledged, OperationStatus::Progressing],
        )?;
        loop {
            let message = self.core.receive().await?;
            if message.is_error_message {
                return Err(self.core.fail(message));
            }
            match message.interaction {
                Interaction::Progress(ProgressStage::Update) => {
                    debug!(tid = self.core.tid, "discarding update while waiting for response");
                    self.core.status = OperationStatus::Progressing;
                }
                Interaction::Progress(ProgressStage::Response) => {
                    self.core.finish();
                    return Ok(readable(message.body));
                }
                _ => return Err(self.core.unexpected("PROGRESS/Response".to_string(), message)),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// PUBSUB
// ---------------------------------------------------------------------------

/// One NOTIFY delivered to a subscriber.
#[derive(Debug, Clone)]
pub struct Notification {
    pub subscription_id: Identifier,
    pub headers: Vec<UpdateHeader>,
    /// The remaining value lists, positioned after the headers.
    pub body: Body,
}

impl Notification {
    fn decode(body: Body) -> EngineResult<Self> {
        let mut body = readable(body);
        let subscription_id = body.decode_required()?;
        let headers = body.decode_parameter()?.unwrap_or_default();
        Ok(Self {
            subscription_id,
            headers,
            body,
        })
    }

    /// Decodes the next value list as `T` elements.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Body` when the list holds another type.
    pub fn next_values<T: Element>(&mut self) -> EngineResult<Vec<T>> {
        Ok(self.body.decode_last_parameter::<Vec<T>>(true)?.unwrap_or_default())
    }

    /// Decodes the next value list without resolving its element type.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Body` when the parameter is not an abstract element.
    pub fn next_abstract(&mut self) -> EngineResult<Option<AbstractElement>> {
        Ok(self.body.decode_abstract()?)
    }
}

pub struct SubscriberOperation {
    core: OperationCore,
}
consumer_operation!(SubscriberOperation);

impl SubscriberOperation {
    /// `uri_to` is the broker URI.
    ///
    /// # Errors
    ///
    /// Fails if the transaction id cannot be registered.
    pub fn new(ctx: &ClientContext, uri_to: Uri, key: OperationKey) -> EngineResult<Self> {
        Ok(Self {
            core: OperationCore::new(ctx, uri_to, key)?,
        })
    }

    /// Registers (or, when already REGISTERED, re-registers) with a raw
    /// subscription body and waits for the acknowledgement.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Protocol` when the broker rejects the registration.
    pub async fn register(&mut self, body: Body) -> EngineResult<()> {
        self.core.expect(
            "register",
            &[OperationStatus::Created, OperationStatus::Registered],
        )?;
        let reregister = self.core.status == OperationStatus::Registered;
        let pending = if reregister {
            OperationStatus::ReregisterInitiated
        } else {
            OperationStatus::RegisterInitiated
        };
        self.core
            .transmit(Interaction::PubSub(PubSubStage::Register), body, pending)
            .await?;
        loop {
            let message = self.core.receive().await?;
            if message.is_error_message {
                return Err(self.core.fail(message));
            }
            match message.interaction {
                Interaction::PubSub(PubSubStage::RegisterAck) => {
                    self.core.status = OperationStatus::Registered;
                    return Ok(());
                }
                Interaction::PubSub(PubSubStage::Notify) if reregister => {
                    debug!(tid = self.core.tid, "dropping notify received during re-registration");
                }
                _ => return Err(self.core.unexpected("PUBSUB/RegisterAck".to_string(), message)),
            }
        }
    }

    /// Registers `subscription`.
    ///
    /// # Errors
    ///
    /// As [`Self::register`].
    pub async fn register_subscription(&mut self, subscription: &Subscription) -> EngineResult<()> {
        let body = Body::single(subscription)?;
        self.register(body).await
    }

    /// Waits for the next notification.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Protocol` when the broker ends the subscription
    /// with an error, `EngineError::Interrupted` when interrupted.
    pub async fn get_notify(&mut self) -> EngineResult<Notification> {
        self.core.expect("get_notify", &[OperationStatus::Registered])?;
        let message = self
            .core
            .await_stage(Interaction::PubSub(PubSubStage::Notify))
            .await?;
        Notification::decode(message.body)
    }

    /// Deregisters with a raw identifier-list body. Notifications still in
    /// flight are dropped.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Protocol` when the broker rejects the request.
    pub async fn deregister(&mut self, body: Body) -> EngineResult<()> {
        self.core
            .expect("deregister", &[OperationStatus::Registered])?;
        self.core
            .transmit(
                Interaction::PubSub(PubSubStage::Deregister),
                body,
                OperationStatus::DeregisterInitiated,
            )
            .await?;
        loop {
            let message = self.core.receive().await?;
            if message.interaction == Interaction::PubSub(PubSubStage::Notify) && !message.is_error_message {
                debug!(tid = self.core.tid, "dropping notify received during deregistration");
                continue;
            }
            if message.is_error_message {
                return Err(self.core.fail(message));
            }
            if message.interaction == Interaction::PubSub(PubSubStage::DeregisterAck) {
                self.core.finish();
                return Ok(());
            }
            return Err(self.core.unexpected("PUBSUB/DeregisterAck".to_string(), message));
        }
    }

    /// Deregisters the given subscription ids.
    ///
    /// # Errors
    ///
    /// As [`Self::deregister`].
    pub async fn deregister_ids(&mut self, subscription_ids: &[Identifier]) -> EngineResult<()> {
        let body = Body::single(subscription_ids)?;
        self.deregister(body).await
    }
}

/// Publisher side of PUBSUB.
///
/// Publishes are fire and forget. A PUBLISH_ERROR sent by the broker is kept
/// until read with [`Self::publish_error`] or [`Self::take_publish_errors`].
pub struct PublisherOperation {
    core: OperationCore,
    publish_errors: VecDeque<MalError>,
}
consumer_operation!(PublisherOperation);

impl PublisherOperation {
    /// `uri_to` is the broker URI.
    ///
    /// # Errors
    ///
    /// Fails if the transaction id cannot be registered.
    pub fn new(ctx: &ClientContext, uri_to: Uri, key: OperationKey) -> EngineResult<Self> {
        Ok(Self {
            core: OperationCore::new(ctx, uri_to, key)?,
            publish_errors: VecDeque::new(),
        })
    }

    fn is_publish_error(message: &Message) -> bool {
        message.is_error_message && message.interaction == Interaction::PubSub(PubSubStage::Publish)
    }

    fn keep_publish_error(&mut self, mut message: Message) {
        let error = MalError::from_body(&mut message.body).unwrap_or_else(MalError::from);
        debug!(tid = self.core.tid, %error, "publish error received");
        self.publish_errors.push_back(error);
    }

    /// Declares the keys this publisher will publish (raw body) and waits
    /// for the acknowledgement.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Protocol` when the broker rejects the registration.
    pub async fn register(&mut self, body: Body) -> EngineResult<()> {
        self.core.expect(
            "register",
            &[OperationStatus::Created, OperationStatus::Registered],
        )?;
        let pending = if self.core.status == OperationStatus::Registered {
            OperationStatus::ReregisterInitiated
        } else {
            OperationStatus::RegisterInitiated
        };
        self.core
            .transmit(Interaction::PubSub(PubSubStage::PublishRegister), body, pending)
            .await?;
        loop {
            let message = self.core.receive().await?;
            if Self::is_publish_error(&message) {
                self.keep_publish_error(message);
                continue;
            }
            if message.is_error_message {
                return Err(self.core.fail(message));
            }
            if message.interaction == Interaction::PubSub(PubSubStage::PublishRegisterAck) {
                self.core.status = OperationStatus::Registered;
                return Ok(());
            }
            return Err(self.core.unexpected("PUBSUB/PublishRegisterAck".to_string(), message));
        }
    }

    /// Declares `keys`.
    ///
    /// # Errors
    ///
    /// As [`Self::register`].
    pub async fn register_keys(&mut self, keys: &[EntityKey]) -> EngineResult<()> {
        let body = Body::single(keys)?;
        self.register(body).await
    }

    /// Publishes a raw body: `(UpdateHeaderList, value lists...)`.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::InvalidState` unless REGISTERED, or the
    /// transport error.
    pub async fn publish(&mut self, body: Body) -> EngineResult<()> {
        self.core.expect("publish", &[OperationStatus::Registered])?;
        self.core
            .transmit(
                Interaction::PubSub(PubSubStage::Publish),
                body,
                OperationStatus::Registered,
            )
            .await
    }

    /// Publishes `headers` with one value list of `T`.
    ///
    /// # Errors
    ///
    /// As [`Self::publish`], plus `EngineError::Body` if encoding fails.
    pub async fn publish_list<T: Element>(&mut self, headers: &[UpdateHeader], values: Vec<T>) -> EngineResult<()> {
        let mut body = Body::new();
        body.encode_parameter(headers)?;
        body.encode_last_parameter(Some(&values), true)?;
        self.publish(body).await
    }

    /// Returns the oldest publish error, waiting for one if none is queued.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Interrupted` or `EngineError::Shutdown` when the
    /// wait is cut short.
    pub async fn publish_error(&mut self) -> EngineResult<MalError> {
        if let Some(error) = self.publish_errors.pop_front() {
            return Ok(error);
        }
        self.core.expect("publish_error", &[OperationStatus::Registered])?;
        loop {
            let message = self.core.receive().await?;
            if Self::is_publish_error(&message) {
                self.keep_publish_error(message);
                if let Some(error) = self.publish_errors.pop_front() {
                    return Ok(error);
                }
            } else {
                debug!(tid = self.core.tid, interaction = %message.interaction, "ignoring message while waiting for publish error");
            }
        }
    }

    /// Drains the publish errors received so far without waiting.
    pub fn take_publish_errors(&mut self) -> Vec<MalError> {
        while let Ok(delivery) = self.core.rx.try_recv() {
            match delivery {
                Delivery::Message(message) if Self::is_publish_error(&message) => {
                    self.keep_publish_error(message);
                }
                Delivery::Message(message) => {
                    debug!(tid = self.core.tid, interaction = %message.interaction, "ignoring unexpected message");
                }
                Delivery::Interrupt(_) => {}
                Delivery::Shutdown => {
                    self.core.shut_down();
                    break;
                }
            }
        }
        self.publish_errors.drain(..).collect()
    }

    /// Withdraws the registration. Publish errors still in flight are kept.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Protocol` when the broker rejects the request.
    pub async fn deregister(&mut self) -> EngineResult<()> {
        self.core
            .expect("deregister", &[OperationStatus::Registered])?;
        self.core
            .transmit(
                Interaction::PubSub(PubSubStage::PublishDeregister),
                Body::new(),
                OperationStatus::DeregisterInitiated,
            )
            .await?;
        loop {
            let message = self.core.receive().await?;
            if Self::is_publish_error(&message) {
                self.keep_publish_error(message);
                continue;
            }
            if message.is_error_message {
                return Err(self.core.fail(message));
            }
            if message.interaction == Interaction::PubSub(PubSubStage::PublishDeregisterAck) {
                self.core.finish();
                return Ok(());
            }
            return Err(self.core.unexpected("PUBSUB/PublishDeregisterAck".to_string(), message));
        }
    }
}
