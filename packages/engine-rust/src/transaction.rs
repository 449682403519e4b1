//! Provider-side transactions.
//!
//! A transaction is created by the engine for every initiating message that
//! reaches a registered handler. It remembers the initiating message's
//! routing metadata and exposes exactly the reply stages of its pattern:
//!
//! | pattern  | replies                              |
//! |----------|--------------------------------------|
//! | SEND     | none                                 |
//! | SUBMIT   | `ack`                                |
//! | REQUEST  | `reply`                              |
//! | INVOKE   | `ack`, then `reply`                  |
//! | PROGRESS | `ack`, `update`*, then `reply`       |
//!
//! Pub/sub transactions serve the broker. Every reply carries the
//! transaction id, operation identity and header of the initiating message,
//! with the addresses swapped. Sending an error on any stage ends the
//! transaction.

use std::fmt;
use std::sync::Arc;

use mal_core::{
    Body, Interaction, InteractionType, InvokeStage, MalError, Message, MessageHeader,
    OperationKey, ProgressStage, PubSubStage, RequestStage, SubmitStage, Uri,
};
use parking_lot::Mutex;

use crate::client_context::ClientContext;
use crate::error::{EngineError, EngineResult};

/// Provider transaction state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// The initiating message arrived; nothing sent back yet.
    Received,
    /// Acknowledged, or a registration accepted by the broker.
    Acknowledged,
    /// At least one PROGRESS update sent.
    Progressing,
    /// The last reply, or an error, has been sent.
    Final,
    /// Abandoned by the provider.
    Closed,
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Received => "RECEIVED",
            Self::Acknowledged => "ACKNOWLEDGED",
            Self::Progressing => "PROGRESSING",
            Self::Final => "FINAL",
            Self::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// Shared core
// ---------------------------------------------------------------------------

pub(crate) struct TransactionCore {
    ctx: ClientContext,
    /// The initiating message, without its body.
    origin: Message,
    status: Mutex<TransactionStatus>,
}

impl TransactionCore {
    fn new(ctx: ClientContext, message: &Message) -> Self {
        let origin = Message {
            uri_from: message.uri_from.clone(),
            uri_to: message.uri_to.clone(),
            timestamp: message.timestamp,
            header: message.header.clone(),
            interaction: message.interaction,
            operation: message.operation,
            transaction_id: message.transaction_id,
            is_error_message: false,
            body: Body::new(),
        };
        Self {
            ctx,
            origin,
            status: Mutex::new(TransactionStatus::Received),
        }
    }

    fn status(&self) -> TransactionStatus {
        *self.status.lock()
    }

    fn close(&self) {
        *self.status.lock() = TransactionStatus::Closed;
    }

    fn require_origin(&self, operation: &'static str, stage: PubSubStage) -> EngineResult<()> {
        if self.origin.interaction == Interaction::PubSub(stage) {
            Ok(())
        } else {
            Err(EngineError::InvalidState {
                operation,
                status: format!("transaction opened by {}", self.origin.interaction),
            })
        }
    }

    /// Moves from one of `allowed` to `next` (FINAL for errors), then sends.
    /// A failed send leaves the status where it was.
    async fn reply(
        &self,
        operation: &'static str,
        allowed: &[TransactionStatus],
        stage: Interaction,
        next: TransactionStatus,
        body: Body,
        is_error: bool,
    ) -> EngineResult<()> {
        let next = if is_error { TransactionStatus::Final } else { next };
        let previous = {
            let mut status = self.status.lock();
            if !allowed.contains(&*status) {
                return Err(EngineError::InvalidState {
                    operation,
                    status: status.to_string(),
                });
            }
            std::mem::replace(&mut *status, next)
        };
        let result = self.transmit(stage, body, is_error).await;
        if result.is_err() {
            self.restore(previous, next);
        }
        result
    }

    /// Undoes a move to `moved_to` unless the status changed since.
    fn restore(&self, previous: TransactionStatus, moved_to: TransactionStatus) {
        let mut status = self.status.lock();
        if *status == moved_to {
            *status = previous;
        }
    }

    async fn transmit(&self, stage: Interaction, body: Body, is_error: bool) -> EngineResult<()> {
        self.ctx.transmit(self.origin.reply(stage, body, is_error)).await
    }

    /// The stage an error would be reported on, given the current status.
    fn error_slot(&self, status: TransactionStatus) -> Option<Interaction> {
        use TransactionStatus::{Acknowledged, Closed, Final, Progressing, Received};
        match (self.origin.interaction, status) {
            (_, Final | Closed) => None,
            (origin, Received) => origin.first_reply(),
            (Interaction::Invoke(_), Acknowledged) => Some(Interaction::Invoke(InvokeStage::Response)),
            (Interaction::Progress(_), Acknowledged | Progressing) => {
                Some(Interaction::Progress(ProgressStage::Response))
            }
            (Interaction::PubSub(PubSubStage::Register), Acknowledged) => {
                Some(Interaction::PubSub(PubSubStage::Notify))
            }
            (Interaction::PubSub(PubSubStage::PublishRegister), Acknowledged) => {
                Some(Interaction::PubSub(PubSubStage::Publish))
            }
            _ => None,
        }
    }

    fn is_open(&self) -> bool {
        self.error_slot(self.status()).is_some()
    }

    /// Sends `error` on the open reply slot.
    async fn send_error(&self, error: &MalError) -> EngineResult<()> {
        let (stage, previous, moved_to) = {
            let mut status = self.status.lock();
            let stage = self
                .error_slot(*status)
                .ok_or_else(|| EngineError::InvalidState {
                    operation: "return an error",
                    status: status.to_string(),
                })?;
            // A PUBLISH_ERROR does not end the publisher registration.
            let keeps_registration = stage == Interaction::PubSub(PubSubStage::Publish)
                && self.origin.interaction == Interaction::PubSub(PubSubStage::PublishRegister);
            let previous = *status;
            if !keeps_registration {
                *status = TransactionStatus::Final;
            }
            (stage, previous, *status)
        };
        let result = self.transmit(stage, error.to_body(), true).await;
        if result.is_err() {
            self.restore(previous, moved_to);
        }
        result
    }

    async fn return_error(&self, error: anyhow::Error) -> EngineResult<()> {
        self.send_error(&into_mal_error(error)).await
    }
}

/// Structured errors pass through; anything else becomes UNKNOWN.
pub(crate) fn into_mal_error(error: anyhow::Error) -> MalError {
    match error.downcast::<MalError>() {
        Ok(mal) => mal,
        Err(other) => match other.downcast::<EngineError>() {
            Ok(EngineError::Protocol(mal)) => mal,
            Ok(engine) => MalError::unknown(engine.to_string()),
            Err(other) => MalError::unknown(format!("{other:#}")),
        },
    }
}

macro_rules! transaction_handle {
    ($name:ident) => {
        impl $name {
            /// Transaction id shared by every message of this interaction.
            #[must_use]
            pub fn transaction_id(&self) -> u64 {
                self.core.origin.transaction_id
            }

            #[must_use]
            pub fn status(&self) -> TransactionStatus {
                self.core.status()
            }

            /// URI of the initiator.
            #[must_use]
            pub fn initiator(&self) -> &Uri {
                &self.core.origin.uri_from
            }

            /// Header of the initiating message.
            #[must_use]
            pub fn header(&self) -> &MessageHeader {
                &self.core.origin.header
            }

            #[must_use]
            pub fn operation(&self) -> OperationKey {
                self.core.origin.operation
            }

            /// Reports `error` on the reply slot that is still open.
            ///
            /// # Errors
            ///
            /// Returns `EngineError::InvalidState` when no reply slot is open.
            pub async fn return_error(&self, error: impl Into<anyhow::Error>) -> EngineResult<()> {
                self.core.return_error(error.into()).await
            }

            /// Abandons the transaction. Idempotent.
            pub fn close(&self) {
                self.core.close();
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("transaction_id", &self.transaction_id())
                    .field("status", &self.status())
                    .finish()
            }
        }
    };
}

// ---------------------------------------------------------------------------
// Pattern handles
// ---------------------------------------------------------------------------

/// SEND has no reply.
#[derive(Clone)]
pub struct SendTransaction {
    core: Arc<TransactionCore>,
}
transaction_handle!(SendTransaction);

#[derive(Clone)]
pub struct SubmitTransaction {
    core: Arc<TransactionCore>,
}
transaction_handle!(SubmitTransaction);

impl SubmitTransaction {
    /// # Errors
    ///
    /// Returns `EngineError::InvalidState` unless RECEIVED.
    pub async fn ack(&self, body: Body, is_error: bool) -> EngineResult<()> {
        self.core
            .reply(
                "ack",
                &[TransactionStatus::Received],
                Interaction::Submit(SubmitStage::Ack),
                TransactionStatus::Final,
                body,
                is_error,
            )
            .await
    }
}

#[derive(Clone)]
pub struct RequestTransaction {
    core: Arc<TransactionCore>,
}
transaction_handle!(RequestTransaction);

impl RequestTransaction {
    /// # Errors
    ///
    /// Returns `EngineError::InvalidState` unless RECEIVED.
    pub async fn reply(&self, body: Body, is_error: bool) -> EngineResult<()> {
        self.core
            .reply(
                "reply",
                &[TransactionStatus::Received],
                Interaction::Request(RequestStage::Response),
                TransactionStatus::Final,
                body,
                is_error,
            )
            .await
    }
}

#[derive(Clone)]
pub struct InvokeTransaction {
    core: Arc<TransactionCore>,
}
transaction_handle!(InvokeTransaction);

impl InvokeTransaction {
    /// # Errors
    ///
    /// Returns `EngineError::InvalidState` unless RECEIVED.
    pub async fn ack(&self, body: Body, is_error: bool) -> EngineResult<()> {
        self.core
            .reply(
                "ack",
                &[TransactionStatus::Received],
                Interaction::Invoke(InvokeStage::Ack),
                TransactionStatus::Acknowledged,
                body,
                is_error,
            )
            .await
    }

    /// # Errors
    ///
    /// Returns `EngineError::InvalidState` unless ACKNOWLEDGED.
    pub async fn reply(&self, body: Body, is_error: bool) -> EngineResult<()> {
        self.core
            .reply(
                "reply",
                &[TransactionStatus::Acknowledged],
                Interaction::Invoke(InvokeStage::Response),
                TransactionStatus::Final,
                body,
                is_error,
            )
            .await
    }
}

#[derive(Clone)]
pub struct ProgressTransaction {
    core: Arc<TransactionCore>,
}
transaction_handle!(ProgressTransaction);

impl ProgressTransaction {
    /// # Errors
    ///
    /// Returns `EngineError::InvalidState` unless RECEIVED.
    pub async fn ack(&self, body: Body, is_error: bool) -> EngineResult<()> {
        self.core
            .reply(
                "ack",
                &[TransactionStatus::Received],
                Interaction::Progress(ProgressStage::Ack),
                TransactionStatus::Acknowledged,
                body,
                is_error,
            )
            .await
    }

    /// Sends one intermediate update. An error update ends the transaction.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::InvalidState` before the ack or after the reply.
    pub async fn update(&self, body: Body, is_error: bool) -> EngineResult<()> {
        self.core
            .reply(
                "update",
                &[TransactionStatus::Acknowledged, TransactionStatus::Progressing],
                Interaction::Progress(ProgressStage::Update),
                TransactionStatus::Progressing,
                body,
                is_error,
            )
            .await
    }

    /// # Errors
    ///
    /// Returns `EngineError::InvalidState` before the ack or after the reply.
    pub async fn reply(&self, body: Body, is_error: bool) -> EngineResult<()> {
        self.core
            .reply(
                "reply",
                &[TransactionStatus::Acknowledged, TransactionStatus::Progressing],
                Interaction::Progress(ProgressStage::Response),
                TransactionStatus::Final,
                body,
                is_error,
            )
            .await
    }
}

/// Broker side of a subscriber's REGISTER or DEREGISTER.
///
/// The REGISTER transaction stays ACKNOWLEDGED for as long as the
/// subscription lives; every NOTIFY is sent through it.
#[derive(Clone)]
pub struct SubscriberTransaction {
    core: Arc<TransactionCore>,
}
transaction_handle!(SubscriberTransaction);

impl SubscriberTransaction {
    /// # Errors
    ///
    /// Returns `EngineError::InvalidState` unless this is a RECEIVED register.
    pub async fn ack_register(&self, body: Body, is_error: bool) -> EngineResult<()> {
        self.core.require_origin("ack_register", PubSubStage::Register)?;
        self.core
            .reply(
                "ack_register",
                &[TransactionStatus::Received],
                Interaction::PubSub(PubSubStage::RegisterAck),
                TransactionStatus::Acknowledged,
                body,
                is_error,
            )
            .await
    }

    /// # Errors
    ///
    /// Returns `EngineError::InvalidState` unless the registration was acknowledged.
    pub async fn notify(&self, body: Body, is_error: bool) -> EngineResult<()> {
        self.core.require_origin("notify", PubSubStage::Register)?;
        self.core
            .reply(
                "notify",
                &[TransactionStatus::Acknowledged],
                Interaction::PubSub(PubSubStage::Notify),
                TransactionStatus::Acknowledged,
                body,
                is_error,
            )
            .await
    }

    /// # Errors
    ///
    /// Returns `EngineError::InvalidState` unless this is a RECEIVED deregister.
    pub async fn ack_deregister(&self, body: Body, is_error: bool) -> EngineResult<()> {
        self.core.require_origin("ack_deregister", PubSubStage::Deregister)?;
        self.core
            .reply(
                "ack_deregister",
                &[TransactionStatus::Received],
                Interaction::PubSub(PubSubStage::DeregisterAck),
                TransactionStatus::Final,
                body,
                is_error,
            )
            .await
    }
}

/// Broker side of a publisher's PUBLISH_REGISTER, PUBLISH or PUBLISH_DEREGISTER.
#[derive(Clone)]
pub struct PublisherTransaction {
    core: Arc<TransactionCore>,
}
transaction_handle!(PublisherTransaction);

impl PublisherTransaction {
    /// # Errors
    ///
    /// Returns `EngineError::InvalidState` unless this is a RECEIVED publish register.
    pub async fn ack_register(&self, body: Body, is_error: bool) -> EngineResult<()> {
        self.core
            .require_origin("ack_register", PubSubStage::PublishRegister)?;
        self.core
            .reply(
                "ack_register",
                &[TransactionStatus::Received],
                Interaction::PubSub(PubSubStage::PublishRegisterAck),
                TransactionStatus::Acknowledged,
                body,
                is_error,
            )
            .await
    }

    /// Sends a PUBLISH_ERROR to the publisher. On the registration
    /// transaction this may happen any number of times.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::InvalidState` when the transaction cannot carry
    /// a publish error.
    pub async fn publish_error(&self, error: &MalError) -> EngineResult<()> {
        match self.core.origin.interaction {
            Interaction::PubSub(PubSubStage::PublishRegister | PubSubStage::Publish) => {
                self.core.send_error(error).await
            }
            other => Err(EngineError::InvalidState {
                operation: "publish_error",
                status: format!("transaction opened by {other}"),
            }),
        }
    }

    /// # Errors
    ///
    /// Returns `EngineError::InvalidState` unless this is a RECEIVED publish deregister.
    pub async fn ack_deregister(&self, body: Body, is_error: bool) -> EngineResult<()> {
        self.core
            .require_origin("ack_deregister", PubSubStage::PublishDeregister)?;
        self.core
            .reply(
                "ack_deregister",
                &[TransactionStatus::Received],
                Interaction::PubSub(PubSubStage::PublishDeregisterAck),
                TransactionStatus::Final,
                body,
                is_error,
            )
            .await
    }
}

// ---------------------------------------------------------------------------
// Transaction
// ---------------------------------------------------------------------------

/// The transaction handed to a [`Handler`](crate::Handler), one variant per pattern.
#[derive(Debug, Clone)]
pub enum Transaction {
    Send(SendTransaction),
    Submit(SubmitTransaction),
    Request(RequestTransaction),
    Invoke(InvokeTransaction),
    Progress(ProgressTransaction),
    Subscriber(SubscriberTransaction),
    Publisher(PublisherTransaction),
}

impl Transaction {
    pub(crate) fn from_message(ctx: ClientContext, message: &Message) -> Self {
        let core = Arc::new(TransactionCore::new(ctx, message));
        match message.interaction {
            Interaction::Send => Self::Send(SendTransaction { core }),
            Interaction::Submit(_) => Self::Submit(SubmitTransaction { core }),
            Interaction::Request(_) => Self::Request(RequestTransaction { core }),
            Interaction::Invoke(_) => Self::Invoke(InvokeTransaction { core }),
            Interaction::Progress(_) => Self::Progress(ProgressTransaction { core }),
            Interaction::PubSub(PubSubStage::Register | PubSubStage::Deregister) => {
                Self::Subscriber(SubscriberTransaction { core })
            }
            Interaction::PubSub(_) => Self::Publisher(PublisherTransaction { core }),
        }
    }

    fn core(&self) -> &Arc<TransactionCore> {
        match self {
            Self::Send(t) => &t.core,
            Self::Submit(t) => &t.core,
            Self::Request(t) => &t.core,
            Self::Invoke(t) => &t.core,
            Self::Progress(t) => &t.core,
            Self::Subscriber(t) => &t.core,
            Self::Publisher(t) => &t.core,
        }
    }

    #[must_use]
    pub fn interaction_type(&self) -> InteractionType {
        self.core().origin.interaction_type()
    }

    #[must_use]
    pub fn transaction_id(&self) -> u64 {
        self.core().origin.transaction_id
    }

    #[must_use]
    pub fn status(&self) -> TransactionStatus {
        self.core().status()
    }

    /// True while some reply slot can still carry an error.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.core().is_open()
    }

    /// Reports `error` on the reply slot that is still open.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::InvalidState` when no reply slot is open.
    pub async fn return_error(&self, error: impl Into<anyhow::Error>) -> EngineResult<()> {
        self.core().return_error(error.into()).await
    }

    pub fn close(&self) {
        self.core().close();
    }

    #[must_use]
    pub fn into_send(self) -> Option<SendTransaction> {
        match self {
            Self::Send(t) => Some(t),
            _ => None,
        }
    }

    #[must_use]
    pub fn into_submit(self) -> Option<SubmitTransaction> {
        match self {
            Self::Submit(t) => Some(t),
            _ => None,
        }
    }

    #[must_use]
    pub fn into_request(self) -> Option<RequestTransaction> {
        match self {
            Self::Request(t) => Some(t),
            _ => None,
        }
    }

    #[must_use]
    pub fn into_invoke(self) -> Option<InvokeTransaction> {
        match self {
            Self::Invoke(t) => Some(t),
            _ => None,
        }
    }

    #[must_use]
    pub fn into_progress(self) -> Option<ProgressTransaction> {
        match self {
            Self::Progress(t) => Some(t),
            _ => None,
        }
    }

    #[must_use]
    pub fn into_subscriber(self) -> Option<SubscriberTransaction> {
        match self {
            Self::Subscriber(t) => Some(t),
            _ => None,
        }
    }

    #[must_use]
    pub fn into_publisher(self) -> Option<PublisherTransaction> {
        match self {
            Self::Publisher(t) => Some(t),
            _ => None,
        }
    }
}
