//! The MAL message envelope.
//!
//! A [`Message`] carries routing metadata ([`MessageHeader`]), the operation
//! identity ([`OperationKey`]), the interaction pattern and stage
//! ([`Interaction`]), the transaction id and the parameter [`Body`].
//!
//! Interaction type and stage are modelled as one enum: a stage only exists
//! inside the pattern it belongs to, so a PROGRESS_UPDATE can never be
//! attached to a SUBMIT message.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::body::Body;
use crate::error::MalError;
use crate::types::{Blob, Identifier, Uri};

// ---------------------------------------------------------------------------
// Operation identity
// ---------------------------------------------------------------------------

/// The `(area, area_version, service, operation)` identity of an operation.
///
/// Identifies *what* is called, as opposed to the transaction id which
/// identifies *which call*.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OperationKey {
    pub area: u16,
    pub area_version: u8,
    pub service: u16,
    pub operation: u16,
}

impl OperationKey {
    #[must_use]
    pub const fn new(area: u16, area_version: u8, service: u16, operation: u16) -> Self {
        Self {
            area,
            area_version,
            service,
            operation,
        }
    }

    /// Packs the identity into a single integer, 16 bits per component.
    #[must_use]
    pub const fn packed(&self) -> u64 {
        ((self.area as u64) << 48)
            | ((self.area_version as u64) << 32)
            | ((self.service as u64) << 16)
            | (self.operation as u64)
    }
}

impl fmt::Display for OperationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.area, self.area_version, self.service, self.operation
        )
    }
}

// ---------------------------------------------------------------------------
// Interaction patterns and stages
// ---------------------------------------------------------------------------

/// The six MAL interaction patterns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InteractionType {
    /// One message, no reply.
    Send,
    /// Acknowledged with no response data.
    Submit,
    /// One request, one response.
    Request,
    /// Acknowledged, then answered.
    Invoke,
    /// Acknowledged, then any number of updates and a response.
    Progress,
    /// Publish-subscribe through a broker.
    PubSub,
}

impl fmt::Display for InteractionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Send => "SEND",
            Self::Submit => "SUBMIT",
            Self::Request => "REQUEST",
            Self::Invoke => "INVOKE",
            Self::Progress => "PROGRESS",
            Self::PubSub => "PUBSUB",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubmitStage {
    /// Consumer to provider.
    Submit,
    /// Provider to consumer; ends the interaction.
    Ack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestStage {
    /// Consumer to provider.
    Request,
    /// Provider to consumer; ends the interaction.
    Response,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InvokeStage {
    /// Consumer to provider.
    Invoke,
    /// The provider accepted the invocation.
    Ack,
    /// Provider to consumer; ends the interaction.
    Response,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProgressStage {
    /// Consumer to provider.
    Progress,
    /// The provider accepted the request.
    Ack,
    /// One intermediate result. An error update ends the interaction.
    Update,
    /// Provider to consumer; ends the interaction.
    Response,
}

/// Publish-subscribe stages. A `Publish` stage flagged as an error message
/// travels broker→publisher and is the PUBLISH_ERROR message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PubSubStage {
    /// Subscriber to broker: add or replace a subscription.
    Register,
    /// Broker to subscriber.
    RegisterAck,
    /// Publisher to broker: declare the entity keys it will publish.
    PublishRegister,
    /// Broker to publisher.
    PublishRegisterAck,
    /// Publisher to broker: one batch of updates.
    Publish,
    /// Broker to subscriber: the updates matching one subscription.
    Notify,
    /// Subscriber to broker: drop subscriptions by id.
    Deregister,
    /// Broker to subscriber.
    DeregisterAck,
    /// Publisher to broker: withdraw the registration.
    PublishDeregister,
    /// Broker to publisher.
    PublishDeregisterAck,
}

/// Interaction pattern together with the stage of this message within it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Interaction {
    #[default]
    Send,
    Submit(SubmitStage),
    Request(RequestStage),
    Invoke(InvokeStage),
    Progress(ProgressStage),
    PubSub(PubSubStage),
}

impl Interaction {
    #[must_use]
    pub fn interaction_type(&self) -> InteractionType {
        match self {
            Self::Send => InteractionType::Send,
            Self::Submit(_) => InteractionType::Submit,
            Self::Request(_) => InteractionType::Request,
            Self::Invoke(_) => InteractionType::Invoke,
            Self::Progress(_) => InteractionType::Progress,
            Self::PubSub(_) => InteractionType::PubSub,
        }
    }

    /// Stage number as defined by the MAL specification (SEND has stage 0).
    #[must_use]
    pub fn stage_number(&self) -> u8 {
        match self {
            Self::Send => 0,
            Self::Submit(SubmitStage::Submit)
            | Self::Request(RequestStage::Request)
            | Self::Invoke(InvokeStage::Invoke)
            | Self::Progress(ProgressStage::Progress)
            | Self::PubSub(PubSubStage::Register) => 1,
            Self::Submit(SubmitStage::Ack)
            | Self::Request(RequestStage::Response)
            | Self::Invoke(InvokeStage::Ack)
            | Self::Progress(ProgressStage::Ack)
            | Self::PubSub(PubSubStage::RegisterAck) => 2,
            Self::Invoke(InvokeStage::Response)
            | Self::Progress(ProgressStage::Update)
            | Self::PubSub(PubSubStage::PublishRegister) => 3,
            Self::Progress(ProgressStage::Response) | Self::PubSub(PubSubStage::PublishRegisterAck) => 4,
            Self::PubSub(PubSubStage::Publish) => 5,
            Self::PubSub(PubSubStage::Notify) => 6,
            Self::PubSub(PubSubStage::Deregister) => 7,
            Self::PubSub(PubSubStage::DeregisterAck) => 8,
            Self::PubSub(PubSubStage::PublishDeregister) => 9,
            Self::PubSub(PubSubStage::PublishDeregisterAck) => 10,
        }
    }

    /// True for stages sent by an initiator towards a provider (or broker),
    /// i.e. stages that start provider-side processing.
    #[must_use]
    pub fn is_initiation(&self) -> bool {
        matches!(
            self,
            Self::Send
                | Self::Submit(SubmitStage::Submit)
                | Self::Request(RequestStage::Request)
                | Self::Invoke(InvokeStage::Invoke)
                | Self::Progress(ProgressStage::Progress)
                | Self::PubSub(
                    PubSubStage::Register
                        | PubSubStage::PublishRegister
                        | PubSubStage::Publish
                        | PubSubStage::Deregister
                        | PubSubStage::PublishDeregister
                )
        )
    }

    /// The first reply stage of an initiation, i.e. the message slot that
    /// carries an error when the initiation is rejected outright. `None` for
    /// SEND, which has no reply, and for non-initiating stages.
    #[must_use]
    pub fn first_reply(&self) -> Option<Interaction> {
        let reply = match self {
            Self::Submit(SubmitStage::Submit) => Self::Submit(SubmitStage::Ack),
            Self::Request(RequestStage::Request) => Self::Request(RequestStage::Response),
            Self::Invoke(InvokeStage::Invoke) => Self::Invoke(InvokeStage::Ack),
            Self::Progress(ProgressStage::Progress) => Self::Progress(ProgressStage::Ack),
            Self::PubSub(PubSubStage::Register) => Self::PubSub(PubSubStage::RegisterAck),
            Self::PubSub(PubSubStage::PublishRegister) => Self::PubSub(PubSubStage::PublishRegisterAck),
            Self::PubSub(PubSubStage::Publish) => Self::PubSub(PubSubStage::Publish),
            Self::PubSub(PubSubStage::Deregister) => Self::PubSub(PubSubStage::DeregisterAck),
            Self::PubSub(PubSubStage::PublishDeregister) => {
                Self::PubSub(PubSubStage::PublishDeregisterAck)
            }
            _ => return None,
        };
        Some(reply)
    }
}

impl fmt::Display for Interaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Send => f.write_str("SEND"),
            Self::Submit(stage) => write!(f, "SUBMIT/{stage:?}"),
            Self::Request(stage) => write!(f, "REQUEST/{stage:?}"),
            Self::Invoke(stage) => write!(f, "INVOKE/{stage:?}"),
            Self::Progress(stage) => write!(f, "PROGRESS/{stage:?}"),
            Self::PubSub(stage) => write!(f, "PUBSUB/{stage:?}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

/// Quality of service requested for a message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QoSLevel {
    /// No delivery guarantee.
    #[default]
    BestEffort,
    /// Delivered in order, or the sender is told it was not.
    Assured,
    /// Held for a destination that is not reachable yet.
    Queued,
    /// Dropped once its time to live has passed.
    Timely,
}

/// Session a message belongs to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionType {
    /// Operational traffic.
    #[default]
    Live,
    Simulation,
    /// Playback of recorded traffic.
    Replay,
}

/// Routing metadata copied from an initiating message into every reply of
/// the same transaction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageHeader {
    pub authentication_id: Blob,
    pub encoding_id: u8,
    pub qos_level: QoSLevel,
    pub priority: u32,
    pub domain: Vec<Identifier>,
    pub network_zone: Identifier,
    pub session: SessionType,
    pub session_name: Identifier,
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A single MAL message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub uri_from: Uri,
    pub uri_to: Uri,
    pub timestamp: u64,
    pub header: MessageHeader,
    pub interaction: Interaction,
    pub operation: OperationKey,
    pub transaction_id: u64,
    pub is_error_message: bool,
    pub body: Body,
}

impl Message {
    #[must_use]
    pub fn interaction_type(&self) -> InteractionType {
        self.interaction.interaction_type()
    }

    /// True when this message starts provider-side processing. A PUBLISH
    /// flagged as error is a PUBLISH_ERROR travelling the other way.
    #[must_use]
    pub fn starts_interaction(&self) -> bool {
        self.interaction.is_initiation() && !self.is_error_message
    }

    /// Builds a reply of this message at `stage`: addresses swapped, header,
    /// operation identity and transaction id preserved.
    #[must_use]
    pub fn reply(&self, stage: Interaction, body: Body, is_error: bool) -> Message {
        Message {
            uri_from: self.uri_to.clone(),
            uri_to: self.uri_from.clone(),
            timestamp: self.timestamp,
            header: self.header.clone(),
            interaction: stage,
            operation: self.operation,
            transaction_id: self.transaction_id,
            is_error_message: is_error,
            body,
        }
    }

    /// Builds the error reply that rejects this initiation, or `None` when no
    /// reply slot exists (SEND, or a message that is itself a reply).
    #[must_use]
    pub fn error_reply(&self, error: &MalError) -> Option<Message> {
        if !self.starts_interaction() {
            return None;
        }
        let stage = self.interaction.first_reply()?;
        Some(self.reply(stage, error.to_body(), true))
    }
}
