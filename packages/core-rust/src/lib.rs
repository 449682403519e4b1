//! MAL core: message envelope, parameter bodies, protocol errors and
//! publish-subscribe data types for the CCSDS Message Abstraction Layer.

pub mod body;
pub mod error;
pub mod message;
pub mod pubsub;
pub mod types;

pub use body::{AbstractElement, Body, BodyError, Element};
pub use error::{codes, MalError};
pub use message::{
    Interaction, InteractionType, InvokeStage, Message, MessageHeader, OperationKey,
    ProgressStage, PubSubStage, QoSLevel, RequestStage, SessionType, SubmitStage,
};
pub use pubsub::{domain_matches, EntityKey, EntityRequest, Subscription, UpdateHeader, UpdateType};
pub use types::{domain, Blob, Identifier, Uri};
