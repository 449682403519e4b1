//! Error types for transports, registries and interaction state machines.

use mal_core::{BodyError, Interaction, MalError, OperationKey, Uri};

/// Errors raised by a transport or while resolving one.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("no transport registered for scheme `{scheme}`")]
    UnsupportedScheme { scheme: String },
    #[error("malformed URI: {uri}")]
    InvalidUri { uri: Uri },
    #[error("destination unknown: {uri}")]
    DestinationUnknown { uri: Uri },
    #[error("address already in use: {uri}")]
    AddressInUse { uri: Uri },
    #[error("connection to {authority} timed out")]
    ConnectTimeout { authority: String },
    #[error("transport closed")]
    Closed,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame codec error: {0}")]
    Codec(String),
}

/// Errors returned by contexts, operations and transactions.
///
/// Protocol errors received from a peer arrive as [`EngineError::Protocol`];
/// everything else is a local failure that never reaches the wire.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Protocol(#[from] MalError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Body(#[from] BodyError),
    #[error("handler already registered for operation {key}")]
    DuplicateHandler { key: OperationKey },
    #[error("endpoint already registered at {uri}")]
    DuplicateEndpoint { uri: Uri },
    #[error("transaction {tid} already in flight")]
    DuplicateTransaction { tid: u64 },
    #[error("no operation registered for transaction {tid}")]
    UnknownTransaction { tid: u64 },
    #[error("no handler registered for operation {key}")]
    UnknownOperation { key: OperationKey },
    #[error("no endpoint registered at {uri}")]
    UnknownEndpoint { uri: Uri },
    #[error("cannot {operation} in state {status}")]
    InvalidState {
        operation: &'static str,
        status: String,
    },
    #[error("unexpected interaction stage {actual}, expected {expected}")]
    UnexpectedStage {
        expected: String,
        actual: Interaction,
    },
    #[error("operation interrupted")]
    Interrupted,
    #[error("context shut down")]
    Shutdown,
}

impl EngineError {
    /// The protocol error carried by this error, if any.
    #[must_use]
    pub fn as_protocol(&self) -> Option<&MalError> {
        match self {
            Self::Protocol(error) => Some(error),
            _ => None,
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
