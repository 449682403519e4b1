//! MAL engine: contexts, transports, consumer and provider interaction
//! state machines, and the publish-subscribe broker.

pub mod broker;
pub mod client_context;
pub mod config;
pub mod context;
pub mod error;
pub mod handler;
pub mod operation;
pub mod transaction;
pub mod transport;

#[cfg(test)]
mod interaction_tests;

pub use broker::{Broker, LocalBroker, MultiValueListHandler, UpdateOrigin, UpdateValueHandler, ValueListHandler};
pub use client_context::ClientContext;
pub use config::{ContextConfig, DispatchPolicy, TcpConfig};
pub use context::{Context, ContextState, Endpoint};
pub use error::{EngineError, EngineResult, TransportError};
pub use handler::Handler;
pub use operation::{
    Interrupter, InvokeOperation, Notification, Operation, OperationCore, OperationStatus,
    ProgressOperation, PublisherOperation, RequestOperation, SendOperation, SubmitOperation,
    SubscriberOperation,
};
pub use transaction::{
    InvokeTransaction, ProgressTransaction, PublisherTransaction, RequestTransaction,
    SendTransaction, SubmitTransaction, SubscriberTransaction, Transaction, TransactionStatus,
};
pub use transport::{
    InboundSink, InvmHub, InvmTransportFactory, TcpTransportFactory, Transport, TransportFactory,
    TransportRegistry,
};
