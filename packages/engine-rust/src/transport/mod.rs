//! Transport abstraction.
//!
//! A [`Transport`] moves [`Message`]s between contexts. Each context owns
//! exactly one transport, created by the [`TransportFactory`] registered for
//! the scheme of the context URI. Inbound messages are pushed into an
//! [`InboundSink`], which feeds the context's dispatch task.

pub mod invm;
pub mod tcp;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use mal_core::{Message, Uri};
use tokio::sync::mpsc;

use crate::config::ContextConfig;
use crate::error::TransportError;

pub use invm::{InvmHub, InvmTransportFactory};
pub use tcp::TcpTransportFactory;

/// Outbound half of a transport bound to one context.
#[async_trait]
pub trait Transport: Send + Sync {
    /// The `scheme://authority` base this transport is reachable at.
    fn local_uri(&self) -> &Uri;

    /// Delivers `message` to the context owning `message.uri_to`.
    async fn transmit(&self, message: Message) -> Result<(), TransportError>;

    /// Delivers several messages, preserving their order.
    async fn transmit_multiple(&self, messages: Vec<Message>) -> Result<(), TransportError> {
        for message in messages {
            self.transmit(message).await?;
        }
        Ok(())
    }

    /// Stops accepting and delivering messages. Idempotent.
    async fn close(&self) -> Result<(), TransportError>;
}

/// Creates transports for one URI scheme.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    fn scheme(&self) -> &'static str;

    /// Binds a transport at `uri` that pushes everything it receives into `sink`.
    async fn create(
        &self,
        uri: &Uri,
        sink: InboundSink,
        config: &ContextConfig,
    ) -> Result<Arc<dyn Transport>, TransportError>;
}

/// Receiving end handed to a transport: forwards messages to the dispatch task.
#[derive(Debug, Clone)]
pub struct InboundSink {
    tx: mpsc::Sender<Message>,
}

impl InboundSink {
    pub(crate) fn new(tx: mpsc::Sender<Message>) -> Self {
        Self { tx }
    }

    /// Queues one inbound message. Waits while the dispatch channel is full.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Closed` once the owning context has shut down.
    pub async fn receive(&self, message: Message) -> Result<(), TransportError> {
        self.tx.send(message).await.map_err(|_| TransportError::Closed)
    }

    /// Queues several inbound messages in order.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Closed` once the owning context has shut down.
    pub async fn receive_multiple(&self, messages: Vec<Message>) -> Result<(), TransportError> {
        for message in messages {
            self.receive(message).await?;
        }
        Ok(())
    }
}

/// Scheme to factory lookup used when creating a context.
#[derive(Clone, Default)]
pub struct TransportRegistry {
    factories: HashMap<&'static str, Arc<dyn TransportFactory>>,
}

impl TransportRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with `invm` (backed by a fresh hub) and `maltcp`.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(InvmTransportFactory::new()));
        registry.register(Arc::new(TcpTransportFactory));
        registry
    }

    /// Adds or replaces the factory for its scheme.
    pub fn register(&mut self, factory: Arc<dyn TransportFactory>) {
        self.factories.insert(factory.scheme(), factory);
    }

    #[must_use]
    pub fn get(&self, scheme: &str) -> Option<Arc<dyn TransportFactory>> {
        self.factories.get(scheme).cloned()
    }
}

impl std::fmt::Debug for TransportRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut schemes: Vec<_> = self.factories.keys().collect();
        schemes.sort();
        f.debug_struct("TransportRegistry")
            .field("schemes", &schemes)
            .finish()
    }
}
