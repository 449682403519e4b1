//! In-process transport (`invm://name`).
//!
//! Contexts created through the same [`InvmHub`] reach each other by handing
//! messages directly to the destination's inbound sink. Nothing is encoded.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use mal_core::{Message, Uri};
use tracing::debug;

use super::{InboundSink, Transport, TransportFactory};
use crate::config::ContextConfig;
use crate::error::TransportError;

/// Shared routing table of in-process contexts, keyed by base URI.
#[derive(Debug, Default)]
pub struct InvmHub {
    endpoints: DashMap<Uri, InboundSink>,
}

impl InvmHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of contexts currently attached.
    #[must_use]
    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

/// Factory for `invm` transports sharing one hub.
#[derive(Debug, Clone, Default)]
pub struct InvmTransportFactory {
    hub: Arc<InvmHub>,
}

impl InvmTransportFactory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A factory attaching to an existing hub.
    #[must_use]
    pub fn with_hub(hub: Arc<InvmHub>) -> Self {
        Self { hub }
    }

    #[must_use]
    pub fn hub(&self) -> &Arc<InvmHub> {
        &self.hub
    }
}

#[async_trait]
impl TransportFactory for InvmTransportFactory {
    fn scheme(&self) -> &'static str {
        "invm"
    }

    async fn create(
        &self,
        uri: &Uri,
        sink: InboundSink,
        _config: &ContextConfig,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        let base = uri
            .base()
            .ok_or_else(|| TransportError::InvalidUri { uri: uri.clone() })?;
        match self.hub.endpoints.entry(base.clone()) {
            Entry::Occupied(_) => return Err(TransportError::AddressInUse { uri: base }),
            Entry::Vacant(slot) => {
                slot.insert(sink);
            }
        }
        debug!(uri = %base, "invm transport attached");
        Ok(Arc::new(InvmTransport {
            base,
            hub: Arc::clone(&self.hub),
        }))
    }
}

struct InvmTransport {
    base: Uri,
    hub: Arc<InvmHub>,
}

#[async_trait]
impl Transport for InvmTransport {
    fn local_uri(&self) -> &Uri {
        &self.base
    }

    async fn transmit(&self, message: Message) -> Result<(), TransportError> {
        let destination = message
            .uri_to
            .base()
            .ok_or_else(|| TransportError::InvalidUri {
                uri: message.uri_to.clone(),
            })?;
        // Clone the sink out of the map: no shard lock may be held across the send.
        let sink = self
            .hub
            .endpoints
            .get(&destination)
            .map(|entry| entry.value().clone())
            .ok_or(TransportError::DestinationUnknown { uri: destination })?;
        sink.receive(message).await
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.hub.endpoints.remove(&self.base).is_some() {
            debug!(uri = %self.base, "invm transport detached");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;

    async fn attach(factory: &InvmTransportFactory, uri: &str) -> (Arc<dyn Transport>, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(8);
        let transport = factory
            .create(&Uri::from(uri), InboundSink::new(tx), &ContextConfig::default())
            .await
            .unwrap();
        (transport, rx)
    }

    #[tokio::test]
    async fn delivers_by_base_uri() {
        let factory = InvmTransportFactory::new();
        let (a, _rx_a) = attach(&factory, "invm://a").await;
        let (_b, mut rx_b) = attach(&factory, "invm://b").await;

        let message = Message {
            uri_from: Uri::from("invm://a/consumer"),
            uri_to: Uri::from("invm://b/provider"),
            transaction_id: 3,
            ..Message::default()
        };
        a.transmit(message.clone()).await.unwrap();
        assert_eq!(rx_b.recv().await.unwrap(), message);
    }

    #[tokio::test]
    async fn unknown_destination_is_reported() {
        let factory = InvmTransportFactory::new();
        let (a, _rx) = attach(&factory, "invm://a").await;
        let message = Message {
            uri_to: Uri::from("invm://nowhere/x"),
            ..Message::default()
        };
        assert!(matches!(
            a.transmit(message).await,
            Err(TransportError::DestinationUnknown { .. })
        ));
    }

    #[tokio::test]
    async fn base_uri_is_exclusive_until_closed() {
        let factory = InvmTransportFactory::new();
        let (a, _rx) = attach(&factory, "invm://a").await;
        let (tx, _rx2) = mpsc::channel(1);
        let second = factory
            .create(&Uri::from("invm://a"), InboundSink::new(tx), &ContextConfig::default())
            .await;
        assert!(matches!(second, Err(TransportError::AddressInUse { .. })));

        a.close().await.unwrap();
        assert!(factory.hub().is_empty());
    }
}
