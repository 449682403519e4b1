//! Transport-bound message router.
//!
//! A [`Context`] owns one transport and a table of [`Endpoint`]s keyed by
//! full URI. A single dispatch task drains the transport's inbound channel
//! and hands each message to the endpoint registered at `uri_to`, so
//! messages for one endpoint are processed in arrival order.
//!
//! Lifecycle: Running -> Closing -> Closed. [`Context::close`] stops the
//! dispatch task, closes the transport and notifies every endpoint.

use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use mal_core::{codes, MalError, Message, Uri};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::ContextConfig;
use crate::error::{EngineError, EngineResult, TransportError};
use crate::transport::{InboundSink, Transport, TransportRegistry};

/// Receiver of messages addressed to one URI.
#[async_trait]
pub trait Endpoint: Send + Sync {
    async fn on_message(&self, message: Message) -> EngineResult<()>;

    /// Called once when the owning context closes.
    async fn on_close(&self) {}
}

/// Context lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Running,
    Closing,
    Closed,
}

/// Handle to a transport-bound context. Cheap to clone.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    uri: Uri,
    config: ContextConfig,
    transport: Arc<dyn Transport>,
    endpoints: DashMap<Uri, Arc<dyn Endpoint>>,
    state: ArcSwap<ContextState>,
    shutdown: watch::Sender<bool>,
}

impl Context {
    /// Creates a context bound to `uri` using the transport registered for
    /// its scheme, and starts its dispatch task.
    ///
    /// For `maltcp://host:0` the actual port is reflected in [`Context::uri`].
    ///
    /// # Errors
    ///
    /// Returns a transport error when the scheme is unknown or the transport
    /// cannot bind.
    pub async fn new(
        uri: impl Into<Uri>,
        transports: &TransportRegistry,
        config: ContextConfig,
    ) -> EngineResult<Self> {
        let uri = uri.into();
        let scheme = uri
            .scheme()
            .ok_or_else(|| TransportError::InvalidUri { uri: uri.clone() })?;
        let factory = transports
            .get(scheme)
            .ok_or_else(|| TransportError::UnsupportedScheme {
                scheme: scheme.to_string(),
            })?;

        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_channel_capacity);
        let transport = factory
            .create(&uri, InboundSink::new(inbound_tx), &config)
            .await?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let inner = Arc::new(ContextInner {
            uri: transport.local_uri().clone(),
            config,
            transport,
            endpoints: DashMap::new(),
            state: ArcSwap::from_pointee(ContextState::Running),
            shutdown: shutdown_tx,
        });
        tokio::spawn(dispatch_loop(Arc::clone(&inner), inbound_rx, shutdown_rx));
        info!(uri = %inner.uri, "context started");

        Ok(Self { inner })
    }

    /// The base URI this context is reachable at.
    #[must_use]
    pub fn uri(&self) -> &Uri {
        &self.inner.uri
    }

    /// A service URI under this context: `<base>/<service>`.
    #[must_use]
    pub fn new_uri(&self, service: &str) -> Uri {
        self.inner.uri.join(service)
    }

    #[must_use]
    pub fn config(&self) -> &ContextConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn state(&self) -> ContextState {
        **self.inner.state.load()
    }

    /// Routes messages addressed to `uri` to `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::DuplicateEndpoint` if `uri` is taken, or
    /// `EngineError::Shutdown` once the context is closing.
    pub fn register_endpoint(&self, uri: Uri, endpoint: Arc<dyn Endpoint>) -> EngineResult<()> {
        self.ensure_running()?;
        match self.inner.endpoints.entry(uri) {
            Entry::Occupied(slot) => Err(EngineError::DuplicateEndpoint {
                uri: slot.key().clone(),
            }),
            Entry::Vacant(slot) => {
                debug!(uri = %slot.key(), "endpoint registered");
                slot.insert(endpoint);
                Ok(())
            }
        }
    }

    /// Removes the endpoint at `uri`. Later messages for it are answered with
    /// DESTINATION_UNKNOWN.
    pub fn unregister_endpoint(&self, uri: &Uri) -> Option<Arc<dyn Endpoint>> {
        self.inner.endpoints.remove(uri).map(|(_, endpoint)| endpoint)
    }

    /// Removes the endpoint at `uri` only if it is `endpoint` itself.
    pub fn unregister_endpoint_if(&self, uri: &Uri, endpoint: &Arc<dyn Endpoint>) -> bool {
        self.inner
            .endpoints
            .remove_if(uri, |_, current| {
                Arc::as_ptr(current).cast::<()>() == Arc::as_ptr(endpoint).cast::<()>()
            })
            .is_some()
    }

    /// Hands a message to the transport.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Shutdown` once the context is closing, or the
    /// transport's error.
    pub async fn send(&self, message: Message) -> EngineResult<()> {
        self.ensure_running()?;
        self.inner.transport.transmit(message).await?;
        metrics::counter!("mal_messages_sent_total").increment(1);
        Ok(())
    }

    /// Shuts the context down. Idempotent.
    ///
    /// Does not wait for the dispatch task, so it is safe to call from inside
    /// a handler.
    pub async fn close(&self) {
        let previous = self.inner.state.swap(Arc::new(ContextState::Closing));
        if *previous != ContextState::Running {
            self.inner.state.store(previous);
            return;
        }
        let _ = self.inner.shutdown.send(true);
        if let Err(e) = self.inner.transport.close().await {
            warn!(uri = %self.inner.uri, error = %e, "transport close failed");
        }

        let endpoints: Vec<_> = self
            .inner
            .endpoints
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.inner.endpoints.clear();
        for endpoint in endpoints {
            endpoint.on_close().await;
        }

        self.inner.state.store(Arc::new(ContextState::Closed));
        info!(uri = %self.inner.uri, "context closed");
    }

    fn ensure_running(&self) -> EngineResult<()> {
        match self.state() {
            ContextState::Running => Ok(()),
            ContextState::Closing | ContextState::Closed => Err(EngineError::Shutdown),
        }
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("uri", &self.inner.uri)
            .field("state", &self.state())
            .field("endpoints", &self.inner.endpoints.len())
            .finish_non_exhaustive()
    }
}

async fn dispatch_loop(
    inner: Arc<ContextInner>,
    mut inbound: mpsc::Receiver<Message>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            message = inbound.recv() => match message {
                Some(message) => inner.dispatch(message).await,
                None => break,
            },
        }
    }
    debug!(uri = %inner.uri, "dispatch loop stopped");
}

impl ContextInner {
    async fn dispatch(&self, message: Message) {
        metrics::counter!("mal_messages_received_total").increment(1);
        let endpoint = self
            .endpoints
            .get(&message.uri_to)
            .map(|entry| Arc::clone(entry.value()));

        match endpoint {
            Some(endpoint) => {
                let tid = message.transaction_id;
                if let Err(e) = endpoint.on_message(message).await {
                    debug!(uri = %self.uri, tid, error = %e, "endpoint rejected message");
                }
            }
            None => self.reject_unknown_destination(message).await,
        }
    }

    async fn reject_unknown_destination(&self, message: Message) {
        warn!(
            uri = %message.uri_to,
            from = %message.uri_from,
            interaction = %message.interaction,
            tid = message.transaction_id,
            "no endpoint registered for destination"
        );
        metrics::counter!("mal_routing_failures_total", "reason" => "destination_unknown").increment(1);

        let error = MalError::with_message(codes::DESTINATION_UNKNOWN, message.uri_to.to_string());
        if let Some(reply) = message.error_reply(&error) {
            if let Err(e) = self.transport.transmit(reply).await {
                debug!(error = %e, "could not report unknown destination");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use mal_core::{Interaction, RequestStage};
    use tokio::sync::mpsc;

    use super::*;

    struct Recorder(mpsc::UnboundedSender<Message>);

    #[async_trait]
    impl Endpoint for Recorder {
        async fn on_message(&self, message: Message) -> EngineResult<()> {
            let _ = self.0.send(message);
            Ok(())
        }
    }

    async fn invm_pair() -> (Context, Context) {
        let transports = TransportRegistry::with_defaults();
        let a = Context::new("invm://a", &transports, ContextConfig::default())
            .await
            .unwrap();
        let b = Context::new("invm://b", &transports, ContextConfig::default())
            .await
            .unwrap();
        (a, b)
    }

    #[tokio::test]
    async fn routes_to_registered_endpoint() {
        let (a, b) = invm_pair().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        b.register_endpoint(b.new_uri("svc"), Arc::new(Recorder(tx)))
            .unwrap();

        a.send(Message {
            uri_from: a.new_uri("client"),
            uri_to: b.new_uri("svc"),
            transaction_id: 11,
            ..Message::default()
        })
        .await
        .unwrap();

        let received = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.transaction_id, 11);
    }

    #[tokio::test]
    async fn unknown_destination_gets_error_reply() {
        let (a, b) = invm_pair().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        a.register_endpoint(a.new_uri("client"), Arc::new(Recorder(tx)))
            .unwrap();

        a.send(Message {
            uri_from: a.new_uri("client"),
            uri_to: b.new_uri("missing"),
            interaction: Interaction::Request(RequestStage::Request),
            transaction_id: 4,
            ..Message::default()
        })
        .await
        .unwrap();

        let mut reply = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(reply.is_error_message);
        assert_eq!(reply.interaction, Interaction::Request(RequestStage::Response));
        assert_eq!(
            MalError::from_body(&mut reply.body).unwrap().code,
            codes::DESTINATION_UNKNOWN
        );
    }

    #[tokio::test]
    async fn duplicate_endpoint_is_rejected() {
        let (a, _b) = invm_pair().await;
        let (tx, _rx) = mpsc::unbounded_channel();
        let uri = a.new_uri("svc");
        a.register_endpoint(uri.clone(), Arc::new(Recorder(tx.clone())))
            .unwrap();
        assert!(matches!(
            a.register_endpoint(uri, Arc::new(Recorder(tx))),
            Err(EngineError::DuplicateEndpoint { .. })
        ));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_rejects_sends() {
        let (a, _b) = invm_pair().await;
        a.close().await;
        a.close().await;
        assert_eq!(a.state(), ContextState::Closed);
        assert!(matches!(
            a.send(Message::default()).await,
            Err(EngineError::Shutdown)
        ));
    }

    #[tokio::test]
    async fn unsupported_scheme_fails() {
        let result = Context::new("http://x", &TransportRegistry::with_defaults(), ContextConfig::default()).await;
        assert!(matches!(
            result,
            Err(EngineError::Transport(TransportError::UnsupportedScheme { .. }))
        ));
    }
}
