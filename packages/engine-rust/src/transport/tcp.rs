//! TCP transport (`maltcp://host:port`).
//!
//! Every message travels as one length-delimited frame holding the `MsgPack`
//! encoding of the full [`Message`]. Each transport listens on its own
//! address and opens one outbound connection per remote authority on first
//! use. Replies flow back over the peer's own outbound connection, so each
//! TCP stream carries traffic in one direction only.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use mal_core::{Message, Uri};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{debug, info, warn};

use super::{InboundSink, Transport, TransportFactory};
use crate::config::{ContextConfig, TcpConfig};
use crate::error::TransportError;

type FrameWriter = FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>;

fn frame_codec(max_frame_length: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(max_frame_length)
        .new_codec()
}

/// Factory for `maltcp` transports.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpTransportFactory;

#[async_trait]
impl TransportFactory for TcpTransportFactory {
    fn scheme(&self) -> &'static str {
        "maltcp"
    }

    async fn create(
        &self,
        uri: &Uri,
        sink: InboundSink,
        config: &ContextConfig,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        let authority = uri
            .authority()
            .filter(|a| !a.is_empty())
            .ok_or_else(|| TransportError::InvalidUri { uri: uri.clone() })?;
        let listener = TcpListener::bind(authority).await?;
        let local_addr = listener.local_addr()?;
        let base = Uri::new(format!("maltcp://{local_addr}"));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(accept_loop(
            listener,
            sink,
            config.tcp.max_frame_length,
            shutdown_rx,
        ));
        info!(uri = %base, "maltcp transport listening");

        Ok(Arc::new(TcpTransport {
            base,
            config: config.tcp.clone(),
            connections: DashMap::new(),
            shutdown: shutdown_tx,
        }))
    }
}

async fn accept_loop(
    listener: TcpListener,
    sink: InboundSink,
    max_frame_length: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "maltcp connection accepted");
                    tokio::spawn(read_loop(
                        stream,
                        peer,
                        sink.clone(),
                        max_frame_length,
                        shutdown.clone(),
                    ));
                }
                Err(e) => warn!(error = %e, "maltcp accept failed"),
            },
            _ = shutdown.changed() => break,
        }
    }
}

async fn read_loop(
    stream: TcpStream,
    peer: SocketAddr,
    sink: InboundSink,
    max_frame_length: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut frames = FramedRead::new(stream, frame_codec(max_frame_length));
    loop {
        tokio::select! {
            frame = frames.next() => match frame {
                Some(Ok(bytes)) => match rmp_serde::from_slice::<Message>(&bytes) {
                    Ok(message) => {
                        metrics::counter!("mal_tcp_frames_received_total").increment(1);
                        if sink.receive(message).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(%peer, error = %e, "discarding undecodable maltcp frame"),
                },
                Some(Err(e)) => {
                    warn!(%peer, error = %e, "maltcp connection failed");
                    break;
                }
                None => break,
            },
            _ = shutdown.changed() => break,
        }
    }
    debug!(%peer, "maltcp connection closed");
}

struct TcpTransport {
    base: Uri,
    config: TcpConfig,
    connections: DashMap<String, Arc<Mutex<FrameWriter>>>,
    shutdown: watch::Sender<bool>,
}

impl TcpTransport {
    async fn connection(&self, authority: &str) -> Result<Arc<Mutex<FrameWriter>>, TransportError> {
        if let Some(existing) = self.connections.get(authority) {
            return Ok(Arc::clone(existing.value()));
        }

        let stream = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(authority))
            .await
            .map_err(|_| TransportError::ConnectTimeout {
                authority: authority.to_string(),
            })??;
        stream.set_nodelay(true)?;
        // Inbound traffic arrives through the peer's own connection to our listener.
        let (_read_half, write_half) = stream.into_split();
        let writer = Arc::new(Mutex::new(FramedWrite::new(
            write_half,
            frame_codec(self.config.max_frame_length),
        )));
        debug!(%authority, "maltcp connection opened");

        // A concurrent connect to the same peer may have won; keep the first.
        let entry = self
            .connections
            .entry(authority.to_string())
            .or_insert(writer);
        Ok(Arc::clone(entry.value()))
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn local_uri(&self) -> &Uri {
        &self.base
    }

    async fn transmit(&self, message: Message) -> Result<(), TransportError> {
        if *self.shutdown.borrow() {
            return Err(TransportError::Closed);
        }
        let authority = message
            .uri_to
            .authority()
            .filter(|a| !a.is_empty())
            .ok_or_else(|| TransportError::InvalidUri {
                uri: message.uri_to.clone(),
            })?
            .to_string();
        let frame = rmp_serde::to_vec_named(&message).map_err(|e| TransportError::Codec(e.to_string()))?;

        let connection = self.connection(&authority).await?;
        let mut writer = connection.lock().await;
        if let Err(e) = writer.send(Bytes::from(frame)).await {
            drop(writer);
            self.connections.remove(&authority);
            return Err(e.into());
        }
        metrics::counter!("mal_tcp_frames_sent_total").increment(1);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.shutdown.send_replace(true) {
            return Ok(());
        }
        let writers: Vec<_> = self
            .connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.connections.clear();
        for writer in writers {
            let mut writer = writer.lock().await;
            if let Err(e) = SinkExt::<Bytes>::close(&mut *writer).await {
                debug!(error = %e, "maltcp connection close failed");
            }
        }
        info!(uri = %self.base, "maltcp transport closed");
        Ok(())
    }
}
