//! Direct producer→consumer artifact push over a fixed TCP pairing
//!
//! The consumer binds its listen address at startup and keeps received
//! artifacts in memory. The producer connects to its configured peer and sends
//! three length-delimited frames: a JSON header, the payload, then waits for a
//! JSON ack. Nothing is durable; if the consumer is not listening the publish
//! fails with [`CacheError::PeerUnavailable`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{CacheArtifact, CacheConnector, CacheError, CacheHandle, CacheLocation, CacheReference};
use crate::config::SideChannelConfig;
use crate::context::{CorrelationId, StageRole};

/// KV blocks for long prompts are large; the codec default (8 MiB) is not enough
const MAX_FRAME_BYTES: usize = 1 << 30;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct TransferHeader {
    correlation_id: CorrelationId,
    producer: StageRole,
    consumer: StageRole,
    len: usize,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum Ack {
    Stored,
    Duplicate,
    Rejected { message: String },
}

type Inbox = Arc<DashMap<CacheReference, CacheArtifact>>;

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_BYTES)
        .new_codec()
}

fn is_expired(created_at: DateTime<Utc>, ttl: Duration) -> bool {
    (Utc::now() - created_at).to_std().unwrap_or(Duration::ZERO) > ttl
}

pub struct SideChannelConnector {
    listen_addr: Option<SocketAddr>,
    peer: Option<SocketAddr>,
    connect_timeout: Duration,
    transfer_timeout: Duration,
    ttl: Duration,
    inbox: Inbox,
    /// Keys already pushed by this producer; the channel is one-shot per key
    sent: DashMap<CacheReference, DateTime<Utc>>,
    shutdown: CancellationToken,
}

impl SideChannelConnector {
    /// Bind the listener (consumer side) if one is configured.
    pub async fn bind(config: &SideChannelConfig) -> Result<Self, CacheError> {
        let inbox: Inbox = Arc::new(DashMap::new());
        let shutdown = CancellationToken::new();
        let ttl = Duration::from_secs(config.ttl_secs);

        let listen_addr = match config.listen {
            Some(addr) => {
                let listener = TcpListener::bind(addr).await?;
                let bound = listener.local_addr()?;
                info!("Side channel listening on {}", bound);
                tokio::spawn(accept_loop(
                    listener,
                    inbox.clone(),
                    ttl,
                    Duration::from_millis(config.transfer_timeout_ms),
                    shutdown.clone(),
                ));
                Some(bound)
            }
            None => None,
        };

        Ok(Self {
            listen_addr,
            peer: config.peer,
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            transfer_timeout: Duration::from_millis(config.transfer_timeout_ms),
            ttl,
            inbox,
            sent: DashMap::new(),
            shutdown,
        })
    }

    /// Actual listen address, useful when configured with port 0
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.listen_addr
    }

    pub fn pending(&self) -> usize {
        self.inbox.len()
    }

    async fn push(&self, peer: SocketAddr, artifact: &CacheArtifact) -> Result<Ack, CacheError> {
        let stream = match timeout(self.connect_timeout, TcpStream::connect(peer)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(CacheError::PeerUnavailable {
                    peer,
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                return Err(CacheError::PeerUnavailable {
                    peer,
                    reason: "connect timed out".to_string(),
                })
            }
        };
        let mut framed = Framed::new(stream, codec());

        let header = TransferHeader {
            correlation_id: artifact.reference.correlation_id.clone(),
            producer: artifact.reference.producer,
            consumer: artifact.consumer,
            len: artifact.payload.len(),
            created_at: artifact.created_at,
        };
        let header = serde_json::to_vec(&header)
            .map_err(|e| CacheError::Protocol(format!("header encode failed: {}", e)))?;

        let exchange = async {
            framed.send(Bytes::from(header)).await?;
            framed.send(artifact.payload.clone()).await?;
            let frame = framed
                .next()
                .await
                .ok_or_else(|| CacheError::Protocol("peer closed before ack".to_string()))??;
            let ack = serde_json::from_slice::<Ack>(&frame)
                .map_err(|e| CacheError::Protocol(format!("bad ack: {}", e)))?;
            Ok::<Ack, CacheError>(ack)
        };

        timeout(self.transfer_timeout, exchange)
            .await
            .map_err(|_| CacheError::Protocol(format!("transfer to {} timed out", peer)))?
    }
}

impl Drop for SideChannelConnector {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn accept_loop(
    listener: TcpListener,
    inbox: Inbox,
    ttl: Duration,
    transfer_timeout: Duration,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    let inbox = inbox.clone();
                    tokio::spawn(async move {
                        match timeout(transfer_timeout, receive(stream, inbox, ttl)).await {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => {
                                warn!("Side-channel transfer from {} failed: {}", remote, e)
                            }
                            Err(_) => warn!(
                                "Side-channel transfer from {} stalled; dropped after {}ms",
                                remote,
                                transfer_timeout.as_millis()
                            ),
                        }
                    });
                }
                Err(e) => warn!("Side-channel accept failed: {}", e),
            }
        }
    }
}

async fn receive(stream: TcpStream, inbox: Inbox, ttl: Duration) -> Result<(), CacheError> {
    let mut framed = Framed::new(stream, codec());

    let header = match framed.next().await {
        Some(frame) => serde_json::from_slice::<TransferHeader>(&frame?)
            .map_err(|e| CacheError::Protocol(format!("bad header: {}", e)))?,
        None => return Ok(()),
    };
    let payload = match framed.next().await {
        Some(frame) => frame?.freeze(),
        None => return Err(CacheError::Protocol("missing payload frame".to_string())),
    };

    let reference = CacheReference {
        correlation_id: header.correlation_id,
        producer: header.producer,
    };

    inbox.retain(|_, a| !is_expired(a.created_at, ttl));

    let ack = if payload.len() != header.len {
        Ack::Rejected {
            message: format!("expected {} bytes, received {}", header.len, payload.len()),
        }
    } else {
        match inbox.entry(reference.clone()) {
            Entry::Occupied(_) => Ack::Duplicate,
            Entry::Vacant(slot) => {
                slot.insert(CacheArtifact {
                    reference: reference.clone(),
                    consumer: header.consumer,
                    payload,
                    created_at: header.created_at,
                });
                Ack::Stored
            }
        }
    };
    debug!("Side channel received {}: {:?}", reference, ack);

    let ack = serde_json::to_vec(&ack)
        .map_err(|e| CacheError::Protocol(format!("ack encode failed: {}", e)))?;
    framed.send(Bytes::from(ack)).await?;
    Ok(())
}

#[async_trait]
impl CacheConnector for SideChannelConnector {
    fn backend(&self) -> &'static str {
        "side_channel"
    }

    async fn publish(
        &self,
        id: &CorrelationId,
        role: StageRole,
        payload: Bytes,
    ) -> Result<CacheHandle, CacheError> {
        let peer = self
            .peer
            .ok_or_else(|| CacheError::Unsupported("side channel has no peer to push to".into()))?;
        let reference = CacheReference::new(id, role);
        let artifact = CacheArtifact::new(reference.clone(), payload)?;

        let ttl = self.ttl;
        self.sent.retain(|_, at| !is_expired(*at, ttl));
        match self.sent.entry(reference.clone()) {
            Entry::Occupied(_) => return Err(CacheError::PublishConflict(reference)),
            Entry::Vacant(slot) => {
                slot.insert(artifact.created_at);
            }
        }

        let outcome = self.push(peer, &artifact).await;
        match outcome {
            Ok(Ack::Stored) => {
                debug!(
                    "Pushed {} ({} bytes) to {}",
                    reference,
                    artifact.payload.len(),
                    peer
                );
                Ok(CacheHandle {
                    reference,
                    location: CacheLocation::Channel(peer),
                    len: artifact.payload.len(),
                })
            }
            Ok(Ack::Duplicate) => Err(CacheError::PublishConflict(reference)),
            Ok(Ack::Rejected { message }) => {
                self.sent.remove(&reference);
                Err(CacheError::Protocol(message))
            }
            Err(e) => {
                // Nothing was stored, so the key may be pushed again
                self.sent.remove(&reference);
                Err(e)
            }
        }
    }

    async fn fetch(
        &self,
        id: &CorrelationId,
        role: StageRole,
    ) -> Result<CacheArtifact, CacheError> {
        if self.listen_addr.is_none() {
            return Err(CacheError::Unsupported(
                "side channel is not listening for transfers".into(),
            ));
        }
        let reference = CacheReference::new(id, role);
        let artifact = self
            .inbox
            .get(&reference)
            .map(|a| a.clone())
            .ok_or_else(|| CacheError::NotFound(reference.clone()))?;

        if is_expired(artifact.created_at, self.ttl) {
            self.inbox.remove(&reference);
            return Err(CacheError::NotFound(reference));
        }
        Ok(artifact)
    }

    async fn release(&self, id: &CorrelationId, role: StageRole) -> Result<(), CacheError> {
        self.inbox.remove(&CacheReference::new(id, role));
        Ok(())
    }
}
