//! Cache handoff protocol
//!
//! A producer stage publishes an artifact (encoder output, KV state) under
//! `(correlation id, producer role)`; the consumer stage fetches it with the
//! same key and releases it once consumed. The control-plane request only
//! carries a [`CacheReference`], never the artifact itself.
//!
//! Two backends satisfy [`CacheConnector`]:
//! - [`SharedStorageConnector`]: durable files under a shared root
//! - [`SideChannelConnector`]: one-shot push over a fixed TCP pairing

pub mod shared_storage;
pub mod side_channel;

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ConnectorConfig;
use crate::context::{CorrelationId, StageRole};

pub use shared_storage::{EvictionReport, SharedStorageConnector};
pub use side_channel::SideChannelConnector;

/// Key of an artifact, and the pointer a consumer stage receives in its request
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheReference {
    pub correlation_id: CorrelationId,
    pub producer: StageRole,
}

impl CacheReference {
    pub fn new(correlation_id: &CorrelationId, producer: StageRole) -> Self {
        Self {
            correlation_id: correlation_id.clone(),
            producer,
        }
    }
}

impl fmt::Display for CacheReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.correlation_id, self.producer)
    }
}

/// Opaque intermediate result handed from one stage to the next
#[derive(Debug, Clone, PartialEq)]
pub struct CacheArtifact {
    pub reference: CacheReference,
    pub consumer: StageRole,
    pub payload: Bytes,
    pub created_at: DateTime<Utc>,
}

impl CacheArtifact {
    pub fn new(reference: CacheReference, payload: Bytes) -> Result<Self, CacheError> {
        let consumer = reference.producer.consumer().ok_or_else(|| {
            CacheError::Unsupported(format!("{} stage has no consumer", reference.producer))
        })?;
        Ok(Self {
            reference,
            consumer,
            payload,
            created_at: Utc::now(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "at", rename_all = "snake_case")]
pub enum CacheLocation {
    Path(PathBuf),
    Channel(SocketAddr),
}

/// Where a published artifact now lives
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheHandle {
    pub reference: CacheReference,
    pub location: CacheLocation,
    pub len: usize,
}

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("no artifact published for {0}")]
    NotFound(CacheReference),

    #[error("artifact {0} was already published")]
    PublishConflict(CacheReference),

    #[error("side-channel peer {peer} is not accepting transfers: {reason}")]
    PeerUnavailable { peer: SocketAddr, reason: String },

    #[error("artifact {reference} is corrupt: {reason}")]
    Corrupt {
        reference: CacheReference,
        reason: String,
    },

    #[error("side-channel protocol error: {0}")]
    Protocol(String),

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CacheError {
    /// Machine-readable kind used in error bodies
    pub fn kind(&self) -> &'static str {
        match self {
            CacheError::NotFound(_) => "cache_miss",
            CacheError::PublishConflict(_) => "cache_publish_conflict",
            CacheError::PeerUnavailable { .. } => "cache_peer_unavailable",
            CacheError::Corrupt { .. } => "cache_corrupt",
            CacheError::Protocol(_) => "cache_protocol_error",
            CacheError::Unsupported(_) => "cache_unsupported",
            CacheError::Io(_) => "cache_io_error",
        }
    }
}

/// Publish/fetch/release contract every backend satisfies.
///
/// `role` is always the producer role: a consumer fetches
/// `(id, its_role.producer())`.
#[async_trait]
pub trait CacheConnector: Send + Sync {
    fn backend(&self) -> &'static str;

    /// Producer side. At most once per `(id, role)`; a repeat either replaces
    /// the artifact or fails with [`CacheError::PublishConflict`].
    async fn publish(
        &self,
        id: &CorrelationId,
        role: StageRole,
        payload: Bytes,
    ) -> Result<CacheHandle, CacheError>;

    /// Consumer side. Repeated calls return equal artifacts until `release`.
    async fn fetch(&self, id: &CorrelationId, role: StageRole)
        -> Result<CacheArtifact, CacheError>;

    /// Drop the artifact now instead of waiting for eviction. Absent is fine.
    async fn release(&self, id: &CorrelationId, role: StageRole) -> Result<(), CacheError>;
}

/// The closed set of backends, chosen by configuration at startup
pub enum Connector {
    SharedStorage(SharedStorageConnector),
    SideChannel(SideChannelConnector),
}

impl Connector {
    /// Build the configured backend. Side-channel listeners bind here.
    pub async fn from_config(config: &ConnectorConfig) -> Result<Self, CacheError> {
        match config {
            ConnectorConfig::SharedStorage(cfg) => {
                Ok(Connector::SharedStorage(SharedStorageConnector::new(cfg)?))
            }
            ConnectorConfig::SideChannel(cfg) => {
                Ok(Connector::SideChannel(SideChannelConnector::bind(cfg).await?))
            }
        }
    }

    fn inner(&self) -> &dyn CacheConnector {
        match self {
            Connector::SharedStorage(c) => c,
            Connector::SideChannel(c) => c,
        }
    }
}

#[async_trait]
impl CacheConnector for Connector {
    fn backend(&self) -> &'static str {
        self.inner().backend()
    }

    async fn publish(
        &self,
        id: &CorrelationId,
        role: StageRole,
        payload: Bytes,
    ) -> Result<CacheHandle, CacheError> {
        self.inner().publish(id, role, payload).await
    }

    async fn fetch(
        &self,
        id: &CorrelationId,
        role: StageRole,
    ) -> Result<CacheArtifact, CacheError> {
        self.inner().fetch(id, role).await
    }

    async fn release(&self, id: &CorrelationId, role: StageRole) -> Result<(), CacheError> {
        self.inner().release(id, role).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_consumer_follows_producer() {
        let id = CorrelationId::mint();
        let artifact =
            CacheArtifact::new(CacheReference::new(&id, StageRole::Encode), Bytes::from("x"))
                .unwrap();
        assert_eq!(artifact.consumer, StageRole::Prefill);

        let err = CacheArtifact::new(CacheReference::new(&id, StageRole::Decode), Bytes::new())
            .unwrap_err();
        assert_eq!(err.kind(), "cache_unsupported");
    }

    #[test]
    fn test_reference_display() {
        let id: CorrelationId = "epd-1".parse().unwrap();
        assert_eq!(
            CacheReference::new(&id, StageRole::Prefill).to_string(),
            "epd-1/prefill"
        );
    }

    #[tokio::test]
    async fn test_connector_from_shared_storage_config() {
        let dir = tempfile::tempdir().unwrap();
        let config: ConnectorConfig = serde_json::from_value(serde_json::json!({
            "backend": "shared_storage",
            "root": dir.path(),
        }))
        .unwrap();

        let connector = Connector::from_config(&config).await.unwrap();
        assert_eq!(connector.backend(), "shared_storage");

        let id = CorrelationId::mint();
        connector
            .publish(&id, StageRole::Encode, Bytes::from_static(b"embedding"))
            .await
            .unwrap();
        let artifact = connector.fetch(&id, StageRole::Encode).await.unwrap();
        assert_eq!(artifact.payload, Bytes::from_static(b"embedding"));
    }
}
