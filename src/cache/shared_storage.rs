//! Durable artifact storage on a filesystem shared by producer and consumer
//!
//! Layout: `<root>/<correlation_id>/<producer>.artifact`. Each file is a
//! single JSON header line followed by the raw payload, so a reader can
//! verify length and digest before trusting the bytes. Files are written to a
//! temporary name and renamed into place; a republish atomically replaces the
//! previous artifact.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::{CacheArtifact, CacheConnector, CacheError, CacheHandle, CacheLocation, CacheReference};
use crate::config::SharedStorageConfig;
use crate::context::{CorrelationId, StageRole};

const ARTIFACT_EXT: &str = "artifact";
const TMP_EXT: &str = "tmp";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ArtifactHeader {
    correlation_id: CorrelationId,
    producer: StageRole,
    consumer: StageRole,
    len: usize,
    sha256: String,
    created_at: DateTime<Utc>,
}

/// Outcome of one eviction sweep
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvictionReport {
    pub removed: usize,
    pub reclaimed_bytes: u64,
}

pub struct SharedStorageConnector {
    root: PathBuf,
    max_age: Duration,
    max_bytes: u64,
    single_read: bool,
    /// Copies handed out by single-read fetches, kept until release
    consumed: DashMap<CacheReference, CacheArtifact>,
}

// ============================================================================
// SBIO: Pure encoding functions (no I/O)
// ============================================================================

pub fn digest_hex(payload: &[u8]) -> String {
    format!("{:x}", Sha256::digest(payload))
}

fn encode_artifact(artifact: &CacheArtifact) -> Result<Vec<u8>, CacheError> {
    let header = ArtifactHeader {
        correlation_id: artifact.reference.correlation_id.clone(),
        producer: artifact.reference.producer,
        consumer: artifact.consumer,
        len: artifact.payload.len(),
        sha256: digest_hex(&artifact.payload),
        created_at: artifact.created_at,
    };
    let mut out = serde_json::to_vec(&header)
        .map_err(|e| CacheError::Protocol(format!("header encode failed: {}", e)))?;
    out.push(b'\n');
    out.extend_from_slice(&artifact.payload);
    Ok(out)
}

fn decode_artifact(reference: &CacheReference, raw: Bytes) -> Result<CacheArtifact, CacheError> {
    let corrupt = |reason: String| CacheError::Corrupt {
        reference: reference.clone(),
        reason,
    };

    let split = raw
        .iter()
        .position(|b| *b == b'\n')
        .ok_or_else(|| corrupt("missing header terminator".to_string()))?;
    let header: ArtifactHeader = serde_json::from_slice(&raw[..split])
        .map_err(|e| corrupt(format!("bad header: {}", e)))?;
    let payload = raw.slice(split + 1..);

    if header.correlation_id != reference.correlation_id || header.producer != reference.producer
    {
        return Err(corrupt(format!(
            "header names {}/{}",
            header.correlation_id, header.producer
        )));
    }
    if payload.len() != header.len {
        return Err(corrupt(format!(
            "expected {} bytes, found {}",
            header.len,
            payload.len()
        )));
    }
    if digest_hex(&payload) != header.sha256 {
        return Err(corrupt("digest mismatch".to_string()));
    }

    Ok(CacheArtifact {
        reference: reference.clone(),
        consumer: header.consumer,
        payload,
        created_at: header.created_at,
    })
}

// ============================================================================
// SBIO: I/O implementation
// ============================================================================

impl SharedStorageConnector {
    pub fn new(config: &SharedStorageConfig) -> Result<Self, CacheError> {
        let root = PathBuf::from(shellexpand::tilde(&config.root).into_owned());
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            max_age: Duration::from_secs(config.max_age_secs),
            max_bytes: config.max_bytes,
            single_read: config.single_read,
            consumed: DashMap::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn artifact_path(&self, id: &CorrelationId, role: StageRole) -> PathBuf {
        self.root
            .join(id.as_str())
            .join(format!("{}.{}", role, ARTIFACT_EXT))
    }

    fn is_expired(&self, created_at: DateTime<Utc>) -> bool {
        let age = (Utc::now() - created_at).to_std().unwrap_or(Duration::ZERO);
        age > self.max_age
    }

    /// Remove artifacts older than `max_age`, then the oldest ones until the
    /// store is within `max_bytes`.
    pub async fn evict(&self) -> Result<EvictionReport, CacheError> {
        self.consumed.retain(|_, a| !self.is_expired(a.created_at));

        let now = SystemTime::now();
        let mut files: Vec<(PathBuf, SystemTime, u64)> = Vec::new();
        let mut stale_tmp: Vec<(PathBuf, u64)> = Vec::new();
        let mut dirs = fs::read_dir(&self.root).await?;
        while let Some(dir) = dirs.next_entry().await? {
            if !dir.file_type().await?.is_dir() {
                continue;
            }
            let mut entries = fs::read_dir(dir.path()).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let meta = entry.metadata().await?;
                let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                match path.extension().and_then(|e| e.to_str()) {
                    Some(ARTIFACT_EXT) => files.push((path, modified, meta.len())),
                    // Left behind by a publish that never reached its rename
                    Some(TMP_EXT) => {
                        let age = now.duration_since(modified).unwrap_or(Duration::ZERO);
                        if age > self.max_age {
                            stale_tmp.push((path, meta.len()));
                        }
                    }
                    _ => {}
                }
            }
        }

        let mut report = EvictionReport::default();
        for (path, len) in stale_tmp {
            match fs::remove_file(&path).await {
                Ok(()) => {
                    trace!("Removed stale temp file {}", path.display());
                    report.removed += 1;
                    report.reclaimed_bytes += len;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
            }
            if let Some(parent) = path.parent() {
                let _ = fs::remove_dir(parent).await;
            }
        }

        files.sort_by_key(|(_, modified, _)| *modified);
        let mut total: u64 = files.iter().map(|(_, _, len)| *len).sum();

        for (path, modified, len) in files {
            let age = now.duration_since(modified).unwrap_or(Duration::ZERO);
            if age <= self.max_age && total <= self.max_bytes {
                continue;
            }
            match fs::remove_file(&path).await {
                Ok(()) => {
                    trace!("Evicted {}", path.display());
                    total = total.saturating_sub(len);
                    report.removed += 1;
                    report.reclaimed_bytes += len;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    total = total.saturating_sub(len);
                }
                Err(e) => warn!("Failed to evict {}: {}", path.display(), e),
            }
            if let Some(parent) = path.parent() {
                // Fails while other artifacts for the request remain
                let _ = fs::remove_dir(parent).await;
            }
        }

        if report.removed > 0 {
            debug!(
                "Evicted {} artifacts ({} bytes) from {}",
                report.removed,
                report.reclaimed_bytes,
                self.root.display()
            );
        }
        Ok(report)
    }
}

#[async_trait]
impl CacheConnector for SharedStorageConnector {
    fn backend(&self) -> &'static str {
        "shared_storage"
    }

    async fn publish(
        &self,
        id: &CorrelationId,
        role: StageRole,
        payload: Bytes,
    ) -> Result<CacheHandle, CacheError> {
        let reference = CacheReference::new(id, role);
        let artifact = CacheArtifact::new(reference.clone(), payload)?;
        let encoded = encode_artifact(&artifact)?;

        let path = self.artifact_path(id, role);
        let dir = path.parent().unwrap_or(self.root.as_path()).to_path_buf();
        fs::create_dir_all(&dir).await?;

        let tmp = dir.join(format!(".{}.{}.{}", role, Uuid::new_v4().simple(), TMP_EXT));
        fs::write(&tmp, &encoded).await?;
        if let Err(e) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        // A republish supersedes any copy a single-read fetch kept around
        self.consumed.remove(&reference);

        debug!(
            "Published {} ({} bytes) to {}",
            reference,
            artifact.payload.len(),
            path.display()
        );
        Ok(CacheHandle {
            reference,
            location: CacheLocation::Path(path),
            len: artifact.payload.len(),
        })
    }

    async fn fetch(
        &self,
        id: &CorrelationId,
        role: StageRole,
    ) -> Result<CacheArtifact, CacheError> {
        let reference = CacheReference::new(id, role);
        if let Some(artifact) = self.consumed.get(&reference) {
            return Ok(artifact.clone());
        }

        let path = self.artifact_path(id, role);
        let raw = match fs::read(&path).await {
            Ok(raw) => Bytes::from(raw),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CacheError::NotFound(reference));
            }
            Err(e) => return Err(e.into()),
        };

        let artifact = decode_artifact(&reference, raw)?;
        if self.is_expired(artifact.created_at) {
            return Err(CacheError::NotFound(reference));
        }

        if self.single_read {
            self.consumed.insert(reference, artifact.clone());
            if let Err(e) = fs::remove_file(&path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to remove consumed artifact {}: {}", path.display(), e);
                }
            }
        }
        Ok(artifact)
    }

    async fn release(&self, id: &CorrelationId, role: StageRole) -> Result<(), CacheError> {
        self.consumed.remove(&CacheReference::new(id, role));

        let path = self.artifact_path(id, role);
        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        if let Some(parent) = path.parent() {
            let _ = fs::remove_dir(parent).await;
        }
        Ok(())
    }
}
