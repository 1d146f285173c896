//! Readiness Gate
//!
//! Stage endpoints are admitted by probing their chat endpoint with a minimal
//! request at a fixed interval. The proxy only binds its listener once every
//! configured endpoint has answered; an endpoint that stays silent past the
//! deadline is marked unreachable and startup fails.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::registry::{EndpointRegistry, Liveness, StageEndpoint};
use crate::client::{stage_url, ChatCompletionRequest, Message};
use crate::context::StageRole;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Upper bound on a single probe request
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum ReadinessError {
    #[error("{role} stage at {endpoint} not ready after {}s", .waited.as_secs())]
    StageUnreachable {
        role: StageRole,
        endpoint: String,
        waited: Duration,
    },

    #[error("shutdown requested while waiting for stages")]
    Cancelled,

    #[error("failed to build probe client: {0}")]
    Client(String),
}

/// Result of a single probe
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeResult {
    pub ready: bool,
    pub status_code: Option<u16>,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ============================================================================
// SBIO: Pure functions (no I/O)
// ============================================================================

/// Minimal chat request a stage can answer as soon as its engine is loaded
pub fn probe_request(model: &str) -> ChatCompletionRequest {
    let mut request = ChatCompletionRequest::new(model, vec![Message::user("ping")]);
    request.max_tokens = Some(1);
    request
}

/// Any answer short of a server error means the engine is serving.
pub fn is_ready_status(status: u16) -> bool {
    status < 500
}

// ============================================================================
// SBIO: I/O implementation
// ============================================================================

pub struct ReadinessGate {
    client: Client,
    probe: ChatCompletionRequest,
    poll_interval: Duration,
}

impl ReadinessGate {
    pub fn new(model: &str, poll_interval: Duration) -> Result<Self, ReadinessError> {
        Self::with_probe_timeout(model, poll_interval, DEFAULT_PROBE_TIMEOUT)
    }

    pub fn with_probe_timeout(
        model: &str,
        poll_interval: Duration,
        probe_timeout: Duration,
    ) -> Result<Self, ReadinessError> {
        let client = Client::builder()
            .timeout(probe_timeout)
            .build()
            .map_err(|e| ReadinessError::Client(e.to_string()))?;
        Ok(Self {
            client,
            probe: probe_request(model),
            poll_interval,
        })
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Probe one endpoint once
    pub async fn probe(&self, base_url: &str) -> ProbeResult {
        let start = Instant::now();
        let result = self
            .client
            .post(stage_url(base_url))
            .json(&self.probe)
            .send()
            .await;
        let latency_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(response) => {
                let status = response.status().as_u16();
                ProbeResult {
                    ready: is_ready_status(status),
                    status_code: Some(status),
                    latency_ms,
                    error: None,
                }
            }
            Err(e) => ProbeResult {
                ready: false,
                status_code: None,
                latency_ms,
                error: Some(e.to_string()),
            },
        }
    }

    /// Poll `endpoint` until it answers or `deadline` passes.
    pub async fn wait_ready(
        &self,
        endpoint: &StageEndpoint,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), ReadinessError> {
        let start = Instant::now();
        let mut attempts = 0u32;

        let poll = async {
            loop {
                attempts += 1;
                let result = self.probe(endpoint.url()).await;
                if result.ready {
                    return;
                }
                debug!(
                    "{} stage {} not ready (attempt {}): {}",
                    endpoint.role(),
                    endpoint.url(),
                    attempts,
                    result
                        .error
                        .or(result.status_code.map(|s| format!("status {}", s)))
                        .unwrap_or_default()
                );
                tokio::time::sleep(self.poll_interval).await;
            }
        };

        tokio::select! {
            outcome = tokio::time::timeout(deadline, poll) => match outcome {
                Ok(()) => {
                    endpoint.set_liveness(Liveness::Ready);
                    info!(
                        "{} stage {} ready after {:.1}s",
                        endpoint.role(),
                        endpoint.url(),
                        start.elapsed().as_secs_f64()
                    );
                    Ok(())
                }
                Err(_) => {
                    endpoint.set_liveness(Liveness::Unreachable);
                    warn!(
                        "{} stage {} did not become ready within {}s",
                        endpoint.role(),
                        endpoint.url(),
                        deadline.as_secs()
                    );
                    Err(ReadinessError::StageUnreachable {
                        role: endpoint.role(),
                        endpoint: endpoint.url().to_string(),
                        waited: deadline,
                    })
                }
            },
            _ = cancel.cancelled() => Err(ReadinessError::Cancelled),
        }
    }

    /// Gate every configured endpoint concurrently under one deadline.
    pub async fn gate_all(
        &self,
        registry: &EndpointRegistry,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), ReadinessError> {
        let endpoints: Vec<&Arc<StageEndpoint>> = registry.all().collect();
        info!(
            "Waiting up to {}s for {} stage endpoint(s)",
            deadline.as_secs(),
            endpoints.len()
        );

        let results = join_all(
            endpoints
                .iter()
                .map(|endpoint| self.wait_ready(endpoint, deadline, cancel)),
        )
        .await;

        results.into_iter().collect::<Result<Vec<()>, _>>()?;
        Ok(())
    }

    /// Re-probe every endpoint once
    pub async fn recheck(&self, registry: &EndpointRegistry) {
        let endpoints: Vec<&Arc<StageEndpoint>> = registry.all().collect();
        let results = join_all(endpoints.iter().map(|e| self.probe(e.url()))).await;

        for (endpoint, result) in endpoints.iter().zip(results) {
            let next = if result.ready {
                Liveness::Ready
            } else {
                Liveness::Unreachable
            };
            let previous = endpoint.set_liveness(next);
            if previous != next {
                warn!(
                    "{} stage {} is now {:?} (was {:?})",
                    endpoint.role(),
                    endpoint.url(),
                    next,
                    previous
                );
            }
        }
    }

    /// Run [`recheck`](Self::recheck) every `interval` until `cancel` fires.
    pub fn spawn_recheck(
        self: Arc<Self>,
        registry: Arc<EndpointRegistry>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // interval fires immediately; startup gating already covered that
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.recheck(&registry).await,
                    _ = cancel.cancelled() => {
                        debug!("Readiness re-check stopped");
                        break;
                    }
                }
            }
        })
    }
}
