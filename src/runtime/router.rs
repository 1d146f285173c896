//! Stage routing
//!
//! Walks a request through its stage plan: one endpoint per stage, strictly in
//! order, each call bounded by its role's deadline. The first failure ends the
//! request; later stages are never called and nothing is retried.

use std::sync::Arc;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::plan::stage_payload;
use super::registry::{EndpointRegistry, Liveness, OutstandingGuard, StageEndpoint};
use super::relay::{spawn_release, DisconnectWatch, RelayStream};
use crate::cache::SharedStorageConnector;
use crate::client::{ClientError, StageBody, StageClient, StageReply};
use crate::config::{RoutingConfig, SelectionPolicy, StageTimeouts};
use crate::context::{RequestContext, StageRole};
use crate::error::ProxyError;

/// What the client receives once every stage succeeded
pub enum ProxyResponse {
    /// Decode's buffered reply, relayed verbatim
    Full {
        status: u16,
        content_type: Option<String>,
        body: Bytes,
    },
    Stream(RelayStream),
}

pub struct StageRouter {
    client: Arc<dyn StageClient>,
    registry: Arc<EndpointRegistry>,
    policy: SelectionPolicy,
    timeouts: StageTimeouts,
    cleanup: Option<Arc<SharedStorageConnector>>,
    shutdown: CancellationToken,
}

impl StageRouter {
    pub fn new(
        client: Arc<dyn StageClient>,
        registry: Arc<EndpointRegistry>,
        routing: &RoutingConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            client,
            registry,
            policy: routing.policy,
            timeouts: routing.timeouts.clone(),
            cleanup: None,
            shutdown,
        }
    }

    /// Shared storage the proxy can reach to release artifacts of failed requests
    pub fn with_cleanup(mut self, storage: Arc<SharedStorageConnector>) -> Self {
        self.cleanup = Some(storage);
        self
    }

    pub fn registry(&self) -> &Arc<EndpointRegistry> {
        &self.registry
    }

    /// Run every planned stage of `ctx` and produce the client response.
    pub async fn dispatch(&self, mut ctx: RequestContext) -> Result<ProxyResponse, ProxyError> {
        let producers: Vec<StageRole> = ctx
            .remaining()
            .copied()
            .filter(|role| role.consumer().is_some())
            .collect();
        let mut watch =
            DisconnectWatch::new(ctx.correlation_id()).with_cleanup(self.cleanup.clone(), producers);
        let result = self.run(&mut ctx).await;
        watch.disarm();

        match result {
            Ok((reply, outstanding)) => Ok(self.respond(ctx, reply, outstanding)),
            Err(err) => {
                self.abort(&mut ctx, &err);
                Err(err)
            }
        }
    }

    async fn run(
        &self,
        ctx: &mut RequestContext,
    ) -> Result<(StageReply, OutstandingGuard), ProxyError> {
        if self.shutdown.is_cancelled() {
            return Err(ProxyError::ShuttingDown);
        }

        let mut last: Option<(StageReply, OutstandingGuard)> = None;
        while let Some(role) = ctx
            .advance()
            .map_err(|e| ProxyError::InvalidRequest(e.to_string()))?
        {
            let previous = last.take().map(|(_, guard)| guard.endpoint().clone());
            last = Some(self.call_stage(ctx, role, previous.as_deref()).await?);
        }

        last.ok_or_else(|| ProxyError::InvalidRequest("empty stage plan".to_string()))
    }

    async fn call_stage(
        &self,
        ctx: &mut RequestContext,
        role: StageRole,
        previous: Option<&StageEndpoint>,
    ) -> Result<(StageReply, OutstandingGuard), ProxyError> {
        let endpoint = self
            .registry
            .select_after(role, self.policy, previous)
            .ok_or_else(|| ProxyError::StageUnreachable {
                role,
                endpoint: None,
                reason: "no endpoint configured".to_string(),
            })?;
        let outstanding = endpoint.begin();

        let id = ctx.correlation_id().clone();
        let payload = stage_payload(ctx.request(), role, ctx.handoff());
        let deadline = self.timeouts.for_role(role);
        ctx.begin_hop(role, endpoint.url());
        debug!("{} -> {} stage at {}", id, role, endpoint.url());

        let call = async {
            let reply = self.client.send(endpoint.url(), &id, &payload).await?;
            // Only a successful terminal reply may keep streaming past the deadline
            if role.is_terminal() && reply.is_success() {
                return Ok::<_, ClientError>(reply);
            }
            let status = reply.status;
            let content_type = reply.content_type.clone();
            let body = reply.into_bytes().await?;
            Ok(StageReply::full(status, content_type.as_deref(), body))
        };

        let outcome = tokio::select! {
            outcome = tokio::time::timeout(deadline, call) => outcome,
            _ = self.shutdown.cancelled() => return Err(ProxyError::ShuttingDown),
        };

        let reply = match outcome {
            Err(_) => {
                return Err(ProxyError::StageUnreachable {
                    role,
                    endpoint: Some(endpoint.url().to_string()),
                    reason: "deadline exceeded".to_string(),
                })
            }
            Ok(Err(e)) => {
                if matches!(e, ClientError::Connect { .. }) {
                    let previous = endpoint.set_liveness(Liveness::Unreachable);
                    if previous != Liveness::Unreachable {
                        warn!("{} stage {} marked unreachable", role, endpoint.url());
                    }
                }
                return Err(ProxyError::StageUnreachable {
                    role,
                    endpoint: Some(endpoint.url().to_string()),
                    reason: e.to_string(),
                });
            }
            Ok(Ok(reply)) => reply,
        };

        if endpoint.set_liveness(Liveness::Ready) == Liveness::Unreachable {
            info!("{} stage {} is answering again", role, endpoint.url());
        }

        ctx.finish_hop(reply.status);
        if !reply.is_success() {
            let status = reply.status;
            let body = reply.into_bytes().await.unwrap_or_default();
            return Err(ProxyError::from_stage_reply(role, &id, status, &body));
        }

        debug!("{} <- {} stage answered {}", id, role, reply.status);
        Ok((reply, outstanding))
    }

    fn respond(
        &self,
        mut ctx: RequestContext,
        reply: StageReply,
        outstanding: OutstandingGuard,
    ) -> ProxyResponse {
        match reply.body {
            StageBody::Full(body) => {
                if let Err(e) = ctx.complete() {
                    warn!("{}", e);
                }
                info!(
                    "Request {} completed in {}ms via {} stage(s)",
                    ctx.correlation_id(),
                    (chrono::Utc::now() - ctx.start_time()).num_milliseconds(),
                    ctx.trace().len()
                );
                ProxyResponse::Full {
                    status: reply.status,
                    content_type: reply.content_type,
                    body,
                }
            }
            StageBody::Stream(stream) => ProxyResponse::Stream(RelayStream::new(
                stream,
                ctx,
                Some(outstanding),
                self.shutdown.clone(),
            )),
        }
    }

    fn abort(&self, ctx: &mut RequestContext, err: &ProxyError) {
        ctx.fail();
        warn!("Request {} failed: {}", ctx.correlation_id(), err);

        let Some(storage) = self.cleanup.clone() else {
            return;
        };
        let producers: Vec<StageRole> = ctx
            .trace()
            .iter()
            .map(|hop| hop.role)
            .filter(|role| role.consumer().is_some())
            .collect();
        spawn_release(storage, ctx.correlation_id().clone(), producers);
    }
}
