//! Incremental relay of the decode stage's stream to the client

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::future::FutureExt;
use futures::stream::{BoxStream, Stream, StreamExt};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::{debug, info, warn};

use super::registry::OutstandingGuard;
use crate::cache::{CacheConnector, SharedStorageConnector};
use crate::client::ClientError;
use crate::context::{CorrelationId, RequestContext, StageRole};
use crate::error::ProxyError;

/// Release, in the background, the shared-storage artifacts `producers`
/// may have published for `id`. Releasing an absent artifact is a no-op.
pub fn spawn_release(
    storage: Arc<SharedStorageConnector>,
    id: CorrelationId,
    producers: Vec<StageRole>,
) {
    if producers.is_empty() {
        return;
    }
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        warn!("No runtime to release artifacts of {}", id);
        return;
    };
    handle.spawn(async move {
        for role in producers {
            if let Err(e) = storage.release(&id, role).await {
                debug!("Cleanup of {}/{} skipped: {}", id, role, e);
            }
        }
    });
}

/// Logs a client disconnect if dropped while still armed.
///
/// Handler futures are dropped when the client goes away, so this is the only
/// place a disconnect during a buffered stage call becomes visible. With
/// cleanup attached, the request's artifacts are released from here too.
pub struct DisconnectWatch {
    correlation_id: CorrelationId,
    armed: bool,
    cleanup: Option<(Arc<SharedStorageConnector>, Vec<StageRole>)>,
}

impl DisconnectWatch {
    pub fn new(correlation_id: &CorrelationId) -> Self {
        Self {
            correlation_id: correlation_id.clone(),
            armed: true,
            cleanup: None,
        }
    }

    pub fn with_cleanup(
        mut self,
        storage: Option<Arc<SharedStorageConnector>>,
        producers: Vec<StageRole>,
    ) -> Self {
        self.cleanup = storage.map(|storage| (storage, producers));
        self
    }

    pub fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for DisconnectWatch {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        info!(
            "{}",
            ProxyError::ClientDisconnect {
                correlation_id: self.correlation_id.clone(),
            }
        );
        if let Some((storage, producers)) = self.cleanup.take() {
            spawn_release(storage, self.correlation_id.clone(), producers);
        }
    }
}

/// Body stream handed to the client for a streaming request.
///
/// Owns the request context and the decode endpoint's outstanding slot, so
/// both live exactly as long as the relay. Chunks pass through unmodified and
/// in arrival order.
pub struct RelayStream {
    inner: BoxStream<'static, Result<Bytes, ClientError>>,
    ctx: RequestContext,
    _outstanding: Option<OutstandingGuard>,
    shutdown: Pin<Box<WaitForCancellationFutureOwned>>,
    relayed: usize,
    done: bool,
}

impl RelayStream {
    pub fn new(
        inner: BoxStream<'static, Result<Bytes, ClientError>>,
        ctx: RequestContext,
        outstanding: Option<OutstandingGuard>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            inner,
            ctx,
            _outstanding: outstanding,
            shutdown: Box::pin(shutdown.cancelled_owned()),
            relayed: 0,
            done: false,
        }
    }

    pub fn correlation_id(&self) -> &CorrelationId {
        self.ctx.correlation_id()
    }

    fn finish(&mut self) {
        self.done = true;
        match self.ctx.complete() {
            Ok(()) => info!(
                "Request {} completed ({} bytes streamed)",
                self.ctx.correlation_id(),
                self.relayed
            ),
            Err(e) => warn!("{}", e),
        }
    }

    fn abort(&mut self, reason: &str) {
        self.done = true;
        self.ctx.fail();
        warn!(
            "Stream for {} ended early: {}",
            self.ctx.correlation_id(),
            reason
        );
    }
}

impl Stream for RelayStream {
    type Item = Result<Bytes, ClientError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }

        if this.shutdown.poll_unpin(cx).is_ready() {
            this.abort("proxy shutting down");
            return Poll::Ready(None);
        }

        match this.inner.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.relayed += chunk.len();
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.abort(&e.to_string());
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.finish();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for RelayStream {
    fn drop(&mut self) {
        if !self.done {
            self.ctx.fail();
            info!(
                "{}",
                ProxyError::ClientDisconnect {
                    correlation_id: self.ctx.correlation_id().clone(),
                }
            );
            debug!("{} bytes relayed before disconnect", self.relayed);
        }
    }
}
