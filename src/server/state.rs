use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::cache::{CacheError, SharedStorageConnector};
use crate::client::{ClientError, HttpStageClient, StageClient};
use crate::config::ProxyConfig;
use crate::context::InFlightTable;
use crate::runtime::{EndpointRegistry, StageRouter};

#[derive(Error, Debug)]
pub enum StateError {
    #[error("stage client: {0}")]
    Client(#[from] ClientError),

    #[error("cleanup storage: {0}")]
    Cache(#[from] CacheError),
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ProxyConfig>,
    pub router: Arc<StageRouter>,
    pub inflight: InFlightTable,
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Build the state with a caller-supplied stage client
    pub fn new(
        config: ProxyConfig,
        client: Arc<dyn StageClient>,
        shutdown: CancellationToken,
    ) -> Self {
        let registry = Arc::new(EndpointRegistry::from_topology(&config.stages));
        let router = StageRouter::new(client, registry, &config.routing, shutdown.clone());
        Self::with_router(config, router, shutdown)
    }

    pub fn with_router(
        config: ProxyConfig,
        router: StageRouter,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config: Arc::new(config),
            router: Arc::new(router),
            inflight: InFlightTable::new(),
            shutdown,
        }
    }

    /// Build the production state: HTTP stage client, plus shared-storage
    /// cleanup when the proxy can reach the storage root.
    pub fn from_config(config: ProxyConfig, shutdown: CancellationToken) -> Result<Self, StateError> {
        let client = HttpStageClient::new(Duration::from_millis(config.routing.connect_timeout_ms))?;
        let registry = Arc::new(EndpointRegistry::from_topology(&config.stages));
        let mut router =
            StageRouter::new(Arc::new(client), registry, &config.routing, shutdown.clone());

        if let Some(storage) = &config.cache.shared_storage {
            router = router.with_cleanup(Arc::new(SharedStorageConnector::new(storage)?));
        }

        Ok(Self::with_router(config, router, shutdown))
    }

    pub fn registry(&self) -> &Arc<EndpointRegistry> {
        self.router.registry()
    }

    /// Get active request count
    pub fn active_request_count(&self) -> usize {
        self.inflight.len()
    }
}
