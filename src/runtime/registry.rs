//! Stage endpoints known to the router, with liveness and load counters

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::config::{SelectionPolicy, StageTopology};
use crate::context::StageRole;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Liveness {
    Unknown,
    Ready,
    Unreachable,
}

impl Liveness {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Liveness::Ready,
            2 => Liveness::Unreachable,
            _ => Liveness::Unknown,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Liveness::Unknown => 0,
            Liveness::Ready => 1,
            Liveness::Unreachable => 2,
        }
    }
}

/// One stage service the router may forward to
#[derive(Debug)]
pub struct StageEndpoint {
    url: String,
    role: StageRole,
    liveness: AtomicU8,
    outstanding: AtomicUsize,
}

impl StageEndpoint {
    pub fn new(role: StageRole, url: impl Into<String>) -> Self {
        Self {
            url: url.into().trim_end_matches('/').to_string(),
            role,
            liveness: AtomicU8::new(Liveness::Unknown.as_u8()),
            outstanding: AtomicUsize::new(0),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn role(&self) -> StageRole {
        self.role
    }

    pub fn liveness(&self) -> Liveness {
        Liveness::from_u8(self.liveness.load(Ordering::Acquire))
    }

    /// Returns the previous value.
    pub fn set_liveness(&self, liveness: Liveness) -> Liveness {
        Liveness::from_u8(self.liveness.swap(liveness.as_u8(), Ordering::AcqRel))
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Count a call against this endpoint until the guard drops.
    pub fn begin(self: &Arc<Self>) -> OutstandingGuard {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        OutstandingGuard {
            endpoint: self.clone(),
        }
    }
}

#[derive(Debug)]
pub struct OutstandingGuard {
    endpoint: Arc<StageEndpoint>,
}

impl OutstandingGuard {
    pub fn endpoint(&self) -> &Arc<StageEndpoint> {
        &self.endpoint
    }
}

impl Drop for OutstandingGuard {
    fn drop(&mut self) {
        self.endpoint.outstanding.fetch_sub(1, Ordering::AcqRel);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EndpointSnapshot {
    pub url: String,
    pub role: StageRole,
    pub liveness: Liveness,
    pub outstanding: usize,
}

#[derive(Debug, Default)]
struct RolePool {
    endpoints: Vec<Arc<StageEndpoint>>,
    next: AtomicUsize,
}

/// Endpoints per role, in configuration order
#[derive(Debug, Default)]
pub struct EndpointRegistry {
    encode: RolePool,
    prefill: RolePool,
    decode: RolePool,
    /// Prefill URL -> decode endpoint receiving its KV
    pairs: HashMap<String, Arc<StageEndpoint>>,
}

impl EndpointRegistry {
    pub fn from_topology(topology: &StageTopology) -> Self {
        let pool = |role: StageRole| RolePool {
            endpoints: topology
                .endpoints(role)
                .iter()
                .map(|url| Arc::new(StageEndpoint::new(role, url.as_str())))
                .collect(),
            next: AtomicUsize::new(0),
        };
        let mut registry = Self {
            encode: pool(StageRole::Encode),
            prefill: pool(StageRole::Prefill),
            decode: pool(StageRole::Decode),
            pairs: HashMap::new(),
        };

        for (prefill, decode) in &topology.pairs {
            let prefill = registry.find(StageRole::Prefill, prefill).cloned();
            let decode = registry.find(StageRole::Decode, decode).cloned();
            if let (Some(prefill), Some(decode)) = (prefill, decode) {
                registry.pairs.insert(prefill.url().to_string(), decode);
            }
        }
        registry
    }

    fn pool(&self, role: StageRole) -> &RolePool {
        match role {
            StageRole::Encode => &self.encode,
            StageRole::Prefill => &self.prefill,
            StageRole::Decode => &self.decode,
        }
    }

    pub fn endpoints(&self, role: StageRole) -> &[Arc<StageEndpoint>] {
        &self.pool(role).endpoints
    }

    pub fn all(&self) -> impl Iterator<Item = &Arc<StageEndpoint>> {
        StageRole::ALL
            .into_iter()
            .flat_map(move |role| self.endpoints(role).iter())
    }

    pub fn find(&self, role: StageRole, url: &str) -> Option<&Arc<StageEndpoint>> {
        let url = url.trim_end_matches('/');
        self.endpoints(role).iter().find(|e| e.url() == url)
    }

    /// Decode endpoint paired with `prefill`, if the topology pins one
    pub fn paired_decode(&self, prefill: &StageEndpoint) -> Option<&Arc<StageEndpoint>> {
        if prefill.role() != StageRole::Prefill {
            return None;
        }
        self.pairs.get(prefill.url())
    }

    /// Pick the endpoint for the next hop of a request. Decode follows the
    /// pairing of the prefill endpoint the request just used, whatever its
    /// liveness, since only that endpoint holds the KV.
    pub fn select_after(
        &self,
        role: StageRole,
        policy: SelectionPolicy,
        previous: Option<&StageEndpoint>,
    ) -> Option<Arc<StageEndpoint>> {
        if role == StageRole::Decode {
            if let Some(paired) = previous.and_then(|p| self.paired_decode(p)) {
                return Some(paired.clone());
            }
        }
        self.select(role, policy)
    }

    /// Pick an endpoint of `role`, skipping those marked unreachable. When
    /// every endpoint is marked, all of them are candidates again: a
    /// restarted stage is only noticed by forwarding to it.
    pub fn select(&self, role: StageRole, policy: SelectionPolicy) -> Option<Arc<StageEndpoint>> {
        let pool = self.pool(role);
        let mut eligible: Vec<&Arc<StageEndpoint>> = pool
            .endpoints
            .iter()
            .filter(|e| e.liveness() != Liveness::Unreachable)
            .collect();
        if eligible.is_empty() {
            eligible = pool.endpoints.iter().collect();
        }
        if eligible.is_empty() {
            return None;
        }

        let chosen = match policy {
            SelectionPolicy::RoundRobin => {
                let n = pool.next.fetch_add(1, Ordering::Relaxed);
                eligible[n % eligible.len()]
            }
            // min_by_key keeps the first of equal keys, i.e. configuration order
            SelectionPolicy::LeastOutstanding => eligible
                .iter()
                .copied()
                .min_by_key(|e| e.outstanding())
                .unwrap_or(eligible[0]),
        };
        Some(chosen.clone())
    }

    pub fn snapshot(&self) -> Vec<EndpointSnapshot> {
        self.all()
            .map(|e| EndpointSnapshot {
                url: e.url().to_string(),
                role: e.role(),
                liveness: e.liveness(),
                outstanding: e.outstanding(),
            })
            .collect()
    }
}
