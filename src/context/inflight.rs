use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;

use super::correlation::CorrelationId;
use super::request::RequestState;
use super::role::StageRole;

/// Snapshot of a live request, kept for observability only
#[derive(Debug, Clone, Serialize)]
pub struct InFlightEntry {
    pub state: RequestState,
    pub plan: Vec<StageRole>,
    pub started_at: DateTime<Utc>,
}

/// Table of requests currently owned by a routing task.
///
/// Entries are removed when their [`InFlightGuard`] drops, which also covers
/// handler futures cancelled by a client disconnect.
#[derive(Debug, Clone, Default)]
pub struct InFlightTable {
    entries: Arc<DashMap<CorrelationId, InFlightEntry>>,
}

impl InFlightTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `id` for a new request. Returns `None` if it is already live.
    pub fn register(&self, id: &CorrelationId, plan: &[StageRole]) -> Option<InFlightGuard> {
        match self.entries.entry(id.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(InFlightEntry {
                    state: RequestState::Received,
                    plan: plan.to_vec(),
                    started_at: Utc::now(),
                });
                Some(InFlightGuard {
                    entries: self.entries.clone(),
                    id: id.clone(),
                })
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: &CorrelationId) -> Option<InFlightEntry> {
        self.entries.get(id).map(|e| e.clone())
    }

    pub fn snapshot(&self) -> Vec<(CorrelationId, InFlightEntry)> {
        self.entries
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }
}

#[derive(Debug)]
pub struct InFlightGuard {
    entries: Arc<DashMap<CorrelationId, InFlightEntry>>,
    id: CorrelationId,
}

impl InFlightGuard {
    pub fn id(&self) -> &CorrelationId {
        &self.id
    }

    pub fn set_state(&self, state: RequestState) {
        if let Some(mut entry) = self.entries.get_mut(&self.id) {
            entry.state = state;
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.entries.remove(&self.id);
    }
}
