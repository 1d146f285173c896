use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use super::correlation::CorrelationId;
use super::inflight::InFlightGuard;
use super::role::StageRole;
use crate::cache::CacheReference;
use crate::client::ChatCompletionRequest;

/// Lifecycle of one client request inside the proxy.
///
/// `Received → (Encoding) → Prefilling → Decoding → Completed`, with `Failed`
/// reachable from every non-terminal state. States are never revisited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Received,
    Encoding,
    Prefilling,
    Decoding,
    Completed,
    Failed,
}

impl RequestState {
    pub fn for_stage(role: StageRole) -> Self {
        match role {
            StageRole::Encode => RequestState::Encoding,
            StageRole::Prefill => RequestState::Prefilling,
            StageRole::Decode => RequestState::Decoding,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestState::Completed | RequestState::Failed)
    }

    fn rank(&self) -> u8 {
        match self {
            RequestState::Received => 0,
            RequestState::Encoding => 1,
            RequestState::Prefilling => 2,
            RequestState::Decoding => 3,
            RequestState::Completed => 4,
            RequestState::Failed => 5,
        }
    }
}

#[derive(Error, Debug, PartialEq)]
#[error("request {correlation_id} cannot move from {from:?} to {to:?}")]
pub struct TransitionError {
    pub correlation_id: CorrelationId,
    pub from: RequestState,
    pub to: RequestState,
}

/// A single stage visit recorded on the request
#[derive(Debug, Clone, Serialize)]
pub struct StageHop {
    pub role: StageRole,
    pub endpoint: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: Option<u16>,
}

/// Per-request state owned by the routing task for the request's lifetime.
#[derive(Debug)]
pub struct RequestContext {
    correlation_id: CorrelationId,
    request: ChatCompletionRequest,
    remaining: VecDeque<StageRole>,
    trace: Vec<StageHop>,
    artifacts: Vec<CacheReference>,
    state: RequestState,
    start_time: DateTime<Utc>,
    tracker: Option<InFlightGuard>,
}

impl RequestContext {
    pub fn new(
        correlation_id: CorrelationId,
        request: ChatCompletionRequest,
        stages: impl IntoIterator<Item = StageRole>,
    ) -> Self {
        Self {
            correlation_id,
            request,
            remaining: stages.into_iter().collect(),
            trace: Vec::new(),
            artifacts: Vec::new(),
            state: RequestState::Received,
            start_time: Utc::now(),
            tracker: None,
        }
    }

    /// Mirror state changes into the shared in-flight table.
    pub fn with_tracker(mut self, tracker: InFlightGuard) -> Self {
        tracker.set_state(self.state);
        self.tracker = Some(tracker);
        self
    }

    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    pub fn request(&self) -> &ChatCompletionRequest {
        &self.request
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    pub fn trace(&self) -> &[StageHop] {
        &self.trace
    }

    pub fn remaining(&self) -> impl Iterator<Item = &StageRole> {
        self.remaining.iter()
    }

    /// Artifacts published so far, oldest first
    pub fn artifacts(&self) -> &[CacheReference] {
        &self.artifacts
    }

    /// Reference the next stage should use to recover its input artifact
    pub fn handoff(&self) -> Option<&CacheReference> {
        self.artifacts.last()
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    /// Pop the next planned stage and enter its state.
    pub fn advance(&mut self) -> Result<Option<StageRole>, TransitionError> {
        let Some(role) = self.remaining.pop_front() else {
            return Ok(None);
        };
        self.transition(RequestState::for_stage(role))?;
        Ok(Some(role))
    }

    pub fn begin_hop(&mut self, role: StageRole, endpoint: &str) {
        self.trace.push(StageHop {
            role,
            endpoint: endpoint.to_string(),
            started_at: Utc::now(),
            finished_at: None,
            status: None,
        });
    }

    /// Close the current hop; a producing stage leaves a reference for its consumer.
    pub fn finish_hop(&mut self, status: u16) {
        let Some(hop) = self.trace.last_mut() else {
            return;
        };
        hop.finished_at = Some(Utc::now());
        hop.status = Some(status);

        let role = hop.role;
        if role.consumer().is_some() && (200..300).contains(&status) {
            self.artifacts.push(CacheReference {
                correlation_id: self.correlation_id.clone(),
                producer: role,
            });
        }
    }

    pub fn complete(&mut self) -> Result<(), TransitionError> {
        self.transition(RequestState::Completed)
    }

    /// Move to `Failed`; no-op once terminal.
    pub fn fail(&mut self) {
        if !self.state.is_terminal() {
            self.set_state(RequestState::Failed);
        }
    }

    fn transition(&mut self, to: RequestState) -> Result<(), TransitionError> {
        let allowed = !self.state.is_terminal()
            && (to == RequestState::Failed || to.rank() > self.state.rank());
        if !allowed {
            return Err(TransitionError {
                correlation_id: self.correlation_id.clone(),
                from: self.state,
                to,
            });
        }
        self.set_state(to);
        Ok(())
    }

    fn set_state(&mut self, state: RequestState) {
        self.state = state;
        if let Some(tracker) = &self.tracker {
            tracker.set_state(state);
        }
    }
}
