//! Correlation context threaded through every stage hop
//!
//! A request is identified by a [`CorrelationId`] minted at the proxy. The
//! same identifier travels in the [`CORRELATION_HEADER`] to each stage and
//! keys every cache artifact produced for the request.

pub mod correlation;
pub mod inflight;
pub mod request;
pub mod role;

pub use correlation::{CorrelationId, CorrelationIdError, CORRELATION_HEADER};
pub use inflight::{InFlightEntry, InFlightGuard, InFlightTable};
pub use request::{RequestContext, RequestState, StageHop, TransitionError};
pub use role::StageRole;
