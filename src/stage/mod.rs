//! Reference stage server
//!
//! Implements the stage side of the cache handoff around a pluggable
//! [`StageEngine`]: recover the upstream artifact named in `cache_handoff`,
//! run the engine, publish this stage's artifact, release the consumed one.

pub mod engine;
pub mod server;

pub use engine::{EchoEngine, EncodedMedia, PrefillState, StageEngine, StageOutput};
pub use server::{create_stage_router, StageState};

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::cache::CacheError;
use crate::context::{CorrelationId, StageRole};
use crate::error::ErrorBody;

#[derive(Error, Debug)]
pub enum StageError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("engine failure: {0}")]
    Engine(String),
}

impl StageError {
    pub fn kind(&self) -> &'static str {
        match self {
            StageError::InvalidRequest(_) => "invalid_request",
            StageError::Cache(e) => e.kind(),
            StageError::Engine(_) => "engine_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            StageError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            StageError::Cache(e) => match e {
                CacheError::NotFound(_) => StatusCode::NOT_FOUND,
                CacheError::PublishConflict(_) => StatusCode::CONFLICT,
                CacheError::PeerUnavailable { .. }
                | CacheError::Corrupt { .. }
                | CacheError::Protocol(_) => StatusCode::BAD_GATEWAY,
                CacheError::Unsupported(_) | CacheError::Io(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
            StageError::Engine(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn into_response_for(
        self,
        role: StageRole,
        correlation_id: Option<&CorrelationId>,
    ) -> Response {
        let body = ErrorBody::new(self.to_string(), self.kind(), Some(role), correlation_id);
        (self.status_code(), Json(body)).into_response()
    }
}
