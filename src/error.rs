//! Client-visible error taxonomy of the proxy

use axum::{
    http::{header::HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::context::{CorrelationId, StageRole, CORRELATION_HEADER};

/// Non-standard status used when the client went away before the response
pub const CLIENT_CLOSED_REQUEST: u16 = 499;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProxyError {
    #[error("{role} stage unreachable{}: {reason}", at(.endpoint))]
    StageUnreachable {
        role: StageRole,
        endpoint: Option<String>,
        reason: String,
    },

    #[error("{role} stage found no cache artifact for {correlation_id}")]
    CacheMiss {
        role: StageRole,
        correlation_id: CorrelationId,
    },

    #[error("{role} stage already published an artifact for {correlation_id}")]
    CachePublishConflict {
        role: StageRole,
        correlation_id: CorrelationId,
    },

    #[error("{role} stage returned {status}: {message}")]
    UpstreamError {
        role: StageRole,
        status: u16,
        message: String,
    },

    #[error("client disconnected from {correlation_id}")]
    ClientDisconnect { correlation_id: CorrelationId },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("proxy is shutting down")]
    ShuttingDown,
}

fn at(endpoint: &Option<String>) -> String {
    endpoint
        .as_ref()
        .map(|e| format!(" at {}", e))
        .unwrap_or_default()
}

impl ProxyError {
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::StageUnreachable { .. } => "stage_unreachable",
            ProxyError::CacheMiss { .. } => "cache_miss",
            ProxyError::CachePublishConflict { .. } => "cache_publish_conflict",
            ProxyError::UpstreamError { .. } => "upstream_error",
            ProxyError::ClientDisconnect { .. } => "client_disconnect",
            ProxyError::InvalidRequest(_) => "invalid_request",
            ProxyError::ShuttingDown => "shutting_down",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::StageUnreachable { .. } | ProxyError::ShuttingDown => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ProxyError::CacheMiss { .. } | ProxyError::UpstreamError { .. } => {
                StatusCode::BAD_GATEWAY
            }
            ProxyError::CachePublishConflict { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::ClientDisconnect { .. } => {
                StatusCode::from_u16(CLIENT_CLOSED_REQUEST).unwrap_or(StatusCode::BAD_REQUEST)
            }
            ProxyError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    /// Stage the failure is attributed to, if any
    pub fn stage(&self) -> Option<StageRole> {
        match self {
            ProxyError::StageUnreachable { role, .. }
            | ProxyError::CacheMiss { role, .. }
            | ProxyError::CachePublishConflict { role, .. }
            | ProxyError::UpstreamError { role, .. } => Some(*role),
            _ => None,
        }
    }

    /// Classify a non-success stage reply by the `kind` in its error body.
    pub fn from_stage_reply(
        role: StageRole,
        correlation_id: &CorrelationId,
        status: u16,
        body: &[u8],
    ) -> Self {
        let detail = ErrorBody::parse(body);
        match detail.as_ref().map(|d| d.kind.as_str()) {
            Some("cache_miss") => ProxyError::CacheMiss {
                role,
                correlation_id: correlation_id.clone(),
            },
            Some("cache_publish_conflict") => ProxyError::CachePublishConflict {
                role,
                correlation_id: correlation_id.clone(),
            },
            _ => {
                let message = match detail {
                    Some(d) => d.message,
                    None => String::from_utf8_lossy(body).chars().take(512).collect(),
                };
                ProxyError::UpstreamError {
                    role,
                    status,
                    message,
                }
            }
        }
    }

    pub fn body(&self, correlation_id: Option<&CorrelationId>) -> ErrorBody {
        ErrorBody::new(self.to_string(), self.kind(), self.stage(), correlation_id)
    }

    /// Render as a JSON response tagged with the request's correlation id
    pub fn into_response_for(self, correlation_id: Option<&CorrelationId>) -> Response {
        let mut response = (self.status_code(), Json(self.body(correlation_id))).into_response();
        if let Some(id) = correlation_id {
            if let Ok(value) = HeaderValue::from_str(id.as_str()) {
                response.headers_mut().insert(CORRELATION_HEADER, value);
            }
        }
        response
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        self.into_response_for(None)
    }
}

/// JSON error envelope shared by the proxy and the stage servers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub message: String,
    #[serde(rename = "type")]
    pub error_type: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<StageRole>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl ErrorBody {
    pub fn new(
        message: impl Into<String>,
        kind: &str,
        stage: Option<StageRole>,
        correlation_id: Option<&CorrelationId>,
    ) -> Self {
        Self {
            error: ErrorDetail {
                message: message.into(),
                error_type: kind.to_string(),
                kind: kind.to_string(),
                stage,
                correlation_id: correlation_id.map(|id| id.to_string()),
            },
        }
    }

    /// Parse an error body, tolerating anything that is not one.
    pub fn parse(body: &[u8]) -> Option<ErrorDetail> {
        serde_json::from_slice::<ErrorBody>(body)
            .ok()
            .map(|b| b.error)
    }
}
