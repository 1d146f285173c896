use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use reqwest::header::CONTENT_TYPE;
use thiserror::Error;

use super::openai::ChatCompletionRequest;
use crate::context::{CorrelationId, CORRELATION_HEADER};

pub const CHAT_COMPLETIONS_PATH: &str = "/v1/chat/completions";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClientError {
    #[error("connection to {url} failed: {message}")]
    Connect { url: String, message: String },

    #[error("request to {url} timed out")]
    Timeout { url: String },

    #[error("HTTP error: {0}")]
    Http(String),
}

impl ClientError {
    /// Whether the failure says nothing reached the stage at all
    pub fn is_unreachable(&self) -> bool {
        matches!(self, ClientError::Connect { .. } | ClientError::Timeout { .. })
    }
}

pub enum StageBody {
    Full(Bytes),
    Stream(BoxStream<'static, Result<Bytes, ClientError>>),
}

/// What a stage answered, with the body either buffered or still in flight
pub struct StageReply {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: StageBody,
}

impl StageReply {
    pub fn full(status: u16, content_type: Option<&str>, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            content_type: content_type.map(str::to_string),
            body: StageBody::Full(body.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Drain the body, whether it was streamed or not.
    pub async fn into_bytes(self) -> Result<Bytes, ClientError> {
        match self.body {
            StageBody::Full(bytes) => Ok(bytes),
            StageBody::Stream(stream) => {
                let chunks: Vec<Bytes> = stream.try_collect().await?;
                Ok(chunks.concat().into())
            }
        }
    }
}

pub fn stage_url(base_url: &str) -> String {
    format!("{}{}", base_url.trim_end_matches('/'), CHAT_COMPLETIONS_PATH)
}

// ============================================================================
// SBIO: Trait for abstraction (allows mocking in tests)
// ============================================================================

#[async_trait]
pub trait StageClient: Send + Sync {
    /// Forward `request` to the stage at `base_url`, tagged with `correlation_id`.
    async fn send(
        &self,
        base_url: &str,
        correlation_id: &CorrelationId,
        request: &ChatCompletionRequest,
    ) -> Result<StageReply, ClientError>;
}

// ============================================================================
// SBIO: I/O implementation (real HTTP client)
// ============================================================================

#[derive(Clone)]
pub struct HttpStageClient {
    client: reqwest::Client,
}

impl HttpStageClient {
    /// Only the connect phase is bounded here; whole-call deadlines belong to
    /// the router since a streamed body may legitimately run long.
    pub fn new(connect_timeout: Duration) -> Result<Self, ClientError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| ClientError::Http(e.to_string()))?;
        Ok(Self { client })
    }
}

fn map_reqwest_error(url: &str, e: reqwest::Error) -> ClientError {
    if e.is_connect() {
        ClientError::Connect {
            url: url.to_string(),
            message: e.to_string(),
        }
    } else if e.is_timeout() {
        ClientError::Timeout {
            url: url.to_string(),
        }
    } else {
        ClientError::Http(e.to_string())
    }
}

#[async_trait]
impl StageClient for HttpStageClient {
    async fn send(
        &self,
        base_url: &str,
        correlation_id: &CorrelationId,
        request: &ChatCompletionRequest,
    ) -> Result<StageReply, ClientError> {
        let url = stage_url(base_url);

        let response = self
            .client
            .post(&url)
            .header(CORRELATION_HEADER, correlation_id.as_str())
            .json(request)
            .send()
            .await
            .map_err(|e| map_reqwest_error(&url, e))?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let body = if request.stream && (200..300).contains(&status) {
            let stream_url = url.clone();
            StageBody::Stream(
                response
                    .bytes_stream()
                    .map_err(move |e| map_reqwest_error(&stream_url, e))
                    .boxed(),
            )
        } else {
            StageBody::Full(
                response
                    .bytes()
                    .await
                    .map_err(|e| map_reqwest_error(&url, e))?,
            )
        };

        Ok(StageReply {
            status,
            content_type,
            body,
        })
    }
}

// ============================================================================
// SBIO: Mock implementation for testing (no I/O)
// ============================================================================
