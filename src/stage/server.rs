use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use futures::stream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, info_span, warn, Instrument};

use super::engine::{StageEngine, StageOutput};
use super::StageError;
use crate::cache::{CacheArtifact, CacheConnector, CacheError, Connector};
use crate::client::{
    AssistantMessage, ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, Choice,
    ChunkChoice, Delta, Usage, CHAT_COMPLETIONS_PATH,
};
use crate::config::StageServerConfig;
use crate::context::{CorrelationId, StageRole, CORRELATION_HEADER};

/// Shared state of one stage server
#[derive(Clone)]
pub struct StageState {
    pub role: StageRole,
    pub model: String,
    pub engine: Arc<dyn StageEngine>,
    pub consumes: Option<Arc<Connector>>,
    pub produces: Option<Arc<Connector>>,
}

impl StageState {
    pub fn new(role: StageRole, model: impl Into<String>, engine: Arc<dyn StageEngine>) -> Self {
        Self {
            role,
            model: model.into(),
            engine,
            consumes: None,
            produces: None,
        }
    }

    pub fn consuming(mut self, connector: Connector) -> Self {
        self.consumes = Some(Arc::new(connector));
        self
    }

    pub fn producing(mut self, connector: Connector) -> Self {
        self.produces = Some(Arc::new(connector));
        self
    }

    /// Build connectors from configuration; side-channel listeners bind here.
    pub async fn from_config(
        config: &StageServerConfig,
        engine: Arc<dyn StageEngine>,
    ) -> Result<Self, CacheError> {
        let mut state = Self::new(config.role, config.model.clone(), engine);
        if let Some(consumes) = &config.consumes {
            state = state.consuming(Connector::from_config(consumes).await?);
        }
        if let Some(produces) = &config.produces {
            state = state.producing(Connector::from_config(produces).await?);
        }
        Ok(state)
    }

    /// Periodically evict stale artifacts from every shared-storage connector.
    pub fn spawn_eviction(&self, interval: Duration, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        [&self.consumes, &self.produces]
            .into_iter()
            .flatten()
            .filter(|c| matches!(c.as_ref(), Connector::SharedStorage(_)))
            .map(|connector| {
                let connector = connector.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    let Connector::SharedStorage(storage) = connector.as_ref() else {
                        return;
                    };
                    let mut ticker = tokio::time::interval(interval);
                    loop {
                        tokio::select! {
                            _ = ticker.tick() => match storage.evict().await {
                                Ok(report) if report.removed > 0 => info!(
                                    "Evicted {} artifact(s), {} bytes from {}",
                                    report.removed,
                                    report.reclaimed_bytes,
                                    storage.root().display()
                                ),
                                Ok(_) => {}
                                Err(e) => warn!("Eviction in {} failed: {}", storage.root().display(), e),
                            },
                            _ = cancel.cancelled() => break,
                        }
                    }
                })
            })
            .collect()
    }
}

/// Health check endpoint
pub async fn health() -> impl IntoResponse {
    StatusCode::OK
}

fn correlation_id(headers: &HeaderMap) -> Result<CorrelationId, StageError> {
    let raw = headers
        .get(CORRELATION_HEADER)
        .ok_or_else(|| StageError::InvalidRequest(format!("missing {} header", CORRELATION_HEADER)))?
        .to_str()
        .map_err(|e| StageError::InvalidRequest(e.to_string()))?;
    raw.parse()
        .map_err(|e| StageError::InvalidRequest(format!("bad {} header: {}", CORRELATION_HEADER, e)))
}

async fn run_stage(
    state: &StageState,
    id: &CorrelationId,
    request: &ChatCompletionRequest,
) -> Result<StageOutput, StageError> {
    let role = state.role;

    let upstream: Option<(CacheArtifact, &Arc<Connector>)> = match &request.cache_handoff {
        Some(reference) => {
            if &reference.correlation_id != id {
                return Err(StageError::InvalidRequest(
                    "cache_handoff refers to another request".to_string(),
                ));
            }
            if role.producer() != Some(reference.producer) {
                return Err(StageError::InvalidRequest(format!(
                    "{} stage cannot consume {} artifacts",
                    role, reference.producer
                )));
            }
            let connector = state.consumes.as_ref().ok_or_else(|| {
                StageError::InvalidRequest(format!("{} stage has no cache to consume from", role))
            })?;
            let artifact = connector.fetch(id, reference.producer).await?;
            debug!(
                "Fetched {} ({} bytes) via {}",
                artifact.reference,
                artifact.payload.len(),
                connector.backend()
            );
            Some((artifact, connector))
        }
        None => None,
    };

    let output = state
        .engine
        .run(role, request, upstream.as_ref().map(|(artifact, _)| artifact))
        .await?;

    if let Some(payload) = output.artifact.clone() {
        match &state.produces {
            Some(connector) => {
                let handle = connector.publish(id, role, payload).await?;
                debug!(
                    "Published {} ({} bytes) via {}",
                    handle.reference,
                    handle.len,
                    connector.backend()
                );
            }
            None => debug!("{} stage has no produces connector; artifact dropped", role),
        }
    }

    if let Some((artifact, connector)) = upstream {
        if let Err(e) = connector.release(id, artifact.reference.producer).await {
            warn!("Failed to release {}: {}", artifact.reference, e);
        }
    }

    Ok(output)
}

fn stream_response(completion_id: String, model: String, output: StageOutput) -> Response {
    let created = Utc::now().timestamp();
    let words: Vec<&str> = output.text.split_whitespace().collect();
    let last = words.len().saturating_sub(1);

    let mut events: Vec<Result<Event, Infallible>> = words
        .iter()
        .enumerate()
        .map(|(i, word)| {
            let chunk = ChatCompletionChunk {
                id: completion_id.clone(),
                object: "chat.completion.chunk".to_string(),
                created,
                model: model.clone(),
                choices: vec![ChunkChoice {
                    index: 0,
                    delta: Delta {
                        role: (i == 0).then(|| "assistant".to_string()),
                        content: Some(if i == 0 {
                            word.to_string()
                        } else {
                            format!(" {}", word)
                        }),
                    },
                    finish_reason: (i == last).then(|| "stop".to_string()),
                }],
            };
            Ok(Event::default().data(serde_json::to_string(&chunk).unwrap_or_default()))
        })
        .collect();
    events.push(Ok(Event::default().data("[DONE]")));

    Sse::new(stream::iter(events)).into_response()
}

fn full_response(
    role: StageRole,
    completion_id: String,
    model: String,
    output: StageOutput,
) -> Response {
    let response = ChatCompletionResponse {
        id: completion_id,
        object: "chat.completion".to_string(),
        created: Utc::now().timestamp(),
        model,
        choices: vec![Choice {
            index: 0,
            message: AssistantMessage {
                role: "assistant".to_string(),
                content: output.text,
            },
            finish_reason: Some(if role.is_terminal() { "stop" } else { "length" }.to_string()),
        }],
        usage: Some(Usage {
            prompt_tokens: output.prompt_tokens,
            completion_tokens: output.completion_tokens,
            total_tokens: output.prompt_tokens + output.completion_tokens,
        }),
    };
    Json(response).into_response()
}

/// Stage chat endpoint: handoff in, engine, handoff out
pub async fn stage_chat(
    State(state): State<StageState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let role = state.role;
    let id = match correlation_id(&headers) {
        Ok(id) => id,
        Err(e) => return e.into_response_for(role, None),
    };
    let request: ChatCompletionRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            return StageError::InvalidRequest(e.to_string()).into_response_for(role, Some(&id))
        }
    };

    let span = info_span!("stage", role = %role, correlation_id = %id);
    async move {
        let mut response = match run_stage(&state, &id, &request).await {
            Ok(output) => {
                let completion_id = format!("chatcmpl-{}", id);
                let model = request.model.clone();
                if request.stream && role.is_terminal() {
                    stream_response(completion_id, model, output)
                } else {
                    full_response(role, completion_id, model, output)
                }
            }
            Err(e) => {
                warn!("{} stage failed: {}", role, e);
                e.into_response_for(role, Some(&id))
            }
        };
        if let Ok(value) = HeaderValue::from_str(id.as_str()) {
            response.headers_mut().insert(CORRELATION_HEADER, value);
        }
        response
    }
    .instrument(span)
    .await
}

/// Create the Axum router for a stage server
pub fn create_stage_router(state: StageState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(CHAT_COMPLETIONS_PATH, post(stage_chat))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use crate::cache::{CacheReference, SharedStorageConnector};
    use crate::config::SharedStorageConfig;
    use crate::error::ErrorBody;
    use crate::stage::EchoEngine;

    fn storage(dir: &tempfile::TempDir) -> Connector {
        Connector::SharedStorage(
            SharedStorageConnector::new(&SharedStorageConfig {
                root: dir.path().to_string_lossy().into_owned(),
                ..Default::default()
            })
            .unwrap(),
        )
    }

    fn chat(id: Option<&str>, body: serde_json::Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/v1/chat/completions")
            .header("content-type", "application/json");
        if let Some(id) = id {
            builder = builder.header(CORRELATION_HEADER, id);
        }
        builder
            .body(Body::from(serde_json::to_string(&body).unwrap()))
            .unwrap()
    }

    async fn body_bytes(response: Response) -> Bytes {
        axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
    }

    fn image_body(handoff: Option<&CacheReference>) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": "m",
            "max_tokens": 1,
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "text", "text": "describe"},
                    {"type": "image_url", "image_url": {"url": "http://img/1.png"}}
                ]
            }]
        });
        if let Some(reference) = handoff {
            body["cache_handoff"] = serde_json::to_value(reference).unwrap();
        }
        body
    }

    #[tokio::test]
    async fn test_missing_correlation_header() {
        let app = create_stage_router(StageState::new(
            StageRole::Decode,
            "m",
            Arc::new(EchoEngine),
        ));

        let response = app.oneshot(chat(None, image_body(None))).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let detail = ErrorBody::parse(&body_bytes(response).await).unwrap();
        assert_eq!(detail.kind, "invalid_request");
        assert_eq!(detail.stage, Some(StageRole::Decode));
    }

    #[tokio::test]
    async fn test_malformed_correlation_header() {
        let app = create_stage_router(StageState::new(
            StageRole::Decode,
            "m",
            Arc::new(EchoEngine),
        ));
        let response = app
            .oneshot(chat(Some("../../etc"), image_body(None)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_encode_then_prefill_over_shared_storage() {
        let dir = tempfile::tempdir().unwrap();
        let id = CorrelationId::mint();

        let encode = create_stage_router(
            StageState::new(StageRole::Encode, "m", Arc::new(EchoEngine)).producing(storage(&dir)),
        );
        let response = encode
            .oneshot(chat(Some(id.as_str()), image_body(None)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(CORRELATION_HEADER).unwrap(),
            id.as_str()
        );
        let artifact = dir
            .path()
            .join(id.as_str())
            .join("encode.artifact");
        assert!(artifact.exists());

        let prefill = create_stage_router(
            StageState::new(StageRole::Prefill, "m", Arc::new(EchoEngine)).consuming(storage(&dir)),
        );
        let reference = CacheReference::new(&id, StageRole::Encode);
        let response = prefill
            .oneshot(chat(Some(id.as_str()), image_body(Some(&reference))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // Consumed artifacts are released
        assert!(!artifact.exists());
    }

    #[tokio::test]
    async fn test_missing_artifact_is_cache_miss() {
        let dir = tempfile::tempdir().unwrap();
        let id = CorrelationId::mint();
        let app = create_stage_router(
            StageState::new(StageRole::Prefill, "m", Arc::new(EchoEngine)).consuming(storage(&dir)),
        );

        let reference = CacheReference::new(&id, StageRole::Encode);
        let response = app
            .oneshot(chat(Some(id.as_str()), image_body(Some(&reference))))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let detail = ErrorBody::parse(&body_bytes(response).await).unwrap();
        assert_eq!(detail.kind, "cache_miss");
        assert_eq!(detail.correlation_id.as_deref(), Some(id.as_str()));
    }

    #[tokio::test]
    async fn test_handoff_for_another_request_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let app = create_stage_router(
            StageState::new(StageRole::Prefill, "m", Arc::new(EchoEngine)).consuming(storage(&dir)),
        );

        let reference = CacheReference::new(&CorrelationId::mint(), StageRole::Encode);
        let response = app
            .oneshot(chat(
                Some(CorrelationId::mint().as_str()),
                image_body(Some(&reference)),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_decode_streams_words() {
        let app = create_stage_router(StageState::new(
            StageRole::Decode,
            "m",
            Arc::new(EchoEngine),
        ));
        let id = CorrelationId::mint();

        let response = app
            .oneshot(chat(
                Some(id.as_str()),
                serde_json::json!({
                    "model": "m",
                    "stream": true,
                    "messages": [{"role": "user", "content": "hello world"}]
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "text/event-stream"
        );

        let text = String::from_utf8(body_bytes(response).await.to_vec()).unwrap();
        let frames: Vec<&str> = text
            .split("\n\n")
            .filter(|f| !f.is_empty())
            .map(|f| f.trim_start_matches("data: "))
            .collect();
        assert_eq!(frames.len(), 4);
        assert_eq!(frames[3], "[DONE]");

        let content: String = frames[..3]
            .iter()
            .map(|f| {
                let chunk: ChatCompletionChunk = serde_json::from_str(f).unwrap();
                chunk.choices[0].delta.content.clone().unwrap()
            })
            .collect();
        assert_eq!(content, "echo: hello world");
    }

    #[tokio::test]
    async fn test_decode_full_response() {
        let app = create_stage_router(StageState::new(
            StageRole::Decode,
            "m",
            Arc::new(EchoEngine),
        ));
        let id = CorrelationId::mint();

        let response = app
            .oneshot(chat(
                Some(id.as_str()),
                serde_json::json!({
                    "model": "m",
                    "messages": [{"role": "user", "content": "hello"}]
                }),
            ))
            .await
            .unwrap();
        let completion: ChatCompletionResponse =
            serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(completion.choices[0].message.content, "echo: hello");
        assert_eq!(completion.id, format!("chatcmpl-{}", id));
    }

    #[tokio::test]
    async fn test_health() {
        let app = create_stage_router(StageState::new(
            StageRole::Encode,
            "m",
            Arc::new(EchoEngine),
        ));
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
