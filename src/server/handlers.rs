use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{
        header::{CACHE_CONTROL, CONTENT_TYPE},
        HeaderMap, HeaderValue, StatusCode,
    },
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, info_span, Instrument};

use crate::client::{ChatCompletionRequest, CHAT_COMPLETIONS_PATH};
use crate::context::{CorrelationId, RequestContext, RequestState, StageRole, CORRELATION_HEADER};
use crate::error::ProxyError;
use crate::runtime::{EndpointSnapshot, ProxyResponse, StagePlan};
use crate::server::state::AppState;

/// Health check endpoint
pub async fn health() -> impl IntoResponse {
    StatusCode::OK
}

#[derive(Debug, Serialize)]
pub struct InFlightStatus {
    pub correlation_id: CorrelationId,
    pub state: RequestState,
    pub plan: Vec<StageRole>,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct ProxyStatus {
    pub endpoints: Vec<EndpointSnapshot>,
    pub active_requests: usize,
    pub requests: Vec<InFlightStatus>,
}

/// Endpoint liveness and in-flight requests
pub async fn status(State(state): State<AppState>) -> impl IntoResponse {
    let requests = state
        .inflight
        .snapshot()
        .into_iter()
        .map(|(correlation_id, entry)| InFlightStatus {
            correlation_id,
            state: entry.state,
            plan: entry.plan,
            started_at: entry.started_at,
        })
        .collect::<Vec<_>>();

    Json(ProxyStatus {
        endpoints: state.registry().snapshot(),
        active_requests: requests.len(),
        requests,
    })
}

fn correlation_header(id: &CorrelationId) -> Option<HeaderValue> {
    HeaderValue::from_str(id.as_str()).ok()
}

fn into_http(response: ProxyResponse, id: &CorrelationId) -> Response {
    let mut http = match response {
        ProxyResponse::Full {
            status,
            content_type,
            body,
        } => {
            let mut http = Response::new(Body::from(body));
            *http.status_mut() = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
            if let Some(value) = content_type.and_then(|ct| HeaderValue::from_str(&ct).ok()) {
                http.headers_mut().insert(CONTENT_TYPE, value);
            }
            http
        }
        ProxyResponse::Stream(relay) => {
            let mut http = Response::new(Body::from_stream(relay));
            let headers = http.headers_mut();
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
            headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
            http
        }
    };
    if let Some(value) = correlation_header(id) {
        http.headers_mut().insert(CORRELATION_HEADER, value);
    }
    http
}

/// Chat completions endpoint (OpenAI-compatible)
pub async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let mut id = CorrelationId::mint();

    // Client ids are never adopted; they only help line up logs
    if let Some(client_id) = headers.get(CORRELATION_HEADER).and_then(|v| v.to_str().ok()) {
        debug!("Client sent {}: {} (using {})", CORRELATION_HEADER, client_id, id);
    }

    if state.shutdown.is_cancelled() {
        return ProxyError::ShuttingDown.into_response_for(Some(&id));
    }

    let request: ChatCompletionRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            return ProxyError::InvalidRequest(e.to_string()).into_response_for(Some(&id));
        }
    };
    if request.messages.is_empty() {
        return ProxyError::InvalidRequest("messages must not be empty".to_string())
            .into_response_for(Some(&id));
    }

    let plan = StagePlan::for_request(&request);
    let tracker = loop {
        match state.inflight.register(&id, plan.stages()) {
            Some(guard) => break guard,
            None => id = CorrelationId::mint(),
        }
    };

    let span = info_span!("request", correlation_id = %id);
    async move {
        info!(
            "Routing {} request through {:?}",
            if request.stream { "streaming" } else { "buffered" },
            plan.stages()
        );
        let ctx = RequestContext::new(id.clone(), request, plan).with_tracker(tracker);
        match state.router.dispatch(ctx).await {
            Ok(response) => into_http(response, &id),
            Err(e) => e.into_response_for(Some(&id)),
        }
    }
    .instrument(span)
    .await
}

/// Create the Axum router
pub fn create_router(state: AppState) -> Router {
    let limit = state.config.max_concurrent_requests;
    let router = Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route(CHAT_COMPLETIONS_PATH, post(chat_completions))
        .with_state(state);

    let router = match limit {
        Some(max) => router.layer(ConcurrencyLimitLayer::new(max)),
        None => router,
    };
    router.layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::http::Request;
    use futures::StreamExt;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    use crate::client::mock::{MockStageClient, Scripted};
    use crate::config::ProxyConfig;

    const PREFILL: &str = "http://prefill:1";
    const DECODE: &str = "http://decode:1";

    fn create_test_app(mock: Arc<MockStageClient>) -> (Router, AppState) {
        let config: ProxyConfig = serde_json::from_value(serde_json::json!({
            "stages": {
                "encode": ["http://encode:1"],
                "prefill": [PREFILL],
                "decode": [DECODE]
            }
        }))
        .unwrap();
        let state = AppState::new(config, mock, CancellationToken::new());
        (create_router(state.clone()), state)
    }

    fn chat(body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/v1/chat/completions")
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_string(&body).unwrap()))
            .unwrap()
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let (app, _) = create_test_app(Arc::new(MockStageClient::new()));

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_status_endpoint() {
        let (app, _) = create_test_app(Arc::new(MockStageClient::new()));

        let response = app
            .oneshot(Request::builder().uri("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        assert_eq!(json["endpoints"].as_array().unwrap().len(), 3);
        assert_eq!(json["endpoints"][0]["liveness"], "unknown");
        assert_eq!(json["active_requests"], 0);
    }

    #[tokio::test]
    async fn test_chat_completions_relays_decode_reply() {
        let mock = Arc::new(MockStageClient::new().with(
            DECODE,
            Scripted::Reply(200, r#"{"id":"chatcmpl-x","object":"chat.completion"}"#.into()),
        ));
        let (app, state) = create_test_app(mock.clone());

        let response = app
            .oneshot(chat(serde_json::json!({
                "model": "test-model",
                "messages": [{"role": "user", "content": "Hello"}]
            })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let header = response
            .headers()
            .get(CORRELATION_HEADER)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        let id: CorrelationId = header.parse().unwrap();
        assert!(mock.calls().iter().all(|c| c.1 == id));

        let json = json_body(response).await;
        assert_eq!(json["id"], "chatcmpl-x");
        assert_eq!(state.active_request_count(), 0);
    }

    #[tokio::test]
    async fn test_client_request_id_not_adopted() {
        let mock = Arc::new(MockStageClient::new());
        let (app, _) = create_test_app(mock.clone());

        let mut request = chat(serde_json::json!({
            "model": "m",
            "messages": [{"role": "user", "content": "Hello"}]
        }));
        request
            .headers_mut()
            .insert(CORRELATION_HEADER, HeaderValue::from_static("client-chosen"));

        let response = app.oneshot(request).await.unwrap();
        let header = response.headers().get(CORRELATION_HEADER).unwrap();
        assert_ne!(header, "client-chosen");
        assert!(mock.calls().iter().all(|c| c.1.as_str() != "client-chosen"));
    }

    #[tokio::test]
    async fn test_stage_failure_becomes_error_body() {
        let mock = Arc::new(MockStageClient::new().with(PREFILL, Scripted::Unreachable));
        let (app, state) = create_test_app(mock.clone());

        let response = app
            .oneshot(chat(serde_json::json!({
                "model": "m",
                "messages": [{"role": "user", "content": "Hello"}]
            })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let id = response
            .headers()
            .get(CORRELATION_HEADER)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        let json = json_body(response).await;
        assert_eq!(json["error"]["kind"], "stage_unreachable");
        assert_eq!(json["error"]["stage"], "prefill");
        assert_eq!(json["error"]["correlation_id"], id);
        assert_eq!(mock.calls_to(DECODE), 0);
        assert_eq!(state.active_request_count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_body_rejected() {
        let (app, _) = create_test_app(Arc::new(MockStageClient::new()));

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/chat/completions")
                    .body(Body::from("{ not json"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = json_body(response).await;
        assert_eq!(json["error"]["type"], "invalid_request");
    }

    #[tokio::test]
    async fn test_empty_messages_rejected() {
        let mock = Arc::new(MockStageClient::new());
        let (app, _) = create_test_app(mock.clone());

        let response = app
            .oneshot(chat(serde_json::json!({"model": "m", "messages": []})))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(mock.calls().is_empty());
    }

    #[tokio::test]
    async fn test_streaming_response() {
        let mock = Arc::new(MockStageClient::new().with(
            DECODE,
            Scripted::Chunks(vec!["data: {}\n\n".into(), "data: [DONE]\n\n".into()]),
        ));
        let (app, _) = create_test_app(mock);

        let response = app
            .oneshot(chat(serde_json::json!({
                "model": "m",
                "stream": true,
                "messages": [{"role": "user", "content": "Hello"}]
            })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "text/event-stream"
        );

        let mut stream = response.into_body().into_data_stream();
        let mut collected = Vec::new();
        while let Some(chunk) = stream.next().await {
            collected.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(collected, b"data: {}\n\ndata: [DONE]\n\n");
    }

    #[tokio::test]
    async fn test_shutting_down_rejects() {
        let (app, state) = create_test_app(Arc::new(MockStageClient::new()));
        state.shutdown.cancel();

        let response = app
            .oneshot(chat(serde_json::json!({
                "model": "m",
                "messages": [{"role": "user", "content": "Hello"}]
            })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let json = json_body(response).await;
        assert_eq!(json["error"]["kind"], "shutting_down");
    }
}
