use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::StageError;
use crate::cache::shared_storage::digest_hex;
use crate::cache::CacheArtifact;
use crate::client::ChatCompletionRequest;
use crate::context::StageRole;

/// What one stage run yields
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageOutput {
    /// Artifact for the next stage, if this role produces one
    pub artifact: Option<Bytes>,
    /// Completion text; only meaningful for the decode stage
    pub text: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

// ============================================================================
// SBIO: Trait for abstraction (the model engine lives behind it)
// ============================================================================

#[async_trait]
pub trait StageEngine: Send + Sync {
    fn name(&self) -> &str;

    async fn run(
        &self,
        role: StageRole,
        request: &ChatCompletionRequest,
        upstream: Option<&CacheArtifact>,
    ) -> Result<StageOutput, StageError>;
}

/// Encoder artifact of the echo engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodedMedia {
    pub media: Vec<String>,
}

/// KV artifact of the echo engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrefillState {
    pub prompt: String,
    pub prompt_tokens: u32,
    pub media: Vec<String>,
    /// Digest of the encoder artifact this state was built from
    pub encoder_digest: Option<String>,
}

/// Deterministic engine that needs no accelerator.
///
/// Encode records the media URLs, prefill derives a state from the prompt and
/// the encoder output, decode answers `echo: <last user text>`.
#[derive(Debug, Clone, Default)]
pub struct EchoEngine;

fn count_words(text: &str) -> u32 {
    text.split_whitespace().count() as u32
}

fn to_bytes<T: Serialize>(value: &T) -> Result<Bytes, StageError> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(|e| StageError::Engine(e.to_string()))
}

#[async_trait]
impl StageEngine for EchoEngine {
    fn name(&self) -> &str {
        "echo"
    }

    async fn run(
        &self,
        role: StageRole,
        request: &ChatCompletionRequest,
        upstream: Option<&CacheArtifact>,
    ) -> Result<StageOutput, StageError> {
        let prompt = request.last_user_text();
        let prompt_tokens = count_words(&prompt);

        match role {
            StageRole::Encode => {
                let media = request
                    .media_urls()
                    .into_iter()
                    .map(str::to_string)
                    .collect();
                Ok(StageOutput {
                    artifact: Some(to_bytes(&EncodedMedia { media })?),
                    prompt_tokens,
                    ..Default::default()
                })
            }
            StageRole::Prefill => {
                let (media, encoder_digest) = match upstream {
                    Some(artifact) => {
                        let encoded: EncodedMedia = serde_json::from_slice(&artifact.payload)
                            .map_err(|e| {
                                StageError::Engine(format!("unreadable encoder artifact: {}", e))
                            })?;
                        (encoded.media, Some(digest_hex(&artifact.payload)))
                    }
                    None => (Vec::new(), None),
                };
                let state = PrefillState {
                    prompt,
                    prompt_tokens,
                    media,
                    encoder_digest,
                };
                Ok(StageOutput {
                    artifact: Some(to_bytes(&state)?),
                    prompt_tokens,
                    ..Default::default()
                })
            }
            StageRole::Decode => {
                if let Some(artifact) = upstream {
                    let state: PrefillState = serde_json::from_slice(&artifact.payload)
                        .map_err(|e| StageError::Engine(format!("unreadable KV state: {}", e)))?;
                    if state.prompt != prompt {
                        return Err(StageError::Engine(
                            "KV state was built for a different prompt".to_string(),
                        ));
                    }
                }
                let text = format!("echo: {}", prompt);
                Ok(StageOutput {
                    artifact: None,
                    completion_tokens: count_words(&text),
                    text,
                    prompt_tokens,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheReference;
    use crate::client::{ContentPart, MediaUrl, Message, MessageContent};
    use crate::context::CorrelationId;

    fn image_request() -> ChatCompletionRequest {
        ChatCompletionRequest::new(
            "m",
            vec![Message::new(
                "user",
                MessageContent::Parts(vec![
                    ContentPart::Text {
                        text: "what is this".into(),
                    },
                    ContentPart::ImageUrl {
                        image_url: MediaUrl {
                            url: "http://img/cat.png".into(),
                            detail: None,
                        },
                    },
                ]),
            )],
        )
    }

    fn artifact(producer: StageRole, payload: Bytes) -> CacheArtifact {
        CacheArtifact::new(CacheReference::new(&CorrelationId::mint(), producer), payload).unwrap()
    }

    #[tokio::test]
    async fn test_full_chain() {
        let engine = EchoEngine;
        let request = image_request();

        let encoded = engine.run(StageRole::Encode, &request, None).await.unwrap();
        let encoded = artifact(StageRole::Encode, encoded.artifact.unwrap());

        let prefilled = engine
            .run(StageRole::Prefill, &request, Some(&encoded))
            .await
            .unwrap();
        let state: PrefillState =
            serde_json::from_slice(prefilled.artifact.as_ref().unwrap()).unwrap();
        assert_eq!(state.media, vec!["http://img/cat.png"]);
        assert_eq!(state.encoder_digest, Some(digest_hex(&encoded.payload)));
        let prefilled = artifact(StageRole::Prefill, prefilled.artifact.unwrap());

        let decoded = engine
            .run(StageRole::Decode, &request, Some(&prefilled))
            .await
            .unwrap();
        assert_eq!(decoded.text, "echo: what is this");
        assert!(decoded.artifact.is_none());
        assert_eq!(decoded.prompt_tokens, 3);
    }

    #[tokio::test]
    async fn test_decode_without_upstream() {
        let request = ChatCompletionRequest::new("m", vec![Message::user("hi there")]);
        let out = EchoEngine
            .run(StageRole::Decode, &request, None)
            .await
            .unwrap();
        assert_eq!(out.text, "echo: hi there");
        assert_eq!(out.completion_tokens, 3);
    }

    #[tokio::test]
    async fn test_decode_rejects_foreign_state() {
        let request = ChatCompletionRequest::new("m", vec![Message::user("hi")]);
        let other = ChatCompletionRequest::new("m", vec![Message::user("bye")]);

        let prefilled = EchoEngine
            .run(StageRole::Prefill, &other, None)
            .await
            .unwrap();
        let prefilled = artifact(StageRole::Prefill, prefilled.artifact.unwrap());

        let err = EchoEngine
            .run(StageRole::Decode, &request, Some(&prefilled))
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::Engine(_)));
    }
}
