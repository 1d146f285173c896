use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::cache::CacheReference;

// ============================================================================
// Data structures (pure, no I/O)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaUrl {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// One item of a structured message body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: MediaUrl },
    AudioUrl { audio_url: MediaUrl },
    VideoUrl { video_url: MediaUrl },
    InputAudio { input_audio: Value },
    /// Part types not interpreted here; forwarded to the stages untouched
    #[serde(untagged)]
    Other(Value),
}

impl ContentPart {
    /// Anything that is not plain text needs the encoder.
    pub fn is_multimodal(&self) -> bool {
        !matches!(self, ContentPart::Text { .. })
    }

    pub fn media_url(&self) -> Option<&str> {
        match self {
            ContentPart::ImageUrl { image_url: m }
            | ContentPart::AudioUrl { audio_url: m }
            | ContentPart::VideoUrl { video_url: m } => Some(&m.url),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    pub fn parts(&self) -> &[ContentPart] {
        match self {
            MessageContent::Text(_) => &[],
            MessageContent::Parts(parts) => parts,
        }
    }

    /// Concatenated text of the message, ignoring media parts
    pub fn text(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join(" "),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<MessageContent>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self::new("user", MessageContent::Text(text.into()))
    }

    pub fn new(role: impl Into<String>, content: MessageContent) -> Self {
        Self {
            role: role.into(),
            content: Some(content),
            extra: Map::new(),
        }
    }

    pub fn text(&self) -> String {
        self.content.as_ref().map(|c| c.text()).unwrap_or_default()
    }
}

/// Chat completion request as accepted from clients and forwarded to stages.
///
/// Unknown top-level fields are kept in `extra` so the stage sees the client's
/// sampling parameters untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Where the receiving stage recovers its input artifact
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_handoff: Option<CacheReference>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChatCompletionRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            stream: false,
            max_tokens: None,
            cache_handoff: None,
            extra: Map::new(),
        }
    }

    pub fn content_parts(&self) -> impl Iterator<Item = &ContentPart> {
        self.messages
            .iter()
            .filter_map(|m| m.content.as_ref())
            .flat_map(|c| c.parts().iter())
    }

    pub fn is_multimodal(&self) -> bool {
        self.content_parts().any(ContentPart::is_multimodal)
    }

    pub fn media_urls(&self) -> Vec<&str> {
        self.content_parts().filter_map(ContentPart::media_url).collect()
    }

    /// Text of the most recent user turn
    pub fn last_user_text(&self) -> String {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(Message::text)
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Choice {
    pub index: u32,
    pub message: AssistantMessage,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<Choice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: Delta,
    pub finish_reason: Option<String>,
}

/// One incremental frame of a streamed completion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{CorrelationId, StageRole};

    #[test]
    fn test_text_request_deserialization() {
        let json = r#"{"model":"m","messages":[{"role":"user","content":"Hello"}]}"#;
        let req: ChatCompletionRequest = serde_json::from_str(json).unwrap();

        assert!(!req.stream);
        assert!(!req.is_multimodal());
        assert_eq!(req.last_user_text(), "Hello");
    }

    #[test]
    fn test_multimodal_request_deserialization() {
        let json = r#"{
            "model": "qwen-vl",
            "stream": true,
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "text", "text": "What is in"},
                    {"type": "image_url", "image_url": {"url": "https://example.com/cat.png"}},
                    {"type": "text", "text": "this picture?"}
                ]
            }]
        }"#;
        let req: ChatCompletionRequest = serde_json::from_str(json).unwrap();

        assert!(req.stream);
        assert!(req.is_multimodal());
        assert_eq!(req.media_urls(), vec!["https://example.com/cat.png"]);
        assert_eq!(req.last_user_text(), "What is in this picture?");
    }

    #[test]
    fn test_text_only_parts_are_not_multimodal() {
        let json = r#"{"model":"m","messages":[{"role":"user","content":[{"type":"text","text":"hi"}]}]}"#;
        let req: ChatCompletionRequest = serde_json::from_str(json).unwrap();
        assert!(!req.is_multimodal());
    }

    #[test]
    fn test_audio_is_multimodal() {
        let json = r#"{"model":"m","messages":[{"role":"user","content":[
            {"type":"input_audio","input_audio":{"data":"AAAA","format":"wav"}}
        ]}]}"#;
        let req: ChatCompletionRequest = serde_json::from_str(json).unwrap();
        assert!(req.is_multimodal());
        assert!(req.media_urls().is_empty());
    }

    #[test]
    fn test_unknown_fields_round_trip() {
        let json = r#"{"model":"m","messages":[{"role":"user","content":"x","name":"bob"}],"temperature":0.2,"top_p":0.9}"#;
        let req: ChatCompletionRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.extra.get("temperature"), Some(&serde_json::json!(0.2)));

        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["top_p"], serde_json::json!(0.9));
        assert_eq!(value["messages"][0]["name"], "bob");
        assert!(value.get("cache_handoff").is_none());
        assert!(value.get("max_tokens").is_none());
    }

    #[test]
    fn test_cache_handoff_serialization() {
        let mut req = ChatCompletionRequest::new("m", vec![Message::user("hi")]);
        let id: CorrelationId = "epd-abc".parse().unwrap();
        req.cache_handoff = Some(CacheReference {
            correlation_id: id,
            producer: StageRole::Encode,
        });

        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["cache_handoff"]["correlation_id"], "epd-abc");
        assert_eq!(value["cache_handoff"]["producer"], "encode");
    }

    #[test]
    fn test_unknown_part_type_is_multimodal_and_kept() {
        let json = r#"{"model":"m","messages":[{"role":"user","content":[
            {"type":"text","text":"describe"},
            {"type":"input_image","image":"data:image/png;base64,AAAA"}
        ]}]}"#;
        let req: ChatCompletionRequest = serde_json::from_str(json).unwrap();
        assert!(req.is_multimodal());
        assert!(req.media_urls().is_empty());
        assert_eq!(req.last_user_text(), "describe");

        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(
            value["messages"][0]["content"][1],
            serde_json::json!({"type": "input_image", "image": "data:image/png;base64,AAAA"})
        );
        assert_eq!(value["messages"][0]["content"][0]["type"], "text");
    }

    #[test]
    fn test_response_deserialization() {
        let json = r#"{
            "id": "chatcmpl-123",
            "object": "chat.completion",
            "created": 1,
            "model": "m",
            "choices": [
                {"index": 0, "message": {"role": "assistant", "content": "Hello!"}, "finish_reason": "stop"}
            ],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
        }"#;

        let resp: ChatCompletionResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.id, "chatcmpl-123");
        assert_eq!(resp.choices[0].message.content, "Hello!");
    }
}
