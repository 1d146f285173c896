use serde::Serialize;

use crate::cache::CacheReference;
use crate::client::ChatCompletionRequest;
use crate::context::StageRole;

/// Ordered stages a request visits
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StagePlan {
    stages: Vec<StageRole>,
}

// ============================================================================
// SBIO: Pure planning functions (no I/O)
// ============================================================================

impl StagePlan {
    /// Multimodal requests start at Encode; text-only ones skip it.
    pub fn for_request(request: &ChatCompletionRequest) -> Self {
        let stages = if request.is_multimodal() {
            vec![StageRole::Encode, StageRole::Prefill, StageRole::Decode]
        } else {
            vec![StageRole::Prefill, StageRole::Decode]
        };
        Self { stages }
    }

    pub fn stages(&self) -> &[StageRole] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn contains(&self, role: StageRole) -> bool {
        self.stages.contains(&role)
    }
}

impl IntoIterator for StagePlan {
    type Item = StageRole;
    type IntoIter = std::vec::IntoIter<StageRole>;

    fn into_iter(self) -> Self::IntoIter {
        self.stages.into_iter()
    }
}

/// Body sent to a stage of `role`.
///
/// Non-terminal stages run prefill-only: no streaming, a single token. The
/// client's own `cache_handoff`, if any, is always replaced.
pub fn stage_payload(
    original: &ChatCompletionRequest,
    role: StageRole,
    handoff: Option<&CacheReference>,
) -> ChatCompletionRequest {
    let mut payload = original.clone();
    payload.cache_handoff = handoff.cloned();
    if !role.is_terminal() {
        payload.stream = false;
        payload.max_tokens = Some(1);
    }
    payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ContentPart, MediaUrl, Message, MessageContent};
    use crate::context::CorrelationId;

    fn text_request() -> ChatCompletionRequest {
        ChatCompletionRequest::new("m", vec![Message::user("What is EPD?")])
    }

    fn image_request() -> ChatCompletionRequest {
        ChatCompletionRequest::new(
            "m",
            vec![Message::new(
                "user",
                MessageContent::Parts(vec![
                    ContentPart::Text {
                        text: "Describe this".into(),
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

    #[test]
    fn test_text_only_plan_skips_encode() {
        let plan = StagePlan::for_request(&text_request());
        assert_eq!(plan.stages(), &[StageRole::Prefill, StageRole::Decode]);
        assert!(!plan.contains(StageRole::Encode));
    }

    #[test]
    fn test_multimodal_plan_starts_with_encode() {
        let plan = StagePlan::for_request(&image_request());
        assert_eq!(
            plan.stages(),
            &[StageRole::Encode, StageRole::Prefill, StageRole::Decode]
        );
    }

    #[test]
    fn test_text_parts_stay_text_only() {
        let request = ChatCompletionRequest::new(
            "m",
            vec![Message::new(
                "user",
                MessageContent::Parts(vec![ContentPart::Text { text: "hi".into() }]),
            )],
        );
        assert_eq!(StagePlan::for_request(&request).len(), 2);
    }

    #[test]
    fn test_every_plan_ends_in_decode() {
        for request in [text_request(), image_request()] {
            let plan = StagePlan::for_request(&request);
            assert_eq!(plan.stages().last(), Some(&StageRole::Decode));
        }
    }

    #[test]
    fn test_non_terminal_payload_is_prefill_only() {
        let mut original = text_request();
        original.stream = true;
        original.max_tokens = Some(256);

        let payload = stage_payload(&original, StageRole::Prefill, None);
        assert!(!payload.stream);
        assert_eq!(payload.max_tokens, Some(1));
        assert!(payload.cache_handoff.is_none());

        let decode = stage_payload(&original, StageRole::Decode, None);
        assert!(decode.stream);
        assert_eq!(decode.max_tokens, Some(256));
    }

    #[test]
    fn test_handoff_reference_attached() {
        let id = CorrelationId::mint();
        let reference = CacheReference::new(&id, StageRole::Prefill);
        let payload = stage_payload(&text_request(), StageRole::Decode, Some(&reference));

        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["cache_handoff"]["correlation_id"], id.as_str());
        assert_eq!(json["cache_handoff"]["producer"], "prefill");
    }

    #[test]
    fn test_client_handoff_is_not_forwarded() {
        let mut original = text_request();
        original.cache_handoff = Some(CacheReference::new(
            &CorrelationId::mint(),
            StageRole::Encode,
        ));

        let payload = stage_payload(&original, StageRole::Prefill, None);
        assert!(payload.cache_handoff.is_none());
    }
}
