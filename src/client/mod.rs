pub mod openai;
pub mod stage;

pub use openai::{
    AssistantMessage, ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, Choice,
    ChunkChoice, ContentPart, Delta, MediaUrl, Message, MessageContent, Usage,
};
pub use stage::{
    stage_url, ClientError, HttpStageClient, StageBody, StageClient, StageReply,
    CHAT_COMPLETIONS_PATH,
};

#[cfg(test)]
pub use stage::mock;
