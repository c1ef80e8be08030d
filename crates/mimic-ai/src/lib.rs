//! Chat-completion types and the OpenAI-compatible client used to generate replies.
mod openai;
mod types;

pub use openai::{OpenAiClient, OpenAiConfig};
pub use types::{
    ChatRequest, ChatResponse, ChatUsage, ContentBlock, LlmClient, MediaSource, Message,
    MessageRole, MimicAiError,
};
