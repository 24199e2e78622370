//! Canonical OpenAI-compatible types
//!
//! These are the shapes the gateway exposes at its boundary and uses
//! internally; every driver translates to and from them.

pub mod batch;
pub mod chat;
pub mod context;
pub mod embedding;
pub mod model;

pub use batch::{
    ApiError, BatchError, BatchErrors, BatchInput, BatchMeta, BatchOutput, BatchPayload,
    BatchRecord, BatchResponse, BatchStatus, FileRecord, RequestCounts,
};
pub use chat::{
    ChatChoice, ChatDelta, ChatMessage, ChatRequest, ChatResponse, Completion, ContentPart,
    ImageUrl, MessageContent, Role, StreamChoice, StreamDelta, StreamOptions,
};
pub use context::RequestScope;
pub use embedding::{Embedding, EmbeddingInput, EmbeddingRequest, EmbeddingResponse};
pub use model::{ModelCard, ModelList};

use serde::{Deserialize, Serialize};

/// Token accounting, as reported by the provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_tokens_details: Option<PromptTokensDetails>,
}

/// Prompt token details; cached-prompt counts land here when available.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PromptTokensDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached_tokens: Option<u32>,
}
