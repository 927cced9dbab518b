use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::TarsyError;
use crate::types::TokenUsage;

mod mock;
mod openai;

pub use mock::MockLlmClient;
pub use openai::OpenAiLlmClient;

/// A tool offered to the model for native function-calling. `name` is
/// already prefixed with its owning server id (`server_id__tool_name`) so a
/// model choosing among tools from several MCP servers never has to
/// disambiguate a bare name collision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmToolSchema {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmToolCall {
    pub id: Option<String>,
    pub name: String,
    pub arguments: Value,
}

/// `messages` are raw OpenAI-chat-shaped JSON objects, assembled by
/// `prompt.rs` — kept untyped here so the request can carry whatever roles
/// (system/user/assistant/tool) the calling strategy needs without this
/// module knowing about stage/chain concepts.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub model: String,
    pub messages: Vec<Value>,
    pub tools: Vec<LlmToolSchema>,
}

#[derive(Debug, Clone, Default)]
pub struct LlmCompletion {
    pub text: Option<String>,
    pub tool_call: Option<LlmToolCall>,
    pub usage: Option<TokenUsage>,
}

/// The single interface between the iteration controller and any LLM
/// provider. Only unrecoverable failures (auth, network exhaustion,
/// unparseable provider response) should surface as `Err` — everything else
/// is a normal `LlmCompletion`.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, request: LlmRequest) -> Result<LlmCompletion, TarsyError>;
}
