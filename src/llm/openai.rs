use async_openai::{
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestMessage, ChatCompletionTool, ChatCompletionToolType,
        CreateChatCompletionRequestArgs, FunctionObject,
    },
    Client,
};
use async_trait::async_trait;

use crate::error::TarsyError;
use crate::llm::{LlmClient, LlmCompletion, LlmRequest, LlmToolCall};
use crate::types::TokenUsage;

pub struct OpenAiLlmClient {
    client: Client<OpenAIConfig>,
}

impl OpenAiLlmClient {
    /// Standard client reading `OPENAI_API_KEY` from the environment.
    pub fn new() -> Self {
        Self { client: Client::new() }
    }

    /// Custom base URL — for Groq, Together, Ollama, Fireworks, etc.
    pub fn with_base_url(api_base: impl Into<String>, api_key: impl Into<String>) -> Self {
        let config = OpenAIConfig::new().with_api_base(api_base).with_api_key(api_key);
        Self { client: Client::with_config(config) }
    }

    fn build_tools(request: &LlmRequest) -> Vec<ChatCompletionTool> {
        request
            .tools
            .iter()
            .map(|schema| ChatCompletionTool {
                r#type: ChatCompletionToolType::Function,
                function: FunctionObject {
                    name: schema.name.clone(),
                    description: Some(schema.description.clone()),
                    parameters: Some(schema.input_schema.clone()),
                },
            })
            .collect()
    }
}

impl Default for OpenAiLlmClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmClient for OpenAiLlmClient {
    async fn complete(&self, request: LlmRequest) -> Result<LlmCompletion, TarsyError> {
        let messages: Vec<ChatCompletionRequestMessage> =
            serde_json::from_value(serde_json::Value::Array(request.messages.clone()))
                .map_err(|e| TarsyError::Llm(format!("failed to build chat messages: {e}")))?;

        let oai_tools = Self::build_tools(&request);

        let mut builder = CreateChatCompletionRequestArgs::default();
        builder.model(&request.model).messages(messages);
        if !oai_tools.is_empty() {
            builder.tools(oai_tools);
        }

        let api_request = builder.build().map_err(|e| TarsyError::Llm(format!("failed to build request: {e}")))?;

        let response =
            self.client.chat().create(api_request).await.map_err(|e| TarsyError::Llm(format!("openai api error: {e}")))?;

        let usage = response.usage.map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens));

        let choice = response.choices.into_iter().next().ok_or_else(|| TarsyError::Llm("empty response from provider".into()))?;
        let message = choice.message;

        if let Some(tool_calls) = message.tool_calls {
            if let Some(tc) = tool_calls.into_iter().next() {
                let arguments = serde_json::from_str(&tc.function.arguments)
                    .map_err(|e| TarsyError::Llm(format!("failed to parse tool call arguments: {e}")))?;
                return Ok(LlmCompletion {
                    text: None,
                    tool_call: Some(LlmToolCall { id: Some(tc.id), name: tc.function.name, arguments }),
                    usage,
                });
            }
        }

        Ok(LlmCompletion { text: message.content, tool_call: None, usage })
    }
}
