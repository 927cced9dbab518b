use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::TarsyError;
use crate::llm::{LlmClient, LlmCompletion, LlmRequest};

/// Scripted LLM client for tests: a queue of canned completions consumed in
/// order, with every request recorded for later assertions.
pub struct MockLlmClient {
    responses: Mutex<Vec<Result<LlmCompletion, String>>>,
    call_log: Mutex<Vec<LlmRequest>>,
}

impl MockLlmClient {
    pub fn new(responses: Vec<LlmCompletion>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().map(Ok).collect()),
            call_log: Mutex::new(Vec::new()),
        }
    }

    pub fn with_results(responses: Vec<Result<LlmCompletion, String>>) -> Self {
        Self { responses: Mutex::new(responses), call_log: Mutex::new(Vec::new()) }
    }

    pub async fn call_count(&self) -> usize {
        self.call_log.lock().await.len()
    }

    pub async fn request_for_call(&self, n: usize) -> Option<LlmRequest> {
        self.call_log.lock().await.get(n).cloned()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, request: LlmRequest) -> Result<LlmCompletion, TarsyError> {
        self.call_log.lock().await.push(request);

        let mut responses = self.responses.lock().await;
        if responses.is_empty() {
            return Err(TarsyError::Llm("MockLlmClient: no more programmed responses".into()));
        }
        match responses.remove(0) {
            Ok(completion) => Ok(completion),
            Err(message) => Err(TarsyError::Llm(message)),
        }
    }
}
