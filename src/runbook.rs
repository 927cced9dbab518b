use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::error::TarsyError;

const RUNBOOK_TIMEOUT: Duration = Duration::from_secs(30);

/// Fetches the text of a runbook given its URL. A failure here is
/// recoverable at the orchestrator level — the session proceeds with an
/// empty runbook and a recorded lifecycle event rather than failing
/// outright.
#[async_trait]
pub trait RunbookFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<String, TarsyError>;
}

pub struct HttpRunbookFetcher {
    client: reqwest::Client,
}

impl HttpRunbookFetcher {
    pub fn new() -> Self {
        Self { client: reqwest::Client::builder().timeout(RUNBOOK_TIMEOUT).build().expect("reqwest client builds") }
    }
}

impl Default for HttpRunbookFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RunbookFetcher for HttpRunbookFetcher {
    async fn fetch(&self, url: &str) -> Result<String, TarsyError> {
        let response = self.client.get(url).send().await.map_err(|e| TarsyError::RunbookFetch(e.to_string()))?;

        if !response.status().is_success() {
            return Err(TarsyError::RunbookFetch(format!("status {}", response.status())));
        }

        response.text().await.map_err(|e| TarsyError::RunbookFetch(e.to_string()))
    }
}

/// Scripted fetcher for tests: returns a fixed response (success or
/// failure) for every call, and records the urls it was asked to fetch.
pub struct MockRunbookFetcher {
    response: Result<String, String>,
    calls: Mutex<Vec<String>>,
}

impl MockRunbookFetcher {
    pub fn ok(content: impl Into<String>) -> Self {
        Self { response: Ok(content.into()), calls: Mutex::new(Vec::new()) }
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self { response: Err(message.into()), calls: Mutex::new(Vec::new()) }
    }

    pub async fn calls(&self) -> Vec<String> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl RunbookFetcher for MockRunbookFetcher {
    async fn fetch(&self, url: &str) -> Result<String, TarsyError> {
        self.calls.lock().await.push(url.to_string());
        self.response.clone().map_err(TarsyError::RunbookFetch)
    }
}
