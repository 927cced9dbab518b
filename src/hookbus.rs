use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use crate::types::TokenUsage;

tokio::task_local! {
    static SESSION_ID: String;
    static STAGE_EXECUTION_ID: String;
}

/// Runs `fut` with the given session/stage ids available to anything it
/// calls via `current_ids()`, so `HookBus::emit_*` call sites don't need to
/// thread ids through every function signature.
pub async fn with_context<F: std::future::Future>(session_id: String, stage_execution_id: String, fut: F) -> F::Output {
    SESSION_ID.scope(session_id, STAGE_EXECUTION_ID.scope(stage_execution_id, fut)).await
}

fn current_ids() -> (String, String) {
    let session_id = SESSION_ID.try_with(|s| s.clone()).unwrap_or_else(|_| "unknown".to_string());
    let stage_execution_id = STAGE_EXECUTION_ID.try_with(|s| s.clone()).unwrap_or_else(|_| "unknown".to_string());
    (session_id, stage_execution_id)
}

#[derive(Debug, Clone)]
pub struct LlmInteractionEvent {
    pub session_id: String,
    pub stage_execution_id: String,
    pub ts_us: i64,
    pub request_messages: Value,
    pub response_text: Option<String>,
    pub tool_call: Option<Value>,
    pub usage: Option<TokenUsage>,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct McpInteractionEvent {
    pub session_id: String,
    pub stage_execution_id: String,
    pub ts_us: i64,
    pub server_id: String,
    pub tool_name: String,
    pub arguments: Value,
    pub result: Option<Value>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleKind {
    SessionCreated,
    SessionFinalized,
    StageStarted,
    StageFinalized,
    RunbookFetchError,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct LifecycleEvent {
    pub session_id: String,
    pub stage_execution_id: Option<String>,
    pub ts_us: i64,
    pub kind: LifecycleKind,
    pub detail: Option<String>,
}

#[derive(Debug, Clone)]
pub enum HookEvent {
    Llm(LlmInteractionEvent),
    Mcp(McpInteractionEvent),
    Lifecycle(LifecycleEvent),
}

#[async_trait]
pub trait HookSubscriber: Send + Sync {
    async fn on_event(&self, event: &HookEvent) -> Result<(), crate::error::TarsyError>;
}

/// Fans out every audit-relevant occurrence to its subscribers in
/// registration order. A subscriber's failure is logged and does not stop
/// the others from seeing the event or the caller from proceeding — the
/// pipeline's correctness never depends on audit writes succeeding.
#[derive(Clone, Default)]
pub struct HookBus {
    subscribers: Vec<Arc<dyn HookSubscriber>>,
}

impl HookBus {
    pub fn new() -> Self {
        Self { subscribers: Vec::new() }
    }

    pub fn subscribe(&mut self, subscriber: Arc<dyn HookSubscriber>) {
        self.subscribers.push(subscriber);
    }

    pub async fn publish(&self, event: HookEvent) {
        for subscriber in &self.subscribers {
            if let Err(e) = subscriber.on_event(&event).await {
                tracing::error!(error = %e, "hook subscriber failed");
            }
        }
    }

    pub async fn emit_llm(
        &self,
        ts_us: i64,
        request_messages: Value,
        response_text: Option<String>,
        tool_call: Option<Value>,
        usage: Option<TokenUsage>,
        error: Option<String>,
    ) {
        let (session_id, stage_execution_id) = current_ids();
        self.publish(HookEvent::Llm(LlmInteractionEvent {
            session_id,
            stage_execution_id,
            ts_us,
            request_messages,
            response_text,
            tool_call,
            usage,
            error,
        }))
        .await;
    }

    pub async fn emit_mcp(
        &self,
        ts_us: i64,
        server_id: impl Into<String>,
        tool_name: impl Into<String>,
        arguments: Value,
        result: Option<Value>,
        error: Option<String>,
    ) {
        let (session_id, stage_execution_id) = current_ids();
        self.publish(HookEvent::Mcp(McpInteractionEvent {
            session_id,
            stage_execution_id,
            ts_us,
            server_id: server_id.into(),
            tool_name: tool_name.into(),
            arguments,
            result,
            error,
        }))
        .await;
    }

    /// Lifecycle events aren't always scoped to a running stage (e.g. a
    /// runbook fetch failure happens before any stage starts), so the stage
    /// id is read from context only when one is set.
    pub async fn emit_lifecycle(&self, session_id: impl Into<String>, ts_us: i64, kind: LifecycleKind, detail: Option<String>) {
        let stage_execution_id = STAGE_EXECUTION_ID.try_with(|s| s.clone()).ok();
        self.publish(HookEvent::Lifecycle(LifecycleEvent {
            session_id: session_id.into(),
            stage_execution_id,
            ts_us,
            kind,
            detail,
        }))
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct RecordingSubscriber {
        count: AtomicUsize,
        last_ids: Mutex<Option<(String, String)>>,
    }

    #[async_trait]
    impl HookSubscriber for RecordingSubscriber {
        async fn on_event(&self, event: &HookEvent) -> Result<(), crate::error::TarsyError> {
            self.count.fetch_add(1, Ordering::SeqCst);
            if let HookEvent::Llm(e) = event {
                *self.last_ids.lock().unwrap() = Some((e.session_id.clone(), e.stage_execution_id.clone()));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn emit_llm_picks_up_task_local_context() {
        let sub = Arc::new(RecordingSubscriber { count: AtomicUsize::new(0), last_ids: Mutex::new(None) });
        let mut bus = HookBus::new();
        bus.subscribe(sub.clone());

        with_context("session-1".into(), "stage-1".into(), async {
            bus.emit_llm(1, serde_json::json!([]), Some("hi".into()), None, None, None).await;
        })
        .await;

        assert_eq!(sub.count.load(Ordering::SeqCst), 1);
        assert_eq!(*sub.last_ids.lock().unwrap(), Some(("session-1".to_string(), "stage-1".to_string())));
    }

    struct FailingSubscriber;

    #[async_trait]
    impl HookSubscriber for FailingSubscriber {
        async fn on_event(&self, _event: &HookEvent) -> Result<(), crate::error::TarsyError> {
            Err(crate::error::TarsyError::Database("boom".into()))
        }
    }

    #[tokio::test]
    async fn a_failing_subscriber_does_not_stop_others() {
        let ok_sub = Arc::new(RecordingSubscriber { count: AtomicUsize::new(0), last_ids: Mutex::new(None) });
        let mut bus = HookBus::new();
        bus.subscribe(Arc::new(FailingSubscriber));
        bus.subscribe(ok_sub.clone());

        bus.emit_lifecycle("session-1", 1, LifecycleKind::SessionCreated, None).await;
        assert_eq!(ok_sub.count.load(Ordering::SeqCst), 0);

        bus.emit_llm(1, serde_json::json!([]), None, None, None, None).await;
        assert_eq!(ok_sub.count.load(Ordering::SeqCst), 1);
    }
}
