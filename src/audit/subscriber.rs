use async_trait::async_trait;
use std::sync::Arc;

use crate::audit::store::{AuditStore, LifecycleEventRow, LlmInteractionRow, McpInteractionRow};
use crate::error::TarsyError;
use crate::hookbus::{HookEvent, HookSubscriber, LifecycleKind};

/// The only `HookSubscriber` that writes to the audit trail. The
/// orchestrator and iteration controller never call `AuditStore` directly —
/// every write goes through the hook bus so that observability is
/// add-on, not load-bearing: removing this subscriber changes what gets
/// recorded, never whether the pipeline runs.
pub struct AuditSubscriber {
    store: Arc<dyn AuditStore>,
}

impl AuditSubscriber {
    pub fn new(store: Arc<dyn AuditStore>) -> Self {
        Self { store }
    }
}

fn lifecycle_kind_str(kind: LifecycleKind) -> &'static str {
    match kind {
        LifecycleKind::SessionCreated => "session_created",
        LifecycleKind::SessionFinalized => "session_finalized",
        LifecycleKind::StageStarted => "stage_started",
        LifecycleKind::StageFinalized => "stage_finalized",
        LifecycleKind::RunbookFetchError => "runbook_fetch_error",
        LifecycleKind::Cancelled => "cancelled",
    }
}

#[async_trait]
impl HookSubscriber for AuditSubscriber {
    async fn on_event(&self, event: &HookEvent) -> Result<(), TarsyError> {
        match event {
            HookEvent::Llm(e) => {
                self.store
                    .record_llm_interaction(LlmInteractionRow {
                        session_id: e.session_id.clone(),
                        stage_execution_id: e.stage_execution_id.clone(),
                        ts_us: e.ts_us,
                        request_messages: e.request_messages.clone(),
                        response_text: e.response_text.clone(),
                        tool_call: e.tool_call.clone(),
                        prompt_tokens: e.usage.map(|u| u.prompt_tokens),
                        completion_tokens: e.usage.map(|u| u.completion_tokens),
                        error: e.error.clone(),
                    })
                    .await
            }
            HookEvent::Mcp(e) => {
                self.store
                    .record_mcp_interaction(McpInteractionRow {
                        session_id: e.session_id.clone(),
                        stage_execution_id: e.stage_execution_id.clone(),
                        ts_us: e.ts_us,
                        server_id: e.server_id.clone(),
                        tool_name: e.tool_name.clone(),
                        arguments: e.arguments.clone(),
                        result: e.result.clone(),
                        error: e.error.clone(),
                    })
                    .await
            }
            HookEvent::Lifecycle(e) => {
                self.store
                    .record_lifecycle_event(LifecycleEventRow {
                        session_id: e.session_id.clone(),
                        stage_execution_id: e.stage_execution_id.clone(),
                        ts_us: e.ts_us,
                        kind: lifecycle_kind_str(e.kind).to_string(),
                        detail: e.detail.clone(),
                    })
                    .await
            }
        }
    }
}
