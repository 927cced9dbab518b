use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::TarsyError;
use crate::types::{SessionStatus, StageExecStatus, StageStatus};

#[derive(Debug, Clone)]
pub struct NewAlertSession {
    pub session_id: String,
    pub alert_type: String,
    pub alert_data: Value,
    pub created_at_us: i64,
}

#[derive(Debug, Clone)]
pub struct NewStageExecution {
    pub stage_execution_id: String,
    pub session_id: String,
    pub stage_id: String,
    pub agent_id: String,
    pub strategy: String,
    pub started_at_us: i64,
}

#[derive(Debug, Clone)]
pub struct LlmInteractionRow {
    pub session_id: String,
    pub stage_execution_id: String,
    pub ts_us: i64,
    pub request_messages: Value,
    pub response_text: Option<String>,
    pub tool_call: Option<Value>,
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct McpInteractionRow {
    pub session_id: String,
    pub stage_execution_id: String,
    pub ts_us: i64,
    pub server_id: String,
    pub tool_name: String,
    pub arguments: Value,
    pub result: Option<Value>,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LifecycleEventRow {
    pub session_id: String,
    pub stage_execution_id: Option<String>,
    pub ts_us: i64,
    pub kind: String,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertSessionRow {
    pub session_id: String,
    pub alert_type: String,
    pub alert_data: Value,
    pub chain_id: Option<String>,
    pub status: SessionStatus,
    pub error_message: Option<String>,
    pub final_analysis: Option<String>,
    pub runbook_url: Option<String>,
    pub created_at_us: i64,
    pub completed_at_us: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageExecutionRow {
    pub stage_execution_id: String,
    pub session_id: String,
    pub stage_id: String,
    pub agent_id: String,
    pub strategy: String,
    pub status: StageExecStatus,
    pub analysis: Option<String>,
    pub error_message: Option<String>,
    pub started_at_us: i64,
    pub completed_at_us: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionTimeline {
    pub session: AlertSessionRow,
    pub stages: Vec<StageExecutionRow>,
    pub llm_interactions: Vec<LlmInteractionSummary>,
    pub mcp_interactions: Vec<McpInteractionSummary>,
    pub lifecycle_events: Vec<LifecycleEventSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmInteractionSummary {
    pub stage_execution_id: String,
    pub ts_us: i64,
    pub response_text: Option<String>,
    pub tool_call: Option<Value>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpInteractionSummary {
    pub stage_execution_id: String,
    pub ts_us: i64,
    pub server_id: String,
    pub tool_name: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleEventSummary {
    pub stage_execution_id: Option<String>,
    pub ts_us: i64,
    pub kind: String,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub alert_type: Option<String>,
    pub status: Option<SessionStatus>,
    pub limit: usize,
    pub offset: usize,
}

#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
}

/// The one write path for everything that ends up in a session's audit
/// trail, and the read path the dashboard/API layer queries against.
/// Implementations must make `finalize_session` and
/// `finalize_stage_execution` idempotent: calling either again on an
/// already-terminal row is a no-op, not an error, since a cancellation and a
/// completion can race to finalize the same row.
#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn create_session(&self, session: NewAlertSession) -> Result<(), TarsyError>;
    async fn set_session_chain(&self, session_id: &str, chain_id: &str) -> Result<(), TarsyError>;
    async fn finalize_session(
        &self,
        session_id: &str,
        status: SessionStatus,
        error_message: Option<String>,
        final_analysis: Option<String>,
        completed_at_us: i64,
    ) -> Result<(), TarsyError>;

    async fn create_stage_execution(&self, stage: NewStageExecution) -> Result<(), TarsyError>;
    async fn finalize_stage_execution(
        &self,
        stage_execution_id: &str,
        status: StageStatus,
        analysis: Option<String>,
        error_message: Option<String>,
        completed_at_us: i64,
    ) -> Result<(), TarsyError>;

    async fn record_llm_interaction(&self, row: LlmInteractionRow) -> Result<(), TarsyError>;
    async fn record_mcp_interaction(&self, row: McpInteractionRow) -> Result<(), TarsyError>;
    async fn record_lifecycle_event(&self, row: LifecycleEventRow) -> Result<(), TarsyError>;

    async fn list_sessions(&self, filter: SessionFilter) -> Result<Page<AlertSessionRow>, TarsyError>;
    async fn get_session_with_timeline(&self, session_id: &str) -> Result<Option<SessionTimeline>, TarsyError>;
}
