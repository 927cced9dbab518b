use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::audit::store::{
    AlertSessionRow, AuditStore, LifecycleEventRow, LifecycleEventSummary, LlmInteractionRow, LlmInteractionSummary,
    McpInteractionRow, McpInteractionSummary, NewAlertSession, NewStageExecution, Page, SessionFilter, SessionTimeline,
    StageExecutionRow,
};
use crate::error::TarsyError;
use crate::types::{SessionStatus, StageExecStatus, StageStatus};

#[derive(Default)]
struct Inner {
    sessions: Vec<AlertSessionRow>,
    stages: Vec<StageExecutionRow>,
    llm_interactions: Vec<(String, LlmInteractionSummary)>,
    mcp_interactions: Vec<(String, McpInteractionSummary)>,
    lifecycle_events: Vec<(String, LifecycleEventSummary)>,
}

/// In-process audit store for tests: same semantics as `SqliteAuditStore`
/// (append-only interaction logs, idempotent finalize) without touching the
/// filesystem.
#[derive(Default)]
pub struct InMemoryAuditStore {
    inner: Mutex<Inner>,
}

impl InMemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AuditStore for InMemoryAuditStore {
    async fn create_session(&self, session: NewAlertSession) -> Result<(), TarsyError> {
        let mut inner = self.inner.lock().await;
        inner.sessions.push(AlertSessionRow {
            session_id: session.session_id,
            alert_type: session.alert_type,
            alert_data: session.alert_data,
            chain_id: None,
            status: SessionStatus::Processing,
            error_message: None,
            final_analysis: None,
            runbook_url: None,
            created_at_us: session.created_at_us,
            completed_at_us: None,
        });
        Ok(())
    }

    async fn set_session_chain(&self, session_id: &str, chain_id: &str) -> Result<(), TarsyError> {
        let mut inner = self.inner.lock().await;
        if let Some(row) = inner.sessions.iter_mut().find(|s| s.session_id == session_id) {
            row.chain_id = Some(chain_id.to_string());
        }
        Ok(())
    }

    async fn finalize_session(
        &self,
        session_id: &str,
        status: SessionStatus,
        error_message: Option<String>,
        final_analysis: Option<String>,
        completed_at_us: i64,
    ) -> Result<(), TarsyError> {
        let mut inner = self.inner.lock().await;
        if let Some(row) = inner.sessions.iter_mut().find(|s| s.session_id == session_id) {
            if row.completed_at_us.is_none() {
                row.status = status;
                row.error_message = error_message;
                row.final_analysis = final_analysis;
                row.completed_at_us = Some(completed_at_us);
            }
        }
        Ok(())
    }

    async fn create_stage_execution(&self, stage: NewStageExecution) -> Result<(), TarsyError> {
        let mut inner = self.inner.lock().await;
        inner.stages.push(StageExecutionRow {
            stage_execution_id: stage.stage_execution_id,
            session_id: stage.session_id,
            stage_id: stage.stage_id,
            agent_id: stage.agent_id,
            strategy: stage.strategy,
            status: StageExecStatus::Running,
            analysis: None,
            error_message: None,
            started_at_us: stage.started_at_us,
            completed_at_us: None,
        });
        Ok(())
    }

    async fn finalize_stage_execution(
        &self,
        stage_execution_id: &str,
        status: StageStatus,
        analysis: Option<String>,
        error_message: Option<String>,
        completed_at_us: i64,
    ) -> Result<(), TarsyError> {
        let mut inner = self.inner.lock().await;
        if let Some(row) = inner.stages.iter_mut().find(|s| s.stage_execution_id == stage_execution_id) {
            if row.completed_at_us.is_none() {
                row.status = match status {
                    StageStatus::Success => StageExecStatus::Completed,
                    StageStatus::Error => StageExecStatus::Failed,
                };
                row.analysis = analysis;
                row.error_message = error_message;
                row.completed_at_us = Some(completed_at_us);
            }
        }
        Ok(())
    }

    async fn record_llm_interaction(&self, row: LlmInteractionRow) -> Result<(), TarsyError> {
        let mut inner = self.inner.lock().await;
        let session_id = row.session_id.clone();
        inner.llm_interactions.push((
            session_id,
            LlmInteractionSummary {
                stage_execution_id: row.stage_execution_id,
                ts_us: row.ts_us,
                response_text: row.response_text,
                tool_call: row.tool_call,
                error: row.error,
            },
        ));
        Ok(())
    }

    async fn record_mcp_interaction(&self, row: McpInteractionRow) -> Result<(), TarsyError> {
        let mut inner = self.inner.lock().await;
        let session_id = row.session_id.clone();
        inner.mcp_interactions.push((
            session_id,
            McpInteractionSummary {
                stage_execution_id: row.stage_execution_id,
                ts_us: row.ts_us,
                server_id: row.server_id,
                tool_name: row.tool_name,
                error: row.error,
            },
        ));
        Ok(())
    }

    async fn record_lifecycle_event(&self, row: LifecycleEventRow) -> Result<(), TarsyError> {
        let mut inner = self.inner.lock().await;
        let session_id = row.session_id.clone();
        inner.lifecycle_events.push((
            session_id,
            LifecycleEventSummary { stage_execution_id: row.stage_execution_id, ts_us: row.ts_us, kind: row.kind, detail: row.detail },
        ));
        Ok(())
    }

    async fn list_sessions(&self, filter: SessionFilter) -> Result<Page<AlertSessionRow>, TarsyError> {
        let inner = self.inner.lock().await;
        let mut items: Vec<AlertSessionRow> = inner
            .sessions
            .iter()
            .filter(|s| filter.alert_type.as_ref().map(|t| t == &s.alert_type).unwrap_or(true))
            .filter(|s| filter.status.map(|st| st == s.status).unwrap_or(true))
            .cloned()
            .collect();
        items.sort_by(|a, b| b.created_at_us.cmp(&a.created_at_us));
        let total = items.len();
        let limit = if filter.limit == 0 { 50 } else { filter.limit };
        let items = items.into_iter().skip(filter.offset).take(limit).collect();
        Ok(Page { items, total })
    }

    async fn get_session_with_timeline(&self, session_id: &str) -> Result<Option<SessionTimeline>, TarsyError> {
        let inner = self.inner.lock().await;
        let Some(session) = inner.sessions.iter().find(|s| s.session_id == session_id).cloned() else {
            return Ok(None);
        };
        let stages = inner.stages.iter().filter(|s| s.session_id == session_id).cloned().collect();
        let llm_interactions =
            inner.llm_interactions.iter().filter(|(sid, _)| sid == session_id).map(|(_, i)| i.clone()).collect();
        let mcp_interactions =
            inner.mcp_interactions.iter().filter(|(sid, _)| sid == session_id).map(|(_, i)| i.clone()).collect();
        let lifecycle_events =
            inner.lifecycle_events.iter().filter(|(sid, _)| sid == session_id).map(|(_, e)| e.clone()).collect();

        Ok(Some(SessionTimeline { session, stages, llm_interactions, mcp_interactions, lifecycle_events }))
    }
}
