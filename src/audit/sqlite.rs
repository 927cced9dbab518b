use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::Path;
use tokio::sync::Mutex;

use crate::audit::schema;
use crate::audit::store::{
    AlertSessionRow, AuditStore, LifecycleEventRow, LifecycleEventSummary, LlmInteractionRow, LlmInteractionSummary,
    McpInteractionRow, McpInteractionSummary, NewAlertSession, NewStageExecution, Page, SessionFilter, SessionTimeline,
    StageExecutionRow,
};
use crate::error::TarsyError;
use crate::types::{SessionStatus, StageExecStatus, StageStatus};

/// Audit trail backed by an on-disk (or in-memory, via `:memory:`) SQLite
/// database. `rusqlite::Connection` is `Send` but not `Sync`, so access is
/// serialized behind a `tokio::sync::Mutex` — write volume here is a
/// fraction of the LLM/MCP round trips it's recording, so the serialization
/// is never the bottleneck.
pub struct SqliteAuditStore {
    conn: Mutex<Connection>,
}

impl SqliteAuditStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, TarsyError> {
        let conn = Connection::open(path).map_err(|e| TarsyError::Database(e.to_string()))?;
        schema::migrate(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> Result<Self, TarsyError> {
        let conn = Connection::open_in_memory().map_err(|e| TarsyError::Database(e.to_string()))?;
        schema::migrate(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn row_to_session(row: &rusqlite::Row) -> rusqlite::Result<AlertSessionRow> {
        let alert_data: String = row.get("alert_data")?;
        let status: String = row.get("status")?;
        Ok(AlertSessionRow {
            session_id: row.get("session_id")?,
            alert_type: row.get("alert_type")?,
            alert_data: serde_json::from_str(&alert_data).unwrap_or(Value::Null),
            chain_id: row.get("chain_id")?,
            status: parse_session_status(&status),
            error_message: row.get("error_message")?,
            final_analysis: row.get("final_analysis")?,
            runbook_url: row.get("runbook_url")?,
            created_at_us: row.get("created_at_us")?,
            completed_at_us: row.get("completed_at_us")?,
        })
    }
}

fn parse_session_status(s: &str) -> SessionStatus {
    match s {
        "pending" => SessionStatus::Pending,
        "completed" => SessionStatus::Completed,
        "partial" => SessionStatus::PartiallyFailed,
        "failed" => SessionStatus::Failed,
        _ => SessionStatus::Processing,
    }
}

fn parse_stage_exec_status(s: &str) -> StageExecStatus {
    match s {
        "completed" => StageExecStatus::Completed,
        "failed" => StageExecStatus::Failed,
        _ => StageExecStatus::Running,
    }
}

#[async_trait]
impl AuditStore for SqliteAuditStore {
    async fn create_session(&self, session: NewAlertSession) -> Result<(), TarsyError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO alert_sessions (session_id, alert_type, alert_data, status, created_at_us)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                session.session_id,
                session.alert_type,
                session.alert_data.to_string(),
                SessionStatus::Processing.to_string(),
                session.created_at_us,
            ],
        )
        .map_err(|e| TarsyError::Database(e.to_string()))?;
        Ok(())
    }

    async fn set_session_chain(&self, session_id: &str, chain_id: &str) -> Result<(), TarsyError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE alert_sessions SET chain_id = ?1 WHERE session_id = ?2",
            params![chain_id, session_id],
        )
        .map_err(|e| TarsyError::Database(e.to_string()))?;
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
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE alert_sessions SET status = ?1, error_message = ?2, final_analysis = ?3, completed_at_us = ?4
             WHERE session_id = ?5 AND completed_at_us IS NULL",
            params![status.to_string(), error_message, final_analysis, completed_at_us, session_id],
        )
        .map_err(|e| TarsyError::Database(e.to_string()))?;
        Ok(())
    }

    async fn create_stage_execution(&self, stage: NewStageExecution) -> Result<(), TarsyError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO stage_executions
             (stage_execution_id, session_id, stage_id, agent_id, strategy, status, started_at_us)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                stage.stage_execution_id,
                stage.session_id,
                stage.stage_id,
                stage.agent_id,
                stage.strategy,
                StageExecStatus::Running.to_display(),
                stage.started_at_us,
            ],
        )
        .map_err(|e| TarsyError::Database(e.to_string()))?;
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
        let exec_status = match status {
            StageStatus::Success => StageExecStatus::Completed,
            StageStatus::Error => StageExecStatus::Failed,
        };
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE stage_executions SET status = ?1, analysis = ?2, error_message = ?3, completed_at_us = ?4
             WHERE stage_execution_id = ?5 AND completed_at_us IS NULL",
            params![exec_status.to_display(), analysis, error_message, completed_at_us, stage_execution_id],
        )
        .map_err(|e| TarsyError::Database(e.to_string()))?;
        Ok(())
    }

    async fn record_llm_interaction(&self, row: LlmInteractionRow) -> Result<(), TarsyError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO llm_interactions
             (session_id, stage_execution_id, ts_us, request_messages, response_text, tool_call,
              prompt_tokens, completion_tokens, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                row.session_id,
                row.stage_execution_id,
                row.ts_us,
                row.request_messages.to_string(),
                row.response_text,
                row.tool_call.map(|v| v.to_string()),
                row.prompt_tokens,
                row.completion_tokens,
                row.error,
            ],
        )
        .map_err(|e| TarsyError::Database(e.to_string()))?;
        Ok(())
    }

    async fn record_mcp_interaction(&self, row: McpInteractionRow) -> Result<(), TarsyError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO mcp_interactions
             (session_id, stage_execution_id, ts_us, server_id, tool_name, arguments, result, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                row.session_id,
                row.stage_execution_id,
                row.ts_us,
                row.server_id,
                row.tool_name,
                row.arguments.to_string(),
                row.result.map(|v| v.to_string()),
                row.error,
            ],
        )
        .map_err(|e| TarsyError::Database(e.to_string()))?;
        Ok(())
    }

    async fn record_lifecycle_event(&self, row: LifecycleEventRow) -> Result<(), TarsyError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO lifecycle_events (session_id, stage_execution_id, ts_us, kind, detail)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![row.session_id, row.stage_execution_id, row.ts_us, row.kind, row.detail],
        )
        .map_err(|e| TarsyError::Database(e.to_string()))?;
        Ok(())
    }

    async fn list_sessions(&self, filter: SessionFilter) -> Result<Page<AlertSessionRow>, TarsyError> {
        let conn = self.conn.lock().await;

        let mut clauses = Vec::new();
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(alert_type) = &filter.alert_type {
            clauses.push("alert_type = ?");
            args.push(Box::new(alert_type.clone()));
        }
        if let Some(status) = filter.status {
            clauses.push("status = ?");
            args.push(Box::new(status.to_string()));
        }
        let where_clause = if clauses.is_empty() { String::new() } else { format!("WHERE {}", clauses.join(" AND ")) };

        let count_sql = format!("SELECT COUNT(*) FROM alert_sessions {where_clause}");
        let total: i64 = conn
            .query_row(&count_sql, rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())), |row| row.get(0))
            .map_err(|e| TarsyError::Database(e.to_string()))?;

        let limit = if filter.limit == 0 { 50 } else { filter.limit };
        let list_sql =
            format!("SELECT * FROM alert_sessions {where_clause} ORDER BY created_at_us DESC LIMIT {limit} OFFSET {}", filter.offset);
        let mut stmt = conn.prepare(&list_sql).map_err(|e| TarsyError::Database(e.to_string()))?;
        let items = stmt
            .query_map(rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())), Self::row_to_session)
            .map_err(|e| TarsyError::Database(e.to_string()))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| TarsyError::Database(e.to_string()))?;

        Ok(Page { items, total: total as usize })
    }

    async fn get_session_with_timeline(&self, session_id: &str) -> Result<Option<SessionTimeline>, TarsyError> {
        let conn = self.conn.lock().await;

        let session: Option<AlertSessionRow> = conn
            .query_row("SELECT * FROM alert_sessions WHERE session_id = ?1", params![session_id], Self::row_to_session)
            .optional()
            .map_err(|e| TarsyError::Database(e.to_string()))?;

        let Some(session) = session else { return Ok(None) };

        let mut stmt = conn
            .prepare("SELECT * FROM stage_executions WHERE session_id = ?1 ORDER BY started_at_us ASC")
            .map_err(|e| TarsyError::Database(e.to_string()))?;
        let stages = stmt
            .query_map(params![session_id], |row| {
                let status: String = row.get("status")?;
                Ok(StageExecutionRow {
                    stage_execution_id: row.get("stage_execution_id")?,
                    session_id: row.get("session_id")?,
                    stage_id: row.get("stage_id")?,
                    agent_id: row.get("agent_id")?,
                    strategy: row.get("strategy")?,
                    status: parse_stage_exec_status(&status),
                    analysis: row.get("analysis")?,
                    error_message: row.get("error_message")?,
                    started_at_us: row.get("started_at_us")?,
                    completed_at_us: row.get("completed_at_us")?,
                })
            })
            .map_err(|e| TarsyError::Database(e.to_string()))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| TarsyError::Database(e.to_string()))?;

        let mut stmt = conn
            .prepare("SELECT * FROM llm_interactions WHERE session_id = ?1 ORDER BY ts_us ASC")
            .map_err(|e| TarsyError::Database(e.to_string()))?;
        let llm_interactions = stmt
            .query_map(params![session_id], |row| {
                let tool_call: Option<String> = row.get("tool_call")?;
                Ok(LlmInteractionSummary {
                    stage_execution_id: row.get("stage_execution_id")?,
                    ts_us: row.get("ts_us")?,
                    response_text: row.get("response_text")?,
                    tool_call: tool_call.and_then(|s| serde_json::from_str(&s).ok()),
                    error: row.get("error")?,
                })
            })
            .map_err(|e| TarsyError::Database(e.to_string()))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| TarsyError::Database(e.to_string()))?;

        let mut stmt = conn
            .prepare("SELECT * FROM mcp_interactions WHERE session_id = ?1 ORDER BY ts_us ASC")
            .map_err(|e| TarsyError::Database(e.to_string()))?;
        let mcp_interactions = stmt
            .query_map(params![session_id], |row| {
                Ok(McpInteractionSummary {
                    stage_execution_id: row.get("stage_execution_id")?,
                    ts_us: row.get("ts_us")?,
                    server_id: row.get("server_id")?,
                    tool_name: row.get("tool_name")?,
                    error: row.get("error")?,
                })
            })
            .map_err(|e| TarsyError::Database(e.to_string()))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| TarsyError::Database(e.to_string()))?;

        let mut stmt = conn
            .prepare("SELECT * FROM lifecycle_events WHERE session_id = ?1 ORDER BY ts_us ASC")
            .map_err(|e| TarsyError::Database(e.to_string()))?;
        let lifecycle_events = stmt
            .query_map(params![session_id], |row| {
                Ok(LifecycleEventSummary {
                    stage_execution_id: row.get("stage_execution_id")?,
                    ts_us: row.get("ts_us")?,
                    kind: row.get("kind")?,
                    detail: row.get("detail")?,
                })
            })
            .map_err(|e| TarsyError::Database(e.to_string()))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| TarsyError::Database(e.to_string()))?;

        Ok(Some(SessionTimeline { session, stages, llm_interactions, mcp_interactions, lifecycle_events }))
    }
}

trait StageExecStatusDisplay {
    fn to_display(&self) -> &'static str;
}

impl StageExecStatusDisplay for StageExecStatus {
    fn to_display(&self) -> &'static str {
        match self {
            StageExecStatus::Running => "running",
            StageExecStatus::Completed => "completed",
            StageExecStatus::Failed => "failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn finalize_session_is_idempotent() {
        let store = SqliteAuditStore::open_in_memory().unwrap();
        store
            .create_session(NewAlertSession {
                session_id: "s1".into(),
                alert_type: "PodCrashLoop".into(),
                alert_data: Value::Null,
                created_at_us: 1,
            })
            .await
            .unwrap();

        store.finalize_session("s1", SessionStatus::Completed, None, Some("ok".into()), 10).await.unwrap();
        store.finalize_session("s1", SessionStatus::Failed, Some("late error".into()), None, 20).await.unwrap();

        let page = store.list_sessions(SessionFilter::default()).await.unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].status, SessionStatus::Completed);
        assert_eq!(page.items[0].completed_at_us, Some(10));
    }

    #[tokio::test]
    async fn rejects_database_from_a_newer_schema_version() {
        let conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "user_version", 9999u32).unwrap();
        let err = schema::migrate(&conn).unwrap_err();
        assert!(matches!(err, TarsyError::SchemaVersionMismatch { .. }));
    }

    #[tokio::test]
    async fn timeline_includes_lifecycle_events_with_no_stage() {
        let store = SqliteAuditStore::open_in_memory().unwrap();
        store
            .create_session(NewAlertSession {
                session_id: "s1".into(),
                alert_type: "PodCrashLoop".into(),
                alert_data: Value::Null,
                created_at_us: 1,
            })
            .await
            .unwrap();
        store
            .record_lifecycle_event(LifecycleEventRow {
                session_id: "s1".into(),
                stage_execution_id: None,
                ts_us: 2,
                kind: "runbook_fetch_error".into(),
                detail: Some("timeout".into()),
            })
            .await
            .unwrap();

        let timeline = store.get_session_with_timeline("s1").await.unwrap().unwrap();
        assert_eq!(timeline.lifecycle_events.len(), 1);
        assert!(timeline.stages.is_empty());
    }
}
