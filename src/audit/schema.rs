use rusqlite::Connection;

use crate::error::TarsyError;

/// Each entry is one additive migration, applied in order starting from
/// whatever `PRAGMA user_version` the database already has. Migrations are
/// never edited in place — a schema change is always a new entry appended
/// to this list.
const MIGRATIONS: &[&str] = &[
    // v1: sessions, stage executions, and the three interaction/event logs.
    r#"
    CREATE TABLE alert_sessions (
        session_id     TEXT PRIMARY KEY,
        alert_type     TEXT NOT NULL,
        alert_data     TEXT NOT NULL,
        chain_id       TEXT,
        status         TEXT NOT NULL,
        error_message  TEXT,
        final_analysis TEXT,
        runbook_url    TEXT,
        runbook_content TEXT,
        created_at_us  INTEGER NOT NULL,
        completed_at_us INTEGER
    );

    CREATE TABLE stage_executions (
        stage_execution_id TEXT PRIMARY KEY,
        session_id          TEXT NOT NULL REFERENCES alert_sessions(session_id),
        stage_id             TEXT NOT NULL,
        agent_id             TEXT NOT NULL,
        strategy              TEXT NOT NULL,
        status                TEXT NOT NULL,
        analysis              TEXT,
        error_message         TEXT,
        started_at_us         INTEGER NOT NULL,
        completed_at_us       INTEGER
    );

    CREATE TABLE llm_interactions (
        id                  INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id           TEXT NOT NULL,
        stage_execution_id   TEXT NOT NULL,
        ts_us                INTEGER NOT NULL,
        request_messages     TEXT NOT NULL,
        response_text        TEXT,
        tool_call            TEXT,
        prompt_tokens        INTEGER,
        completion_tokens    INTEGER,
        error                TEXT
    );

    CREATE TABLE mcp_interactions (
        id                  INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id           TEXT NOT NULL,
        stage_execution_id   TEXT NOT NULL,
        ts_us                INTEGER NOT NULL,
        server_id            TEXT NOT NULL,
        tool_name            TEXT NOT NULL,
        arguments            TEXT NOT NULL,
        result               TEXT,
        error                TEXT
    );

    CREATE TABLE lifecycle_events (
        id                  INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id           TEXT NOT NULL,
        stage_execution_id   TEXT,
        ts_us                INTEGER NOT NULL,
        kind                 TEXT NOT NULL,
        detail               TEXT
    );

    CREATE INDEX idx_stage_executions_session ON stage_executions(session_id);
    CREATE INDEX idx_llm_interactions_session ON llm_interactions(session_id);
    CREATE INDEX idx_mcp_interactions_session ON mcp_interactions(session_id);
    CREATE INDEX idx_lifecycle_events_session ON lifecycle_events(session_id);
    "#,
];

pub fn known_version() -> u32 {
    MIGRATIONS.len() as u32
}

/// Applies any migrations newer than the database's current
/// `user_version`. Refuses to open a database whose version is *ahead* of
/// what this binary knows — that means an older binary is pointed at a
/// newer store, and silently downgrading the schema would be wrong.
pub fn migrate(conn: &Connection) -> Result<(), TarsyError> {
    let found: u32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0)).map_err(|e| TarsyError::Database(e.to_string()))?;
    let known = known_version();

    if found > known {
        return Err(TarsyError::SchemaVersionMismatch { found, known });
    }

    for (i, migration) in MIGRATIONS.iter().enumerate() {
        let version = (i + 1) as u32;
        if version <= found {
            continue;
        }
        conn.execute_batch(migration).map_err(|e| TarsyError::Database(e.to_string()))?;
        conn.pragma_update(None, "user_version", version).map_err(|e| TarsyError::Database(e.to_string()))?;
    }

    Ok(())
}
