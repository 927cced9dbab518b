use thiserror::Error;

/// The single error type returned by fallible operations at the edges of the
/// pipeline: registry construction, configuration loading, and storage I/O.
///
/// Failures that occur *inside* a running stage (a bad tool call, an
/// unparseable LLM response, a blown iteration budget) are not represented
/// here — they are captured as `StageResult::error` and never cross a stage
/// boundary as an exception. See `iteration::controller`.
#[derive(Debug, Error)]
pub enum TarsyError {
    #[error("unknown alert type '{requested}', known types: {known:?}")]
    UnknownAlertType { requested: String, known: Vec<String> },

    #[error("duplicate chain id '{0}'")]
    DuplicateChainId(String),

    #[error("alert type '{alert_type}' claimed by both chain '{chain_a}' and chain '{chain_b}'")]
    AlertTypeConflict {
        alert_type: String,
        chain_a: String,
        chain_b: String,
    },

    #[error("unknown agent '{0}'")]
    UnknownAgent(String),

    #[error("unknown mcp server '{0}'")]
    UnknownMcpServer(String),

    #[error("mcp server '{0}' is disabled")]
    McpServerDisabled(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("runbook fetch failed: {0}")]
    RunbookFetch(String),

    #[error("llm call failed: {0}")]
    Llm(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("tool '{tool}' not available on server '{server}', available: {available:?}")]
    ToolNotAvailable {
        server: String,
        tool: String,
        available: Vec<String>,
    },

    #[error("mcp tool call failed: {0}")]
    McpTool(String),

    #[error("iteration budget exhausted")]
    IterationBudgetExhausted,

    #[error("unparseable llm response: {0}")]
    UnparseableResponse(String),

    #[error("stage agent error: {0}")]
    StageAgent(String),

    #[error("cancelled")]
    Cancelled,

    #[error("schema version mismatch: found {found}, known up to {known}")]
    SchemaVersionMismatch { found: u32, known: u32 },

    #[error("database error: {0}")]
    Database(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

impl TarsyError {
    /// Whether the orchestrator may retry or continue the chain after this
    /// error, versus treating it as a hard stop for the whole session.
    pub fn recoverable(&self) -> bool {
        match self {
            TarsyError::RunbookFetch(_)
            | TarsyError::Llm(_)
            | TarsyError::Timeout(_)
            | TarsyError::ToolNotAvailable { .. }
            | TarsyError::McpTool(_)
            | TarsyError::UnparseableResponse(_) => true,

            TarsyError::UnknownAlertType { .. }
            | TarsyError::DuplicateChainId(_)
            | TarsyError::AlertTypeConflict { .. }
            | TarsyError::UnknownAgent(_)
            | TarsyError::UnknownMcpServer(_)
            | TarsyError::McpServerDisabled(_)
            | TarsyError::Configuration(_)
            | TarsyError::IterationBudgetExhausted
            | TarsyError::StageAgent(_)
            | TarsyError::Cancelled
            | TarsyError::SchemaVersionMismatch { .. }
            | TarsyError::Database(_)
            | TarsyError::Io(_)
            | TarsyError::Serialization(_) => false,
        }
    }
}
