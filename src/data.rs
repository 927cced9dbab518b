use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::types::{IterationStrategy, StageStatus};

/// One MCP tool invocation made while producing a stage's result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpCallRecord {
    pub tool_name: String,
    pub arguments: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub ts_us: i64,
}

impl McpCallRecord {
    pub fn success(tool_name: String, arguments: serde_json::Value, result: serde_json::Value, ts_us: i64) -> Self {
        Self { tool_name, arguments, result: Some(result), error: None, ts_us }
    }

    pub fn failure(tool_name: String, arguments: serde_json::Value, error: String, ts_us: i64) -> Self {
        Self { tool_name, arguments, result: None, error: Some(error), ts_us }
    }
}

/// What a stage produced. `analysis` and `error` are mutually exclusive —
/// a stage is either a success (possibly with no analysis, for
/// data-collection-only strategies) or a failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    pub status: StageStatus,
    pub analysis: Option<String>,
    pub mcp_results: HashMap<String, Vec<McpCallRecord>>,
    pub strategy: IterationStrategy,
    pub ts_us: i64,
    pub error: Option<String>,
}

impl StageResult {
    pub fn success(
        strategy: IterationStrategy,
        ts_us: i64,
        analysis: Option<String>,
        mcp_results: HashMap<String, Vec<McpCallRecord>>,
    ) -> Self {
        Self { status: StageStatus::Success, analysis, mcp_results, strategy, ts_us, error: None }
    }

    pub fn error(
        strategy: IterationStrategy,
        ts_us: i64,
        error: String,
        mcp_results: HashMap<String, Vec<McpCallRecord>>,
    ) -> Self {
        Self { status: StageStatus::Error, analysis: None, mcp_results, strategy, ts_us, error: Some(error) }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, StageStatus::Success)
    }
}

/// The single owner of an alert's accumulated state as it flows through a
/// chain. Each field is written at most once per stage; nothing downstream
/// ever rewrites a prior stage's output. Owned exclusively by the task
/// driving that one alert through its chain — never shared across alerts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertProcessingData {
    pub alert_type: String,
    pub alert_data: serde_json::Value,
    pub runbook_url: Option<String>,
    pub runbook_content: Option<String>,
    stage_outputs: Vec<(String, StageResult)>,
}

impl AlertProcessingData {
    pub fn new(alert_type: impl Into<String>, alert_data: serde_json::Value, runbook_url: Option<String>) -> Self {
        Self {
            alert_type: alert_type.into(),
            alert_data,
            runbook_url,
            runbook_content: None,
            stage_outputs: Vec::new(),
        }
    }

    /// Records the result of a stage. Stages are appended in execution
    /// order and a given stage id is only ever recorded once.
    pub fn record_stage(&mut self, stage_id: impl Into<String>, result: StageResult) {
        self.stage_outputs.push((stage_id.into(), result));
    }

    pub fn stage_result(&self, stage_id: &str) -> Option<&StageResult> {
        self.stage_outputs.iter().find(|(id, _)| id == stage_id).map(|(_, r)| r)
    }

    pub fn stage_outputs(&self) -> &[(String, StageResult)] {
        &self.stage_outputs
    }

    /// Merges MCP call records from every completed stage, keyed by server
    /// id. Defensive against stages that recorded nothing — a stage with an
    /// empty or missing result simply contributes nothing.
    pub fn get_all_mcp_results(&self) -> HashMap<String, Vec<McpCallRecord>> {
        let mut merged: HashMap<String, Vec<McpCallRecord>> = HashMap::new();
        for (_, result) in &self.stage_outputs {
            for (server_id, records) in &result.mcp_results {
                merged.entry(server_id.clone()).or_default().extend(records.iter().cloned());
            }
        }
        merged
    }

    /// Concatenates every prior stage's analysis text, in order, for
    /// inclusion in a later stage's prompt. Stages with no analysis (or
    /// that failed) are skipped.
    pub fn prior_analyses(&self) -> Vec<(&str, &str)> {
        self.stage_outputs
            .iter()
            .filter_map(|(id, r)| r.analysis.as_deref().map(|a| (id.as_str(), a)))
            .collect()
    }
}
