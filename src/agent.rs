use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

use crate::clock::SessionClock;
use crate::data::{AlertProcessingData, StageResult};
use crate::error::TarsyError;
use crate::hookbus::HookBus;
use crate::iteration::controller::{run_stage, ToolDispatcher, DEFAULT_MAX_ITERATIONS};
use crate::llm::LlmClient;
use crate::mcp::registry::McpRegistry;
use crate::prompt::{build_initial_messages, build_tool_schemas};
use crate::types::IterationStrategy;

/// Where an agent's definition came from. Both variants carry the same
/// shape — this only affects what the audit trail reports, never behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentSource {
    BuiltIn,
    Configured,
}

/// An agent is a named bundle of MCP server access plus default iteration
/// behavior. A built-in agent and a user-configured one are the same type —
/// there is no separate trait hierarchy per agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub agent_id: String,
    #[serde(default)]
    pub mcp_server_ids: Vec<String>,
    #[serde(default)]
    pub custom_instructions: Option<String>,
    #[serde(default)]
    pub default_strategy: Option<IterationStrategy>,
    pub source: AgentSource,
}

#[derive(Default)]
pub struct AgentRegistry {
    agents: HashMap<String, AgentConfig>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self { agents: HashMap::new() }
    }

    pub fn insert(&mut self, config: AgentConfig) {
        self.agents.insert(config.agent_id.clone(), config);
    }

    pub fn get(&self, agent_id: &str) -> Option<&AgentConfig> {
        self.agents.get(agent_id)
    }
}

/// Dispatches a prefixed tool name (`server_id__tool_name`) to whichever
/// server owns it, restricted to the servers an agent was actually
/// configured with. `McpConnectionPool` is referenced through a trait
/// object so this module doesn't need the concrete pool type at compile
/// time in tests.
#[async_trait]
pub trait McpDispatchBackend: Send + Sync {
    async fn list_tools(&self, session_id: &str, config: &crate::mcp::types::McpServerConfig) -> Result<Vec<crate::mcp::types::McpToolDef>, TarsyError>;
    async fn call(&self, server_id: &str, tool_name: &str, arguments: Value) -> Result<Value, TarsyError>;
}

/// Dispatches only tools present in the agent's own gathered catalog,
/// scoped to the MCP servers it was configured with. A tool name not found
/// there — wrong server, typo'd tool, or a server the agent was never
/// granted — surfaces as a structured `ToolNotAvailable` the iteration
/// controller can feed back to the model as an observation, rather than an
/// opaque dispatch failure.
struct ScopedDispatcher<'a> {
    backend: &'a dyn McpDispatchBackend,
    catalog: &'a [(String, Vec<crate::mcp::types::McpToolDef>)],
}

#[async_trait]
impl<'a> ToolDispatcher for ScopedDispatcher<'a> {
    async fn call(&self, prefixed_name: &str, arguments: Value) -> Result<(String, Value), TarsyError> {
        let Some((server_id, tool_name)) = prefixed_name.split_once("__") else {
            return Err(TarsyError::ToolNotAvailable { server: String::new(), tool: prefixed_name.into(), available: vec![] });
        };

        let Some((_, tools)) = self.catalog.iter().find(|(id, _)| id == server_id) else {
            return Err(TarsyError::ToolNotAvailable { server: server_id.into(), tool: tool_name.into(), available: vec![] });
        };

        if !tools.iter().any(|t| t.name == tool_name) {
            return Err(TarsyError::ToolNotAvailable {
                server: server_id.into(),
                tool: tool_name.into(),
                available: tools.iter().map(|t| t.name.clone()).collect(),
            });
        }

        let result = self.backend.call(server_id, tool_name, arguments).await?;
        Ok((server_id.to_string(), result))
    }
}

/// Runs one agent's stage: gathers its tool catalog, assembles the initial
/// prompt from everything the alert has accumulated so far, and drives the
/// bounded iteration loop. Every internal failure (a bad tool call, an
/// unparseable response, a timeout) is caught here and mapped into
/// `StageResult::error` — nothing escapes as an exception across the stage
/// boundary.
pub struct AgentRuntime<'a> {
    pub llm: &'a dyn LlmClient,
    pub mcp_backend: &'a dyn McpDispatchBackend,
    pub mcp_registry: &'a McpRegistry,
    pub hookbus: &'a HookBus,
    pub clock: &'a SessionClock,
    pub model: &'a str,
    pub max_iterations: u32,
}

impl<'a> AgentRuntime<'a> {
    pub fn new(
        llm: &'a dyn LlmClient,
        mcp_backend: &'a dyn McpDispatchBackend,
        mcp_registry: &'a McpRegistry,
        hookbus: &'a HookBus,
        clock: &'a SessionClock,
        model: &'a str,
    ) -> Self {
        Self { llm, mcp_backend, mcp_registry, hookbus, clock, model, max_iterations: DEFAULT_MAX_ITERATIONS }
    }

    pub async fn process_alert(
        &self,
        session_id: &str,
        agent: &AgentConfig,
        strategy: IterationStrategy,
        data: &AlertProcessingData,
        cancellation: &CancellationToken,
    ) -> StageResult {
        let ts_us = self.clock.now_us();

        let mut catalog = Vec::new();
        if strategy.allows_tools() {
            for server_id in &agent.mcp_server_ids {
                let Some(config) = self.mcp_registry.get(server_id) else {
                    return StageResult::error(strategy, ts_us, format!("unknown mcp server '{server_id}'"), HashMap::new());
                };
                match self.mcp_backend.list_tools(session_id, config).await {
                    Ok(tools) => catalog.push((server_id.clone(), tools)),
                    Err(e) => return StageResult::error(strategy, ts_us, e.to_string(), HashMap::new()),
                }
            }
        }

        let tools = build_tool_schemas(&catalog);
        let messages = build_initial_messages(strategy, agent.custom_instructions.as_deref(), &catalog, data);
        let dispatcher = ScopedDispatcher { backend: self.mcp_backend, catalog: &catalog };

        let outcome = run_stage(
            self.llm,
            &dispatcher,
            self.hookbus,
            self.clock,
            cancellation,
            self.model,
            strategy,
            messages,
            tools,
            self.max_iterations,
        )
        .await;

        match outcome.status {
            crate::types::StageStatus::Success => StageResult::success(strategy, ts_us, outcome.analysis, outcome.mcp_results),
            crate::types::StageStatus::Error => {
                StageResult::error(strategy, ts_us, outcome.error.unwrap_or_default(), outcome.mcp_results)
            }
        }
    }
}
