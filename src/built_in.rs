use crate::agent::{AgentConfig, AgentSource};
use crate::chain::{ChainDefinition, ChainStage};
use crate::mcp::types::McpServerConfig;
use crate::types::IterationStrategy;

/// The kubernetes-agent-chain shipped with every deployment: a single-stage
/// chain that investigates pod-level alerts using a kubectl-backed MCP
/// server.
pub fn built_in_chains() -> Vec<ChainDefinition> {
    vec![ChainDefinition {
        chain_id: "kubernetes-agent-chain".into(),
        alert_types: vec!["PodCrashLoop".into(), "PodOOMKilled".into(), "PodPending".into()],
        stages: vec![ChainStage { stage_id: "investigate".into(), agent_id: "kubernetes-agent".into(), iteration_strategy: None }],
    }]
}

pub fn built_in_agents() -> Vec<AgentConfig> {
    vec![AgentConfig {
        agent_id: "kubernetes-agent".into(),
        mcp_server_ids: vec!["kubernetes".into()],
        custom_instructions: Some(
            "You investigate Kubernetes pod alerts. Check pod status, recent events, and logs before concluding.".into(),
        ),
        default_strategy: Some(IterationStrategy::React),
        source: AgentSource::BuiltIn,
    }]
}

pub fn built_in_mcp_servers() -> Vec<McpServerConfig> {
    vec![McpServerConfig {
        server_id: "kubernetes".into(),
        enabled: true,
        command: "kubectl-mcp".into(),
        args: vec![],
        instructions: Some("Read-only kubectl access scoped to the alerting cluster.".into()),
    }]
}
