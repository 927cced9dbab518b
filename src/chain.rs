use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::agent::AgentRegistry;
use crate::error::TarsyError;
use crate::mcp::registry::McpRegistry;
use crate::types::IterationStrategy;

/// One step of a chain: run a named agent, optionally overriding its
/// default iteration strategy for this stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainStage {
    pub stage_id: String,
    pub agent_id: String,
    #[serde(default)]
    pub iteration_strategy: Option<IterationStrategy>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainDefinition {
    pub chain_id: String,
    pub alert_types: Vec<String>,
    pub stages: Vec<ChainStage>,
}

/// Read-only after construction. Maps an alert type to the one chain that
/// handles it, and validates that both agents and MCP servers referenced by
/// every chain's stages actually exist.
pub struct ChainRegistry {
    chains: HashMap<String, Arc<ChainDefinition>>,
    by_alert_type: HashMap<String, String>,
}

impl ChainRegistry {
    pub fn build(
        built_in: Vec<ChainDefinition>,
        user_supplied: Vec<ChainDefinition>,
        agents: &AgentRegistry,
        mcp: &McpRegistry,
    ) -> Result<Self, TarsyError> {
        let mut chains: HashMap<String, Arc<ChainDefinition>> = HashMap::new();
        let mut by_alert_type: HashMap<String, String> = HashMap::new();

        for chain in built_in.into_iter().chain(user_supplied.into_iter()) {
            if chains.contains_key(&chain.chain_id) {
                return Err(TarsyError::DuplicateChainId(chain.chain_id));
            }

            for stage in &chain.stages {
                let agent = agents
                    .get(&stage.agent_id)
                    .ok_or_else(|| TarsyError::UnknownAgent(stage.agent_id.clone()))?;
                for server_id in &agent.mcp_server_ids {
                    match mcp.get(server_id) {
                        None => return Err(TarsyError::UnknownMcpServer(server_id.clone())),
                        Some(config) if !config.enabled => return Err(TarsyError::McpServerDisabled(server_id.clone())),
                        Some(_) => {}
                    }
                }
            }

            for alert_type in &chain.alert_types {
                if let Some(existing) = by_alert_type.get(alert_type) {
                    return Err(TarsyError::AlertTypeConflict {
                        alert_type: alert_type.clone(),
                        chain_a: existing.clone(),
                        chain_b: chain.chain_id.clone(),
                    });
                }
                by_alert_type.insert(alert_type.clone(), chain.chain_id.clone());
            }

            chains.insert(chain.chain_id.clone(), Arc::new(chain));
        }

        Ok(Self { chains, by_alert_type })
    }

    pub fn resolve(&self, alert_type: &str) -> Result<Arc<ChainDefinition>, TarsyError> {
        let chain_id = self.by_alert_type.get(alert_type).ok_or_else(|| TarsyError::UnknownAlertType {
            requested: alert_type.to_string(),
            known: {
                let mut known: Vec<String> = self.by_alert_type.keys().cloned().collect();
                known.sort();
                known
            },
        })?;
        Ok(Arc::clone(&self.chains[chain_id]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentConfig, AgentSource};
    use crate::mcp::registry::McpRegistry;
    use crate::mcp::types::McpServerConfig;

    fn agents_with(mcp_server_ids: Vec<String>) -> AgentRegistry {
        let mut agents = AgentRegistry::new();
        agents.insert(AgentConfig {
            agent_id: "kubernetes-agent".into(),
            mcp_server_ids,
            custom_instructions: None,
            default_strategy: Some(IterationStrategy::React),
            source: AgentSource::BuiltIn,
        });
        agents
    }

    fn mcp_with(server_id: &str) -> McpRegistry {
        let mut mcp = McpRegistry::new();
        mcp.insert(McpServerConfig {
            server_id: server_id.to_string(),
            enabled: true,
            command: "kubectl-mcp".into(),
            args: vec![],
            instructions: None,
        });
        mcp
    }

    #[test]
    fn rejects_duplicate_chain_ids() {
        let agents = agents_with(vec!["kubernetes".into()]);
        let mcp = mcp_with("kubernetes");
        let chain = ChainDefinition {
            chain_id: "k8s-chain".into(),
            alert_types: vec!["PodCrashLoop".into()],
            stages: vec![ChainStage { stage_id: "s1".into(), agent_id: "kubernetes-agent".into(), iteration_strategy: None }],
        };
        let err = ChainRegistry::build(vec![chain.clone()], vec![chain], &agents, &mcp).unwrap_err();
        assert!(matches!(err, TarsyError::DuplicateChainId(_)));
    }

    #[test]
    fn rejects_alert_type_claimed_twice() {
        let agents = agents_with(vec!["kubernetes".into()]);
        let mcp = mcp_with("kubernetes");
        let stage = ChainStage { stage_id: "s1".into(), agent_id: "kubernetes-agent".into(), iteration_strategy: None };
        let chain_a = ChainDefinition { chain_id: "a".into(), alert_types: vec!["X".into()], stages: vec![stage.clone()] };
        let chain_b = ChainDefinition { chain_id: "b".into(), alert_types: vec!["X".into()], stages: vec![stage] };
        let err = ChainRegistry::build(vec![chain_a, chain_b], vec![], &agents, &mcp).unwrap_err();
        assert!(matches!(err, TarsyError::AlertTypeConflict { .. }));
    }

    #[test]
    fn rejects_chain_referencing_a_disabled_mcp_server() {
        let agents = agents_with(vec!["kubernetes".into()]);
        let mut mcp = mcp_with("kubernetes");
        mcp.insert(McpServerConfig {
            server_id: "kubernetes".into(),
            enabled: false,
            command: "kubectl-mcp".into(),
            args: vec![],
            instructions: None,
        });
        let chain = ChainDefinition {
            chain_id: "k8s-chain".into(),
            alert_types: vec!["PodCrashLoop".into()],
            stages: vec![ChainStage { stage_id: "s1".into(), agent_id: "kubernetes-agent".into(), iteration_strategy: None }],
        };
        let err = ChainRegistry::build(vec![chain], vec![], &agents, &mcp).unwrap_err();
        assert!(matches!(err, TarsyError::McpServerDisabled(_)));
    }

    #[test]
    fn unknown_alert_type_lists_known_types() {
        let agents = agents_with(vec!["kubernetes".into()]);
        let mcp = mcp_with("kubernetes");
        let chain = ChainDefinition {
            chain_id: "k8s-chain".into(),
            alert_types: vec!["PodCrashLoop".into()],
            stages: vec![ChainStage { stage_id: "s1".into(), agent_id: "kubernetes-agent".into(), iteration_strategy: None }],
        };
        let registry = ChainRegistry::build(vec![chain], vec![], &agents, &mcp).unwrap();
        let err = registry.resolve("DiskFull").unwrap_err();
        match err {
            TarsyError::UnknownAlertType { requested, known } => {
                assert_eq!(requested, "DiskFull");
                assert_eq!(known, vec!["PodCrashLoop".to_string()]);
            }
            _ => panic!("expected UnknownAlertType"),
        }
    }
}
