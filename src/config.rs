use serde::Deserialize;
use std::path::Path;

use crate::agent::{AgentConfig, AgentSource};
use crate::chain::ChainDefinition;
use crate::error::TarsyError;
use crate::mcp::types::McpServerConfig;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawAgentConfig {
    agent_id: String,
    #[serde(default)]
    mcp_server_ids: Vec<String>,
    #[serde(default)]
    custom_instructions: Option<String>,
    #[serde(default)]
    default_strategy: Option<crate::types::IterationStrategy>,
}

impl From<RawAgentConfig> for AgentConfig {
    fn from(raw: RawAgentConfig) -> Self {
        AgentConfig {
            agent_id: raw.agent_id,
            mcp_server_ids: raw.mcp_server_ids,
            custom_instructions: raw.custom_instructions,
            default_strategy: raw.default_strategy,
            source: AgentSource::Configured,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfigFile {
    #[serde(default)]
    mcp_servers: Vec<McpServerConfig>,
    #[serde(default)]
    agents: Vec<RawAgentConfig>,
    #[serde(default, rename = "agent_chains")]
    chains: Vec<ChainDefinition>,
}

pub struct UserConfig {
    pub mcp_servers: Vec<McpServerConfig>,
    pub agents: Vec<AgentConfig>,
    pub chains: Vec<ChainDefinition>,
}

/// Parses a user-supplied YAML config describing the MCP servers, agents,
/// and chains this deployment adds on top of the built-in ones. Unknown
/// fields are rejected so a typo in the config surfaces at load time
/// instead of silently doing nothing.
pub fn load_user_config(path: impl AsRef<Path>) -> Result<UserConfig, TarsyError> {
    let contents = std::fs::read_to_string(path).map_err(TarsyError::Io)?;
    parse_user_config(&contents)
}

pub fn parse_user_config(yaml: &str) -> Result<UserConfig, TarsyError> {
    let raw: RawConfigFile = serde_yaml::from_str(yaml).map_err(|e| TarsyError::Configuration(e.to_string()))?;
    Ok(UserConfig {
        mcp_servers: raw.mcp_servers,
        agents: raw.agents.into_iter().map(AgentConfig::from).collect(),
        chains: raw.chains,
    })
}

/// Runtime knobs that come from the environment rather than the YAML
/// config: credentials, the audit database location, and concurrency
/// limits.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub openai_api_key: Option<String>,
    pub openai_base_url: Option<String>,
    pub database_path: String,
    pub max_concurrent_alerts: usize,
    pub default_model: String,
}

impl EnvConfig {
    pub fn from_env() -> Result<Self, TarsyError> {
        let max_concurrent_alerts = std::env::var("TARSY_MAX_CONCURRENT_ALERTS")
            .ok()
            .map(|v| v.parse::<usize>().map_err(|e| TarsyError::Configuration(format!("TARSY_MAX_CONCURRENT_ALERTS: {e}"))))
            .transpose()?
            .unwrap_or(10);

        Ok(Self {
            openai_api_key: std::env::var("OPENAI_API_KEY").ok(),
            openai_base_url: std::env::var("OPENAI_BASE_URL").ok(),
            database_path: std::env::var("TARSY_DB_PATH").unwrap_or_else(|_| "tarsy.db".to_string()),
            max_concurrent_alerts,
            default_model: std::env::var("TARSY_DEFAULT_MODEL").unwrap_or_else(|_| "gpt-4o".to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_minimal_config() {
        let yaml = r#"
mcp_servers:
  - server_id: kubernetes
    command: kubectl-mcp
    args: []
agents:
  - agent_id: kubernetes-agent
    mcp_server_ids: [kubernetes]
    default_strategy: REACT
agent_chains:
  - chain_id: k8s-chain
    alert_types: [PodCrashLoop]
    stages:
      - stage_id: investigate
        agent_id: kubernetes-agent
"#;
        let config = parse_user_config(yaml).unwrap();
        assert_eq!(config.mcp_servers.len(), 1);
        assert_eq!(config.agents[0].source, AgentSource::Configured);
        assert_eq!(config.chains[0].chain_id, "k8s-chain");
    }

    #[test]
    fn rejects_unknown_fields() {
        let yaml = "mcp_servers:\n  - server_id: x\n    command: y\n    bogus_field: true\n";
        assert!(parse_user_config(yaml).is_err());
    }
}
