use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::TarsyError;
use crate::mcp::client::{McpClient, StdioMcpClient};
use crate::mcp::types::{McpServerConfig, McpToolDef};

/// All MCP servers known to this deployment, keyed by server id.
#[derive(Default)]
pub struct McpRegistry {
    servers: HashMap<String, McpServerConfig>,
}

impl McpRegistry {
    pub fn new() -> Self {
        Self { servers: HashMap::new() }
    }

    pub fn insert(&mut self, config: McpServerConfig) {
        self.servers.insert(config.server_id.clone(), config);
    }

    pub fn get(&self, server_id: &str) -> Option<&McpServerConfig> {
        self.servers.get(server_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &McpServerConfig> {
        self.servers.values()
    }
}

/// Builds an `McpClient` for a server config. The only production
/// implementation spawns a stdio subprocess; tests supply their own factory
/// returning `MockMcpClient`s.
#[async_trait]
pub trait McpClientFactory: Send + Sync {
    async fn create(&self, config: &McpServerConfig) -> Result<Arc<dyn McpClient>, TarsyError>;
}

pub struct StdioMcpClientFactory;

#[async_trait]
impl McpClientFactory for StdioMcpClientFactory {
    async fn create(&self, config: &McpServerConfig) -> Result<Arc<dyn McpClient>, TarsyError> {
        let client = StdioMcpClient::spawn(&config.command, &config.args).await?;
        Ok(client as Arc<dyn McpClient>)
    }
}

/// Lazily creates and caches one `McpClient` per server for the lifetime of
/// the pool, and caches each server's tool catalog per session so a chain
/// with several stages hitting the same server only lists tools once.
pub struct McpConnectionPool {
    factory: Arc<dyn McpClientFactory>,
    clients: Mutex<HashMap<String, Arc<dyn McpClient>>>,
    tool_cache: Mutex<HashMap<(String, String), Vec<McpToolDef>>>,
}

impl McpConnectionPool {
    pub fn new(factory: Arc<dyn McpClientFactory>) -> Self {
        Self { factory, clients: Mutex::new(HashMap::new()), tool_cache: Mutex::new(HashMap::new()) }
    }

    pub async fn client_for(&self, config: &McpServerConfig) -> Result<Arc<dyn McpClient>, TarsyError> {
        if !config.enabled {
            return Err(TarsyError::McpServerDisabled(config.server_id.clone()));
        }

        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(&config.server_id) {
            return Ok(Arc::clone(client));
        }
        let client = self.factory.create(config).await?;
        clients.insert(config.server_id.clone(), Arc::clone(&client));
        Ok(client)
    }

    /// Tool catalog for `server_id`, scoped to `session_id` so a new session
    /// re-lists tools even if the underlying client connection is reused.
    pub async fn list_tools_cached(
        &self,
        session_id: &str,
        config: &McpServerConfig,
    ) -> Result<Vec<McpToolDef>, TarsyError> {
        let key = (session_id.to_string(), config.server_id.clone());
        if let Some(tools) = self.tool_cache.lock().await.get(&key) {
            return Ok(tools.clone());
        }

        let client = self.client_for(config).await?;
        let tools = client.list_tools().await?;
        self.tool_cache.lock().await.insert(key, tools.clone());
        Ok(tools)
    }
}

/// Bundles the registry (for server config lookup) and the connection pool
/// (for cached clients) behind the `McpDispatchBackend` trait the agent
/// runtime depends on.
pub struct McpBackend<'a> {
    pub registry: &'a McpRegistry,
    pub pool: &'a McpConnectionPool,
}

#[async_trait]
impl<'a> crate::agent::McpDispatchBackend for McpBackend<'a> {
    async fn list_tools(&self, session_id: &str, config: &McpServerConfig) -> Result<Vec<McpToolDef>, TarsyError> {
        self.pool.list_tools_cached(session_id, config).await
    }

    async fn call(&self, server_id: &str, tool_name: &str, arguments: serde_json::Value) -> Result<serde_json::Value, TarsyError> {
        let config = self.registry.get(server_id).ok_or_else(|| TarsyError::UnknownMcpServer(server_id.to_string()))?;
        let client = self.pool.client_for(config).await?;
        client.call_tool(tool_name, arguments).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::client::MockMcpClient;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingFactory {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl McpClientFactory for CountingFactory {
        async fn create(&self, _config: &McpServerConfig) -> Result<Arc<dyn McpClient>, TarsyError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(MockMcpClient::new(vec![McpToolDef {
                name: "get_pods".into(),
                description: None,
                input_schema: None,
            }])))
        }
    }

    fn config() -> McpServerConfig {
        McpServerConfig {
            server_id: "kubernetes".into(),
            enabled: true,
            command: "kubectl-mcp".into(),
            args: vec![],
            instructions: None,
        }
    }

    #[tokio::test]
    async fn caches_tool_catalog_per_session() {
        let factory = Arc::new(CountingFactory { calls: AtomicUsize::new(0) });
        let pool = McpConnectionPool::new(factory.clone());
        let cfg = config();

        pool.list_tools_cached("session-1", &cfg).await.unwrap();
        pool.list_tools_cached("session-1", &cfg).await.unwrap();
        assert_eq!(factory.calls.load(Ordering::SeqCst), 1, "client created once for repeated lookups");

        pool.list_tools_cached("session-2", &cfg).await.unwrap();
        assert_eq!(factory.calls.load(Ordering::SeqCst), 1, "client reused across sessions");
    }

    #[tokio::test]
    async fn rejects_disabled_server() {
        let factory = Arc::new(CountingFactory { calls: AtomicUsize::new(0) });
        let pool = McpConnectionPool::new(factory);
        let mut cfg = config();
        cfg.enabled = false;

        let err = pool.client_for(&cfg).await.unwrap_err();
        assert!(matches!(err, TarsyError::McpServerDisabled(_)));
    }
}
