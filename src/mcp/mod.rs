pub mod client;
pub mod registry;
pub mod transport;
pub mod types;

pub use client::{McpClient, MockMcpClient, StdioMcpClient};
pub use registry::{McpBackend, McpConnectionPool, McpRegistry};
pub use types::{CallToolResult, McpContent, McpServerConfig, McpToolDef};
