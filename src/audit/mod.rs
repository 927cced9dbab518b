pub mod memory;
pub mod schema;
pub mod sqlite;
pub mod store;
pub mod subscriber;

pub use memory::InMemoryAuditStore;
pub use sqlite::SqliteAuditStore;
pub use store::{
    AlertSessionRow, AuditStore, LifecycleEventRow, LlmInteractionRow, McpInteractionRow, NewAlertSession,
    NewStageExecution, Page, SessionFilter, SessionTimeline,
};
pub use subscriber::AuditSubscriber;
