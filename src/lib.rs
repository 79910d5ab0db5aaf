// src/lib.rs

// Import the top-level `estatedesk` module.
pub mod estatedesk;

// Re-exporting key items for easier external access.
pub use estatedesk::config::Config;
pub use estatedesk::llm::{ChatClient, ChatMessage, FunctionCall, Role};
pub use estatedesk::orchestrator::Orchestrator;
pub use estatedesk::rpc_server::RpcServer;
pub use estatedesk::session::Session;
pub use estatedesk::telemetry::Telemetry;
pub use estatedesk::tool_protocol::{McpTool, ToolError};
