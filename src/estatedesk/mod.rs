// src/estatedesk/mod.rs

pub mod config;
pub mod enrichment;
pub mod host_utils;
pub mod llm;
pub mod logging;
pub mod orchestrator;
pub mod router;
pub mod rpc_server;
pub mod schema_registry;
pub mod session;
pub mod telemetry;
pub mod tool_base;
pub mod tool_protocol;
pub mod tools;
pub mod transport;
#[cfg(feature = "web")]
pub mod web;

// Explicitly export the host entry points so callers reach them as
// estatedesk::Orchestrator rather than estatedesk::orchestrator::Orchestrator.
pub use orchestrator::Orchestrator;
pub use rpc_server::RpcServer;
