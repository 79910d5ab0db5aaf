//! JSON-RPC server: tool registry, capability negotiation, serve loop.
//!
//! Messages are processed sequentially, one frame at a time. Three method
//! families are recognized: `capability` (toggle `logging`/`streaming`/
//! `interrupt` subscriptions), `resource` (named read-only resources such as
//! the running config), and tool names. Every uncaught failure is returned
//! as a JSON-RPC error with code `-32000`; sensitive values have already
//! been redacted by the log and config formatters.

use mongodb::bson::oid::ObjectId;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

use crate::estatedesk::config::Config;
use crate::estatedesk::session::Session;
use crate::estatedesk::telemetry::Telemetry;
use crate::estatedesk::tool_base::ToolContext;
use crate::estatedesk::tool_protocol::{McpTool, ToolDefinition, ToolError};
use crate::estatedesk::transport::Transport;

const RPC_ERROR_CODE: i64 = -32000;
const KNOWN_CAPABILITIES: [&str; 3] = ["logging", "streaming", "interrupt"];

type CloseHook = Box<dyn Fn() + Send + Sync>;

/// The RPC host: registry plus dispatch.
pub struct RpcServer {
    ctx: ToolContext,
    config: Arc<Config>,
    tools: HashMap<String, Arc<dyn McpTool>>,
    resources: HashMap<String, Box<dyn Fn() -> Value + Send + Sync>>,
    /// Capabilities the server advertises.
    capabilities: RwLock<HashSet<String>>,
    /// Capabilities the connected transport subscribed to.
    subscriptions: RwLock<HashSet<String>>,
    on_close: Vec<CloseHook>,
}

impl RpcServer {
    pub fn new(session: Arc<Session>, telemetry: Arc<Telemetry>) -> Self {
        let config = Arc::clone(session.config());
        Self {
            ctx: ToolContext::new(session, telemetry),
            config,
            tools: HashMap::new(),
            resources: HashMap::new(),
            capabilities: RwLock::new(HashSet::new()),
            subscriptions: RwLock::new(HashSet::new()),
            on_close: Vec::new(),
        }
    }

    /// Register a tool unless configuration excludes it.
    pub fn register_tool(&mut self, tool: Arc<dyn McpTool>) {
        let disabled = &self.config.disabled_tools;
        if disabled.names.iter().any(|n| n == tool.name())
            || disabled.categories.iter().any(|c| c == tool.category())
            || disabled.types.iter().any(|t| t == tool.operation_type())
        {
            log::info!("Tool '{}' disabled by configuration", tool.name());
            return;
        }
        if self.config.read_only && tool.operation_type() != "read" {
            log::info!("Tool '{}' disabled in read-only mode", tool.name());
            return;
        }
        log::info!("Registered tool '{}'", tool.name());
        self.tools.insert(tool.name().to_string(), tool);
    }

    /// Advertise a capability by name.
    pub async fn capability(&self, name: &str) {
        self.capabilities.write().await.insert(name.to_string());
    }

    /// Register a named read-only resource.
    pub fn resource(
        &mut self,
        name: &str,
        handler: impl Fn() -> Value + Send + Sync + 'static,
    ) {
        self.resources.insert(name.to_string(), Box::new(handler));
    }

    /// Run a hook when the server closes.
    pub fn on_close(&mut self, hook: impl Fn() + Send + Sync + 'static) {
        self.on_close.push(Box::new(hook));
    }

    /// Function schemas for every registered tool (planner-facing).
    pub fn tool_definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|t| t.metadata().to_tool_definition())
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Dispatch one tool call through the cross-cutting layer, scoped to the
    /// request's tenant.
    pub async fn call_tool(
        &self,
        tenant: ObjectId,
        name: &str,
        arguments: Value,
    ) -> Result<Value, ToolError> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| ToolError::NotFound(format!("Tool '{}'", name)))?;

        log::info!("Tool `{}` started", name);
        let start = Instant::now();
        let result = self.ctx.run(tool.as_ref(), tenant, arguments).await;
        log::info!(
            "Tool `{}` finished in {}ms",
            name,
            start.elapsed().as_millis()
        );
        result
    }

    /// Serve frames from the transport until it closes.
    pub async fn serve(&self, transport: &mut dyn Transport) {
        while let Some(request) = transport.read_message().await {
            self.handle(transport, request).await;
        }
        log::info!("Transport closed; leaving serve loop");
    }

    async fn handle(&self, transport: &mut dyn Transport, request: Value) {
        let id = request.get("id").cloned().unwrap_or(Value::Null);
        let method = request
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let params = request.get("params").cloned().unwrap_or(Value::Null);

        self.notify(transport, "INFO", &format!("request `{}` received", method))
            .await;

        let outcome = match method.as_str() {
            "capability" => self.handle_capability(&params).await,
            "resource" => self.handle_resource(&params),
            _ => {
                // Tool arguments arrive either wrapped or as the params object.
                let arguments = params
                    .get("arguments")
                    .cloned()
                    .unwrap_or_else(|| params.clone());
                // The stdio frame carries no tenant; the startup default
                // applies. Its absence is a server error, not a user error.
                match self.ctx.session.default_tenant().await {
                    Some(tenant) => self.call_tool(tenant, &method, arguments).await,
                    None => Err(ToolError::Internal(
                        "No tenant ID set on session.".to_string(),
                    )),
                }
            }
        };

        let response = match outcome {
            Ok(result) => json!({"jsonrpc": "1.0", "id": id, "result": result}),
            Err(e) => {
                log::error!("Error handling request method='{}': {}", method, e);
                self.notify(transport, "ERROR", &e.to_string()).await;
                json!({
                    "jsonrpc": "1.0",
                    "id": id,
                    "error": {"code": RPC_ERROR_CODE, "message": e.to_string()},
                })
            }
        };
        transport.write_message(&response).await;
    }

    async fn handle_capability(&self, params: &Value) -> Result<Value, ToolError> {
        let name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                ToolError::InvalidArguments("Missing 'name' in capability params".to_string())
            })?;
        let enabled = params
            .get("enabled")
            .and_then(Value::as_bool)
            .unwrap_or(true);

        if !KNOWN_CAPABILITIES.contains(&name) {
            return Err(ToolError::InvalidArguments(format!(
                "Unknown capability '{}'",
                name
            )));
        }

        {
            let mut capabilities = self.capabilities.write().await;
            let mut subscriptions = self.subscriptions.write().await;
            if enabled {
                capabilities.insert(name.to_string());
                subscriptions.insert(name.to_string());
            } else {
                capabilities.remove(name);
                subscriptions.remove(name);
            }
        }
        log::info!("Capability '{}' set enabled={}", name, enabled);
        Ok(Value::Bool(true))
    }

    fn handle_resource(&self, params: &Value) -> Result<Value, ToolError> {
        let name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                ToolError::InvalidArguments("Missing 'name' in resource params".to_string())
            })?;
        let handler = self
            .resources
            .get(name)
            .ok_or_else(|| ToolError::NotFound(format!("resource '{}'", name)))?;
        Ok(handler())
    }

    /// Emit a `logging` notification when the transport subscribed to it.
    async fn notify(&self, transport: &mut dyn Transport, level: &str, message: &str) {
        if !self.subscriptions.read().await.contains("logging") {
            return;
        }
        let mut params = Map::new();
        params.insert("level".to_string(), json!(level));
        params.insert("logger".to_string(), json!("rpc_server"));
        params.insert(
            "message".to_string(),
            json!(crate::estatedesk::logging::redact(message)),
        );
        transport
            .write_message(&json!({
                "jsonrpc": "1.0",
                "method": "logging",
                "params": Value::Object(params),
            }))
            .await;
    }

    /// Invoke shutdown hooks, flush telemetry, and close the session.
    pub async fn close(&self) {
        log::info!("Shutting down RPC server");
        for hook in &self.on_close {
            hook();
        }
        self.ctx.telemetry.shutdown().await;
        self.ctx.session.close().await;
    }

    /// Shared session handle (used by the orchestrator for tenant binding).
    pub fn session(&self) -> &Arc<Session> {
        &self.ctx.session
    }
}
