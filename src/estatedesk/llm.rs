//! Provider-agnostic LLM client for the planning loop.
//!
//! The host consumes exactly one LLM capability: an OpenAI-compatible Chat
//! Completions endpoint with classic function calling (`functions` array plus
//! `function_call: "auto"`). The [`ChatClient`] trait abstracts the provider
//! so tests can script responses; [`OpenAiClient`] is the production
//! implementation, speaking the wire format directly through a shared,
//! connection-pooled HTTP client.

use async_trait::async_trait;
use lazy_static::lazy_static;
use serde_json::{json, Value};
use std::error::Error;
use std::fmt;
use std::time::Duration;

use crate::estatedesk::tool_protocol::ToolDefinition;

lazy_static! {
    /// Shared HTTP client with persistent connection pooling.
    ///
    /// A single instance keeps TLS sessions and DNS lookups warm across the
    /// router, planner, and summarizer call sites.
    static ref SHARED_HTTP_CLIENT: reqwest::Client = {
        reqwest::ClientBuilder::new()
            .pool_idle_timeout(Some(Duration::from_secs(90)))
            .pool_max_idle_per_host(10)
            .tcp_keepalive(Some(Duration::from_secs(60)))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to build shared HTTP client")
    };
}

/// Represents the possible roles for a chat message.
#[derive(Debug, Clone, PartialEq)]
pub enum Role {
    System,
    User,
    Assistant,
    /// A function-result message; carries the function's name.
    Function,
}

impl Role {
    fn wire_name(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Function => "function",
        }
    }
}

/// A function invocation requested by the assistant.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCall {
    /// Function name matching one of the advertised [`ToolDefinition`]s.
    pub name: String,
    /// Raw JSON-encoded arguments exactly as the provider returned them.
    pub arguments: String,
}

/// One chat message in provider wire shape.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: Role,
    pub content: Option<String>,
    /// Function name; only present on [`Role::Function`] messages.
    pub name: Option<String>,
    /// Present when the assistant requests a tool invocation.
    pub function_call: Option<FunctionCall>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: Some(content.into()),
            name: None,
            function_call: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: Some(content.into()),
            name: None,
            function_call: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: Some(content.into()),
            name: None,
            function_call: None,
        }
    }

    /// Assistant message that calls a function instead of speaking.
    pub fn assistant_call(name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: None,
            name: None,
            function_call: Some(FunctionCall {
                name: name.into(),
                arguments: arguments.into(),
            }),
        }
    }

    /// Function-result message fed back to the planner.
    pub fn function_result(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Function,
            content: Some(content.into()),
            name: Some(name.into()),
            function_call: None,
        }
    }

    fn to_wire(&self) -> Value {
        let mut msg = serde_json::Map::new();
        msg.insert("role".to_string(), json!(self.role.wire_name()));
        msg.insert(
            "content".to_string(),
            self.content.as_ref().map(|c| json!(c)).unwrap_or(Value::Null),
        );
        if let Some(name) = &self.name {
            msg.insert("name".to_string(), json!(name));
        }
        if let Some(call) = &self.function_call {
            msg.insert(
                "function_call".to_string(),
                json!({"name": call.name, "arguments": call.arguments}),
            );
        }
        Value::Object(msg)
    }
}

/// Error surfaced when the provider is unreachable or answers garbage.
#[derive(Debug, Clone)]
pub struct LlmError(pub String);

impl fmt::Display for LlmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Error for LlmError {}

/// Trait-driven abstraction over the chat-completions provider.
///
/// Implementations **must** be thread-safe (`Send + Sync`) so they can be
/// shared between the router, the planner loop, and the summarizer.
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Send one chat request; `functions` may be empty for plain chat.
    async fn chat(
        &self,
        messages: &[ChatMessage],
        functions: &[ToolDefinition],
    ) -> Result<ChatMessage, LlmError>;

    /// Model identifier injected into each request.
    fn model_name(&self) -> &str;
}

/// Production client for OpenAI-compatible Chat Completions endpoints.
pub struct OpenAiClient {
    api_key: String,
    model: String,
    base_url: String,
    timeout: Duration,
}

impl OpenAiClient {
    /// Construct a client with an explicit model name and request timeout.
    pub fn new(api_key: &str, model: &str, timeout: Duration) -> Self {
        Self {
            api_key: api_key.to_string(),
            model: model.to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            timeout,
        }
    }

    /// Construct a client targeting a custom OpenAI-compatible base URL
    /// (no trailing slash, e.g. `https://api.openai.com/v1`).
    pub fn new_with_base_url(api_key: &str, model: &str, timeout: Duration, base_url: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            model: model.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        }
    }
}

#[async_trait]
impl ChatClient for OpenAiClient {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        functions: &[ToolDefinition],
    ) -> Result<ChatMessage, LlmError> {
        let wire_messages: Vec<Value> = messages.iter().map(ChatMessage::to_wire).collect();

        let mut body = serde_json::Map::new();
        body.insert("model".to_string(), json!(self.model));
        body.insert("messages".to_string(), Value::Array(wire_messages));
        if !functions.is_empty() {
            let wire_functions: Vec<Value> = functions
                .iter()
                .map(|f| {
                    json!({
                        "name": f.name,
                        "description": f.description,
                        "parameters": f.parameters_schema,
                    })
                })
                .collect();
            body.insert("functions".to_string(), Value::Array(wire_functions));
            body.insert("function_call".to_string(), json!("auto"));
        }

        let url = format!("{}/chat/completions", self.base_url);
        let response = SHARED_HTTP_CLIENT
            .post(&url)
            .timeout(self.timeout)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&Value::Object(body))
            .send()
            .await
            .map_err(|e| LlmError(format!("request failed: {}", e)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| LlmError(format!("body read failed: {}", e)))?;
        if !status.is_success() {
            log::error!("LLM call failed: HTTP {} from {}: {}", status, url, text);
            return Err(LlmError(format!("HTTP {}", status)));
        }

        let parsed: Value = serde_json::from_str(&text)
            .map_err(|e| LlmError(format!("invalid JSON from provider: {}", e)))?;
        let message = parsed
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .ok_or_else(|| LlmError("no choices in response".to_string()))?;

        let content = message
            .get("content")
            .and_then(Value::as_str)
            .map(str::to_string);
        let function_call = message.get("function_call").and_then(|fc| {
            Some(FunctionCall {
                name: fc.get("name")?.as_str()?.to_string(),
                arguments: fc
                    .get("arguments")
                    .and_then(Value::as_str)
                    .unwrap_or("{}")
                    .to_string(),
            })
        });

        Ok(ChatMessage {
            role: Role::Assistant,
            content,
            name: None,
            function_call,
        })
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn function_result_messages_carry_their_name() {
        let msg = ChatMessage::function_result("count", "{\"result\": 3}");
        let wire = msg.to_wire();
        assert_eq!(wire["role"], "function");
        assert_eq!(wire["name"], "count");
        assert_eq!(wire["content"], "{\"result\": 3}");
    }

    #[test]
    fn assistant_calls_serialize_with_null_content() {
        let msg = ChatMessage::assistant_call("find", "{\"collection\":\"leads\"}");
        let wire = msg.to_wire();
        assert_eq!(wire["role"], "assistant");
        assert!(wire["content"].is_null());
        assert_eq!(wire["function_call"]["name"], "find");
    }

    #[test]
    fn plain_messages_have_no_function_fields() {
        let wire = ChatMessage::user("hello").to_wire();
        assert_eq!(wire["role"], "user");
        assert_eq!(wire["content"], "hello");
        assert!(wire.get("function_call").is_none());
        assert!(wire.get("name").is_none());
    }
}
