//! Tool protocol abstraction.
//!
//! This module defines how MongoDB tools are described, discovered, and
//! dispatched inside the host.
//!
//! # Key components
//!
//! - **[`McpTool`] trait**: one implementation per read-only operation; the
//!   cross-cutting layer in [`tool_base`](crate::estatedesk::tool_base) wraps
//!   every call with validation, tenant scoping, and telemetry.
//! - **[`ToolMetadata`] / [`ToolParameter`]**: declarative argument models
//!   from which both the RPC schema and the LLM function schema are derived.
//! - **[`ToolDefinition`]**: provider-agnostic function schema sent to the
//!   chat-completions API.
//! - **[`ToolError`]**: typed error distinguishing user-visible failures from
//!   internal ones so callers can map them to the right status.

use async_trait::async_trait;
use mongodb::bson::oid::ObjectId;
use serde_json::{json, Value};
use std::error::Error;
use std::fmt;

use crate::estatedesk::tool_base::ToolContext;

/// Error type shared by every tool operation.
///
/// The split between user-visible variants and internal ones drives the whole
/// propagation policy: validation problems surface verbatim, dependency and
/// programmer errors surface as generic messages with the detail logged.
#[derive(Debug, Clone)]
pub enum ToolError {
    /// The provided arguments failed validation against the tool's schema.
    InvalidArguments(String),
    /// The request named a collection outside the configured allow-list.
    Forbidden(String),
    /// Requested tool or resource is not registered.
    NotFound(String),
    /// A MongoDB operation failed (dependency error).
    Database(String),
    /// Unexpected failure inside a tool; message is already generic.
    Internal(String),
}

impl ToolError {
    /// True for errors whose message may be shown to the caller verbatim.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            ToolError::InvalidArguments(_) | ToolError::Forbidden(_) | ToolError::NotFound(_)
        )
    }
}

impl fmt::Display for ToolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolError::InvalidArguments(msg) => write!(f, "Invalid arguments: {}", msg),
            ToolError::Forbidden(msg) => write!(f, "{}", msg),
            ToolError::NotFound(msg) => write!(f, "Not found: {}", msg),
            ToolError::Database(msg) => write!(f, "Database error: {}", msg),
            ToolError::Internal(msg) => write!(f, "{}", msg),
        }
    }
}

impl Error for ToolError {}

/// Defines the type of a tool parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolParameterType {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
}

impl ToolParameterType {
    fn json_name(&self) -> &'static str {
        match self {
            ToolParameterType::String => "string",
            ToolParameterType::Number => "number",
            ToolParameterType::Integer => "integer",
            ToolParameterType::Boolean => "boolean",
            ToolParameterType::Array => "array",
            ToolParameterType::Object => "object",
        }
    }
}

/// Declarative definition of one tool argument.
#[derive(Debug, Clone)]
pub struct ToolParameter {
    pub name: String,
    pub param_type: ToolParameterType,
    pub description: Option<String>,
    pub required: bool,
    /// Closed set of accepted values, surfaced as a JSON-schema `enum`.
    pub enum_values: Option<Vec<Value>>,
}

impl ToolParameter {
    /// Define a new tool parameter with the provided name and type.
    pub fn new(name: impl Into<String>, param_type: ToolParameterType) -> Self {
        Self {
            name: name.into(),
            param_type,
            description: None,
            required: false,
            enum_values: None,
        }
    }

    /// Add a human readable description that will surface in generated schemas.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Mark the argument as required.
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Constrain the argument to a closed set of values.
    pub fn with_enum(mut self, values: Vec<Value>) -> Self {
        self.enum_values = Some(values);
        self
    }
}

/// Metadata about a tool: identity, description, and parameter model.
#[derive(Debug, Clone)]
pub struct ToolMetadata {
    pub name: String,
    pub description: String,
    pub parameters: Vec<ToolParameter>,
}

impl ToolMetadata {
    /// Create metadata with the supplied identifier and description.
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: Vec::new(),
        }
    }

    /// Append a parameter definition.
    pub fn with_parameter(mut self, param: ToolParameter) -> Self {
        self.parameters.push(param);
        self
    }

    /// Build the function schema sent to the chat-completions API.
    pub fn to_tool_definition(&self) -> ToolDefinition {
        let mut properties = serde_json::Map::new();
        let mut required = Vec::new();
        for param in &self.parameters {
            let mut prop = serde_json::Map::new();
            prop.insert("type".to_string(), json!(param.param_type.json_name()));
            if let Some(desc) = &param.description {
                prop.insert("description".to_string(), json!(desc));
            }
            if let Some(values) = &param.enum_values {
                prop.insert("enum".to_string(), json!(values));
            }
            properties.insert(param.name.clone(), Value::Object(prop));
            if param.required {
                required.push(json!(param.name));
            }
        }
        ToolDefinition {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters_schema: json!({
                "type": "object",
                "properties": properties,
                "required": required,
            }),
        }
    }
}

/// Provider-agnostic function schema passed to the LLM with each request.
#[derive(Debug, Clone)]
pub struct ToolDefinition {
    /// Tool name as it appears in the API `functions` array.
    pub name: String,
    /// Human-readable description surfaced to the LLM to aid tool selection.
    pub description: String,
    /// JSON Schema object describing the accepted parameters.
    pub parameters_schema: Value,
}

/// One read-only MongoDB operation exposed over the RPC surface.
///
/// Implementations receive arguments *after* the cross-cutting layer has
/// filled the database default, applied tenant scoping, injected
/// case-insensitive matching, and enforced the allow-list. The capability
/// flags below tell that layer which transformations apply. The tenant is
/// request-scoped and travels with every call; it is never read from shared
/// state.
#[async_trait]
pub trait McpTool: Send + Sync {
    /// Stable tool identifier (the RPC method name).
    fn name(&self) -> &'static str;

    /// Identity, description, and declarative parameter model.
    fn metadata(&self) -> ToolMetadata;

    /// Registry category, used by per-category disabling.
    fn category(&self) -> &'static str {
        "database"
    }

    /// Operation type; the `read_only` flag drops everything non-`read`.
    fn operation_type(&self) -> &'static str {
        "read"
    }

    /// Whether the tool accepts a `database` argument that should default to
    /// the session database when absent.
    fn takes_database(&self) -> bool {
        false
    }

    /// Whether the tool's `filter` argument must be tenant-scoped.
    fn scopes_filter(&self) -> bool {
        false
    }

    /// Whether the tool's `pipeline` argument must be tenant-scoped.
    fn scopes_pipeline(&self) -> bool {
        false
    }

    /// Run the operation with prepared arguments, bound to one tenant.
    async fn execute(
        &self,
        ctx: &ToolContext,
        tenant: ObjectId,
        args: Value,
    ) -> Result<Value, ToolError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parameter_builder_round_trip() {
        let param = ToolParameter::new("collection", ToolParameterType::String)
            .with_description("Collection to query")
            .required()
            .with_enum(vec![json!("leads"), json!("projects")]);

        assert_eq!(param.name, "collection");
        assert!(param.required);
        assert_eq!(param.enum_values.as_ref().map(Vec::len), Some(2));
    }

    #[test]
    fn metadata_builds_function_schema() {
        let meta = ToolMetadata::new("count", "Count documents")
            .with_parameter(
                ToolParameter::new("collection", ToolParameterType::String).required(),
            )
            .with_parameter(ToolParameter::new("filter", ToolParameterType::Object));

        let def = meta.to_tool_definition();
        assert_eq!(def.name, "count");
        assert_eq!(def.parameters_schema["type"], "object");
        assert_eq!(def.parameters_schema["required"], json!(["collection"]));
        assert_eq!(
            def.parameters_schema["properties"]["filter"]["type"],
            "object"
        );
    }

    #[test]
    fn user_errors_are_distinguished_from_internal() {
        assert!(ToolError::InvalidArguments("bad".into()).is_user_error());
        assert!(ToolError::Forbidden("no".into()).is_user_error());
        assert!(!ToolError::Database("down".into()).is_user_error());
        assert!(!ToolError::Internal("bug".into()).is_user_error());
    }

    #[test]
    fn display_prefixes_match_error_kind() {
        let err = ToolError::InvalidArguments("limit out of range".into());
        assert_eq!(err.to_string(), "Invalid arguments: limit out of range");
        let err = ToolError::Database("timeout".into());
        assert_eq!(err.to_string(), "Database error: timeout");
    }
}
