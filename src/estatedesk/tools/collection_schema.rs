//! `collection_schema`: field names, type labels, and sample values.
//!
//! Served from the static registry — no live sampling — so the planner gets
//! deterministic, low-latency schema context.

use async_trait::async_trait;
use mongodb::bson::oid::ObjectId;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::estatedesk::schema_registry;
use crate::estatedesk::tool_base::ToolContext;
use crate::estatedesk::tool_protocol::{
    McpTool, ToolError, ToolMetadata, ToolParameter, ToolParameterType,
};

#[derive(Debug, Deserialize)]
struct CollectionSchemaArgs {
    collection: String,
    #[serde(rename = "maxValues", default = "default_max_values")]
    max_values: usize,
}

fn default_max_values() -> usize {
    10
}

pub struct CollectionSchemaTool;

#[async_trait]
impl McpTool for CollectionSchemaTool {
    fn name(&self) -> &'static str {
        "collection_schema"
    }

    fn metadata(&self) -> ToolMetadata {
        ToolMetadata::new(
            "collection_schema",
            "Describe a collection: field names, types, and sample values.",
        )
        .with_parameter(
            ToolParameter::new("collection", ToolParameterType::String)
                .with_description(format!(
                    "One of: {}",
                    schema_registry::collection_names().collect::<Vec<_>>().join(", ")
                ))
                .required(),
        )
        .with_parameter(
            ToolParameter::new("maxValues", ToolParameterType::Integer)
                .with_description("Max distinct sample values to return per field"),
        )
    }

    async fn execute(
        &self,
        _ctx: &ToolContext,
        _tenant: ObjectId,
        args: Value,
    ) -> Result<Value, ToolError> {
        let args: CollectionSchemaArgs = serde_json::from_value(args)
            .map_err(|e| ToolError::InvalidArguments(e.to_string()))?;

        let schema = schema_registry::get(&args.collection).ok_or_else(|| {
            ToolError::InvalidArguments(format!("unknown collection '{}'", args.collection))
        })?;

        let mut values = Map::new();
        for field in schema.fields.keys() {
            let sampled: Vec<Value> = schema
                .values
                .get(field)
                .map(|v| v.iter().take(args.max_values).cloned().collect())
                .unwrap_or_default();
            values.insert(field.clone(), Value::Array(sampled));
        }

        log::info!(
            "Returning schema for '{}' ({} fields, {} with sampled values)",
            args.collection,
            schema.fields.len(),
            values
                .values()
                .filter(|v| v.as_array().is_some_and(|a| !a.is_empty()))
                .count()
        );

        Ok(json!({
            "fields": schema.fields,
            "values": values,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::estatedesk::config::Config;
    use crate::estatedesk::session::Session;
    use crate::estatedesk::telemetry::Telemetry;
    use std::sync::Arc;

    async fn ctx() -> ToolContext {
        let config = Arc::new(Config::default());
        let session = Arc::new(Session::new(Arc::clone(&config)).await.unwrap());
        ToolContext::new(session, Telemetry::new(config))
    }

    fn tenant() -> ObjectId {
        ObjectId::parse_str("64b000000000000000000001").unwrap()
    }

    #[tokio::test]
    async fn returns_fields_and_truncated_values() {
        let out = CollectionSchemaTool
            .execute(
                &ctx().await,
                tenant(),
                json!({"collection": "leads", "maxValues": 2}),
            )
            .await
            .unwrap();

        assert_eq!(out["fields"]["leadStatus"], "string");
        let statuses = out["values"]["leadStatus"].as_array().unwrap();
        assert_eq!(statuses.len(), 2);
        // Fields without samples still appear, with an empty list.
        assert_eq!(out["values"]["name"], json!([]));
    }

    #[tokio::test]
    async fn unknown_collection_is_a_user_error() {
        let err = CollectionSchemaTool
            .execute(&ctx().await, tenant(), json!({"collection": "nope"}))
            .await
            .unwrap_err();
        assert!(err.is_user_error());
    }
}
