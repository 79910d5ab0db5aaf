//! `count`: scoped document counting.

use async_trait::async_trait;
use mongodb::bson::oid::ObjectId;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::estatedesk::tool_base::ToolContext;
use crate::estatedesk::tool_protocol::{
    McpTool, ToolError, ToolMetadata, ToolParameter, ToolParameterType,
};
use crate::estatedesk::transport::json_to_document;

#[derive(Debug, Deserialize)]
struct CountArgs {
    database: Option<String>,
    collection: String,
    #[serde(default)]
    filter: Value,
}

pub struct CountTool;

#[async_trait]
impl McpTool for CountTool {
    fn name(&self) -> &'static str {
        "count"
    }

    fn metadata(&self) -> ToolMetadata {
        ToolMetadata::new("count", "Count the documents matching a filter.")
            .with_parameter(
                ToolParameter::new("database", ToolParameterType::String)
                    .with_description("Database to query; omitted means the tenant database"),
            )
            .with_parameter(
                ToolParameter::new("collection", ToolParameterType::String)
                    .with_description("Collection to count")
                    .required(),
            )
            .with_parameter(
                ToolParameter::new("filter", ToolParameterType::Object)
                    .with_description("Query filter"),
            )
    }

    fn takes_database(&self) -> bool {
        true
    }

    fn scopes_filter(&self) -> bool {
        true
    }

    async fn execute(
        &self,
        ctx: &ToolContext,
        _tenant: ObjectId,
        args: Value,
    ) -> Result<Value, ToolError> {
        let args: CountArgs =
            serde_json::from_value(args).map_err(|e| ToolError::InvalidArguments(e.to_string()))?;

        let filter = if args.filter.is_null() {
            mongodb::bson::Document::new()
        } else {
            json_to_document(&args.filter).map_err(ToolError::InvalidArguments)?
        };

        log::info!(
            "db={:?} collection={} op=count filter={}",
            args.database,
            args.collection,
            filter
        );

        let coll = ctx
            .session
            .collection(args.database.as_deref(), &args.collection)?;
        let count = coll
            .count_documents(filter)
            .await
            .map_err(|e| ToolError::Database(e.to_string()))?;

        Ok(json!({"result": count}))
    }
}
