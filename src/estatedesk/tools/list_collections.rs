//! `list_collections`: the curated collection catalogue.
//!
//! Returns a fixed list rather than live discovery so the planner's
//! `collection` enum can never drift into collections the host refuses to
//! serve.

use async_trait::async_trait;
use mongodb::bson::oid::ObjectId;
use serde_json::{json, Value};

use crate::estatedesk::tool_base::ToolContext;
use crate::estatedesk::tool_protocol::{
    McpTool, ToolError, ToolMetadata, ToolParameter, ToolParameterType,
};

/// Collections advertised to the planner.
pub const STATIC_COLLECTIONS: [&str; 22] = [
    "companies",
    "plans",
    "brokers",
    "broker-payments",
    "contracts",
    "contractors",
    "contractor-payments",
    "general-expenses",
    "lands",
    "projects",
    "properties",
    "property-bookings",
    "property-payments",
    "rent-payments",
    "tenants",
    "leads",
    "lead-assignments",
    "lead-rotations",
    "lead-visited-properties",
    "lead-notes",
    "amenities",
    "cold-leads",
];

pub struct ListCollectionsTool;

#[async_trait]
impl McpTool for ListCollectionsTool {
    fn name(&self) -> &'static str {
        "list_collections"
    }

    fn metadata(&self) -> ToolMetadata {
        ToolMetadata::new(
            "list_collections",
            "List the collections available for querying.",
        )
        .with_parameter(
            ToolParameter::new("database", ToolParameterType::String)
                .with_description("Ignored; the catalogue is static"),
        )
    }

    fn takes_database(&self) -> bool {
        true
    }

    async fn execute(
        &self,
        _ctx: &ToolContext,
        _tenant: ObjectId,
        args: Value,
    ) -> Result<Value, ToolError> {
        log::info!(
            "Returning static collection list (ignoring database={:?})",
            args.get("database").and_then(Value::as_str)
        );
        Ok(json!({"result": STATIC_COLLECTIONS}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalogue_is_deduplicated() {
        let mut names: Vec<&str> = STATIC_COLLECTIONS.to_vec();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), STATIC_COLLECTIONS.len());
    }

    #[test]
    fn catalogue_covers_the_core_entities() {
        for name in ["leads", "properties", "property-bookings", "companies"] {
            assert!(STATIC_COLLECTIONS.contains(&name), "missing {}", name);
        }
    }
}
