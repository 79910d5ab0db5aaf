// src/estatedesk/tools/mod.rs

pub mod aggregate;
pub mod collection_schema;
pub mod count;
pub mod find;
pub mod list_collections;
pub mod search;

pub use aggregate::AggregateTool;
pub use collection_schema::CollectionSchemaTool;
pub use count::CountTool;
pub use find::FindTool;
pub use list_collections::ListCollectionsTool;
pub use search::SearchTool;

use crate::estatedesk::tool_protocol::McpTool;
use std::sync::Arc;

/// The full curated tool set, in registration order.
pub fn all_tools() -> Vec<Arc<dyn McpTool>> {
    vec![
        Arc::new(FindTool),
        Arc::new(CountTool),
        Arc::new(AggregateTool),
        Arc::new(CollectionSchemaTool),
        Arc::new(ListCollectionsTool),
        Arc::new(SearchTool),
    ]
}
