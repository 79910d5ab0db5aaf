//! Host-side helpers around tool calls: trimming, emptiness checks, and the
//! error mapping between tool failures and HTTP-style statuses.
//!
//! Tool results are trimmed before they are fed back to the planner: large
//! binary-ish fields are dropped, documents are capped, and extended-JSON
//! wrappers are collapsed to plain strings the LLM can read.

use chrono::DateTime;
use mongodb::bson::oid::ObjectId;
use serde_json::{json, Map, Value};
use std::error::Error;
use std::fmt;

use crate::estatedesk::orchestrator::ToolDispatcher;
use crate::estatedesk::tool_protocol::ToolError;

/// Fields that are large, binary, or opaque and never useful to the planner.
const BIG_FIELDS: [&str; 7] = [
    "images",
    "videos",
    "documents",
    "brochure",
    "qrCode",
    "govtApprovedDocuments",
    "layoutPlanImages",
];

/// Documents kept per result bucket after trimming.
const MAX_DOCS: usize = 15;
/// Elements kept per embedded list after trimming.
const MAX_LIST_ITEMS: usize = 10;

/// Error surfaced by the orchestrator, mapped onto HTTP-style statuses.
#[derive(Debug, Clone)]
pub enum HostError {
    /// Caller mistake (400): bad arguments, invalid tenant, disallowed
    /// collection. The message is safe to show.
    BadRequest(String),
    /// Upstream dependency failure (502): MongoDB or the LLM.
    Upstream(String),
    /// Anything unexpected (500); the body stays generic, detail is logged.
    Internal,
}

impl HostError {
    pub fn status(&self) -> u16 {
        match self {
            HostError::BadRequest(_) => 400,
            HostError::Upstream(_) => 502,
            HostError::Internal => 500,
        }
    }
}

impl fmt::Display for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostError::BadRequest(msg) => write!(f, "{}", msg),
            HostError::Upstream(msg) => write!(f, "{}", msg),
            HostError::Internal => write!(f, "Internal server error, please try again later"),
        }
    }
}

impl Error for HostError {}

impl From<ToolError> for HostError {
    fn from(e: ToolError) -> Self {
        if e.is_user_error() {
            HostError::BadRequest(e.to_string())
        } else if matches!(e, ToolError::Database(_)) {
            HostError::Upstream(e.to_string())
        } else {
            HostError::Internal
        }
    }
}

/// Collapse extended-JSON wrappers into plain values the LLM can read.
fn simplify_scalar(value: &Value) -> Option<Value> {
    let map = value.as_object()?;
    if map.len() != 1 {
        return None;
    }
    if let Some(oid) = map.get("$oid").and_then(Value::as_str) {
        return Some(json!(oid));
    }
    if let Some(date) = map.get("$date") {
        // Relaxed form carries an ISO string; canonical nests $numberLong.
        if let Some(iso) = date.as_str() {
            return Some(json!(iso));
        }
        if let Some(millis) = date
            .get("$numberLong")
            .and_then(Value::as_str)
            .and_then(|s| s.parse::<i64>().ok())
        {
            let iso = DateTime::from_timestamp_millis(millis)
                .map(|dt| dt.to_rfc3339())
                .unwrap_or_else(|| millis.to_string());
            return Some(json!(iso));
        }
    }
    if let Some(n) = map.get("$numberLong").and_then(Value::as_str) {
        return Some(json!(n.parse::<i64>().ok()?));
    }
    if let Some(n) = map.get("$numberDecimal").and_then(Value::as_str) {
        return Some(json!(n));
    }
    None
}

/// Trim one document: drop `__v` and binary fields, cap embedded lists, and
/// simplify extended-JSON scalars.
pub fn trim_document(doc: &Value) -> Value {
    let Some(map) = doc.as_object() else {
        return doc.clone();
    };
    let mut out = Map::new();
    for (key, value) in map {
        if key == "__v" || BIG_FIELDS.contains(&key.as_str()) {
            continue;
        }
        out.insert(key.clone(), trim_value(value));
    }
    Value::Object(out)
}

fn trim_value(value: &Value) -> Value {
    if let Some(simple) = simplify_scalar(value) {
        return simple;
    }
    match value {
        Value::Object(_) => trim_document(value),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .take(MAX_LIST_ITEMS)
                .map(trim_value)
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Shrink a raw tool result to what the planner should see.
pub fn trim_result(tool: &str, raw: &Value) -> Value {
    match tool {
        "find" => {
            let mut out = raw.clone();
            if let Some(buckets) = out.get_mut("results").and_then(Value::as_array_mut) {
                for bucket in buckets {
                    if let Some(docs) = bucket.get_mut("documents").and_then(Value::as_array_mut) {
                        let trimmed: Vec<Value> =
                            docs.iter().take(MAX_DOCS).map(trim_document).collect();
                        *docs = trimmed;
                    }
                }
            }
            out
        }
        "aggregate" => {
            let mut out = raw.clone();
            if let Some(rows) = out.get_mut("result").and_then(Value::as_array_mut) {
                let trimmed: Vec<Value> = rows.iter().take(MAX_DOCS).map(trim_document).collect();
                *rows = trimmed;
            }
            out
        }
        "search" => {
            let buckets: Vec<Value> = raw
                .get("results")
                .and_then(Value::as_array)
                .map(|entries| {
                    entries
                        .iter()
                        .map(|entry| {
                            let hits: Vec<Value> = entry
                                .get("hits")
                                .and_then(Value::as_array)
                                .map(|hits| {
                                    hits.iter()
                                        .take(MAX_DOCS)
                                        .map(|hit| {
                                            json!({
                                                "_id": hit
                                                    .get("_id")
                                                    .map(|id| simplify_scalar(id)
                                                        .unwrap_or_else(|| id.clone()))
                                                    .unwrap_or(Value::Null),
                                                "matches": hit.get("matches").cloned()
                                                    .unwrap_or_else(|| json!([])),
                                            })
                                        })
                                        .collect()
                                })
                                .unwrap_or_default();
                            let mut bucket = json!({
                                "collection": entry.get("collection").cloned().unwrap_or(Value::Null),
                                "hits": hits,
                            });
                            if entry.get("truncated").is_some() {
                                bucket["truncated"] = entry["truncated"].clone();
                            }
                            bucket
                        })
                        .collect()
                })
                .unwrap_or_default();
            json!({"results": buckets})
        }
        _ => raw.clone(),
    }
}

/// Whether a (trimmed) tool result carries no data.
pub fn result_is_empty(tool: &str, result: &Value) -> bool {
    match tool {
        "count" => result.get("result").and_then(Value::as_u64).unwrap_or(0) == 0,
        "find" => {
            result
                .get("total_documents")
                .and_then(Value::as_u64)
                .unwrap_or(0)
                == 0
        }
        "aggregate" => result
            .get("result")
            .and_then(Value::as_array)
            .map(|r| r.is_empty())
            .unwrap_or(true),
        "search" => result
            .get("results")
            .and_then(Value::as_array)
            .map(|r| r.is_empty())
            .unwrap_or(true),
        _ => false,
    }
}

/// Dispatch one tenant-scoped tool call and trim the result.
///
/// The tenant is a request-scoped value resolved by the orchestrator; it
/// rides along with the dispatch instead of living in shared state, so
/// concurrent turns for different tenants cannot cross-contaminate. Returns
/// the trimmed result plus an emptiness flag the retry budget keys on.
/// `find` filters with a bare string `_id` get the string coerced into an
/// ObjectId wrapper so planner-synthesized lookups hit real documents.
pub async fn call_tool(
    dispatcher: &dyn ToolDispatcher,
    tenant: ObjectId,
    name: &str,
    mut args: Value,
) -> Result<(Value, bool), HostError> {
    if name == "find" {
        if let Some(id) = args
            .get("filter")
            .and_then(|f| f.get("_id"))
            .and_then(Value::as_str)
        {
            if mongodb::bson::oid::ObjectId::parse_str(id).is_ok() {
                let wrapped = json!({"$oid": id});
                args["filter"]["_id"] = wrapped;
                log::debug!("Coerced _id string into ObjectId for find");
            }
        }
    }

    log::info!("MCP Request -> {} {}", name, args);
    let raw = dispatcher.dispatch(tenant, name, args).await.map_err(|e| {
        log::error!("Tool call {} failed: {}", name, e);
        HostError::from(e)
    })?;
    log::info!("MCP Response <- {} ({} bytes)", name, raw.to_string().len());

    let trimmed = trim_result(name, &raw);
    let empty = result_is_empty(name, &trimmed);
    log::debug!("Trimmed {} empty={}", name, empty);
    Ok((trimmed, empty))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trim_drops_big_fields_and_version_keys() {
        let doc = json!({
            "name": "Skyline Tower",
            "__v": 3,
            "images": ["a.jpg", "b.jpg"],
            "brochure": "big.pdf",
            "address": {"city": "Pune", "qrCode": "xxxx"},
        });
        let trimmed = trim_document(&doc);
        assert_eq!(trimmed["name"], "Skyline Tower");
        assert!(trimmed.get("__v").is_none());
        assert!(trimmed.get("images").is_none());
        assert!(trimmed.get("brochure").is_none());
        assert!(trimmed["address"].get("qrCode").is_none());
    }

    #[test]
    fn trim_simplifies_extended_json_scalars() {
        let doc = json!({
            "_id": {"$oid": "64b000000000000000000001"},
            "createdAt": {"$date": {"$numberLong": "1700000000000"}},
            "count": {"$numberLong": "42"},
        });
        let trimmed = trim_document(&doc);
        assert_eq!(trimmed["_id"], "64b000000000000000000001");
        assert!(trimmed["createdAt"].as_str().unwrap().starts_with("2023-11-14"));
        assert_eq!(trimmed["count"], 42);
    }

    #[test]
    fn find_results_are_capped_per_bucket() {
        let docs: Vec<Value> = (0..30).map(|i| json!({"n": i})).collect();
        let raw = json!({
            "results": [{"collection": "leads", "count": 30, "documents": docs}],
            "total_documents": 30,
        });
        let trimmed = trim_result("find", &raw);
        assert_eq!(
            trimmed["results"][0]["documents"].as_array().unwrap().len(),
            MAX_DOCS
        );
    }

    #[test]
    fn embedded_lists_are_capped() {
        let doc = json!({"tags": (0..25).map(|i| json!(i)).collect::<Vec<_>>()});
        let trimmed = trim_document(&doc);
        assert_eq!(trimmed["tags"].as_array().unwrap().len(), MAX_LIST_ITEMS);
    }

    #[test]
    fn search_trim_flattens_hit_ids() {
        let raw = json!({
            "results": [{
                "collection": "leads",
                "hits": [{"_id": {"$oid": "64b000000000000000000009"}, "matches": [{"path": "name", "snippet": "Sonu"}]}],
                "truncated": true,
            }],
        });
        let trimmed = trim_result("search", &raw);
        assert_eq!(
            trimmed["results"][0]["hits"][0]["_id"],
            "64b000000000000000000009"
        );
        assert_eq!(trimmed["results"][0]["truncated"], true);
    }

    #[test]
    fn emptiness_rules_per_tool() {
        assert!(result_is_empty("count", &json!({"result": 0})));
        assert!(!result_is_empty("count", &json!({"result": 7})));
        assert!(result_is_empty("find", &json!({"total_documents": 0, "results": []})));
        assert!(result_is_empty("aggregate", &json!({"result": []})));
        assert!(result_is_empty("search", &json!({"results": []})));
        assert!(!result_is_empty(
            "search",
            &json!({"results": [{"collection": "leads", "hits": []}]})
        ));
        assert!(!result_is_empty("list_collections", &json!({"result": []})));
    }

    #[test]
    fn tool_errors_map_to_statuses() {
        assert_eq!(
            HostError::from(ToolError::InvalidArguments("bad".into())).status(),
            400
        );
        assert_eq!(
            HostError::from(ToolError::Database("down".into())).status(),
            502
        );
        assert_eq!(
            HostError::from(ToolError::Internal("bug".into())).status(),
            500
        );
        // Internal errors never leak detail.
        assert_eq!(
            HostError::from(ToolError::Internal("secret detail".into())).to_string(),
            "Internal server error, please try again later"
        );
    }
}
