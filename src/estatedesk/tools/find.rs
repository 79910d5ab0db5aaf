//! `find`: single- or multi-collection document retrieval.
//!
//! When no collection is named the tool walks the configured whitelist
//! (capped) and, by default, stops at the first collection that yields
//! matches. Every query carries a server-side time limit.

use async_trait::async_trait;
use futures_util::stream::TryStreamExt;
use lazy_static::lazy_static;
use mongodb::bson::{oid::ObjectId, Document};
use mongodb::options::FindOptions;
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::{Duration, Instant};

use crate::estatedesk::tool_base::ToolContext;
use crate::estatedesk::tool_protocol::{
    McpTool, ToolError, ToolMetadata, ToolParameter, ToolParameterType,
};
use crate::estatedesk::transport::{document_to_json, json_to_document};

const MAX_COLLECTIONS_SCAN: usize = 100;
const MAX_SKIP: u64 = 10_000;
const MAX_LIMIT: i64 = 1_000;

lazy_static! {
    static ref NAME_RE: Regex = Regex::new(r"^[A-Za-z0-9_\-]{1,64}$").expect("name pattern");
}

#[derive(Debug, Deserialize)]
struct FindArgs {
    database: Option<String>,
    collection: Option<String>,
    #[serde(default)]
    filter: Value,
    projection: Option<Value>,
    sort: Option<Value>,
    #[serde(default)]
    skip: u64,
    #[serde(default = "default_limit")]
    limit: i64,
    #[serde(rename = "stopAfterFirst", default = "default_stop_after_first")]
    stop_after_first: bool,
}

fn default_limit() -> i64 {
    10
}

fn default_stop_after_first() -> bool {
    true
}

impl FindArgs {
    fn validate(&self) -> Result<(), ToolError> {
        for name in [self.database.as_deref(), self.collection.as_deref()]
            .into_iter()
            .flatten()
        {
            if !NAME_RE.is_match(name) {
                return Err(ToolError::InvalidArguments(format!(
                    "Name '{}' must match pattern {}",
                    name,
                    NAME_RE.as_str()
                )));
            }
        }
        if self.skip > MAX_SKIP {
            return Err(ToolError::InvalidArguments(format!(
                "skip must be at most {}",
                MAX_SKIP
            )));
        }
        if self.limit < 1 || self.limit > MAX_LIMIT {
            return Err(ToolError::InvalidArguments(format!(
                "limit must be between 1 and {}",
                MAX_LIMIT
            )));
        }
        if let Some(sort) = &self.sort {
            let Some(map) = sort.as_object() else {
                return Err(ToolError::InvalidArguments("sort must be a document".into()));
            };
            for (key, dir) in map {
                if dir.as_i64() != Some(1) && dir.as_i64() != Some(-1) {
                    return Err(ToolError::InvalidArguments(format!(
                        "sort value for '{}' must be 1 or -1",
                        key
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Restore plain strings from the anchored case-insensitive regexes the base
/// layer injects: `{"$regex": "^<literal>$", "$options": "i"}` becomes the
/// literal again. This is the escape hatch for exact `_id`-style equality the
/// planner expresses as a bare string.
pub fn unwrap_ci_regex(value: &Value) -> Value {
    match value {
        Value::Array(items) => Value::Array(items.iter().map(unwrap_ci_regex).collect()),
        Value::Object(map) => {
            if map.len() == 2
                && map.get("$options").and_then(Value::as_str) == Some("i")
            {
                if let Some(pattern) = map.get("$regex").and_then(Value::as_str) {
                    if let Some(inner) = pattern
                        .strip_prefix('^')
                        .and_then(|rest| rest.strip_suffix('$'))
                    {
                        return Value::String(unescape_regex(inner));
                    }
                }
            }
            Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), unwrap_ci_regex(v)))
                    .collect(),
            )
        }
        other => other.clone(),
    }
}

// Inverse of regex::escape: drops the backslash before any escaped
// non-alphanumeric character.
fn unescape_regex(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len());
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.peek() {
                Some(&next) if !next.is_alphanumeric() => {
                    out.push(next);
                    chars.next();
                }
                _ => out.push(c),
            }
        } else {
            out.push(c);
        }
    }
    out
}

pub struct FindTool;

#[async_trait]
impl McpTool for FindTool {
    fn name(&self) -> &'static str {
        "find"
    }

    fn metadata(&self) -> ToolMetadata {
        ToolMetadata::new(
            "find",
            "Fetch documents from one collection, or scan the whitelist when none is given.",
        )
        .with_parameter(
            ToolParameter::new("database", ToolParameterType::String)
                .with_description("Database; omitted means the tenant database"),
        )
        .with_parameter(
            ToolParameter::new("collection", ToolParameterType::String)
                .with_description("Collection to query; omit to scan multiple collections"),
        )
        .with_parameter(
            ToolParameter::new("filter", ToolParameterType::Object)
                .with_description("MongoDB filter"),
        )
        .with_parameter(
            ToolParameter::new("projection", ToolParameterType::Object)
                .with_description("MongoDB projection document"),
        )
        .with_parameter(
            ToolParameter::new("sort", ToolParameterType::Object)
                .with_description("Sort spec, e.g. {\"createdAt\": -1}"),
        )
        .with_parameter(
            ToolParameter::new("skip", ToolParameterType::Integer)
                .with_description("Documents to skip (0-10000)"),
        )
        .with_parameter(
            ToolParameter::new("limit", ToolParameterType::Integer)
                .with_description("Maximum documents per collection (1-1000)"),
        )
        .with_parameter(
            ToolParameter::new("stopAfterFirst", ToolParameterType::Boolean)
                .with_description("Return after the first collection with matches"),
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
        let start = Instant::now();
        let args: FindArgs =
            serde_json::from_value(args).map_err(|e| ToolError::InvalidArguments(e.to_string()))?;
        args.validate()?;

        let filter_json = unwrap_ci_regex(&args.filter);
        let filter = if filter_json.is_null() {
            Document::new()
        } else {
            json_to_document(&filter_json).map_err(ToolError::InvalidArguments)?
        };

        let db_name = args.database.clone();
        let coll_list = match &args.collection {
            Some(coll) => vec![coll.clone()],
            None => {
                let mut list = self.collection_whitelist(ctx, db_name.as_deref()).await?;
                if list.len() > MAX_COLLECTIONS_SCAN {
                    log::warn!("find: limiting scan to {} collections", MAX_COLLECTIONS_SCAN);
                    list.truncate(MAX_COLLECTIONS_SCAN);
                }
                list
            }
        };

        let mut results = Vec::new();
        let mut total_docs = 0usize;

        for coll_name in &coll_list {
            let docs = self
                .query_collection(ctx, db_name.as_deref(), coll_name, &filter, &args)
                .await?;
            if !docs.is_empty() {
                total_docs += docs.len();
                results.push(json!({
                    "collection": coll_name,
                    "count": docs.len(),
                    "documents": docs,
                }));
                if args.stop_after_first {
                    break;
                }
            }
        }

        let duration_ms = start.elapsed().as_millis() as u64;
        log::info!(
            "find: db={:?} scanned={} hits={} time={}ms",
            db_name,
            coll_list.len(),
            total_docs,
            duration_ms
        );

        Ok(json!({
            "results": results,
            "total_documents": total_docs,
            "collections_scanned": coll_list,
            "database": db_name.unwrap_or_else(|| ctx.session.db_name().to_string()),
            "duration_ms": duration_ms,
        }))
    }
}

impl FindTool {
    async fn query_collection(
        &self,
        ctx: &ToolContext,
        db: Option<&str>,
        coll_name: &str,
        filter: &Document,
        args: &FindArgs,
    ) -> Result<Vec<Value>, ToolError> {
        let coll = ctx.session.collection(db, coll_name)?;

        let mut options = FindOptions::default();
        if let Some(projection) = &args.projection {
            options.projection = Some(json_to_document(projection).map_err(ToolError::InvalidArguments)?);
        }
        if let Some(sort) = &args.sort {
            options.sort = Some(json_to_document(sort).map_err(ToolError::InvalidArguments)?);
        }
        if args.skip > 0 {
            options.skip = Some(args.skip);
        }
        options.limit = Some(args.limit);
        options.max_time = Some(Duration::from_millis(ctx.config.query_timeout_ms));

        let cursor = coll
            .find(filter.clone())
            .with_options(options)
            .await
            .map_err(|e| ToolError::Database(e.to_string()))?;
        let docs: Vec<Document> = cursor
            .try_collect()
            .await
            .map_err(|e| ToolError::Database(e.to_string()))?;

        Ok(docs.into_iter().map(document_to_json).collect())
    }

    async fn collection_whitelist(
        &self,
        ctx: &ToolContext,
        db: Option<&str>,
    ) -> Result<Vec<String>, ToolError> {
        if let Some(allowed) = &ctx.config.allowed_collections {
            return Ok(allowed.clone());
        }
        ctx.session
            .database(db)
            .list_collection_names()
            .await
            .map_err(|e| {
                log::error!("find: failed to list collections: {}", e);
                ToolError::Database(format!("Cannot list collections: {}", e))
            })
    }
}
