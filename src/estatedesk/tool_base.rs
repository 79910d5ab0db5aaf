//! Cross-cutting tool execution layer.
//!
//! [`ToolContext::run`] wraps every tool dispatch with the shared machinery:
//! database defaulting, tenant scoping of filters and pipelines,
//! case-insensitive string-match injection, allow-list enforcement, timing,
//! and telemetry recording. Tools themselves only see prepared arguments.

use mongodb::bson::oid::ObjectId;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Instant;

use crate::estatedesk::config::Config;
use crate::estatedesk::session::Session;
use crate::estatedesk::telemetry::Telemetry;
use crate::estatedesk::tool_protocol::{McpTool, ToolError};

/// Shared handles every tool needs at execution time.
pub struct ToolContext {
    pub session: Arc<Session>,
    pub telemetry: Arc<Telemetry>,
    pub config: Arc<Config>,
}

impl ToolContext {
    pub fn new(session: Arc<Session>, telemetry: Arc<Telemetry>) -> Self {
        let config = Arc::clone(session.config());
        Self {
            session,
            telemetry,
            config,
        }
    }

    /// Run `tool` with raw caller arguments, applying the shared pipeline:
    ///
    /// 1. default `database` from the session when the tool takes one;
    /// 2. tenant-scope `filter` and `pipeline` with the request's tenant,
    ///    unless the collection is declared tenant-global;
    /// 3. rewrite bare string literals in the filter into case-insensitive
    ///    regex matches;
    /// 4. enforce the collection allow-list before any I/O;
    /// 5. dispatch, time the call, and record telemetry either way.
    ///
    /// The tenant arrives as a parameter (resolved by the caller from the
    /// request) so concurrent calls for different tenants cannot interfere.
    pub async fn run(
        &self,
        tool: &dyn McpTool,
        tenant: ObjectId,
        raw_args: Value,
    ) -> Result<Value, ToolError> {
        let start = Instant::now();
        let mut args = match raw_args {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(ToolError::InvalidArguments(format!(
                    "expected an object of arguments, got {}",
                    other
                )));
            }
        };

        if tool.takes_database() && !args.contains_key("database") {
            args.insert("database".to_string(), json!(self.session.db_name()));
        }

        let collection = args
            .get("collection")
            .and_then(Value::as_str)
            .map(str::to_string);

        if tool.scopes_filter() {
            let extra = match args.remove("filter") {
                Some(Value::Object(map)) => map,
                Some(Value::Null) | None => Map::new(),
                Some(other) => {
                    return Err(ToolError::InvalidArguments(format!(
                        "filter must be a document, got {}",
                        other
                    )));
                }
            };

            let scoped = if collection
                .as_deref()
                .is_some_and(|c| self.config.is_non_tenant(c))
            {
                let passthrough = inject_case_insensitive(&Value::Object(extra));
                log::debug!(
                    "Skipping tenant scope for global collection {:?}; filter={}",
                    collection,
                    passthrough
                );
                passthrough
            } else {
                let filt = make_tenant_filter(collection.as_deref(), &tenant, Some(extra));
                let injected = inject_case_insensitive(&Value::Object(filt));
                log::debug!(
                    "Scoped filter for tenant on collection {:?}: {}",
                    collection,
                    injected
                );
                injected
            };
            args.insert("filter".to_string(), scoped);
        }

        if tool.scopes_pipeline() {
            match args.remove("pipeline") {
                Some(Value::Array(mut pipeline)) if !pipeline.is_empty() => {
                    let skip_scope = collection
                        .as_deref()
                        .is_some_and(|c| self.config.is_non_tenant(c));
                    if skip_scope {
                        log::debug!(
                            "Skipping tenant-scope pipeline for global collection {:?}",
                            collection
                        );
                    } else {
                        let tenant_match =
                            make_tenant_filter(collection.as_deref(), &tenant, None);
                        if !first_stage_matches_tenant(&pipeline, &tenant_match) {
                            pipeline.insert(0, json!({"$match": Value::Object(tenant_match)}));
                        }
                        log::debug!(
                            "Scoped pipeline for tenant on collection {:?}: {} stages",
                            collection,
                            pipeline.len()
                        );
                    }
                    args.insert("pipeline".to_string(), Value::Array(pipeline));
                }
                // An absent or empty pipeline stays absent so the tool's own
                // construction modes (groupBy, stat, count) still apply.
                Some(Value::Array(_)) | Some(Value::Null) | None => {}
                Some(other) => {
                    return Err(ToolError::InvalidArguments(format!(
                        "pipeline must be an array of stages, got {}",
                        other
                    )));
                }
            }
        }

        if let Some(coll) = collection.as_deref() {
            if let Some(allowed) = &self.config.allowed_collections {
                if !allowed.iter().any(|c| c == coll) {
                    if allowed.is_empty() {
                        return Err(ToolError::Forbidden(
                            "No collections are currently allowed. Check your `allowed_collections` configuration."
                                .to_string(),
                        ));
                    }
                    return Err(ToolError::Forbidden(format!(
                        "Collection '{}' not in allowed list. Allowed collections: {}",
                        coll,
                        allowed.join(", ")
                    )));
                }
            }
        }

        let prepared = Value::Object(args);
        log::debug!("Starting tool '{}' with args: {}", tool.name(), prepared);

        let result = tool.execute(self, tenant, prepared.clone()).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        match &result {
            Ok(_) => {
                log::info!("Tool '{}' succeeded in {}ms", tool.name(), duration_ms);
                self.telemetry
                    .record(tool.name(), duration_ms, true, Some(prepared));
            }
            Err(e) if e.is_user_error() => {
                log::warn!(
                    "Tool '{}' failed in {}ms (user error): {}",
                    tool.name(),
                    duration_ms,
                    e
                );
                self.telemetry
                    .record(tool.name(), duration_ms, false, Some(prepared));
            }
            Err(e) => {
                log::error!("Tool '{}' errored in {}ms: {}", tool.name(), duration_ms, e);
                self.telemetry.record(
                    tool.name(),
                    duration_ms,
                    false,
                    Some(json!({"error": e.to_string()})),
                );
            }
        }
        result
    }
}

/// Build the tenant predicate for a collection, merged with caller filters.
///
/// The `companies` collection stores the tenant as its own `_id`; every other
/// collection stamps documents with a `company` reference. The tenant key is
/// inserted last so a caller-supplied value can never widen the scope.
pub fn make_tenant_filter(
    collection: Option<&str>,
    tenant: &ObjectId,
    extra: Option<Map<String, Value>>,
) -> Map<String, Value> {
    let key = if collection == Some("companies") {
        "_id"
    } else {
        "company"
    };
    let mut filter = extra.unwrap_or_default();
    filter.insert(key.to_string(), json!({"$oid": tenant.to_hex()}));
    filter
}

fn first_stage_matches_tenant(pipeline: &[Value], tenant_match: &Map<String, Value>) -> bool {
    let Some(first) = pipeline.first() else {
        return false;
    };
    let Some(stage) = first.get("$match").and_then(Value::as_object) else {
        return false;
    };
    tenant_match.keys().any(|key| stage.contains_key(key))
}

/// Rewrite every bare string literal into a case-insensitive anchored regex.
///
/// Values under keys starting with `$` are operator payloads (including
/// extended-JSON wrappers like `$oid` and `$date`) and pass through
/// untouched.
pub fn inject_case_insensitive(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| {
                    if k.starts_with('$') {
                        (k.clone(), v.clone())
                    } else {
                        (k.clone(), inject_case_insensitive(v))
                    }
                })
                .collect(),
        ),
        Value::Array(items) => {
            Value::Array(items.iter().map(inject_case_insensitive).collect())
        }
        Value::String(s) => json!({
            "$regex": format!("^{}$", regex::escape(s)),
            "$options": "i",
        }),
        other => other.clone(),
    }
}
