//! `aggregate`: staged pipeline construction.
//!
//! The caller supplies either a full custom pipeline or one of three
//! shortcuts (grouped statistics, a global statistic, or a grouped count
//! facet). Field names are normalized against the static schema so
//! `max_budget`, `maxbudget`, and `maxBudget` resolve identically, and
//! ISO-8601 strings inside the filter are parsed into real dates.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use mongodb::bson::{oid::ObjectId, Document};
use mongodb::options::AggregateOptions;
use futures_util::stream::TryStreamExt;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::estatedesk::schema_registry::normalize_field_name;
use crate::estatedesk::tool_base::ToolContext;
use crate::estatedesk::tool_protocol::{
    McpTool, ToolError, ToolMetadata, ToolParameter, ToolParameterType,
};
use crate::estatedesk::transport::{document_to_json, json_to_document};

const STAT_OPS: [&str; 4] = ["avg", "sum", "min", "max"];

#[derive(Debug, Deserialize)]
struct AggregateArgs {
    database: Option<String>,
    collection: String,
    pipeline: Option<Vec<Value>>,
    #[serde(rename = "groupBy")]
    group_by: Option<Value>,
    #[serde(rename = "statField")]
    stat_field: Option<String>,
    #[serde(rename = "statOp")]
    stat_op: Option<String>,
    #[serde(default)]
    filter: Value,
    #[serde(rename = "sortBy")]
    sort_by: Option<String>,
    #[serde(rename = "sortDir", default = "default_sort_dir")]
    sort_dir: String,
    #[serde(default = "default_limit")]
    limit: i64,
    #[serde(rename = "allowDiskUse", default)]
    allow_disk_use: bool,
}

fn default_sort_dir() -> String {
    "desc".to_string()
}

fn default_limit() -> i64 {
    100
}

impl AggregateArgs {
    fn group_fields(&self) -> Option<Vec<String>> {
        match &self.group_by {
            Some(Value::String(s)) => Some(vec![s.clone()]),
            Some(Value::Array(items)) => Some(
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect(),
            ),
            _ => None,
        }
    }
}

/// Recursively parse ISO-8601 strings into BSON dates (extended-JSON form).
pub fn convert_iso_dates(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), convert_iso_dates(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(convert_iso_dates).collect()),
        Value::String(s) => parse_iso_date(s)
            .map(|millis| json!({"$date": {"$numberLong": millis.to_string()}}))
            .unwrap_or_else(|| value.clone()),
        other => other.clone(),
    }
}

fn parse_iso_date(s: &str) -> Option<i64> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc).timestamp_millis());
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        let midnight = date.and_hms_opt(0, 0, 0)?;
        return Some(midnight.and_utc().timestamp_millis());
    }
    None
}

/// Strip whitespace from every stage key, recursing into sub-documents.
/// Planners occasionally emit artifacts like `" $group"`.
pub fn sanitize_pipeline_keys(pipeline: &[Value]) -> Vec<Value> {
    pipeline.iter().map(clean_keys).collect()
}

fn clean_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.trim().to_string(), clean_keys(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(clean_keys).collect()),
        other => other.clone(),
    }
}

/// Build the full aggregation pipeline for the given arguments.
///
/// Exposed for tests; `execute` converts the result to BSON and runs it.
fn build_pipeline(args: &AggregateArgs) -> Result<Vec<Value>, ToolError> {
    let mut pipeline: Vec<Value> = Vec::new();

    // 1) Initial $match: the tenant-scoped filter with dates materialized.
    let base_filter = if args.filter.is_object() {
        convert_iso_dates(&args.filter)
    } else {
        Value::Object(Map::new())
    };
    pipeline.push(json!({"$match": base_filter}));

    let group_fields = args
        .group_fields()
        .map(|fields| {
            fields
                .iter()
                .map(|f| normalize_field_name(f, &args.collection))
                .collect::<Vec<_>>()
        })
        .filter(|fields| !fields.is_empty());

    if let Some(custom) = args.pipeline.as_ref().filter(|p| !p.is_empty()) {
        // 2) Custom pipeline overrides every other mode.
        pipeline.extend(sanitize_pipeline_keys(custom));
    } else if let (Some(fields), Some(stat_field), Some(stat_op)) =
        (&group_fields, &args.stat_field, &args.stat_op)
    {
        // 3) Grouped statistic.
        let op = validate_stat_op(stat_op)?;
        let stat_field = normalize_field_name(stat_field, &args.collection);
        let group_key = group_key(fields);
        let mut group = Map::new();
        group.insert("_id".to_string(), group_key);
        group.insert(
            "stat".to_string(),
            stat_expr(&op, &stat_field),
        );
        pipeline.push(json!({"$group": Value::Object(group)}));

        let mut proj = Map::new();
        proj.insert("_id".to_string(), json!(0));
        proj.insert("stat".to_string(), json!(1));
        if fields.len() == 1 {
            proj.insert("group".to_string(), json!("$_id"));
        } else {
            for f in fields {
                proj.insert(f.clone(), json!(format!("$_id.{}", f)));
            }
        }
        pipeline.push(json!({"$project": Value::Object(proj)}));
    } else if let (Some(stat_field), Some(stat_op)) = (&args.stat_field, &args.stat_op) {
        // 4) Global single-bucket statistic.
        let op = validate_stat_op(stat_op)?;
        let stat_field = normalize_field_name(stat_field, &args.collection);
        let mut group = Map::new();
        group.insert("_id".to_string(), Value::Null);
        group.insert("result".to_string(), stat_expr(&op, &stat_field));
        pipeline.push(json!({"$group": Value::Object(group)}));
        pipeline.push(json!({"$project": {"_id": 0, "result": 1}}));
    } else if let Some(fields) = &group_fields {
        // 5) Grouped count behind a $facet so the total rides along.
        let group_stage = json!({"$group": {"_id": group_key(fields), "count": {"$sum": 1}}});
        let mut proj = Map::new();
        if fields.len() == 1 {
            proj.insert("field".to_string(), json!("$_id"));
        } else {
            for f in fields {
                proj.insert(f.clone(), json!(format!("$_id.{}", f)));
            }
        }
        proj.insert("count".to_string(), json!(1));
        proj.insert("_id".to_string(), json!(0));
        pipeline.push(json!({
            "$facet": {
                "total": [{"$count": "total"}],
                "byGroup": [group_stage, {"$project": Value::Object(proj)}],
            }
        }));
    } else {
        // 6) Bare count of matching documents.
        pipeline.push(json!({"$count": "count"}));
    }

    // 7) Sort and limit only apply to flat (non-facet) pipelines.
    let is_facet = pipeline
        .iter()
        .any(|stage| stage.get("$facet").is_some());
    if !is_facet {
        if let Some(sort_by) = &args.sort_by {
            let field = normalize_field_name(sort_by, &args.collection);
            let direction = if args.sort_dir.eq_ignore_ascii_case("desc") {
                -1
            } else {
                1
            };
            let mut sort = Map::new();
            sort.insert(field, json!(direction));
            pipeline.push(json!({"$sort": Value::Object(sort)}));
        }
        if args.limit > 0 {
            pipeline.push(json!({"$limit": args.limit}));
        }
    }

    Ok(sanitize_pipeline_keys(&pipeline))
}

fn group_key(fields: &[String]) -> Value {
    if fields.len() == 1 {
        json!(format!("${}", fields[0]))
    } else {
        Value::Object(
            fields
                .iter()
                .map(|f| (f.clone(), json!(format!("${}", f))))
                .collect(),
        )
    }
}

fn stat_expr(op: &str, field: &str) -> Value {
    let mut expr = Map::new();
    expr.insert(format!("${}", op), json!(format!("${}", field)));
    Value::Object(expr)
}

fn validate_stat_op(op: &str) -> Result<String, ToolError> {
    let lowered = op.to_lowercase();
    if STAT_OPS.contains(&lowered.as_str()) {
        Ok(lowered)
    } else {
        Err(ToolError::InvalidArguments(format!(
            "Unsupported statOp '{}'",
            op
        )))
    }
}

pub struct AggregateTool;

#[async_trait]
impl McpTool for AggregateTool {
    fn name(&self) -> &'static str {
        "aggregate"
    }

    fn metadata(&self) -> ToolMetadata {
        ToolMetadata::new(
            "aggregate",
            "Run an aggregation: a custom pipeline, grouped statistics, or grouped counts.",
        )
        .with_parameter(ToolParameter::new("database", ToolParameterType::String))
        .with_parameter(
            ToolParameter::new("collection", ToolParameterType::String)
                .with_description("Name of the collection")
                .required(),
        )
        .with_parameter(
            ToolParameter::new("pipeline", ToolParameterType::Array)
                .with_description("Full custom aggregation pipeline"),
        )
        .with_parameter(
            ToolParameter::new("groupBy", ToolParameterType::String)
                .with_description("Field (or fields) to group by"),
        )
        .with_parameter(
            ToolParameter::new("statField", ToolParameterType::String)
                .with_description("Field for a statistical op (e.g. maxBudget)"),
        )
        .with_parameter(
            ToolParameter::new("statOp", ToolParameterType::String)
                .with_description("Aggregation op: avg, sum, min, max")
                .with_enum(STAT_OPS.iter().map(|op| json!(op)).collect()),
        )
        .with_parameter(
            ToolParameter::new("filter", ToolParameterType::Object)
                .with_description("Additional match filter"),
        )
        .with_parameter(
            ToolParameter::new("sortBy", ToolParameterType::String)
                .with_description("Field to sort results by"),
        )
        .with_parameter(
            ToolParameter::new("sortDir", ToolParameterType::String)
                .with_description("asc or desc")
                .with_enum(vec![json!("asc"), json!("desc")]),
        )
        .with_parameter(
            ToolParameter::new("limit", ToolParameterType::Integer)
                .with_description("Max documents to return"),
        )
        .with_parameter(
            ToolParameter::new("allowDiskUse", ToolParameterType::Boolean)
                .with_description("Allow disk usage for large pipelines"),
        )
    }

    fn takes_database(&self) -> bool {
        true
    }

    fn scopes_filter(&self) -> bool {
        true
    }

    fn scopes_pipeline(&self) -> bool {
        true
    }

    async fn execute(
        &self,
        ctx: &ToolContext,
        _tenant: ObjectId,
        args: Value,
    ) -> Result<Value, ToolError> {
        let args: AggregateArgs =
            serde_json::from_value(args).map_err(|e| ToolError::InvalidArguments(e.to_string()))?;

        if args.pipeline.as_ref().filter(|p| !p.is_empty()).is_none()
            && args.group_fields().filter(|f| !f.is_empty()).is_none()
            && args.stat_field.is_none()
        {
            return Err(ToolError::InvalidArguments(
                "Must provide at least one of 'pipeline', 'groupBy' or 'statField'".to_string(),
            ));
        }

        let pipeline = build_pipeline(&args)?;
        let stages: Vec<Document> = pipeline
            .iter()
            .map(json_to_document)
            .collect::<Result<_, _>>()
            .map_err(ToolError::InvalidArguments)?;

        log::info!(
            "Running aggregation on {:?}.{}: {} stages",
            args.database,
            args.collection,
            stages.len()
        );

        let coll = ctx
            .session
            .collection(args.database.as_deref(), &args.collection)?;
        let mut options = AggregateOptions::default();
        options.allow_disk_use = Some(args.allow_disk_use);

        let cursor = coll
            .aggregate(stages)
            .with_options(options)
            .await
            .map_err(|e| ToolError::Database(format!("Aggregation failed: {}", e)))?;
        let docs: Vec<Document> = cursor
            .try_collect()
            .await
            .map_err(|e| ToolError::Database(format!("Aggregation failed: {}", e)))?;

        Ok(json!({"result": docs.into_iter().map(document_to_json).collect::<Vec<_>>()}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(value: Value) -> AggregateArgs {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn group_by_alone_builds_a_count_facet() {
        let pipeline = build_pipeline(&args(json!({
            "collection": "leads",
            "groupBy": "sourceType",
            "filter": {},
        })))
        .unwrap();

        assert_eq!(pipeline.len(), 2);
        assert!(pipeline[0].get("$match").is_some());
        let facet = &pipeline[1]["$facet"];
        assert_eq!(facet["total"], json!([{"$count": "total"}]));
        assert_eq!(
            facet["byGroup"][0]["$group"],
            json!({"_id": "$sourceType", "count": {"$sum": 1}})
        );
        assert_eq!(
            facet["byGroup"][1]["$project"],
            json!({"field": "$_id", "count": 1, "_id": 0})
        );
    }

    #[test]
    fn facet_pipelines_never_get_sort_or_limit() {
        let pipeline = build_pipeline(&args(json!({
            "collection": "leads",
            "groupBy": "sourceType",
            "sortBy": "count",
            "limit": 5,
        })))
        .unwrap();
        assert!(pipeline.iter().all(|s| s.get("$sort").is_none()));
        assert!(pipeline.iter().all(|s| s.get("$limit").is_none()));
    }

    #[test]
    fn grouped_statistic_normalizes_field_names() {
        let pipeline = build_pipeline(&args(json!({
            "collection": "leads",
            "groupBy": "source_type",
            "statField": "max_budget",
            "statOp": "AVG",
        })))
        .unwrap();

        assert_eq!(
            pipeline[1]["$group"],
            json!({"_id": "$sourceType", "stat": {"$avg": "$maxBudget"}})
        );
        assert_eq!(
            pipeline[2]["$project"],
            json!({"_id": 0, "stat": 1, "group": "$_id"})
        );
    }

    #[test]
    fn multi_field_grouping_promotes_id_components() {
        let pipeline = build_pipeline(&args(json!({
            "collection": "leads",
            "groupBy": ["sourceType", "leadStatus"],
            "statField": "maxBudget",
            "statOp": "sum",
        })))
        .unwrap();

        assert_eq!(
            pipeline[1]["$group"]["_id"],
            json!({"sourceType": "$sourceType", "leadStatus": "$leadStatus"})
        );
        assert_eq!(pipeline[2]["$project"]["sourceType"], "$_id.sourceType");
        assert_eq!(pipeline[2]["$project"]["leadStatus"], "$_id.leadStatus");
    }

    #[test]
    fn global_statistic_uses_a_null_bucket() {
        let pipeline = build_pipeline(&args(json!({
            "collection": "leads",
            "statField": "maxBudget",
            "statOp": "max",
        })))
        .unwrap();
        assert_eq!(
            pipeline[1]["$group"],
            json!({"_id": null, "result": {"$max": "$maxBudget"}})
        );
        // Flat pipeline: default limit applies.
        assert_eq!(pipeline.last().unwrap()["$limit"], 100);
    }

    #[test]
    fn custom_pipeline_wins_and_keys_are_sanitized() {
        let pipeline = build_pipeline(&args(json!({
            "collection": "leads",
            "pipeline": [{" $group": {"_id": "$leadStatus", "n": {" $sum": 1}}}],
        })))
        .unwrap();
        assert!(pipeline[1].get("$group").is_some());
        assert!(pipeline[1]["$group"]["n"].get("$sum").is_some());
    }

    #[test]
    fn unsupported_stat_op_is_rejected() {
        let err = build_pipeline(&args(json!({
            "collection": "leads",
            "statField": "maxBudget",
            "statOp": "median",
        })))
        .unwrap_err();
        assert!(err.is_user_error());
    }

    #[test]
    fn iso_strings_become_dates_in_place() {
        let filter = json!({
            "createdAt": {"$gte": "2024-01-01T00:00:00Z", "$lt": "2024-02-01"},
            "leadStatus": "Converted",
        });
        let converted = convert_iso_dates(&filter);
        assert!(converted["createdAt"]["$gte"].get("$date").is_some());
        assert!(converted["createdAt"]["$lt"].get("$date").is_some());
        assert_eq!(converted["leadStatus"], "Converted");
    }

    #[test]
    fn sort_direction_and_normalized_sort_field() {
        let pipeline = build_pipeline(&args(json!({
            "collection": "leads",
            "statField": "maxBudget",
            "statOp": "avg",
            "sortBy": "max_budget",
            "sortDir": "asc",
        })))
        .unwrap();
        let sort = pipeline
            .iter()
            .find(|s| s.get("$sort").is_some())
            .expect("sort stage present");
        assert_eq!(sort["$sort"]["maxBudget"], 1);
    }
}
