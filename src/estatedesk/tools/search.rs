//! `search`: universal fuzzy search across the collection whitelist.
//!
//! For each collection the tool escalates through three `$text` query levels
//! (exact phrase, free text, per token) and, when all of them miss, falls
//! back to a bounded tenant scan that flattens every document into
//! `(path, value)` pairs and matches them by regex and fuzzy token-set
//! ratio. This is the primary resolver for "who is X?" questions.

use async_trait::async_trait;
use futures_util::stream::TryStreamExt;
use mongodb::bson::{doc, oid::ObjectId, Bson, Document};
use mongodb::options::{FindOptions, IndexOptions};
use mongodb::IndexModel;
use regex::{Regex, RegexBuilder};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashSet;

use crate::estatedesk::tool_base::ToolContext;
use crate::estatedesk::tool_protocol::{
    McpTool, ToolError, ToolMetadata, ToolParameter, ToolParameterType,
};

/// Collections covered by the universal search (reference lists excluded).
const SEARCH_COLLECTIONS: [&str; 20] = [
    "companies",
    "brokers",
    "broker-payments",
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

/// Longest string value the flattening pass will consider.
const MAX_VALUE_LEN: usize = 500;
/// Cap on documents examined by the fallback scan, per collection.
const MAX_SCAN_DOCS: i64 = 5_000;

#[derive(Debug, Deserialize)]
struct SearchArgs {
    term: String,
    #[serde(default = "default_threshold")]
    fuzzy_threshold: u32,
}

fn default_threshold() -> u32 {
    80
}

pub struct SearchTool;

#[async_trait]
impl McpTool for SearchTool {
    fn name(&self) -> &'static str {
        "search"
    }

    fn metadata(&self) -> ToolMetadata {
        ToolMetadata::new(
            "search",
            "Search multiple collections with full-text, regex, and fuzzy matching. \
             Returns results grouped by collection.",
        )
        .with_parameter(
            ToolParameter::new("term", ToolParameterType::String)
                .with_description("Search term (e.g. 'Sonu Sharma')")
                .required(),
        )
        .with_parameter(
            ToolParameter::new("fuzzy_threshold", ToolParameterType::Integer)
                .with_description("Fuzzy matching threshold (0-100); higher is stricter"),
        )
    }

    async fn execute(
        &self,
        ctx: &ToolContext,
        tenant: ObjectId,
        args: Value,
    ) -> Result<Value, ToolError> {
        let args: SearchArgs =
            serde_json::from_value(args).map_err(|e| ToolError::InvalidArguments(e.to_string()))?;

        let term = args.term.trim().to_string();
        if term.is_empty() {
            return Err(ToolError::InvalidArguments("term must not be empty".into()));
        }
        let threshold = args.fuzzy_threshold;

        let full_regex = ci_regex(&term)?;
        let tokens: Vec<String> = term.split_whitespace().map(str::to_string).collect();
        let token_regexes: Vec<Regex> = tokens
            .iter()
            .map(|t| ci_regex(t))
            .collect::<Result<_, _>>()?;

        log::info!("search: term='{}' fuzz={}", term, threshold);
        let mut results = Vec::new();

        for coll_name in SEARCH_COLLECTIONS {
            if !ctx.config.is_allowed(coll_name) {
                continue;
            }
            let coll = ctx.session.collection(None, coll_name)?;
            self.ensure_text_index(&coll, coll_name).await;

            let mut hits: Vec<Value> = Vec::new();
            let mut seen: HashSet<ObjectId> = HashSet::new();
            let mut truncated = false;

            // Level 1: exact phrase.
            self.text_search(&coll, &tenant, &format!("\"{}\"", term), "<full-text>", &mut hits, &mut seen)
                .await;
            // Level 2: free text.
            if hits.is_empty() {
                self.text_search(&coll, &tenant, &term, "<text-token>", &mut hits, &mut seen)
                    .await;
            }
            // Level 3: per token, first token that yields anything wins.
            if hits.is_empty() {
                for token in &tokens {
                    self.text_search(&coll, &tenant, token, "<token-text>", &mut hits, &mut seen)
                        .await;
                    if !hits.is_empty() {
                        break;
                    }
                }
            }

            // Level 4: bounded tenant scan with regex and fuzzy matching.
            if hits.is_empty() {
                truncated = self
                    .fallback_scan(
                        &coll,
                        &tenant,
                        &term,
                        &tokens,
                        &full_regex,
                        &token_regexes,
                        threshold,
                        &mut hits,
                        &mut seen,
                    )
                    .await?;
            }

            if !hits.is_empty() {
                log::info!("search: '{}' -> {} hits", coll_name, hits.len());
                let mut entry = json!({"collection": coll_name, "hits": hits});
                if truncated {
                    entry["truncated"] = json!(true);
                }
                results.push(entry);
            } else {
                log::debug!("search: '{}' -> 0 hits", coll_name);
            }
        }

        log::info!("search: total collections with hits = {}", results.len());
        Ok(json!({"results": results}))
    }
}

impl SearchTool {
    /// Create the wildcard text index when the collection lacks one.
    ///
    /// Best effort: on read-only deployments index creation fails and the
    /// fallback scan still serves the query.
    async fn ensure_text_index(&self, coll: &mongodb::Collection<Document>, name: &str) {
        let has_text = match coll.list_indexes().await {
            Ok(cursor) => cursor
                .try_collect::<Vec<IndexModel>>()
                .await
                .map(|indexes| {
                    indexes.iter().any(|idx| {
                        idx.keys
                            .values()
                            .any(|v| matches!(v, Bson::String(s) if s == "text"))
                    })
                })
                .unwrap_or(false),
            Err(e) => {
                log::debug!("search: cannot list indexes on {}: {}", name, e);
                return;
            }
        };
        if has_text {
            return;
        }
        log::debug!("Creating wildcard text index on {}", name);
        let mut options = IndexOptions::default();
        options.default_language = Some("english".to_string());
        let model = IndexModel::builder()
            .keys(doc! {"$**": "text"})
            .options(options)
            .build();
        if let Err(e) = coll.create_index(model).await {
            log::debug!("search: text index creation failed on {}: {}", name, e);
        }
    }

    /// One `$text` query; errors (e.g. missing index) degrade to no hits.
    async fn text_search(
        &self,
        coll: &mongodb::Collection<Document>,
        tenant: &ObjectId,
        query: &str,
        path_label: &str,
        hits: &mut Vec<Value>,
        seen: &mut HashSet<ObjectId>,
    ) {
        let filter = doc! {"company": *tenant, "$text": {"$search": query}};
        let mut options = FindOptions::default();
        options.projection = Some(doc! {"score": {"$meta": "textScore"}});
        options.sort = Some(doc! {"score": {"$meta": "textScore"}});

        let cursor = match coll.find(filter).with_options(options).await {
            Ok(cursor) => cursor,
            Err(e) => {
                log::debug!("search: $text query failed ({}); escalating", e);
                return;
            }
        };
        let docs: Vec<Document> = match cursor.try_collect().await {
            Ok(docs) => docs,
            Err(e) => {
                log::debug!("search: $text cursor failed ({}); escalating", e);
                return;
            }
        };

        for doc in docs {
            let Ok(id) = doc.get_object_id("_id") else {
                continue;
            };
            if seen.insert(id) {
                hits.push(json!({
                    "_id": {"$oid": id.to_hex()},
                    "matches": [{"path": path_label, "snippet": query.trim_matches('"')}],
                }));
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn fallback_scan(
        &self,
        coll: &mongodb::Collection<Document>,
        tenant: &ObjectId,
        term: &str,
        tokens: &[String],
        full_regex: &Regex,
        token_regexes: &[Regex],
        threshold: u32,
        hits: &mut Vec<Value>,
        seen: &mut HashSet<ObjectId>,
    ) -> Result<bool, ToolError> {
        let mut options = FindOptions::default();
        options.limit = Some(MAX_SCAN_DOCS);

        let cursor = coll
            .find(doc! {"company": *tenant})
            .with_options(options)
            .await
            .map_err(|e| ToolError::Database(e.to_string()))?;
        let docs: Vec<Document> = cursor
            .try_collect()
            .await
            .map_err(|e| ToolError::Database(e.to_string()))?;
        let truncated = docs.len() as i64 >= MAX_SCAN_DOCS;

        for doc in &docs {
            let Ok(id) = doc.get_object_id("_id") else {
                continue;
            };
            if seen.contains(&id) {
                continue;
            }

            let mut matches = Vec::new();
            for (path, value) in flatten_with_paths(doc) {
                let matched = full_regex.is_match(&value)
                    || token_regexes.iter().any(|rx| rx.is_match(&value))
                    || token_set_ratio(term, &value) >= threshold
                    || tokens
                        .iter()
                        .any(|tok| token_set_ratio(tok, &value) >= threshold);
                if matched {
                    matches.push(json!({"path": path, "snippet": value}));
                }
            }

            if !matches.is_empty() {
                seen.insert(id);
                hits.push(json!({"_id": {"$oid": id.to_hex()}, "matches": matches}));
            }
        }
        Ok(truncated)
    }
}

fn ci_regex(text: &str) -> Result<Regex, ToolError> {
    RegexBuilder::new(&regex::escape(text))
        .case_insensitive(true)
        .build()
        .map_err(|e| ToolError::Internal(format!("regex build failed: {}", e)))
}

/// Flatten a document into `(dotted.path[i], string value)` pairs, skipping
/// values longer than [`MAX_VALUE_LEN`].
fn flatten_with_paths(doc: &Document) -> Vec<(String, String)> {
    let mut items = Vec::new();
    for (key, value) in doc {
        flatten_bson(value, key, &mut items);
    }
    items
}

fn flatten_bson(value: &Bson, path: &str, items: &mut Vec<(String, String)>) {
    match value {
        Bson::Document(doc) => {
            for (key, inner) in doc {
                flatten_bson(inner, &format!("{}.{}", path, key), items);
            }
        }
        Bson::Array(array) => {
            for (i, inner) in array.iter().enumerate() {
                flatten_bson(inner, &format!("{}[{}]", path, i), items);
            }
        }
        Bson::String(s) if s.len() <= MAX_VALUE_LEN => {
            items.push((path.to_string(), s.clone()));
        }
        _ => {}
    }
}

/// Fuzzy token-set ratio in 0–100, comparable to classic fuzz scoring.
///
/// Both inputs are tokenized; the sorted intersection is compared against
/// each side's full sorted token string and the best ratio wins.
fn token_set_ratio(a: &str, b: &str) -> u32 {
    let tokens_a: std::collections::BTreeSet<String> =
        a.to_lowercase().split_whitespace().map(str::to_string).collect();
    let tokens_b: std::collections::BTreeSet<String> =
        b.to_lowercase().split_whitespace().map(str::to_string).collect();
    if tokens_a.is_empty() || tokens_b.is_empty() {
        return 0;
    }

    let intersection: Vec<String> = tokens_a.intersection(&tokens_b).cloned().collect();
    let sorted_a: Vec<String> = tokens_a.iter().cloned().collect();
    let sorted_b: Vec<String> = tokens_b.iter().cloned().collect();

    let joined_int = intersection.join(" ");
    let joined_a = sorted_a.join(" ");
    let joined_b = sorted_b.join(" ");

    let candidates = if joined_int.is_empty() {
        vec![ratio(&joined_a, &joined_b)]
    } else {
        vec![
            ratio(&joined_int, &joined_a),
            ratio(&joined_int, &joined_b),
            ratio(&joined_a, &joined_b),
        ]
    };
    candidates.into_iter().max().unwrap_or(0)
}

fn ratio(a: &str, b: &str) -> u32 {
    (strsim::normalized_levenshtein(a, b) * 100.0).round() as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongodb::bson::doc;

    #[test]
    fn token_set_ratio_is_order_insensitive() {
        assert_eq!(token_set_ratio("Sonu Sharma", "sharma sonu"), 100);
        assert!(token_set_ratio("Sonu Sharma", "sonu  sharma") >= 95);
    }

    #[test]
    fn token_set_ratio_scores_subsets_high() {
        // The query tokens are a subset of the value's tokens.
        assert_eq!(token_set_ratio("sonu", "sonu sharma"), 100);
        assert!(token_set_ratio("sonu kumar", "rahul verma") < 50);
    }

    #[test]
    fn flattening_walks_nested_documents_and_arrays() {
        let doc = doc! {
            "name": "Sonu Sharma",
            "address": {"city": "Pune", "pin": 411001},
            "tags": ["hot", "priority"],
        };
        let flat = flatten_with_paths(&doc);
        assert!(flat.contains(&("name".to_string(), "Sonu Sharma".to_string())));
        assert!(flat.contains(&("address.city".to_string(), "Pune".to_string())));
        assert!(flat.contains(&("tags[0]".to_string(), "hot".to_string())));
        // Numbers are not string values and never flatten.
        assert!(flat.iter().all(|(p, _)| p != "address.pin"));
    }

    #[test]
    fn long_values_are_skipped() {
        let doc = doc! {"blob": "x".repeat(MAX_VALUE_LEN + 1), "ok": "short"};
        let flat = flatten_with_paths(&doc);
        assert_eq!(flat.len(), 1);
        assert_eq!(flat[0].0, "ok");
    }

    #[test]
    fn search_regexes_are_case_insensitive_and_escaped() {
        let rx = ci_regex("a+b (c)").unwrap();
        assert!(rx.is_match("A+B (C)"));
        assert!(!rx.is_match("ab c"));
    }
}
