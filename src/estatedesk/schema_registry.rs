//! Static collection schema registry.
//!
//! The registry is the code-resident source of truth for field names,
//! semantic type labels, and enumerable sample values. No live sampling is
//! performed — determinism and latency are traded for freshness. The data
//! lives in `resources/schemas.json`, a versioned resource bundled into the
//! binary at compile time and parsed once at startup.

use lazy_static::lazy_static;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// Schema for one collection: field → type label, field → sample values.
#[derive(Debug, Clone, Deserialize)]
pub struct CollectionSchema {
    pub fields: BTreeMap<String, String>,
    #[serde(default)]
    pub values: BTreeMap<String, Vec<Value>>,
}

#[derive(Debug, Deserialize)]
struct SchemaFile {
    version: u32,
    collections: BTreeMap<String, CollectionSchema>,
}

lazy_static! {
    static ref SCHEMA_FILE: SchemaFile = serde_json::from_str(include_str!(
        "../../resources/schemas.json"
    ))
    .expect("bundled schemas.json must parse");
}

/// Resource format version of the bundled registry.
pub fn version() -> u32 {
    SCHEMA_FILE.version
}

/// Look up the schema for a collection.
pub fn get(collection: &str) -> Option<&'static CollectionSchema> {
    SCHEMA_FILE.collections.get(collection)
}

/// All collections present in the registry.
pub fn collection_names() -> impl Iterator<Item = &'static str> {
    SCHEMA_FILE.collections.keys().map(|k| k.as_str())
}

/// Resolve a caller-supplied field name against the registry, ignoring case
/// and underscores, so `max_budget`, `maxbudget`, and `maxBudget` all land on
/// the schema's `maxBudget`. Unknown names come back unchanged.
pub fn normalize_field_name(input: &str, collection: &str) -> String {
    let Some(schema) = get(collection) else {
        return input.to_string();
    };
    let key = input.to_lowercase().replace('_', "");
    for field in schema.fields.keys() {
        if field.to_lowercase() == key {
            return field.clone();
        }
    }
    input.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_loads_and_is_versioned() {
        assert!(version() >= 1);
        assert!(collection_names().count() > 10);
    }

    #[test]
    fn known_collections_have_fields_and_values() {
        let leads = get("leads").expect("leads schema present");
        assert_eq!(leads.fields.get("leadStatus").map(String::as_str), Some("string"));
        assert!(leads
            .values
            .get("leadStatus")
            .is_some_and(|v| v.contains(&serde_json::json!("Converted"))));
    }

    #[test]
    fn field_normalization_ignores_case_and_underscores() {
        assert_eq!(normalize_field_name("max_budget", "leads"), "maxBudget");
        assert_eq!(normalize_field_name("maxbudget", "leads"), "maxBudget");
        assert_eq!(normalize_field_name("MAXBUDGET", "leads"), "maxBudget");
        assert_eq!(normalize_field_name("lead_status", "leads"), "leadStatus");
    }

    #[test]
    fn unknown_fields_and_collections_pass_through() {
        assert_eq!(normalize_field_name("nonexistent", "leads"), "nonexistent");
        assert_eq!(normalize_field_name("max_budget", "no-such-coll"), "max_budget");
    }
}
