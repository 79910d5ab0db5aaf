//! ID-to-name enrichment.
//!
//! Tool results are full of ObjectId references (`company`, `project`,
//! `lead`, …) that mean nothing to the planner or the user. The enricher
//! recursively rewrites every known reference field into its human-readable
//! name using per-process memoized lookups. Unknown fields pass through
//! unchanged, and values that are not valid ObjectIds are left alone.

use futures_util::future::{join_all, BoxFuture};
use mongodb::bson::{doc, oid::ObjectId, Bson, Document};
use mongodb::options::FindOneOptions;
use mongodb::Database;
use serde_json::{Map, Value};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// How one reference field resolves to a display name.
enum Lookup {
    /// `find_one({_id}, {name_field: 1})` on a collection.
    Simple {
        collection: &'static str,
        name_field: &'static str,
    },
    Country,
    State,
    City,
    Property,
    Amenities,
    Booking,
}

fn lookup_for(field: &str) -> Option<Lookup> {
    use Lookup::*;
    let simple = |collection, name_field| Some(Simple { collection, name_field });
    match field {
        "company" => simple("companies", "name"),
        "project" => simple("projects", "name"),
        "property" => Some(Property),
        "tenant" => simple("tenants", "name"),
        "broker" => simple("brokers", "name"),
        "country" => Some(Country),
        "state" => Some(State),
        "city" => Some(City),
        "plan" => simple("plans", "name"),
        "category" => simple("project-categories", "name"),
        "propertyUnitSubType" | "projectUnitSubType" => {
            simple("property-unit-sub-types", "name")
        }
        "bhk" => simple("bhk", "name"),
        "bhkType" => simple("bhk-types", "name"),
        "amenities" => Some(Amenities),
        "bank" => simple("banks", "contactPersonDetails.fullName"),
        "bankNameId" => simple("bank-names", "name"),
        "lead" => simple("leads", "name"),
        "booking" => Some(Booking),
        "user" => simple("users", "firstName"),
        "assignee" | "defaultPrimary" | "defaultSecondary" => simple("users", "fullName"),
        "team" => simple("teams", "name"),
        "group" => simple("groups", "name"),
        "designation" => simple("designations", "name"),
        _ => None,
    }
}

/// Pull an ObjectId out of a hex string or `{"$oid": …}` wrapper.
fn extract_object_id(value: &Value) -> Option<ObjectId> {
    match value {
        Value::String(s) => ObjectId::parse_str(s).ok(),
        Value::Object(map) if map.len() == 1 => map
            .get("$oid")
            .and_then(Value::as_str)
            .and_then(|s| ObjectId::parse_str(s).ok()),
        _ => None,
    }
}

/// The enrichment engine with its process-wide memo cache.
pub struct Enricher {
    db: Database,
    cache: RwLock<HashMap<String, String>>,
}

impl Enricher {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Recursively rewrite known reference fields into names.
    pub fn enrich<'a>(&'a self, value: &'a Value) -> BoxFuture<'a, Value> {
        Box::pin(async move {
            match value {
                Value::Object(map) => {
                    let mut out = Map::new();
                    for (key, inner) in map {
                        let replaced = match inner {
                            Value::Object(_) => self.enrich(inner).await,
                            Value::Array(items) => {
                                // Concurrent lookups for list-valued fields.
                                let futures = items.iter().map(|item| async move {
                                    if item.is_object() && extract_object_id(item).is_none() {
                                        self.enrich(item).await
                                    } else {
                                        self.replace_field(key, item).await
                                    }
                                });
                                Value::Array(join_all(futures).await)
                            }
                            _ => self.replace_field(key, inner).await,
                        };
                        out.insert(key.clone(), replaced);
                    }
                    Value::Object(out)
                }
                Value::Array(items) => {
                    let futures = items.iter().map(|item| self.enrich(item));
                    Value::Array(join_all(futures).await)
                }
                other => other.clone(),
            }
        })
    }

    async fn replace_field(&self, key: &str, value: &Value) -> Value {
        let Some(lookup) = lookup_for(key) else {
            return value.clone();
        };
        match lookup {
            Lookup::Simple {
                collection,
                name_field,
            } => self.simple_name(collection, name_field, value).await,
            Lookup::Country => self.simple_name("countries", "name", value).await,
            Lookup::State => self.state_name(value).await,
            Lookup::City => self.city_name(value).await,
            Lookup::Property => self.property_label(value).await,
            Lookup::Amenities => self.amenities_names(value).await,
            Lookup::Booking => self.booking_label(value).await,
        }
    }

    /// Memoized `find_one` on `collection` projecting `name_field`.
    async fn simple_name(&self, collection: &str, name_field: &str, value: &Value) -> Value {
        let Some(oid) = extract_object_id(value) else {
            log::debug!("enrichment: value for lookup is not an ObjectId");
            return value.clone();
        };
        let cache_key = format!("{}:{}:{}", collection, oid.to_hex(), name_field);
        if let Some(hit) = self.cache.read().await.get(&cache_key) {
            return Value::String(hit.clone());
        }

        let name = self
            .fetch_field(collection, &oid, name_field)
            .await
            .unwrap_or_else(|| oid.to_hex());
        self.cache
            .write()
            .await
            .insert(cache_key, name.clone());
        Value::String(name)
    }

    async fn fetch_field(&self, collection: &str, oid: &ObjectId, path: &str) -> Option<String> {
        let mut options = FindOneOptions::default();
        options.projection = Some(doc! {path: 1});
        let doc = self
            .db
            .collection::<Document>(collection)
            .find_one(doc! {"_id": *oid})
            .with_options(options)
            .await
            .ok()??;
        get_dotted_str(&doc, path)
    }

    /// States are embedded inside `countries.states`.
    async fn state_name(&self, value: &Value) -> Value {
        let Some(oid) = extract_object_id(value) else {
            return value.clone();
        };
        let cache_key = format!("state:{}", oid.to_hex());
        if let Some(hit) = self.cache.read().await.get(&cache_key) {
            return Value::String(hit.clone());
        }

        let mut options = FindOneOptions::default();
        options.projection = Some(doc! {"states": 1});
        let found = self
            .db
            .collection::<Document>("countries")
            .find_one(doc! {"states._id": oid})
            .with_options(options)
            .await
            .ok()
            .flatten()
            .and_then(|doc| {
                doc.get_array("states").ok().and_then(|states| {
                    states.iter().find_map(|state| {
                        let state = state.as_document()?;
                        (state.get_object_id("_id").ok()? == oid)
                            .then(|| state.get_str("name").ok().map(str::to_string))?
                    })
                })
            });

        let name = found.unwrap_or_else(|| oid.to_hex());
        self.cache.write().await.insert(cache_key, name.clone());
        Value::String(name)
    }

    /// Cities nest two levels deep: `countries.states[].cities[]`.
    async fn city_name(&self, value: &Value) -> Value {
        let Some(oid) = extract_object_id(value) else {
            return value.clone();
        };
        let cache_key = format!("city:{}", oid.to_hex());
        if let Some(hit) = self.cache.read().await.get(&cache_key) {
            return Value::String(hit.clone());
        }

        let mut options = FindOneOptions::default();
        options.projection = Some(doc! {"states": 1});
        let found = self
            .db
            .collection::<Document>("countries")
            .find_one(doc! {"states.cities._id": oid})
            .with_options(options)
            .await
            .ok()
            .flatten()
            .and_then(|doc| {
                let states = doc.get_array("states").ok()?;
                states.iter().find_map(|state| {
                    let cities = state.as_document()?.get_array("cities").ok()?;
                    cities.iter().find_map(|city| {
                        let city = city.as_document()?;
                        (city.get_object_id("_id").ok()? == oid)
                            .then(|| city.get_str("name").ok().map(str::to_string))?
                    })
                })
            });

        let name = found.unwrap_or_else(|| oid.to_hex());
        self.cache.write().await.insert(cache_key, name.clone());
        Value::String(name)
    }

    /// A property's label is its name or a composition of type, block, floor.
    async fn property_label(&self, value: &Value) -> Value {
        let Some(oid) = extract_object_id(value) else {
            return value.clone();
        };
        let cache_key = format!("properties:{}:label", oid.to_hex());
        if let Some(hit) = self.cache.read().await.get(&cache_key) {
            return Value::String(hit.clone());
        }

        let doc = self
            .db
            .collection::<Document>("properties")
            .find_one(doc! {"_id": oid})
            .await
            .ok()
            .flatten();
        let label = match doc {
            None => oid.to_hex(),
            Some(doc) => match doc.get_str("name") {
                Ok(name) if !name.is_empty() => name.to_string(),
                _ => {
                    let parts: Vec<&str> = ["propertyType", "blockName", "floorName"]
                        .iter()
                        .filter_map(|f| doc.get_str(f).ok())
                        .filter(|s| !s.is_empty())
                        .collect();
                    if parts.is_empty() {
                        "UnknownProperty".to_string()
                    } else {
                        parts.join(" ")
                    }
                }
            },
        };
        self.cache.write().await.insert(cache_key, label.clone());
        Value::String(label)
    }

    /// Amenities come as a list of ids, a comma-joined string, or one id.
    async fn amenities_names(&self, value: &Value) -> Value {
        let names: Vec<String> = match value {
            Value::Array(items) => {
                let futures = items
                    .iter()
                    .map(|item| self.simple_name("amenities", "name", item));
                join_all(futures)
                    .await
                    .into_iter()
                    .map(value_to_display)
                    .collect()
            }
            Value::String(s) if s.contains(',') => {
                let tokens: Vec<Value> = s
                    .split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(|t| Value::String(t.to_string()))
                    .collect();
                let futures = tokens
                    .iter()
                    .map(|item| self.simple_name("amenities", "name", item));
                join_all(futures)
                    .await
                    .into_iter()
                    .map(value_to_display)
                    .collect()
            }
            other => vec![value_to_display(
                self.simple_name("amenities", "name", other).await,
            )],
        };
        Value::String(names.join(", "))
    }

    /// A booking reads as "<lead> - <type> - <date>".
    async fn booking_label(&self, value: &Value) -> Value {
        let Some(oid) = extract_object_id(value) else {
            return value.clone();
        };
        let cache_key = format!("property-bookings:{}:label", oid.to_hex());
        if let Some(hit) = self.cache.read().await.get(&cache_key) {
            return Value::String(hit.clone());
        }

        let Some(doc) = self
            .db
            .collection::<Document>("property-bookings")
            .find_one(doc! {"_id": oid})
            .await
            .ok()
            .flatten()
        else {
            return Value::String(oid.to_hex());
        };

        let lead_name = match doc.get_object_id("lead") {
            Ok(lead_id) => {
                let lead = Value::String(lead_id.to_hex());
                value_to_display(self.simple_name("leads", "name", &lead).await)
            }
            Err(_) => String::new(),
        };
        let booking_type = doc.get_str("bookingType").unwrap_or_default();
        let booking_date = match doc.get("bookingDate") {
            Some(Bson::DateTime(dt)) => dt.try_to_rfc3339_string().unwrap_or_default(),
            Some(other) => other.to_string(),
            None => String::new(),
        };

        let label = if lead_name.is_empty() {
            oid.to_hex()
        } else {
            format!("{} - {} - {}", lead_name, booking_type, booking_date)
        };
        self.cache.write().await.insert(cache_key, label.clone());
        Value::String(label)
    }
}

fn value_to_display(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

fn get_dotted_str(doc: &Document, path: &str) -> Option<String> {
    let mut current = doc;
    let mut parts = path.split('.').peekable();
    while let Some(part) = parts.next() {
        if parts.peek().is_none() {
            return current.get_str(part).ok().map(str::to_string);
        }
        current = current.get_document(part).ok()?;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn known_reference_fields_are_mapped() {
        assert!(lookup_for("company").is_some());
        assert!(lookup_for("amenities").is_some());
        assert!(lookup_for("booking").is_some());
        assert!(lookup_for("leadStatus").is_none());
        assert!(lookup_for("name").is_none());
    }

    #[test]
    fn object_ids_are_extracted_from_both_shapes() {
        let hex = "64b000000000000000000001";
        assert!(extract_object_id(&json!(hex)).is_some());
        assert!(extract_object_id(&json!({"$oid": hex})).is_some());
        assert!(extract_object_id(&json!("not-an-oid")).is_none());
        assert!(extract_object_id(&json!(42)).is_none());
        assert!(extract_object_id(&json!({"$oid": hex, "extra": 1})).is_none());
    }

    #[test]
    fn dotted_paths_traverse_nested_documents() {
        let doc = doc! {
            "contactPersonDetails": {"fullName": "Asha Patel"},
            "name": "HDFC",
        };
        assert_eq!(
            get_dotted_str(&doc, "contactPersonDetails.fullName").as_deref(),
            Some("Asha Patel")
        );
        assert_eq!(get_dotted_str(&doc, "name").as_deref(), Some("HDFC"));
        assert!(get_dotted_str(&doc, "contactPersonDetails.phone").is_none());
        assert!(get_dotted_str(&doc, "missing.path").is_none());
    }
}
