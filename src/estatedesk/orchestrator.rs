//! The chat orchestrator.
//!
//! One user turn flows: router classification → (chat reply | tool-calling
//! loop) → summarization. The data path drives a bounded function-calling
//! conversation against the planner LLM: it pre-injects the collection
//! catalogue, prefetches schema and baseline counts before data tools,
//! enriches and trims every tool result, retries a fixed number of times on
//! empty results, and finally compresses the answer to a short reply.
//!
//! Turns for the same tenant are serialized; history is a bounded ring.

use async_trait::async_trait;
use chrono::Utc;
use mongodb::bson::oid::ObjectId;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use crate::estatedesk::enrichment::Enricher;
use crate::estatedesk::host_utils::{call_tool, HostError};
use crate::estatedesk::llm::{ChatClient, ChatMessage, Role};
use crate::estatedesk::router::{RouteDecision, Router};
use crate::estatedesk::rpc_server::RpcServer;
use crate::estatedesk::session::Session;
use crate::estatedesk::tool_protocol::{ToolDefinition, ToolError};

const HISTORY_CAP: usize = 10;
const MAX_EMPTY_RETRIES: u32 = 2;
const MAX_TOOL_ITERATIONS: u32 = 12;
const SCHEMA_PREFETCH_VALUES: u32 = 10;

const NO_DATA_REPLY: &str = "No data found—please refine your question.";
const NUDGE_REPLY: &str = "Still no data—maybe try differently?";

/// Tools whose `collection` argument is pinned to the catalogue enum and
/// which trigger the schema/count prefetch.
const DATA_TOOLS: [&str; 3] = ["count", "find", "aggregate"];

/// Anything that can execute registered tools for the orchestrator.
///
/// [`RpcServer`] is the production implementation; tests substitute scripted
/// dispatchers.
#[async_trait]
pub trait ToolDispatcher: Send + Sync {
    /// Execute one tool call, scoped to the request's tenant.
    async fn dispatch(
        &self,
        tenant: ObjectId,
        name: &str,
        arguments: Value,
    ) -> Result<Value, ToolError>;

    /// Function schemas advertised to the planner.
    fn tool_definitions(&self) -> Vec<ToolDefinition>;
}

#[async_trait]
impl ToolDispatcher for RpcServer {
    async fn dispatch(
        &self,
        tenant: ObjectId,
        name: &str,
        arguments: Value,
    ) -> Result<Value, ToolError> {
        self.call_tool(tenant, name, arguments).await
    }

    fn tool_definitions(&self) -> Vec<ToolDefinition> {
        RpcServer::tool_definitions(self)
    }
}

#[derive(Debug, Clone)]
struct HistoryTurn {
    role: Role,
    content: String,
}

/// Drives a full user turn from query to grounded reply.
pub struct Orchestrator {
    session: Arc<Session>,
    dispatcher: Arc<dyn ToolDispatcher>,
    llm: Arc<dyn ChatClient>,
    router: Router,
    enricher: Arc<Enricher>,
    history: RwLock<HashMap<String, VecDeque<HistoryTurn>>>,
    turn_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    collections_cache: RwLock<Option<Value>>,
}

impl Orchestrator {
    pub fn new(
        session: Arc<Session>,
        dispatcher: Arc<dyn ToolDispatcher>,
        llm: Arc<dyn ChatClient>,
        enricher: Arc<Enricher>,
    ) -> Self {
        let router = Router::new(Some(Arc::clone(&llm)));
        Self {
            session,
            dispatcher,
            llm,
            router,
            enricher,
            history: RwLock::new(HashMap::new()),
            turn_locks: Mutex::new(HashMap::new()),
            collections_cache: RwLock::new(None),
        }
    }

    /// Handle one user turn for a tenant.
    pub async fn handle_query(&self, company_id: &str, query: &str) -> Result<String, HostError> {
        // Turns for the same tenant are strictly serialized.
        let lock = {
            let mut locks = self.turn_locks.lock().await;
            Arc::clone(locks.entry(company_id.to_string()).or_default())
        };
        let _turn = lock.lock().await;

        match self.router.route(company_id, query).await {
            RouteDecision::Chat(reply) => {
                self.push_history(company_id, query, &reply).await;
                Ok(reply)
            }
            RouteDecision::Data => self.run_data_query(company_id, query).await,
        }
    }

    async fn run_data_query(&self, company_id: &str, query: &str) -> Result<String, HostError> {
        log::info!("Chat start <- {}: {}", company_id, query);

        // The tenant is resolved once per turn and travels with every call.
        let tenant = self
            .session
            .resolve_tenant(company_id)
            .map_err(HostError::from)?;

        let catalogue = self.collections_catalogue(tenant).await?;
        let collections: Vec<Value> = catalogue
            .get("result")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut functions = self.dispatcher.tool_definitions();
        pin_collection_enum(&mut functions, &collections);

        let mut messages = self.build_prompt(company_id, query, &catalogue).await;

        let mut found = false;
        let mut retries = MAX_EMPTY_RETRIES;
        let mut iterations = 0u32;

        loop {
            iterations += 1;
            if iterations > MAX_TOOL_ITERATIONS {
                log::warn!("Tool loop cap reached for {}", company_id);
                let reply = NO_DATA_REPLY.to_string();
                self.push_history(company_id, query, &reply).await;
                return Ok(reply);
            }

            let response = self.llm.chat(&messages, &functions).await.map_err(|e| {
                log::error!("Planner LLM call failed: {}", e);
                HostError::Upstream("LLM unavailable, please retry".to_string())
            })?;

            let Some(call) = response.function_call.clone() else {
                // Terminal assistant message.
                if !found && retries > 0 {
                    retries -= 1;
                    messages.push(ChatMessage::assistant(NUDGE_REPLY));
                    continue;
                }
                let raw = response.content.unwrap_or_default();
                let reply = self.summarize(query, &raw).await.unwrap_or(raw);
                self.push_history(company_id, query, &reply).await;
                return Ok(reply);
            };

            let name = call.name.clone();
            let args: Value = serde_json::from_str(&call.arguments).unwrap_or_else(|_| json!({}));
            messages.push(ChatMessage::assistant_call(&name, &call.arguments));

            if name == "search" {
                let (result, empty) =
                    call_tool(self.dispatcher.as_ref(), tenant, "search", args).await?;
                messages.push(ChatMessage::function_result("search", result.to_string()));

                if !empty {
                    if let Some((collection, id)) = top_search_hit(&result) {
                        let follow_args = json!({
                            "collection": collection,
                            "filter": {"_id": id},
                            "limit": 1,
                        });
                        messages.push(ChatMessage::assistant_call(
                            "find",
                            follow_args.to_string(),
                        ));
                        let (followed, _) =
                            call_tool(self.dispatcher.as_ref(), tenant, "find", follow_args)
                                .await?;
                        let enriched = self.enricher.enrich(&followed).await;
                        messages
                            .push(ChatMessage::function_result("find", enriched.to_string()));
                    }
                }
                found = true;
                continue;
            }

            let collection = args.get("collection").and_then(Value::as_str);
            if DATA_TOOLS.contains(&name.as_str()) {
                if let Some(collection) = collection {
                    self.prefetch_context(tenant, collection, &mut messages)
                        .await?;
                }
            }

            let (result, empty) =
                call_tool(self.dispatcher.as_ref(), tenant, &name, args).await?;
            let enriched = self.enricher.enrich(&result).await;
            messages.push(ChatMessage::function_result(&name, enriched.to_string()));

            found |= !empty;
            if !found && retries > 0 {
                retries -= 1;
                continue;
            }
            if !found {
                let reply = NO_DATA_REPLY.to_string();
                self.push_history(company_id, query, &reply).await;
                return Ok(reply);
            }
        }
    }

    /// Inject `collection_schema` + baseline `count` exchanges so the planner
    /// sees field names, enumerable values, and cardinality before its call.
    async fn prefetch_context(
        &self,
        tenant: ObjectId,
        collection: &str,
        messages: &mut Vec<ChatMessage>,
    ) -> Result<(), HostError> {
        let schema_args = json!({"collection": collection, "maxValues": SCHEMA_PREFETCH_VALUES});
        let (schema, _) = call_tool(
            self.dispatcher.as_ref(),
            tenant,
            "collection_schema",
            schema_args.clone(),
        )
        .await?;
        messages.push(ChatMessage::assistant_call(
            "collection_schema",
            schema_args.to_string(),
        ));
        messages.push(ChatMessage::function_result(
            "collection_schema",
            schema.to_string(),
        ));

        let count_args = json!({"collection": collection, "filter": {}});
        let (count, _) = call_tool(
            self.dispatcher.as_ref(),
            tenant,
            "count",
            count_args.clone(),
        )
        .await?;
        messages.push(ChatMessage::assistant_call("count", count_args.to_string()));
        messages.push(ChatMessage::function_result("count", count.to_string()));
        Ok(())
    }

    async fn build_prompt(
        &self,
        company_id: &str,
        query: &str,
        catalogue: &Value,
    ) -> Vec<ChatMessage> {
        let today = Utc::now().date_naive();
        let date_msg = ChatMessage::system(format!(
            "Current UTC date: {today}. \
             Use [\"{today}T00:00:00Z\",\"{today}T23:59:59Z\"] for \"today\".",
        ));
        let charter = ChatMessage::system(
            "You are EstateDesk AI, a helpful assistant for real-estate questions.\n\n\
             Tools available:\n\
             - list_collections()\n\
             - collection_schema(collection, maxValues?)\n\
             - count(collection, filter)\n\
             - find(collection, filter, limit?)\n\
             - aggregate(collection, pipeline | groupBy | statField)\n\
             - search(term, fuzzy_threshold?)\n\n\
             Guidelines:\n\
             1. For sales questions, use the property-bookings collection.\n\
             2. Ground every answer in tool results; never invent data.\n\
             3. Use search to resolve people or entities by name.",
        );

        let mut messages = vec![date_msg, charter];
        for turn in self.history_snapshot(company_id).await {
            messages.push(ChatMessage {
                role: turn.role,
                content: Some(turn.content),
                name: None,
                function_call: None,
            });
        }
        messages.push(ChatMessage::user(query));
        // The catalogue is pre-injected so the planner never asks for it.
        messages.push(ChatMessage::assistant_call("list_collections", "{}"));
        messages.push(ChatMessage::function_result(
            "list_collections",
            catalogue.to_string(),
        ));
        messages
    }

    async fn summarize(&self, question: &str, raw: &str) -> Option<String> {
        let messages = vec![
            ChatMessage::system("Write a 4-6 line clear answer."),
            ChatMessage::user(format!("Question: {}", question)),
            ChatMessage::user(format!("Data: {}", raw)),
        ];
        match self.llm.chat(&messages, &[]).await {
            Ok(msg) => msg
                .content
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty()),
            Err(e) => {
                log::warn!("Summarization failed, using raw output: {}", e);
                None
            }
        }
    }

    async fn collections_catalogue(&self, tenant: ObjectId) -> Result<Value, HostError> {
        if let Some(cached) = self.collections_cache.read().await.clone() {
            return Ok(cached);
        }
        let (catalogue, _) = call_tool(
            self.dispatcher.as_ref(),
            tenant,
            "list_collections",
            json!({}),
        )
        .await?;
        *self.collections_cache.write().await = Some(catalogue.clone());
        Ok(catalogue)
    }

    async fn history_snapshot(&self, company_id: &str) -> Vec<HistoryTurn> {
        self.history
            .read()
            .await
            .get(company_id)
            .map(|ring| ring.iter().cloned().collect())
            .unwrap_or_default()
    }

    async fn push_history(&self, company_id: &str, query: &str, reply: &str) {
        let mut history = self.history.write().await;
        let ring = history.entry(company_id.to_string()).or_default();
        for turn in [
            HistoryTurn {
                role: Role::User,
                content: query.to_string(),
            },
            HistoryTurn {
                role: Role::Assistant,
                content: reply.to_string(),
            },
        ] {
            if ring.len() >= HISTORY_CAP {
                ring.pop_front();
            }
            ring.push_back(turn);
        }
    }

    /// Number of stored history entries for a tenant (diagnostics, tests).
    pub async fn history_len(&self, company_id: &str) -> usize {
        self.history
            .read()
            .await
            .get(company_id)
            .map(VecDeque::len)
            .unwrap_or(0)
    }
}

/// Pin the `collection` enum of the data tools to the curated catalogue so
/// the planner cannot hallucinate collections.
fn pin_collection_enum(functions: &mut [ToolDefinition], collections: &[Value]) {
    for def in functions.iter_mut() {
        let pinned = DATA_TOOLS.contains(&def.name.as_str()) || def.name == "collection_schema";
        if !pinned {
            continue;
        }
        if let Some(prop) = def
            .parameters_schema
            .get_mut("properties")
            .and_then(|p| p.get_mut("collection"))
        {
            prop["enum"] = Value::Array(collections.to_vec());
        }
    }
}

/// Collection and `_id` of the first hit in a (trimmed) search result.
fn top_search_hit(result: &Value) -> Option<(String, String)> {
    let bucket = result.get("results")?.as_array()?.first()?;
    let collection = bucket.get("collection")?.as_str()?.to_string();
    let id = bucket
        .get("hits")?
        .as_array()?
        .first()?
        .get("_id")?
        .as_str()?
        .to_string();
    Some((collection, id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collection_enum_is_pinned_on_data_tools() {
        let mut functions = vec![
            crate::estatedesk::tool_protocol::ToolMetadata::new("find", "find")
                .with_parameter(crate::estatedesk::tool_protocol::ToolParameter::new(
                    "collection",
                    crate::estatedesk::tool_protocol::ToolParameterType::String,
                ))
                .to_tool_definition(),
            crate::estatedesk::tool_protocol::ToolMetadata::new("search", "search")
                .with_parameter(crate::estatedesk::tool_protocol::ToolParameter::new(
                    "term",
                    crate::estatedesk::tool_protocol::ToolParameterType::String,
                ))
                .to_tool_definition(),
        ];
        let collections = vec![json!("leads"), json!("projects")];
        pin_collection_enum(&mut functions, &collections);

        assert_eq!(
            functions[0].parameters_schema["properties"]["collection"]["enum"],
            json!(["leads", "projects"])
        );
        assert!(functions[1].parameters_schema["properties"]
            .get("collection")
            .is_none());
    }

    #[test]
    fn top_search_hit_reads_the_trimmed_shape() {
        let result = json!({
            "results": [
                {"collection": "leads", "hits": [
                    {"_id": "64b000000000000000000009", "matches": []},
                    {"_id": "64b00000000000000000000a", "matches": []},
                ]},
                {"collection": "brokers", "hits": [{"_id": "x", "matches": []}]},
            ],
        });
        assert_eq!(
            top_search_hit(&result),
            Some((
                "leads".to_string(),
                "64b000000000000000000009".to_string()
            ))
        );
        assert_eq!(top_search_hit(&json!({"results": []})), None);
    }
}
