//! Orchestrator behavior with scripted LLM and tool dispatchers.

use async_trait::async_trait;
use mongodb::bson::oid::ObjectId;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;

use estatedesk::estatedesk::config::Config;
use estatedesk::estatedesk::enrichment::Enricher;
use estatedesk::estatedesk::llm::{ChatClient, ChatMessage, LlmError};
use estatedesk::estatedesk::orchestrator::{Orchestrator, ToolDispatcher};
use estatedesk::estatedesk::session::Session;
use estatedesk::estatedesk::tool_protocol::{
    ToolDefinition, ToolError, ToolMetadata, ToolParameter, ToolParameterType,
};

const TENANT: &str = "64b000000000000000000001";

/// Scripted chat client: pops responses in order; optionally repeats the
/// last one forever instead of erroring out.
struct MockLlm {
    responses: Mutex<VecDeque<ChatMessage>>,
    repeat_last: bool,
}

impl MockLlm {
    fn new(responses: Vec<ChatMessage>, repeat_last: bool) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            repeat_last,
        })
    }
}

#[async_trait]
impl ChatClient for MockLlm {
    async fn chat(
        &self,
        _messages: &[ChatMessage],
        _functions: &[ToolDefinition],
    ) -> Result<ChatMessage, LlmError> {
        let mut responses = self.responses.lock().await;
        if responses.len() > 1 || !self.repeat_last {
            responses
                .pop_front()
                .ok_or_else(|| LlmError("script exhausted".to_string()))
        } else {
            responses
                .front()
                .cloned()
                .ok_or_else(|| LlmError("script exhausted".to_string()))
        }
    }

    fn model_name(&self) -> &str {
        "mock"
    }
}

/// Dispatcher returning canned results per tool, recording every call with
/// the tenant it was scoped to.
struct MockDispatcher {
    responses: Value,
    calls: Mutex<Vec<(ObjectId, String, Value)>>,
}

impl MockDispatcher {
    fn new(responses: Value) -> Arc<Self> {
        Arc::new(Self {
            responses,
            calls: Mutex::new(Vec::new()),
        })
    }

    async fn call_names(&self) -> Vec<String> {
        self.calls
            .lock()
            .await
            .iter()
            .map(|(_, name, _)| name.clone())
            .collect()
    }

    async fn args_for(&self, tool: &str) -> Option<Value> {
        self.calls
            .lock()
            .await
            .iter()
            .find(|(_, name, _)| name == tool)
            .map(|(_, _, args)| args.clone())
    }

    async fn tenants(&self) -> Vec<ObjectId> {
        self.calls
            .lock()
            .await
            .iter()
            .map(|(tenant, _, _)| *tenant)
            .collect()
    }
}

#[async_trait]
impl ToolDispatcher for MockDispatcher {
    async fn dispatch(
        &self,
        tenant: ObjectId,
        name: &str,
        arguments: Value,
    ) -> Result<Value, ToolError> {
        self.calls
            .lock()
            .await
            .push((tenant, name.to_string(), arguments.clone()));
        self.responses
            .get(name)
            .cloned()
            .ok_or_else(|| ToolError::NotFound(format!("Tool '{}'", name)))
    }

    fn tool_definitions(&self) -> Vec<ToolDefinition> {
        ["count", "find", "aggregate", "collection_schema", "list_collections", "search"]
            .iter()
            .map(|name| {
                ToolMetadata::new(*name, "mock tool")
                    .with_parameter(ToolParameter::new(
                        "collection",
                        ToolParameterType::String,
                    ))
                    .to_tool_definition()
            })
            .collect()
    }
}

async fn orchestrator(
    llm: Arc<MockLlm>,
    dispatcher: Arc<MockDispatcher>,
) -> Orchestrator {
    let config = Arc::new(Config::default());
    let session = Arc::new(Session::new(Arc::clone(&config)).await.unwrap());
    let enricher = Arc::new(Enricher::new(session.database(None)));
    Orchestrator::new(session, dispatcher, llm, enricher)
}

fn base_responses() -> Value {
    json!({
        "list_collections": {"result": ["leads", "properties", "property-bookings"]},
        "collection_schema": {"fields": {"leadStatus": "string"}, "values": {}},
        "count": {"result": 0},
        "find": {"results": [], "total_documents": 0, "collections_scanned": ["leads"], "database": "test", "duration_ms": 1},
        "search": {"results": []},
    })
}

fn sentinel() -> ChatMessage {
    ChatMessage::assistant(r#"{"route":"data"}"#)
}

#[tokio::test]
async fn chat_route_returns_the_reply_verbatim_and_records_history() {
    let llm = MockLlm::new(vec![ChatMessage::assistant("Hello! How can I help?")], false);
    let dispatcher = MockDispatcher::new(base_responses());
    let orch = orchestrator(llm, Arc::clone(&dispatcher)).await;

    let reply = orch.handle_query(TENANT, "hi there").await.unwrap();
    assert_eq!(reply, "Hello! How can I help?");
    assert_eq!(orch.history_len(TENANT).await, 2);
    // Chat path never touches tools.
    assert!(dispatcher.call_names().await.is_empty());
}

#[tokio::test]
async fn empty_results_exhaust_the_retry_budget_into_the_canned_reply() {
    // Router says data; the planner keeps asking for an empty find.
    let llm = MockLlm::new(
        vec![
            sentinel(),
            ChatMessage::assistant_call("find", r#"{"collection":"leads","filter":{}}"#),
        ],
        true,
    );
    let dispatcher = MockDispatcher::new(base_responses());
    let orch = orchestrator(llm, Arc::clone(&dispatcher)).await;

    let reply = orch.handle_query(TENANT, "list leads named bogus").await.unwrap();
    assert_eq!(reply, "No data found—please refine your question.");

    // Initial attempt plus two retries, never more.
    let finds = dispatcher
        .call_names()
        .await
        .iter()
        .filter(|n| *n == "find")
        .count();
    assert_eq!(finds, 3);
}

#[tokio::test]
async fn search_hits_synthesize_a_follow_up_find_by_id() {
    let hit_id = "64b000000000000000000009";
    let mut responses = base_responses();
    responses["search"] = json!({
        "results": [{
            "collection": "leads",
            "hits": [{"_id": {"$oid": hit_id}, "matches": [{"path": "name", "snippet": "Sonu Sharma"}]}],
        }],
    });
    responses["find"] = json!({
        "results": [{"collection": "leads", "count": 1, "documents": [{"name": "Sonu Sharma"}]}],
        "total_documents": 1,
        "collections_scanned": ["leads"],
        "database": "test",
        "duration_ms": 2,
    });

    let llm = MockLlm::new(
        vec![
            sentinel(),
            ChatMessage::assistant_call("search", r#"{"term":"Sonu Sharma"}"#),
            ChatMessage::assistant("Sonu Sharma is a lead."),
            ChatMessage::assistant("Sonu Sharma is an active lead in your system."),
        ],
        false,
    );
    let dispatcher = MockDispatcher::new(responses);
    let orch = orchestrator(llm, Arc::clone(&dispatcher)).await;

    let reply = orch.handle_query(TENANT, "find Sonu Sharma").await.unwrap();
    assert_eq!(reply, "Sonu Sharma is an active lead in your system.");

    let names = dispatcher.call_names().await;
    assert_eq!(names, vec!["list_collections", "search", "find"]);

    // The synthesized find targets the hit's collection and ObjectId.
    let find_args = dispatcher.args_for("find").await.unwrap();
    assert_eq!(find_args["collection"], "leads");
    assert_eq!(find_args["filter"]["_id"], json!({"$oid": hit_id}));
    assert_eq!(find_args["limit"], 1);
}

#[tokio::test]
async fn data_tools_are_preceded_by_schema_and_count_prefetch() {
    let mut responses = base_responses();
    responses["count"] = json!({"result": 7});

    let llm = MockLlm::new(
        vec![
            sentinel(),
            ChatMessage::assistant_call("count", r#"{"collection":"leads","filter":{}}"#),
            ChatMessage::assistant("You have 7 leads."),
            ChatMessage::assistant("There are 7 leads in total."),
        ],
        false,
    );
    let dispatcher = MockDispatcher::new(responses);
    let orch = orchestrator(llm, Arc::clone(&dispatcher)).await;

    let reply = orch.handle_query(TENANT, "how many leads?").await.unwrap();
    assert_eq!(reply, "There are 7 leads in total.");

    let names = dispatcher.call_names().await;
    assert_eq!(
        names,
        vec!["list_collections", "collection_schema", "count", "count"]
    );
    let schema_args = dispatcher.args_for("collection_schema").await.unwrap();
    assert_eq!(schema_args["collection"], "leads");
    assert_eq!(schema_args["maxValues"], 10);

    // Every dispatch was scoped to the caller's tenant.
    let expected = ObjectId::parse_str(TENANT).unwrap();
    assert!(dispatcher.tenants().await.iter().all(|t| *t == expected));
}

#[tokio::test]
async fn llm_failure_surfaces_as_bad_gateway() {
    // Router decides data, then the planner call fails (script exhausted).
    let llm = MockLlm::new(vec![sentinel()], false);
    let dispatcher = MockDispatcher::new(base_responses());
    let orch = orchestrator(llm, dispatcher).await;

    let err = orch.handle_query(TENANT, "how many leads?").await.unwrap_err();
    assert_eq!(err.status(), 502);
}

#[tokio::test]
async fn invalid_tenant_is_a_bad_request() {
    let llm = MockLlm::new(
        vec![
            sentinel(),
            ChatMessage::assistant_call("count", r#"{"collection":"leads","filter":{}}"#),
        ],
        true,
    );
    let dispatcher = MockDispatcher::new(base_responses());
    let orch = orchestrator(llm, dispatcher).await;

    let err = orch
        .handle_query("not-a-hex-id", "how many leads?")
        .await
        .unwrap_err();
    assert_eq!(err.status(), 400);
}

#[tokio::test]
async fn history_ring_never_exceeds_ten_entries() {
    let llm = MockLlm::new(vec![ChatMessage::assistant("Hi!")], true);
    let dispatcher = MockDispatcher::new(base_responses());
    let orch = orchestrator(llm, dispatcher).await;

    for i in 0..9 {
        orch.handle_query(TENANT, &format!("hello {}", i)).await.unwrap();
    }
    assert_eq!(orch.history_len(TENANT).await, 10);
}

#[tokio::test]
async fn summarizer_failure_falls_back_to_the_raw_reply() {
    let mut responses = base_responses();
    responses["count"] = json!({"result": 3});

    // Script ends right after the terminal message: the summarizer call
    // errors and the raw reply must be used.
    let llm = MockLlm::new(
        vec![
            sentinel(),
            ChatMessage::assistant_call("count", r#"{"collection":"leads","filter":{}}"#),
            ChatMessage::assistant("Raw: 3 leads."),
        ],
        false,
    );
    let dispatcher = MockDispatcher::new(responses);
    let orch = orchestrator(llm, dispatcher).await;

    let reply = orch.handle_query(TENANT, "lead count?").await.unwrap();
    assert_eq!(reply, "Raw: 3 leads.");
}
