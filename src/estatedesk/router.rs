//! Data-vs-chat routing.
//!
//! Every user turn first passes through a fast classifier: either the query
//! needs live data (the tool-calling loop takes over) or it is small talk the
//! LLM can answer directly. When the LLM is unreachable a deterministic
//! keyword heuristic decides, biased toward the data path.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::estatedesk::llm::{ChatClient, ChatMessage};

/// Sentinel the classifier returns for data queries.
pub const DATA_SENTINEL: &str = r#"{"route":"data"}"#;

const CONTEXT_CAP: usize = 10;
const CONTEXT_WINDOW: usize = 3;

const DATA_KEYWORDS: [&str; 21] = [
    "count",
    "how many",
    "kitne",
    "total",
    "number",
    "list",
    "show",
    "display",
    "batao",
    "dikhao",
    "find",
    "search",
    "converted",
    "ongoing",
    "active",
    "pending",
    "completed",
    "lead",
    "property",
    "booking",
    "tenant",
];

const FOLLOWUP_PATTERNS: [&str; 6] = [
    "and",
    "what about",
    "how about",
    "pending",
    "active",
    "converted",
];

const GREETINGS: [&str; 6] = ["hi", "hello", "hey", "namaste", "ram", "how are"];

/// Outcome of routing one query.
#[derive(Debug, Clone, PartialEq)]
pub enum RouteDecision {
    /// Run the tool-calling loop.
    Data,
    /// Return this chat reply verbatim.
    Chat(String),
}

#[derive(Debug, Clone)]
struct RouteTurn {
    query: String,
    was_data: bool,
}

/// The classifier plus its per-tenant context ring.
pub struct Router {
    client: Option<Arc<dyn ChatClient>>,
    contexts: RwLock<HashMap<String, VecDeque<RouteTurn>>>,
}

impl Router {
    pub fn new(client: Option<Arc<dyn ChatClient>>) -> Self {
        if client.is_none() {
            log::warn!("No LLM client configured; routing falls back to keyword heuristics");
        }
        Self {
            client,
            contexts: RwLock::new(HashMap::new()),
        }
    }

    /// Classify one query for a tenant.
    pub async fn route(&self, company_id: &str, query: &str) -> RouteDecision {
        let context = self.recent_context(company_id).await;

        let Some(client) = &self.client else {
            return self.fallback_and_record(company_id, query, &context).await;
        };

        let messages = vec![
            ChatMessage::system(self.system_prompt(&context)),
            ChatMessage::user(query),
        ];
        let reply = match client.chat(&messages, &[]).await {
            Ok(msg) => msg.content.unwrap_or_default().trim().to_string(),
            Err(e) => {
                log::error!("Routing LLM call failed: {}", e);
                return self.fallback_and_record(company_id, query, &context).await;
            }
        };

        if reply == DATA_SENTINEL || reply.contains(r#""route":"data""#) {
            self.record(company_id, query, true).await;
            RouteDecision::Data
        } else {
            self.record(company_id, query, false).await;
            RouteDecision::Chat(reply)
        }
    }

    fn system_prompt(&self, context: &[RouteTurn]) -> String {
        let mut context_block = String::new();
        if !context.is_empty() {
            context_block.push_str("\n\nRECENT CONVERSATION CONTEXT:\n");
            for (i, turn) in context.iter().enumerate() {
                context_block.push_str(&format!(
                    "{}. User: '{}' (was: {})\n",
                    i + 1,
                    turn.query,
                    if turn.was_data { "data" } else { "chat" }
                ));
            }
            context_block.push_str("\nUse this context to understand follow-up questions.\n");
        }

        format!(
            "You are EstateDesk AI, an assistant for real-estate companies.\n\n\
             ROUTING DECISION:\n\
             If the user wants DATA from the CRM, respond EXACTLY:\n\
             {}\n\n\
             DATA QUERIES include counts ('how many leads'), listings \
             ('show properties'), status checks ('converted leads'), searches \
             ('find Sonu Sharma'), analytics ('sales report'), and short \
             follow-ups after a data question ('and converted?') — in any \
             language.\n\n\
             CHAT QUERIES are greetings, small talk, acknowledgments, and \
             questions about what you can do; answer those naturally and \
             briefly.\n\n\
             RULES:\n\
             1. Be generous with data routing; when in doubt, route to data.\n\
             2. Short queries right after a data question are usually follow-ups.\n\
             3. Use the conversation context below to resolve intent.\
             {}",
            DATA_SENTINEL, context_block
        )
    }

    async fn fallback_and_record(
        &self,
        company_id: &str,
        query: &str,
        context: &[RouteTurn],
    ) -> RouteDecision {
        let decision = fallback_classify(query, context);
        self.record(company_id, query, decision == RouteDecision::Data)
            .await;
        decision
    }

    async fn recent_context(&self, company_id: &str) -> Vec<RouteTurn> {
        let contexts = self.contexts.read().await;
        contexts
            .get(company_id)
            .map(|ring| {
                ring.iter()
                    .rev()
                    .take(CONTEXT_WINDOW)
                    .rev()
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    async fn record(&self, company_id: &str, query: &str, was_data: bool) {
        let mut contexts = self.contexts.write().await;
        let ring = contexts.entry(company_id.to_string()).or_default();
        if ring.len() >= CONTEXT_CAP {
            ring.pop_front();
        }
        ring.push_back(RouteTurn {
            query: query.to_string(),
            was_data,
        });
    }
}

/// Deterministic classification used when the LLM is unavailable.
fn fallback_classify(query: &str, context: &[RouteTurn]) -> RouteDecision {
    let lowered = query.to_lowercase();
    let lowered = lowered.trim();

    if DATA_KEYWORDS.iter().any(|kw| lowered.contains(kw)) {
        return RouteDecision::Data;
    }

    let last_was_data = context.last().map(|t| t.was_data).unwrap_or(false);
    if last_was_data && query.split_whitespace().count() <= 3 {
        if FOLLOWUP_PATTERNS.iter().any(|p| lowered.contains(p)) {
            return RouteDecision::Data;
        }
    }

    if GREETINGS.iter().any(|g| lowered.contains(g)) {
        return RouteDecision::Chat(
            "Hello! I'm EstateDesk AI, ready to help with your real-estate data and queries. \
             What would you like to know?"
                .to_string(),
        );
    }

    RouteDecision::Chat(
        "I'm here to help! You can ask me about leads, properties, bookings, or any CRM data. \
         What do you need?"
            .to_string(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn(query: &str, was_data: bool) -> RouteTurn {
        RouteTurn {
            query: query.to_string(),
            was_data,
        }
    }

    #[test]
    fn strong_keywords_route_to_data() {
        for query in [
            "how many leads this month?",
            "count of bookings",
            "show properties in Pune",
            "kitne leads aaye?",
        ] {
            assert_eq!(fallback_classify(query, &[]), RouteDecision::Data, "{}", query);
        }
    }

    #[test]
    fn short_followups_after_data_route_to_data() {
        let context = vec![turn("how many leads", true)];
        assert_eq!(
            fallback_classify("and converted?", &context),
            RouteDecision::Data
        );
    }

    #[test]
    fn followups_without_data_context_stay_chat() {
        assert!(matches!(
            fallback_classify("and you?", &[]),
            RouteDecision::Chat(_)
        ));
    }

    #[test]
    fn greetings_get_a_chat_reply() {
        match fallback_classify("namaste", &[]) {
            RouteDecision::Chat(reply) => assert!(reply.contains("EstateDesk")),
            other => panic!("expected chat, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn router_context_ring_is_bounded() {
        let router = Router::new(None);
        for i in 0..15 {
            router.route("tenant-a", &format!("hello there friend {}", i)).await;
        }
        let contexts = router.contexts.read().await;
        assert_eq!(contexts.get("tenant-a").unwrap().len(), CONTEXT_CAP);
    }

    #[tokio::test]
    async fn router_without_client_uses_the_fallback() {
        let router = Router::new(None);
        assert_eq!(
            router.route("tenant-a", "how many leads?").await,
            RouteDecision::Data
        );
    }
}
