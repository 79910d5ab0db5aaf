//! HTTP and WebSocket surface (feature `web`).
//!
//! `POST /chat` answers one query; `GET /` serves the bundled single-page
//! front-end; the WebSocket endpoint accepts `user_query` events and emits
//! `assistant_reply` or `assistant_error`. All real work happens in the
//! [`Orchestrator`]; this module only maps transport frames and statuses.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::estatedesk::host_utils::HostError;
use crate::estatedesk::orchestrator::Orchestrator;

/// Shared state for every handler.
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub company_id: String,
    pub query: String,
}

/// Build the axum application.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/chat", post(chat))
        .route("/ws", get(ws_upgrade))
        .with_state(state)
}

async fn index() -> Html<&'static str> {
    Html(include_str!("../../resources/index.html"))
}

async fn chat(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ChatRequest>,
) -> impl IntoResponse {
    match state
        .orchestrator
        .handle_query(&request.company_id, &request.query)
        .await
    {
        Ok(reply) => (StatusCode::OK, Json(json!({"reply": reply}))),
        Err(e) => error_response(&e),
    }
}

fn error_response(e: &HostError) -> (StatusCode, Json<Value>) {
    let status =
        StatusCode::from_u16(e.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_server_error() {
        log::error!("Chat request failed: {}", e);
    } else {
        log::info!("User-visible error ({}): {}", e.status(), e);
    }
    (status, Json(json!({"error": e.to_string()})))
}

async fn ws_upgrade(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>) {
    log::info!("WebSocket connected");
    while let Some(Ok(message)) = socket.recv().await {
        let Message::Text(text) = message else {
            continue;
        };

        let reply = match serde_json::from_str::<Value>(&text) {
            Ok(frame) if frame.get("event").and_then(Value::as_str) == Some("user_query") => {
                match serde_json::from_value::<ChatRequest>(
                    frame.get("data").cloned().unwrap_or(Value::Null),
                ) {
                    Ok(request) => {
                        match state
                            .orchestrator
                            .handle_query(&request.company_id, &request.query)
                            .await
                        {
                            Ok(reply) => json!({
                                "event": "assistant_reply",
                                "data": {"reply": reply},
                            }),
                            Err(e) => {
                                log::info!("User-visible error ({}): {}", e.status(), e);
                                json!({
                                    "event": "assistant_error",
                                    "data": {"error": e.to_string()},
                                })
                            }
                        }
                    }
                    Err(_) => json!({
                        "event": "assistant_error",
                        "data": {"error": "expected {company_id, query}"},
                    }),
                }
            }
            Ok(_) => json!({
                "event": "assistant_error",
                "data": {"error": "unknown event"},
            }),
            Err(_) => json!({
                "event": "assistant_error",
                "data": {"error": "malformed frame"},
            }),
        };

        if socket
            .send(Message::Text(reply.to_string().into()))
            .await
            .is_err()
        {
            break;
        }
    }
    log::info!("WebSocket disconnected");
}
