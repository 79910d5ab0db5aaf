//! Telemetry: bounded in-memory event buffer with periodic flush.
//!
//! Every tool invocation (and `server_start`/`server_stop`) is recorded as a
//! [`TelemetryEvent`]. Events are buffered up to a configured cap — overflow
//! discards the oldest, never the newest — and a background worker flushes
//! the buffer to the configured HTTP endpoint with basic auth. Serialization
//! or network problems never propagate to the caller; a failed batch is
//! retried a fixed number of times and then dropped.

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::estatedesk::config::Config;

const SENSITIVE_KEYS: [&str; 10] = [
    "password",
    "pwd",
    "secret",
    "apikey",
    "accesstoken",
    "authorization",
    "clientsecret",
    "privatekey",
    "certificate",
    "passphrase",
];

/// One recorded invocation.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TelemetryEvent {
    pub command: String,
    #[serde(rename = "durationMs")]
    pub duration_ms: u64,
    pub success: bool,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

struct Buffer {
    events: VecDeque<TelemetryEvent>,
    next_idx: u64,
}

/// Telemetry recorder and flusher.
pub struct Telemetry {
    config: Arc<Config>,
    enabled: bool,
    buffer: Mutex<Buffer>,
    http: reqwest::Client,
    shutdown: Notify,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Telemetry {
    pub fn new(config: Arc<Config>) -> Arc<Self> {
        let enabled = config.telemetry_enabled;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.telemetry_timeout_secs))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        let telemetry = Arc::new(Self {
            config,
            enabled,
            buffer: Mutex::new(Buffer {
                events: VecDeque::new(),
                next_idx: 0,
            }),
            http,
            shutdown: Notify::new(),
            worker: Mutex::new(None),
        });

        if telemetry.flush_configured() {
            telemetry.spawn_worker();
            log::info!(
                "Telemetry enabled: flushing every {}s, cache size {}",
                telemetry.config.telemetry_flush_interval_secs,
                telemetry.config.telemetry_cache_size
            );
        } else if enabled {
            log::warn!("Telemetry enabled but missing API config; background flush disabled");
        } else {
            log::info!("Telemetry disabled");
        }

        telemetry
    }

    fn flush_configured(&self) -> bool {
        self.enabled
            && !self.config.api_base_url.is_empty()
            && !self.config.api_client_id.is_empty()
            && !self.config.api_client_secret.is_empty()
    }

    fn spawn_worker(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let interval = Duration::from_secs(this.config.telemetry_flush_interval_secs);
        let handle = tokio::spawn(async move {
            log::debug!("Telemetry flusher task started");
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => this.flush().await,
                    _ = this.shutdown.notified() => break,
                }
            }
            log::debug!("Telemetry flusher task exiting");
        });
        if let Ok(mut worker) = self.worker.lock() {
            *worker = Some(handle);
        }
    }

    /// Record one event. A no-op when telemetry is disabled.
    pub fn record(&self, command: &str, duration_ms: u64, success: bool, arguments: Option<Value>) {
        if !self.enabled {
            return;
        }

        let metadata = if command == "server_start" {
            Some(json!({
                "os": std::env::consts::OS,
                "arch": std::env::consts::ARCH,
                "appName": "estatedesk-mcp",
                "runtime": "rust",
            }))
        } else {
            None
        };

        let event = TelemetryEvent {
            command: command.to_string(),
            duration_ms,
            success,
            timestamp: Utc::now().timestamp_millis(),
            arguments: arguments.map(redact_value),
            metadata,
        };

        let Ok(mut buffer) = self.buffer.lock() else {
            return;
        };
        if buffer.events.len() >= self.config.telemetry_cache_size {
            buffer.events.pop_front();
            log::debug!("Dropped oldest telemetry event to stay within cap");
        }
        let idx = buffer.next_idx;
        buffer.events.push_back(event);
        buffer.next_idx += 1;
        log::debug!("Recorded telemetry event '{}' at index {}", command, idx);
    }

    /// Drain the buffer and POST the batch; retries then drops on failure.
    pub async fn flush(&self) {
        if !self.flush_configured() {
            return;
        }

        let events: Vec<TelemetryEvent> = {
            let Ok(mut buffer) = self.buffer.lock() else {
                return;
            };
            buffer.events.drain(..).collect()
        };
        if events.is_empty() {
            log::debug!("No telemetry events to flush");
            return;
        }

        let payload = match serde_json::to_string(&events) {
            Ok(payload) => payload,
            Err(e) => {
                log::error!("Failed to serialize telemetry events: {}", e);
                return;
            }
        };

        let url = format!(
            "{}/v2/telemetry",
            self.config.api_base_url.trim_end_matches('/')
        );

        for attempt in 1..=self.config.telemetry_max_retries {
            let response = self
                .http
                .post(&url)
                .basic_auth(&self.config.api_client_id, Some(&self.config.api_client_secret))
                .header("Content-Type", "application/json")
                .body(payload.clone())
                .send()
                .await;

            match response {
                Ok(resp) if resp.status().is_success() => {
                    log::info!("Flushed {} telemetry events successfully", events.len());
                    return;
                }
                Ok(resp) if resp.status().is_client_error() => {
                    let status = resp.status();
                    let body = resp.text().await.unwrap_or_default();
                    log::error!("Telemetry flush aborted (HTTP {}): {}", status, body);
                    return;
                }
                Ok(resp) => {
                    log::warn!(
                        "Telemetry flush attempt {} failed (HTTP {}); retrying",
                        attempt,
                        resp.status()
                    );
                }
                Err(e) => {
                    log::warn!("Telemetry flush attempt {} network error: {}", attempt, e);
                }
            }

            tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
        }
        log::error!("Max telemetry retries reached; dropping telemetry events");
    }

    /// Stop the worker and perform a final best-effort flush.
    pub async fn shutdown(&self) {
        self.shutdown.notify_waiters();
        let handle = self.worker.lock().ok().and_then(|mut w| w.take());
        if let Some(handle) = handle {
            log::info!("Shutting down telemetry");
            let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
        }
        let deadline = Duration::from_secs(self.config.telemetry_timeout_secs.max(1));
        if tokio::time::timeout(deadline, self.flush()).await.is_err() {
            log::warn!("Telemetry shutdown flush timed out");
        }
        log::debug!("Telemetry shutdown complete");
    }

    /// Copy of the buffered events, oldest first.
    pub fn snapshot(&self) -> Vec<TelemetryEvent> {
        self.buffer
            .lock()
            .map(|b| b.events.iter().cloned().collect())
            .unwrap_or_default()
    }
}

/// Structurally replace the value of every sensitive key with `<REDACTED>`.
pub fn redact_value(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| {
                    if SENSITIVE_KEYS.contains(&k.to_lowercase().as_str()) {
                        (k, Value::String("<REDACTED>".to_string()))
                    } else {
                        (k, redact_value(v))
                    }
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(redact_value).collect()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(cap: usize) -> Arc<Config> {
        let mut config = Config::default();
        config.telemetry_cache_size = cap;
        config.api_client_id = String::new();
        Arc::new(config)
    }

    #[tokio::test]
    async fn overflow_drops_the_oldest_events() {
        let telemetry = Telemetry::new(test_config(3));
        for i in 0..5 {
            telemetry.record(&format!("cmd-{}", i), i, true, None);
        }
        let snapshot = telemetry.snapshot();
        let commands: Vec<&str> = snapshot.iter().map(|e| e.command.as_str()).collect();
        assert_eq!(commands, vec!["cmd-2", "cmd-3", "cmd-4"]);
    }

    #[tokio::test]
    async fn disabled_telemetry_records_nothing() {
        let mut config = Config::default();
        config.telemetry_enabled = false;
        let telemetry = Telemetry::new(Arc::new(config));
        telemetry.record("find", 10, true, None);
        assert!(telemetry.snapshot().is_empty());
    }

    #[tokio::test]
    async fn server_start_carries_platform_metadata() {
        let telemetry = Telemetry::new(test_config(10));
        telemetry.record("server_start", 0, true, None);
        let snapshot = telemetry.snapshot();
        let metadata = snapshot[0].metadata.as_ref().unwrap();
        assert_eq!(metadata["appName"], "estatedesk-mcp");
        assert_eq!(metadata["runtime"], "rust");
    }

    #[test]
    fn redaction_reaches_nested_structures() {
        let args = json!({
            "filter": {"apiKey": "abc", "name": "Sonu"},
            "creds": [{"password": "x"}, {"note": "ok"}],
        });
        let redacted = redact_value(args);
        assert_eq!(redacted["filter"]["apiKey"], "<REDACTED>");
        assert_eq!(redacted["filter"]["name"], "Sonu");
        assert_eq!(redacted["creds"][0]["password"], "<REDACTED>");
        assert_eq!(redacted["creds"][1]["note"], "ok");
    }

    #[test]
    fn redaction_is_case_insensitive_on_keys() {
        let redacted = redact_value(json!({"ApiKey": "abc", "CLIENTSECRET": "def"}));
        assert_eq!(redacted["ApiKey"], "<REDACTED>");
        assert_eq!(redacted["CLIENTSECRET"], "<REDACTED>");
    }
}
