//! Host configuration.
//!
//! Provides the [`Config`] struct consumed by every other component (session,
//! telemetry, tool base, orchestrator). Users construct it manually or load it
//! from the environment with [`Config::from_env`] — no config-file parsing
//! dependencies are introduced.
//!
//! # Example
//!
//! ```rust
//! use estatedesk::Config;
//!
//! let mut config = Config::default();
//! config.db_name = "crm".to_string();
//! config.allowed_collections = Some(vec!["leads".to_string()]);
//! ```

use serde_json::json;
use std::env;

/// Controls which tools are excluded from the registry.
#[derive(Debug, Clone, Default)]
pub struct DisabledTools {
    /// Tool categories to skip at registration (e.g. `"read"`).
    pub categories: Vec<String>,
    /// Individual tool names to skip (e.g. `"search"`).
    pub names: Vec<String>,
    /// Operation types to skip (e.g. `"create"`, `"update"`).
    pub types: Vec<String>,
}

/// Runtime configuration for the MCP host.
///
/// The field set mirrors the command surface of the server: MongoDB target,
/// collection gating, logging, telemetry endpoint, and LLM routing. All
/// fields are public so embedders can build one directly; [`Config::from_env`]
/// fills it from environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// Default tenant company id (24-hex ObjectId), may be empty.
    pub company_id: String,
    /// MongoDB connection URI.
    pub mongo_uri: String,
    /// Database that holds the tenant collections.
    pub db_name: String,
    /// `secondaryPreferred` (default) or `primary`.
    pub read_preference: String,
    /// When `Some`, a hard allow-list of collections the server will touch.
    /// `None` means no restriction (the `*` sentinel).
    pub allowed_collections: Option<Vec<String>>,
    /// Reference collections shared across tenants; never tenant-scoped.
    pub non_tenant_collections: Vec<String>,
    /// Path of the rotating JSON disk log.
    pub log_path: String,
    /// Log verbosity (`DEBUG`, `INFO`, `WARN`, `ERROR`).
    pub log_level: String,
    /// Whether telemetry events are recorded and flushed.
    pub telemetry_enabled: bool,
    /// Maximum buffered telemetry events before the oldest is dropped.
    pub telemetry_cache_size: usize,
    /// Seconds between background telemetry flushes.
    pub telemetry_flush_interval_secs: u64,
    /// Attempts per telemetry flush before the batch is discarded.
    pub telemetry_max_retries: u32,
    /// Per-request telemetry timeout in seconds.
    pub telemetry_timeout_secs: u64,
    /// Reserved: disables write-category tools. Every tool in this host is
    /// read-only already, so the flag currently gates nothing.
    pub read_only: bool,
    /// Per-tool and per-category registry exclusions.
    pub disabled_tools: DisabledTools,
    /// Base URL of the telemetry ingestion endpoint.
    pub api_base_url: String,
    /// Basic-auth user for the telemetry endpoint.
    pub api_client_id: String,
    /// Basic-auth secret for the telemetry endpoint.
    pub api_client_secret: String,
    /// API key for the chat-completions endpoint used by the planner.
    pub openai_api_key: Option<String>,
    /// Model identifier for the planner (e.g. `gpt-4o-mini`).
    pub model_name: Option<String>,
    /// Per-query `maxTimeMS` applied by the find tool.
    pub query_timeout_ms: u64,
    /// Client-side timeout for planner LLM calls, in seconds.
    pub llm_timeout_secs: u64,
    /// Listen port for the web surface.
    pub port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            company_id: String::new(),
            mongo_uri: "mongodb://localhost:27017".to_string(),
            db_name: "test".to_string(),
            read_preference: "secondaryPreferred".to_string(),
            allowed_collections: None,
            non_tenant_collections: ["plans", "countries", "states", "cities"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            log_path: default_log_path(),
            log_level: "INFO".to_string(),
            telemetry_enabled: true,
            telemetry_cache_size: 1000,
            telemetry_flush_interval_secs: 60,
            telemetry_max_retries: 3,
            telemetry_timeout_secs: 5,
            read_only: false,
            disabled_tools: DisabledTools::default(),
            api_base_url: "https://telemetry.estatedesk.dev/".to_string(),
            api_client_id: String::new(),
            api_client_secret: String::new(),
            openai_api_key: None,
            model_name: None,
            query_timeout_ms: 30_000,
            llm_timeout_secs: 30,
            port: 8000,
        }
    }
}

impl Config {
    /// Load the configuration from environment variables.
    ///
    /// Unset variables fall back to the defaults documented on each field.
    /// `COLLECTIONS` accepts a comma-separated list or `*` (no restriction);
    /// `DO_NOT_TRACK=1` forces telemetry off regardless of `MDB_MCP_TELEMETRY`.
    pub fn from_env() -> Self {
        let defaults = Config::default();

        let raw_collections = env::var("COLLECTIONS").unwrap_or_else(|_| "*".to_string());
        let allowed_collections = match raw_collections.trim() {
            "" | "*" => None,
            other => Some(parse_list(other)),
        };

        let non_tenant_collections = env::var("NON_TENANT_COLLECTIONS")
            .map(|v| parse_list(&v))
            .unwrap_or(defaults.non_tenant_collections);

        let telemetry_enabled = if env::var("DO_NOT_TRACK").ok().as_deref() == Some("1") {
            false
        } else {
            env::var("MDB_MCP_TELEMETRY")
                .map(|v| v.to_lowercase() != "disabled")
                .unwrap_or(true)
        };

        Self {
            company_id: env::var("COMPANY_ID").unwrap_or_default(),
            mongo_uri: env::var("MONGO_URI").unwrap_or(defaults.mongo_uri),
            db_name: env::var("DB_NAME").unwrap_or(defaults.db_name),
            read_preference: env::var("MDB_MCP_READ_PREF").unwrap_or(defaults.read_preference),
            allowed_collections,
            non_tenant_collections,
            log_path: env::var("LOG_PATH").unwrap_or(defaults.log_path),
            log_level: env::var("LOG_LEVEL")
                .map(|v| v.to_uppercase())
                .unwrap_or(defaults.log_level),
            telemetry_enabled,
            telemetry_cache_size: env_parse("MDB_MCP_TELEMETRY_CACHE_SIZE", defaults.telemetry_cache_size),
            telemetry_flush_interval_secs: env_parse(
                "MDB_MCP_TELEMETRY_FLUSH_INTERVAL",
                defaults.telemetry_flush_interval_secs,
            ),
            telemetry_max_retries: env_parse("MDB_MCP_TELEMETRY_MAX_RETRIES", defaults.telemetry_max_retries),
            telemetry_timeout_secs: env_parse("MDB_MCP_TELEMETRY_TIMEOUT", defaults.telemetry_timeout_secs),
            read_only: env_flag("MDB_MCP_READ_ONLY"),
            disabled_tools: DisabledTools {
                categories: env::var("MDB_MCP_DISABLED_TOOL_CATEGORIES")
                    .map(|v| parse_list(&v))
                    .unwrap_or_default(),
                names: env::var("MDB_MCP_DISABLED_TOOL_NAMES")
                    .map(|v| parse_list(&v))
                    .unwrap_or_default(),
                types: env::var("MDB_MCP_DISABLED_TOOL_TYPES")
                    .map(|v| parse_list(&v))
                    .unwrap_or_default(),
            },
            api_base_url: env::var("API_BASE_URL").unwrap_or(defaults.api_base_url),
            api_client_id: env::var("API_CLIENT_ID").unwrap_or_default(),
            api_client_secret: env::var("API_CLIENT_SECRET").unwrap_or_default(),
            openai_api_key: env::var("OPENAI_API_KEY").ok(),
            model_name: env::var("MODEL_NAME").ok(),
            query_timeout_ms: env_parse("MDB_MCP_QUERY_TIMEOUT_MS", defaults.query_timeout_ms),
            llm_timeout_secs: env_parse("MDB_MCP_LLM_TIMEOUT", defaults.llm_timeout_secs),
            port: env_parse("PORT", defaults.port),
        }
    }

    /// True when the collection may be queried without tenant scoping.
    pub fn is_non_tenant(&self, collection: &str) -> bool {
        self.non_tenant_collections.iter().any(|c| c == collection)
    }

    /// True when the collection passes the allow-list (or no list is set).
    pub fn is_allowed(&self, collection: &str) -> bool {
        match &self.allowed_collections {
            Some(list) => list.iter().any(|c| c == collection),
            None => true,
        }
    }

    /// JSON view of the running config for the `config://config` resource.
    ///
    /// Secrets are replaced before the value ever leaves the process.
    pub fn resource_view(&self) -> serde_json::Value {
        json!({
            "companyId": self.company_id,
            "mongoUri": crate::estatedesk::logging::redact(&self.mongo_uri),
            "dbName": self.db_name,
            "readPreference": self.read_preference,
            "allowedCollections": self.allowed_collections,
            "nonTenantCollections": self.non_tenant_collections,
            "logPath": self.log_path,
            "logLevel": self.log_level,
            "telemetry": if self.telemetry_enabled { "enabled" } else { "disabled" },
            "readOnly": self.read_only,
            "disabledTools": {
                "categories": self.disabled_tools.categories,
                "names": self.disabled_tools.names,
                "types": self.disabled_tools.types,
            },
            "apiBaseUrl": self.api_base_url,
            "apiClientId": if self.api_client_id.is_empty() { "" } else { "<REDACTED>" },
            "apiClientSecret": if self.api_client_secret.is_empty() { "" } else { "<REDACTED>" },
            "modelName": self.model_name,
        })
    }
}

fn default_log_path() -> String {
    let home = env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.mongodb/mongodb-mcp/.app-logs/mcp.log", home)
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

fn env_flag(name: &str) -> bool {
    env::var(name)
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_allow_list_is_open() {
        let config = Config::default();
        assert!(config.is_allowed("leads"));
        assert!(config.is_allowed("anything"));
    }

    #[test]
    fn explicit_allow_list_is_a_hard_gate() {
        let mut config = Config::default();
        config.allowed_collections = Some(vec!["leads".to_string(), "projects".to_string()]);
        assert!(config.is_allowed("leads"));
        assert!(!config.is_allowed("users"));
    }

    #[test]
    fn non_tenant_defaults_cover_reference_lists() {
        let config = Config::default();
        assert!(config.is_non_tenant("countries"));
        assert!(config.is_non_tenant("plans"));
        assert!(!config.is_non_tenant("leads"));
    }

    #[test]
    fn parse_list_trims_and_skips_blanks() {
        assert_eq!(parse_list("a, b ,,c"), vec!["a", "b", "c"]);
        assert!(parse_list("").is_empty());
    }

    #[test]
    fn resource_view_redacts_credentials() {
        let mut config = Config::default();
        config.api_client_secret = "super-secret".to_string();
        let view = config.resource_view();
        assert_eq!(view["apiClientSecret"], "<REDACTED>");
    }
}
