//! MongoDB session: client ownership and tenant identity.
//!
//! The session exclusively owns the MongoDB client and validates tenant
//! identifiers. The tenant itself is request-scoped: callers resolve the
//! incoming company id with [`Session::resolve_tenant`] and pass the
//! resulting ObjectId explicitly through every tool call, so concurrent
//! requests for different tenants can never observe each other's scope. The
//! stdio transport, which carries no per-request tenant, binds one default
//! tenant at startup. Tools borrow collection handles through the session,
//! which is where the collection allow-list is enforced before any I/O.

use mongodb::bson::{doc, oid::ObjectId, Document};
use mongodb::options::{ClientOptions, ReadPreference, SelectionCriteria};
use mongodb::{Client, Collection, Database};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::estatedesk::config::Config;
use crate::estatedesk::tool_protocol::ToolError;

/// Per-process database session.
pub struct Session {
    config: Arc<Config>,
    client: Client,
    /// Fallback tenant for transports without per-request identity (stdio).
    /// Written once at startup, never per request.
    default_tenant: RwLock<Option<ObjectId>>,
}

impl Session {
    /// Build the client from the configured URI and read preference.
    ///
    /// The driver connects lazily; call [`Session::connect`] to force a
    /// round-trip and log the server version.
    pub async fn new(config: Arc<Config>) -> Result<Self, mongodb::error::Error> {
        let mut options = ClientOptions::parse(&config.mongo_uri).await?;
        options.app_name = Some("estatedesk-mcp".to_string());
        let read_pref = if config.read_preference.eq_ignore_ascii_case("secondarypreferred") {
            ReadPreference::SecondaryPreferred {
                options: Default::default(),
            }
        } else {
            ReadPreference::Primary
        };
        options.selection_criteria = Some(SelectionCriteria::ReadPreference(read_pref));

        let client = Client::with_options(options)?;
        log::debug!(
            "Mongo client ready for {} (readPreference={})",
            config.db_name,
            config.read_preference
        );
        Ok(Self {
            config,
            client,
            default_tenant: RwLock::new(None),
        })
    }

    /// Ping the deployment and log the server version.
    pub async fn connect(&self) -> Result<(), mongodb::error::Error> {
        let admin = self.client.database("admin");
        admin.run_command(doc! {"ping": 1}).await?;
        let version = admin
            .run_command(doc! {"buildInfo": 1})
            .await
            .ok()
            .and_then(|info| info.get_str("version").map(str::to_string).ok())
            .unwrap_or_else(|| "unknown".to_string());
        log::info!(
            "Connected to MongoDB (readPreference={}); server version: {}",
            self.config.read_preference,
            version
        );
        Ok(())
    }

    /// Validate a company id into the tenant every operation is scoped to.
    ///
    /// The identifier must be a 24-hex ObjectId; anything else fails fast
    /// with a user-visible error. No shared state is touched: the returned
    /// id travels with the request.
    pub fn resolve_tenant(&self, company_id: &str) -> Result<ObjectId, ToolError> {
        let oid = ObjectId::parse_str(company_id).map_err(|_| {
            log::error!("Invalid company_id '{}'", company_id);
            ToolError::InvalidArguments(format!("Invalid company_id: {}", company_id))
        })?;
        log::debug!("Using company_id {}", oid);
        Ok(oid)
    }

    /// Bind the startup default tenant (stdio mode).
    pub async fn set_default_tenant(&self, company_id: &str) -> Result<ObjectId, ToolError> {
        let oid = self.resolve_tenant(company_id)?;
        *self.default_tenant.write().await = Some(oid);
        log::info!("Default tenant bound to {}", oid);
        Ok(oid)
    }

    /// The startup default tenant, if one was bound.
    pub async fn default_tenant(&self) -> Option<ObjectId> {
        *self.default_tenant.read().await
    }

    /// Handle on the configured database, or a caller-named one.
    pub fn database(&self, name: Option<&str>) -> Database {
        self.client.database(name.unwrap_or(&self.config.db_name))
    }

    /// Name of the default database.
    pub fn db_name(&self) -> &str {
        &self.config.db_name
    }

    /// Collection handle with the allow-list enforced before any I/O.
    pub fn collection(
        &self,
        db: Option<&str>,
        name: &str,
    ) -> Result<Collection<Document>, ToolError> {
        if !self.config.is_allowed(name) {
            log::warn!("Access to collection '{}' is not allowed", name);
            return Err(ToolError::Forbidden(format!(
                "Collection '{}' is not in allowed_collections.",
                name
            )));
        }
        Ok(self.database(db).collection::<Document>(name))
    }

    /// Shared config handle.
    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// Close the underlying client, draining its connection pool.
    pub async fn close(&self) {
        self.client.clone().shutdown().await;
        log::info!("Closed MongoDB connection");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolve_tenant_accepts_only_object_ids() {
        let session = Session::new(Arc::new(Config::default())).await.unwrap();
        assert!(session.resolve_tenant("64b000000000000000000001").is_ok());

        let err = session.resolve_tenant("not-a-hex-id").unwrap_err();
        assert!(err.is_user_error());
        assert!(err.to_string().contains("not-a-hex-id"));
    }

    #[tokio::test]
    async fn default_tenant_is_unset_until_bound() {
        let session = Session::new(Arc::new(Config::default())).await.unwrap();
        assert!(session.default_tenant().await.is_none());

        let oid = session
            .set_default_tenant("64b000000000000000000001")
            .await
            .unwrap();
        assert_eq!(session.default_tenant().await, Some(oid));
    }
}
