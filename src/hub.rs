//! Sync hub
//!
//! Entry point of request execution. The hub owns the registered databases,
//! the shared resource pools, the authenticator and the optional event
//! dispatcher. Request execution itself lives in `executor`.

use crate::auth::{AuthenticateNone, Authenticator};
use crate::config::HubConfig;
use crate::database::Database;
use crate::error::{HubError, HubResult};
use crate::events::EventDispatcher;
use crate::pool::SharedPools;
use crate::protocol::{SyncRequest, SyncResponse};
use crate::types::JsonValue;
use dashmap::DashMap;
use std::sync::Arc;

pub struct Hub {
    config: HubConfig,
    name: Arc<str>,
    databases: DashMap<String, Arc<Database>>,
    pools: Arc<SharedPools>,
    authenticator: Arc<dyn Authenticator>,
    events: Option<Arc<dyn EventDispatcher>>,
}

impl Hub {
    pub fn new(config: HubConfig) -> HubResult<Self> {
        config.validate()?;
        Ok(Hub {
            name: Arc::from(config.hub_name.as_str()),
            pools: Arc::new(SharedPools::new(&config.pools)),
            databases: DashMap::new(),
            authenticator: Arc::new(AuthenticateNone),
            events: None,
            config,
        })
    }

    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = authenticator;
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventDispatcher>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pools(&self) -> &Arc<SharedPools> {
        &self.pools
    }

    pub(crate) fn name_arc(&self) -> Arc<str> {
        Arc::clone(&self.name)
    }

    pub(crate) fn authenticator(&self) -> &dyn Authenticator {
        self.authenticator.as_ref()
    }

    pub(crate) fn events(&self) -> Option<&Arc<dyn EventDispatcher>> {
        self.events.as_ref()
    }

    // ==================== Databases ====================

    pub fn add_database(&self, database: Database) -> HubResult<Arc<Database>> {
        let name = database.name().to_string();
        match self.databases.entry(name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(HubError::DatabaseExists(name)),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let database = Arc::new(database);
                entry.insert(Arc::clone(&database));
                tracing::info!(database = %name, backend = database.backend_kind(), "database registered");
                Ok(database)
            }
        }
    }

    pub fn database(&self, name: &str) -> Option<Arc<Database>> {
        self.databases.get(name).map(|entry| Arc::clone(entry.value()))
    }

    pub fn remove_database(&self, name: &str) -> HubResult<Arc<Database>> {
        self.databases
            .remove(name)
            .map(|(_, database)| database)
            .ok_or_else(|| HubError::DatabaseNotFound(name.to_string()))
    }

    pub fn database_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.databases.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }

    // ==================== Execution ====================

    /// Execute a request with the mode chosen for its database: through the
    /// database's request queue if one is configured, otherwise sync when
    /// every task supports it and async else.
    pub async fn execute_request(&self, request: SyncRequest) -> HubResult<SyncResponse> {
        let queue = self
            .database(&request.database)
            .and_then(|database| database.service().queue().cloned());
        match queue {
            Some(queue) => queue.enqueue(request).await.map_err(|_| HubError::RequestDropped)?,
            None => Ok(self.execute_direct(&request).await),
        }
    }

    /// Serialize a response for the transport layer using a pooled buffer
    pub fn serialize_response(&self, response: &SyncResponse) -> HubResult<JsonValue> {
        let mut buffer = self.pools.buffers.acquire();
        serde_json::to_writer(&mut *buffer, response)?;
        Ok(JsonValue::from_bytes(buffer.as_slice()))
    }
}
