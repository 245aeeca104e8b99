//! Database registry
//!
//! A `Database` owns its containers, created lazily by a `ContainerFactory`
//! on first access and cached for the database lifetime, plus the
//! connection pool and the service (command handlers, optional queue).

use crate::config::HubConfig;
use crate::connection_pool::ConnectionPool;
use crate::container::EntityContainer;
use crate::dispatcher::ServiceDispatcher;
use crate::error::{TaskExecuteError, TaskResult};
use crate::queue::RequestQueue;
use crate::schema::DatabaseSchema;
use dashmap::DashMap;
use std::sync::Arc;

const DEFAULT_KEY_NAME: &str = "id";

/// Storage backend creating the containers of a database
pub trait ContainerFactory: Send + Sync {
    /// Backend name used in logs
    fn kind(&self) -> &'static str;

    fn create_container(&self, name: &str, key_name: &str) -> Arc<dyn EntityContainer>;
}

/// Command / message handlers of a database and its optional request queue
pub struct DatabaseService {
    dispatcher: ServiceDispatcher,
    queue: Option<Arc<RequestQueue>>,
}

impl DatabaseService {
    pub fn new(dispatcher: ServiceDispatcher) -> Self {
        DatabaseService { dispatcher, queue: None }
    }

    /// Execute all requests of the database through `queue`
    pub fn with_queue(mut self, queue: Arc<RequestQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn dispatcher(&self) -> &ServiceDispatcher {
        &self.dispatcher
    }

    pub fn dispatcher_mut(&mut self) -> &mut ServiceDispatcher {
        &mut self.dispatcher
    }

    pub fn queue(&self) -> Option<&Arc<RequestQueue>> {
        self.queue.as_ref()
    }
}

impl Default for DatabaseService {
    fn default() -> Self {
        DatabaseService::new(ServiceDispatcher::new())
    }
}

pub struct Database {
    name: String,
    schema: Option<DatabaseSchema>,
    backend: Arc<dyn ContainerFactory>,
    containers: DashMap<String, Arc<dyn EntityContainer>>,
    connections: Arc<ConnectionPool>,
    service: DatabaseService,
}

impl Database {
    pub fn new(name: &str, backend: Arc<dyn ContainerFactory>, config: &HubConfig) -> Self {
        Database {
            name: name.to_string(),
            schema: None,
            backend,
            containers: DashMap::new(),
            connections: Arc::new(ConnectionPool::new(name, config.connections.clone())),
            service: DatabaseService::default(),
        }
    }

    pub fn with_schema(mut self, schema: DatabaseSchema) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn with_service(mut self, service: DatabaseService) -> Self {
        self.service = service;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> Option<&DatabaseSchema> {
        self.schema.as_ref()
    }

    pub fn backend_kind(&self) -> &'static str {
        self.backend.kind()
    }

    pub fn connections(&self) -> &Arc<ConnectionPool> {
        &self.connections
    }

    pub fn service(&self) -> &DatabaseService {
        &self.service
    }

    pub fn service_mut(&mut self) -> &mut DatabaseService {
        &mut self.service
    }

    /// Container `name`, created on first access. With a schema bound only
    /// containers named by the schema exist.
    pub fn container(&self, name: &str) -> TaskResult<Arc<dyn EntityContainer>> {
        if let Some(container) = self.containers.get(name) {
            return Ok(Arc::clone(container.value()));
        }
        if name.is_empty() {
            return Err(TaskExecuteError::invalid_task("missing container name"));
        }
        let key_name = match &self.schema {
            Some(schema) => match schema.entity_type(name) {
                Some(entity_type) => entity_type.key_name.clone(),
                None => return Err(TaskExecuteError::invalid_task(format!("container not found: {}", name))),
            },
            None => DEFAULT_KEY_NAME.to_string(),
        };
        let entry = self.containers.entry(name.to_string()).or_insert_with(|| {
            tracing::debug!(database = %self.name, container = %name, backend = self.backend.kind(), "container created");
            self.backend.create_container(name, &key_name)
        });
        Ok(Arc::clone(entry.value()))
    }

    /// Names of the schema containers, or of the containers accessed so far
    pub fn container_names(&self) -> Vec<String> {
        match &self.schema {
            Some(schema) => schema.container_names(),
            None => {
                let mut names: Vec<String> = self.containers.iter().map(|entry| entry.key().clone()).collect();
                names.sort();
                names
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TaskErrorType;
    use crate::memory::MemoryBackend;
    use crate::schema::EntityType;

    fn memory_database() -> Database {
        let config = HubConfig::default();
        Database::new("main", Arc::new(MemoryBackend::new(&config)), &config)
    }

    #[test]
    fn test_container_created_once() {
        let db = memory_database();
        let first = db.container("items").unwrap();
        let second = db.container("items").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(db.container_names(), vec!["items".to_string()]);
        assert_eq!(db.backend_kind(), "memory");
    }

    #[test]
    fn test_schema_restricts_containers() {
        let schema = DatabaseSchema::new().with_container("users", EntityType::new().with_key_name("uid"));
        let db = memory_database().with_schema(schema);

        assert_eq!(db.container("users").unwrap().key_name(), "uid");
        let err = db.container("orders").err().unwrap();
        assert_eq!(err.kind, TaskErrorType::InvalidTask);
        assert_eq!(err.message, "container not found: orders");
    }

    #[test]
    fn test_empty_container_name() {
        let db = memory_database();
        assert!(db.container("").is_err());
    }
}
