//! SyncHub - Rust Core Engine
//!
//! Execution core of a JSON document sync hub. Clients send batched
//! requests of heterogeneous tasks targeting the containers of a database;
//! the hub executes them in order and answers with one result per task.
//!
//! # Architecture
//!
//! - Container Layer: two-tier `EntityContainer` trait, memory and file backends
//! - Database Layer: lazily created containers, optional schema, connection pool
//! - Context Layer: per request state, transactions with an undo journal
//! - Service Layer: command / message dispatcher, deferred request queue
//! - Engine Layer: sync and async task execution, reference resolution, merge patch

pub mod types;
pub mod error;
pub mod config;
pub mod logging;

// Storage modules
pub mod container;
pub mod cursor;
pub mod filter;
pub mod memory;
pub mod storage;

// Database modules
pub mod database;
pub mod schema;
pub mod connection_pool;

// Request execution modules
pub mod protocol;
pub mod context;
pub mod transaction;
pub mod executor;
pub mod references;
pub mod merge;
pub mod hub;

// Service modules
pub mod dispatcher;
pub mod queue;
pub mod auth;
pub mod events;
pub mod pool;

pub use types::{EntityState, EntityValue, JsonEntity, JsonKey, JsonValue};
pub use error::{
    EntityError, EntityErrorType, HubError, HubResult, TaskErrorType, TaskExecuteError, TaskResult,
};
pub use config::{ConnectionPoolConfig, CursorConfig, HubConfig, MemoryConfig, PoolConfig};
pub use logging::init_logging;

// Storage exports
pub use container::{ContainerCapabilities, EntityContainer, ExecutionMode, QueryCollector, QueryPage};
pub use cursor::CursorTable;
pub use filter::Filter;
pub use memory::{MemoryBackend, MemoryContainer};
pub use storage::{FileBackend, FileContainer};

// Database exports
pub use database::{ContainerFactory, Database, DatabaseService};
pub use schema::{DatabaseSchema, EntityType, Field, FieldType, ValidationError};
pub use connection_pool::{ConnectionPool, PoolStats, PooledConnection};

// Request exports
pub use protocol::*;
pub use context::SyncContext;
pub use transaction::{Transaction, TransactionState};
pub use references::Selector;
pub use merge::merge_patch;
pub use hub::Hub;

// Service exports
pub use dispatcher::{HandlerKind, HandlerResult, Param, ServiceDispatcher};
pub use queue::{DeferredQueue, RequestQueue};
pub use auth::{AuthState, AuthenticateNone, Authenticator, HubPermission, Role, TaskAuthorizer, UserAuthenticator};
pub use events::{ChangeEvent, EventDispatcher, EventLog};
pub use pool::SharedPools;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
