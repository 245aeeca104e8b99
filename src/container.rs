//! Entity containers
//!
//! A container is a named key → JSON collection. Backends implement the
//! `EntityContainer` trait in two tiers:
//!
//! - required operations (create, upsert, read, query, delete), each in a
//!   synchronous and an asynchronous form. The async form defaults to the
//!   sync one, the sync form defaults to `NotImplemented`. A backend sets
//!   `ContainerCapabilities::sync` when its sync forms are usable.
//! - optional native fast paths (count, merge). When absent the engine
//!   composes them from the required operations.
//!
//! The free functions at the bottom pick the sync or async form according
//! to an `ExecutionMode` and are used by every caller inside the crate.

use crate::context::SyncContext;
use crate::cursor::CursorTable;
use crate::error::{TaskExecuteError, TaskResult};
use crate::filter::Filter;
use crate::protocol::{
    CreateEntities, DeleteEntities, EntityErrors, MergeEntities, QueryEntities, ReadEntities,
    UpsertEntities,
};
use crate::types::{EntityValue, JsonKey, JsonValue};
use async_trait::async_trait;

/// How a request is executed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Sync forms only, never suspends
    Sync,
    /// Async forms, awaited one task at a time
    Async,
}

/// Features offered by a container backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerCapabilities {
    /// Sync forms of the required operations are implemented
    pub sync: bool,
    /// `count_all` is implemented
    pub native_count: bool,
    /// `merge_entities` is implemented
    pub native_merge: bool,
}

/// One page of query results
#[derive(Debug, Clone, Default)]
pub struct QueryPage {
    pub entities: Vec<EntityValue>,
    pub cursor: Option<String>,
}

fn not_sync(container: &str, operation: &str) -> TaskExecuteError {
    TaskExecuteError::not_implemented(format!(
        "synchronous {} not supported by container '{}'",
        operation, container
    ))
}

fn not_native(container: &str, operation: &str) -> TaskExecuteError {
    TaskExecuteError::not_implemented(format!(
        "native {} not supported by container '{}'",
        operation, container
    ))
}

#[async_trait]
pub trait EntityContainer: Send + Sync {
    fn name(&self) -> &str;

    /// Name of the key field of stored entities
    fn key_name(&self) -> &str;

    fn capabilities(&self) -> ContainerCapabilities;

    fn cursors(&self) -> &CursorTable;

    // ---- sync forms ----

    fn create_entities(&self, _command: &CreateEntities, _ctx: &SyncContext) -> TaskResult<EntityErrors> {
        Err(not_sync(self.name(), "create"))
    }

    fn upsert_entities(&self, _command: &UpsertEntities, _ctx: &SyncContext) -> TaskResult<EntityErrors> {
        Err(not_sync(self.name(), "upsert"))
    }

    /// One entry per requested id, in request order
    fn read_entities(&self, _command: &ReadEntities, _ctx: &SyncContext) -> TaskResult<Vec<EntityValue>> {
        Err(not_sync(self.name(), "read"))
    }

    fn query_entities(&self, _command: &QueryEntities, _ctx: &SyncContext) -> TaskResult<QueryPage> {
        Err(not_sync(self.name(), "query"))
    }

    fn delete_entities(&self, _command: &DeleteEntities, _ctx: &SyncContext) -> TaskResult<EntityErrors> {
        Err(not_sync(self.name(), "delete"))
    }

    fn count_all(&self, _ctx: &SyncContext) -> TaskResult<usize> {
        Err(not_native(self.name(), "count"))
    }

    fn merge_entities(&self, _command: &MergeEntities, _ctx: &SyncContext) -> TaskResult<EntityErrors> {
        Err(not_native(self.name(), "merge"))
    }

    // ---- async forms ----

    async fn create_entities_async(&self, command: &CreateEntities, ctx: &SyncContext) -> TaskResult<EntityErrors> {
        self.create_entities(command, ctx)
    }

    async fn upsert_entities_async(&self, command: &UpsertEntities, ctx: &SyncContext) -> TaskResult<EntityErrors> {
        self.upsert_entities(command, ctx)
    }

    async fn read_entities_async(&self, command: &ReadEntities, ctx: &SyncContext) -> TaskResult<Vec<EntityValue>> {
        self.read_entities(command, ctx)
    }

    async fn query_entities_async(&self, command: &QueryEntities, ctx: &SyncContext) -> TaskResult<QueryPage> {
        self.query_entities(command, ctx)
    }

    async fn delete_entities_async(&self, command: &DeleteEntities, ctx: &SyncContext) -> TaskResult<EntityErrors> {
        self.delete_entities(command, ctx)
    }

    async fn count_all_async(&self, ctx: &SyncContext) -> TaskResult<usize> {
        self.count_all(ctx)
    }

    async fn merge_entities_async(&self, command: &MergeEntities, ctx: &SyncContext) -> TaskResult<EntityErrors> {
        self.merge_entities(command, ctx)
    }
}

// ==================== Query pagination ====================

/// Why a query scan stopped early
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStop {
    ReachedLimit,
    ReachedMaxCount,
}

/// Collects query matches in key order and manages the cursor.
///
/// Backends enumerate their keys in ascending order starting after
/// `start_after()`, feed each entity to `accept` until it returns
/// `Some(stop)`, then call `finish` telling whether more keys remain.
pub struct QueryCollector<'a> {
    command: &'a QueryEntities,
    cursors: &'a CursorTable,
    user_id: Option<&'a str>,
    start: Option<JsonKey>,
    entities: Vec<EntityValue>,
    last: Option<JsonKey>,
    stop: Option<ScanStop>,
}

impl<'a> QueryCollector<'a> {
    /// Resolve the cursor of `command` (if any) and prepare the scan
    pub fn new(command: &'a QueryEntities, cursors: &'a CursorTable, user_id: Option<&'a str>) -> TaskResult<Self> {
        let start = match &command.cursor {
            Some(id) => Some(cursors.resume(id, user_id)?),
            None => None,
        };
        Ok(QueryCollector {
            command,
            cursors,
            user_id,
            start,
            entities: Vec::new(),
            last: None,
            stop: None,
        })
    }

    /// Enumeration starts after this key
    pub fn start_after(&self) -> Option<&JsonKey> {
        self.start.as_ref()
    }

    pub fn accept(&mut self, key: JsonKey, value: &JsonValue) -> TaskResult<Option<ScanStop>> {
        let matched = self.command.filter.matches(value).map_err(|e| {
            TaskExecuteError::filter(format!("filter '{}' failed for key {}: {}", self.command.filter.source(), key, e))
        })?;
        self.last = Some(key.clone());
        if matched {
            self.entities.push(EntityValue::with_value(key, value.clone()));
            if self.command.limit.map_or(false, |limit| self.entities.len() >= limit) {
                self.stop = Some(ScanStop::ReachedLimit);
            } else if self.command.max_count.map_or(false, |max| self.entities.len() >= max) {
                self.stop = Some(ScanStop::ReachedMaxCount);
            }
        }
        Ok(self.stop)
    }

    /// Last key passed to `accept`, where a follow up page resumes
    pub fn position(&self) -> Option<&JsonKey> {
        self.last.as_ref()
    }

    pub fn finish(self, has_more: bool) -> QueryPage {
        let keep_cursor = self.stop == Some(ScanStop::ReachedMaxCount) && has_more;
        let cursor = match (keep_cursor, self.last, &self.command.cursor) {
            (true, Some(position), Some(id)) => {
                self.cursors.update(id, position);
                Some(id.clone())
            }
            (true, Some(position), None) => Some(self.cursors.open(position, self.user_id)),
            (_, _, Some(id)) => {
                self.cursors.remove(id);
                None
            }
            _ => None,
        };
        QueryPage {
            entities: self.entities,
            cursor,
        }
    }
}

// ==================== Mode dispatch ====================

pub async fn create(c: &dyn EntityContainer, command: &CreateEntities, ctx: &SyncContext, mode: ExecutionMode) -> TaskResult<EntityErrors> {
    match mode {
        ExecutionMode::Sync => c.create_entities(command, ctx),
        ExecutionMode::Async => c.create_entities_async(command, ctx).await,
    }
}

pub async fn upsert(c: &dyn EntityContainer, command: &UpsertEntities, ctx: &SyncContext, mode: ExecutionMode) -> TaskResult<EntityErrors> {
    match mode {
        ExecutionMode::Sync => c.upsert_entities(command, ctx),
        ExecutionMode::Async => c.upsert_entities_async(command, ctx).await,
    }
}

pub async fn read(c: &dyn EntityContainer, command: &ReadEntities, ctx: &SyncContext, mode: ExecutionMode) -> TaskResult<Vec<EntityValue>> {
    match mode {
        ExecutionMode::Sync => c.read_entities(command, ctx),
        ExecutionMode::Async => c.read_entities_async(command, ctx).await,
    }
}

pub async fn query(c: &dyn EntityContainer, command: &QueryEntities, ctx: &SyncContext, mode: ExecutionMode) -> TaskResult<QueryPage> {
    match mode {
        ExecutionMode::Sync => c.query_entities(command, ctx),
        ExecutionMode::Async => c.query_entities_async(command, ctx).await,
    }
}

pub async fn delete(c: &dyn EntityContainer, command: &DeleteEntities, ctx: &SyncContext, mode: ExecutionMode) -> TaskResult<EntityErrors> {
    match mode {
        ExecutionMode::Sync => c.delete_entities(command, ctx),
        ExecutionMode::Async => c.delete_entities_async(command, ctx).await,
    }
}

/// Native merge of a backend. Callers check `capabilities().native_merge`.
pub async fn merge_native(c: &dyn EntityContainer, command: &MergeEntities, ctx: &SyncContext, mode: ExecutionMode) -> TaskResult<EntityErrors> {
    match mode {
        ExecutionMode::Sync => c.merge_entities(command, ctx),
        ExecutionMode::Async => c.merge_entities_async(command, ctx).await,
    }
}

/// Count entities matching `filter`. An unconditional filter uses the
/// backend count when available, anything else scans with a query.
pub async fn count(c: &dyn EntityContainer, filter: &Filter, ctx: &SyncContext, mode: ExecutionMode) -> TaskResult<usize> {
    if filter.is_unconditional() && c.capabilities().native_count {
        return match mode {
            ExecutionMode::Sync => c.count_all(ctx),
            ExecutionMode::Async => c.count_all_async(ctx).await,
        };
    }
    let command = QueryEntities::new(c.name(), filter.clone());
    let page = query(c, &command, ctx, mode).await?;
    Ok(page.entities.len())
}

/// Read the given keys, no references
pub async fn read_keys(c: &dyn EntityContainer, ids: Vec<JsonKey>, ctx: &SyncContext, mode: ExecutionMode) -> TaskResult<Vec<EntityValue>> {
    let command = ReadEntities {
        container: c.name().to_string(),
        ids,
        references: Vec::new(),
    };
    read(c, &command, ctx, mode).await
}
