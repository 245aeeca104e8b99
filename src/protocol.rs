//! Request / response protocol
//!
//! A `SyncRequest` carries an ordered list of tasks for one database. The
//! matching `SyncResponse` carries exactly one `SyncTaskResult` per task, in
//! the same order.

use crate::error::{EntityError, TaskExecuteError};
use crate::filter::Filter;
use crate::types::{EntityValue, JsonEntity, JsonKey, JsonValue};
use serde::{Deserialize, Serialize};

// ==================== Request ====================

/// Batched request targeting one database
#[derive(Debug, Clone, Default)]
pub struct SyncRequest {
    pub database: String,
    pub client_id: Option<String>,
    pub user_id: Option<String>,
    pub token: Option<String>,
    pub tasks: Vec<SyncTask>,
}

impl SyncRequest {
    pub fn new(database: impl Into<String>, tasks: Vec<SyncTask>) -> Self {
        SyncRequest {
            database: database.into(),
            tasks,
            ..Default::default()
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>, token: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self.token = Some(token.into());
        self
    }

    pub fn with_client(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }
}

/// One unit of work inside a request
#[derive(Debug, Clone)]
pub enum SyncTask {
    Create(CreateEntities),
    Upsert(UpsertEntities),
    Read(ReadEntities),
    Query(QueryEntities),
    Aggregate(AggregateEntities),
    Delete(DeleteEntities),
    Merge(MergeEntities),
    Message(SendMessage),
    Command(SendCommand),
    SubscribeChanges(SubscribeChanges),
    SubscribeMessage(SubscribeMessage),
    CloseCursors(CloseCursors),
    TransactionBegin,
    TransactionCommit,
    TransactionRollback,
}

impl SyncTask {
    /// Task name used in logs and authorization messages
    pub fn name(&self) -> &'static str {
        match self {
            SyncTask::Create(_) => "create",
            SyncTask::Upsert(_) => "upsert",
            SyncTask::Read(_) => "read",
            SyncTask::Query(_) => "query",
            SyncTask::Aggregate(_) => "aggregate",
            SyncTask::Delete(_) => "delete",
            SyncTask::Merge(_) => "merge",
            SyncTask::Message(_) => "message",
            SyncTask::Command(_) => "command",
            SyncTask::SubscribeChanges(_) => "subscribeChanges",
            SyncTask::SubscribeMessage(_) => "subscribeMessage",
            SyncTask::CloseCursors(_) => "closeCursors",
            SyncTask::TransactionBegin => "transactionBegin",
            SyncTask::TransactionCommit => "transactionCommit",
            SyncTask::TransactionRollback => "transactionRollback",
        }
    }

    /// Container addressed by the task, if any
    pub fn container(&self) -> Option<&str> {
        match self {
            SyncTask::Create(t) => Some(&t.container),
            SyncTask::Upsert(t) => Some(&t.container),
            SyncTask::Read(t) => Some(&t.container),
            SyncTask::Query(t) => Some(&t.container),
            SyncTask::Aggregate(t) => Some(&t.container),
            SyncTask::Delete(t) => Some(&t.container),
            SyncTask::Merge(t) => Some(&t.container),
            SyncTask::SubscribeChanges(t) => Some(&t.container),
            SyncTask::CloseCursors(t) => Some(&t.container),
            _ => None,
        }
    }

    /// True for tasks that modify entities
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            SyncTask::Create(_) | SyncTask::Upsert(_) | SyncTask::Delete(_) | SyncTask::Merge(_)
        )
    }

    pub fn create(container: &str, entities: Vec<JsonEntity>) -> Self {
        SyncTask::Create(CreateEntities {
            container: container.to_string(),
            entities,
        })
    }

    pub fn upsert(container: &str, entities: Vec<JsonEntity>) -> Self {
        SyncTask::Upsert(UpsertEntities {
            container: container.to_string(),
            entities,
        })
    }

    pub fn read(container: &str, ids: Vec<JsonKey>) -> Self {
        SyncTask::Read(ReadEntities {
            container: container.to_string(),
            ids,
            references: Vec::new(),
        })
    }

    pub fn query(container: &str, filter: Filter) -> Self {
        SyncTask::Query(QueryEntities::new(container, filter))
    }

    pub fn count(container: &str, filter: Filter) -> Self {
        SyncTask::Aggregate(AggregateEntities {
            container: container.to_string(),
            kind: AggregateType::Count,
            filter,
        })
    }

    pub fn delete(container: &str, ids: Vec<JsonKey>) -> Self {
        SyncTask::Delete(DeleteEntities {
            container: container.to_string(),
            ids,
            all: false,
        })
    }

    pub fn delete_all(container: &str) -> Self {
        SyncTask::Delete(DeleteEntities {
            container: container.to_string(),
            ids: Vec::new(),
            all: true,
        })
    }

    pub fn merge(container: &str, patches: Vec<EntityPatch>) -> Self {
        SyncTask::Merge(MergeEntities {
            container: container.to_string(),
            patches,
        })
    }

    pub fn command(name: &str, param: Option<serde_json::Value>) -> Self {
        SyncTask::Command(SendCommand {
            name: name.to_string(),
            param: param.map(JsonValue::from),
        })
    }

    pub fn message(name: &str, param: Option<serde_json::Value>) -> Self {
        SyncTask::Message(SendMessage {
            name: name.to_string(),
            param: param.map(JsonValue::from),
        })
    }
}

#[derive(Debug, Clone)]
pub struct CreateEntities {
    pub container: String,
    pub entities: Vec<JsonEntity>,
}

#[derive(Debug, Clone)]
pub struct UpsertEntities {
    pub container: String,
    pub entities: Vec<JsonEntity>,
}

#[derive(Debug, Clone)]
pub struct ReadEntities {
    pub container: String,
    pub ids: Vec<JsonKey>,
    pub references: Vec<References>,
}

#[derive(Debug, Clone)]
pub struct QueryEntities {
    pub container: String,
    pub filter: Filter,
    /// Stop after this many matches, without a cursor
    pub limit: Option<usize>,
    /// Page size. A cursor is returned when more entities remain.
    pub max_count: Option<usize>,
    /// Cursor of a previous page
    pub cursor: Option<String>,
    pub references: Vec<References>,
}

impl QueryEntities {
    pub fn new(container: &str, filter: Filter) -> Self {
        QueryEntities {
            container: container.to_string(),
            filter,
            limit: None,
            max_count: None,
            cursor: None,
            references: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggregateType {
    Count,
}

#[derive(Debug, Clone)]
pub struct AggregateEntities {
    pub container: String,
    pub kind: AggregateType,
    pub filter: Filter,
}

#[derive(Debug, Clone)]
pub struct DeleteEntities {
    pub container: String,
    pub ids: Vec<JsonKey>,
    /// Delete every entity of the container
    pub all: bool,
}

/// Partial document applied with merge-patch semantics
#[derive(Debug, Clone, PartialEq)]
pub struct EntityPatch {
    pub key: JsonKey,
    pub patch: JsonValue,
}

impl EntityPatch {
    pub fn new(key: impl Into<JsonKey>, patch: serde_json::Value) -> Self {
        EntityPatch {
            key: key.into(),
            patch: JsonValue::from_value(&patch),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MergeEntities {
    pub container: String,
    pub patches: Vec<EntityPatch>,
}

#[derive(Debug, Clone)]
pub struct SendMessage {
    pub name: String,
    pub param: Option<JsonValue>,
}

#[derive(Debug, Clone)]
pub struct SendCommand {
    pub name: String,
    pub param: Option<JsonValue>,
}

/// Kind of entity change a subscriber is interested in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChangeKind {
    Create,
    Upsert,
    Delete,
    Merge,
}

#[derive(Debug, Clone)]
pub struct SubscribeChanges {
    pub container: String,
    /// Empty list removes the subscription
    pub changes: Vec<ChangeKind>,
    pub filter: Filter,
}

#[derive(Debug, Clone)]
pub struct SubscribeMessage {
    pub name: String,
    pub remove: bool,
}

#[derive(Debug, Clone)]
pub struct CloseCursors {
    pub container: String,
    /// `None` closes all cursors of the calling user
    pub cursors: Option<Vec<String>>,
}

/// Ordering of deduplicated foreign keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum KeyOrder {
    /// Order of first appearance
    #[default]
    Unordered,
    Ascending,
    Descending,
}

/// Foreign key reference resolved against another container
#[derive(Debug, Clone)]
pub struct References {
    /// Selector path, e.g. `.author` or `.items[*].article`
    pub selector: String,
    pub container: String,
    pub key_name: String,
    pub order: KeyOrder,
    pub references: Vec<References>,
}

impl References {
    pub fn new(selector: &str, container: &str) -> Self {
        References {
            selector: selector.to_string(),
            container: container.to_string(),
            key_name: "id".to_string(),
            order: KeyOrder::Unordered,
            references: Vec::new(),
        }
    }

    pub fn ordered(mut self, order: KeyOrder) -> Self {
        self.order = order;
        self
    }

    pub fn with_references(mut self, references: Vec<References>) -> Self {
        self.references = references;
        self
    }
}

// ==================== Response ====================

/// Response to a `SyncRequest`
#[derive(Debug, Clone, Serialize)]
pub struct SyncResponse {
    pub database: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    pub tasks: Vec<SyncTaskResult>,
}

/// Result of one task, or the error voiding it
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "task", rename_all = "camelCase")]
pub enum SyncTaskResult {
    Create(EntityErrors),
    Upsert(EntityErrors),
    Read(ReadEntitiesResult),
    Query(QueryEntitiesResult),
    Aggregate(AggregateEntitiesResult),
    Delete(EntityErrors),
    Merge(EntityErrors),
    Message,
    Command(SendCommandResult),
    SubscribeChanges,
    SubscribeMessage,
    CloseCursors(CloseCursorsResult),
    TransactionBegin(TransactionResult),
    TransactionCommit(TransactionResult),
    TransactionRollback(TransactionResult),
    Error(TaskExecuteError),
}

impl SyncTaskResult {
    pub fn is_error(&self) -> bool {
        matches!(self, SyncTaskResult::Error(_))
    }

    pub fn error(&self) -> Option<&TaskExecuteError> {
        match self {
            SyncTaskResult::Error(e) => Some(e),
            _ => None,
        }
    }

    /// Per entity errors of write tasks
    pub fn entity_errors(&self) -> &[EntityError] {
        match self {
            SyncTaskResult::Create(r)
            | SyncTaskResult::Upsert(r)
            | SyncTaskResult::Delete(r)
            | SyncTaskResult::Merge(r) => &r.errors,
            _ => &[],
        }
    }

    /// Entities returned by read and query tasks
    pub fn entities(&self) -> &[EntityValue] {
        match self {
            SyncTaskResult::Read(r) => &r.entities,
            SyncTaskResult::Query(r) => &r.entities,
            _ => &[],
        }
    }
}

impl From<TaskExecuteError> for SyncTaskResult {
    fn from(error: TaskExecuteError) -> Self {
        SyncTaskResult::Error(error)
    }
}

/// Errors of create / upsert / delete / merge tasks
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EntityErrors {
    pub errors: Vec<EntityError>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReadEntitiesResult {
    pub entities: Vec<EntityValue>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<ReferencesResult>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryEntitiesResult {
    pub container: String,
    pub cursor: Option<String>,
    pub entities: Vec<EntityValue>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<ReferencesResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateEntitiesResult {
    pub container: String,
    pub kind: AggregateType,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SendCommandResult {
    pub result: Option<JsonValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CloseCursorsResult {
    /// Cursors of the calling user still open in the container
    pub count: usize,
}

/// Outcome reported by transaction tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionOutcome {
    Active,
    Committed,
    RolledBack,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransactionResult {
    pub state: TransactionOutcome,
}

/// Entities resolved for one reference
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReferencesResult {
    pub container: String,
    pub key_name: String,
    /// Path of selectors leading to this reference
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub entities: Vec<EntityValue>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<ReferencesResult>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_task_result_serialization() {
        let result = SyncTaskResult::TransactionBegin(TransactionResult {
            state: TransactionOutcome::Committed,
        });
        assert_eq!(
            serde_json::to_value(&result).unwrap(),
            json!({"task": "transactionBegin", "state": "Committed"})
        );

        let error = SyncTaskResult::Error(TaskExecuteError::invalid_task("cursor not found"));
        assert_eq!(
            serde_json::to_value(&error).unwrap(),
            json!({"task": "error", "kind": "InvalidTask", "message": "cursor not found"})
        );
    }

    #[test]
    fn test_task_container() {
        let task = SyncTask::read("items", vec![JsonKey::from(1)]);
        assert_eq!(task.container(), Some("items"));
        assert_eq!(task.name(), "read");
        assert!(!task.is_mutation());
        assert!(SyncTask::delete_all("items").is_mutation());
        assert_eq!(SyncTask::TransactionBegin.container(), None);
    }
}
