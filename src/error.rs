//! Error types
//!
//! Two orthogonal channels: `TaskExecuteError` voids a whole task,
//! `EntityError` voids a single key inside an otherwise successful task.
//! `HubError` covers failures outside of task execution.

use crate::types::JsonKey;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Kind of a task level failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskErrorType {
    Error,
    ValidationError,
    InvalidTask,
    DatabaseError,
    FilterError,
    NotImplemented,
    PermissionDenied,
}

impl fmt::Display for TaskErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskErrorType::Error => "Error",
            TaskErrorType::ValidationError => "ValidationError",
            TaskErrorType::InvalidTask => "InvalidTask",
            TaskErrorType::DatabaseError => "DatabaseError",
            TaskErrorType::FilterError => "FilterError",
            TaskErrorType::NotImplemented => "NotImplemented",
            TaskErrorType::PermissionDenied => "PermissionDenied",
        };
        f.write_str(name)
    }
}

/// Failure that voids an entire task. Sibling tasks are unaffected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind} ~ {message}")]
pub struct TaskExecuteError {
    pub kind: TaskErrorType,
    pub message: String,
    /// User the failure is attributed to (set for permission failures)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl TaskExecuteError {
    pub fn new(kind: TaskErrorType, message: impl Into<String>) -> Self {
        TaskExecuteError {
            kind,
            message: message.into(),
            user_id: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(TaskErrorType::Error, message)
    }

    pub fn invalid_task(message: impl Into<String>) -> Self {
        Self::new(TaskErrorType::InvalidTask, message)
    }

    pub fn database(message: impl Into<String>) -> Self {
        Self::new(TaskErrorType::DatabaseError, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(TaskErrorType::ValidationError, message)
    }

    pub fn filter(message: impl Into<String>) -> Self {
        Self::new(TaskErrorType::FilterError, message)
    }

    pub fn not_implemented(message: impl Into<String>) -> Self {
        Self::new(TaskErrorType::NotImplemented, message)
    }

    pub fn permission_denied(message: impl Into<String>, user_id: Option<String>) -> Self {
        TaskExecuteError {
            kind: TaskErrorType::PermissionDenied,
            message: message.into(),
            user_id,
        }
    }
}

/// Kind of a per entity failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityErrorType {
    WriteError,
    ReadError,
    DeleteError,
    PatchError,
    ParseError,
}

impl fmt::Display for EntityErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntityErrorType::WriteError => "WriteError",
            EntityErrorType::ReadError => "ReadError",
            EntityErrorType::DeleteError => "DeleteError",
            EntityErrorType::PatchError => "PatchError",
            EntityErrorType::ParseError => "ParseError",
        };
        f.write_str(name)
    }
}

/// Failure for one key inside a batch task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind}: [{key}], {message}")]
pub struct EntityError {
    pub key: JsonKey,
    pub kind: EntityErrorType,
    pub message: String,
}

impl EntityError {
    pub fn new(key: JsonKey, kind: EntityErrorType, message: impl Into<String>) -> Self {
        EntityError {
            key,
            kind,
            message: message.into(),
        }
    }
}

/// Errors raised outside of task execution
#[derive(Debug, Error)]
pub enum HubError {
    #[error("database not found: {0}")]
    DatabaseNotFound(String),

    #[error("database already registered: {0}")]
    DatabaseExists(String),

    #[error("invalid handler name '{0}'")]
    InvalidHandlerName(String),

    #[error("handler name '{0}' uses the reserved prefix 'std.'")]
    ReservedHandlerName(String),

    #[error("handler already registered: {0}")]
    DuplicateHandler(String),

    #[error("request was dropped before completion")]
    RequestDropped,

    #[error("request execution failed: {0}")]
    Execution(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type HubResult<T> = Result<T, HubError>;

/// Result of a single task operation
pub type TaskResult<T> = Result<T, TaskExecuteError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_error_display() {
        let err = TaskExecuteError::invalid_task("cursor not found");
        assert_eq!(err.to_string(), "InvalidTask ~ cursor not found");
    }

    #[test]
    fn test_permission_denied_carries_user() {
        let err = TaskExecuteError::permission_denied("not authorized", Some("bob".to_string()));
        assert_eq!(err.kind, TaskErrorType::PermissionDenied);
        assert_eq!(err.user_id.as_deref(), Some("bob"));
    }

    #[test]
    fn test_entity_error_display() {
        let err = EntityError::new(JsonKey::from(7), EntityErrorType::PatchError, "entity not found");
        assert_eq!(err.to_string(), "PatchError: [7], entity not found");
    }
}
