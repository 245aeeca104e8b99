//! Transaction Management
//!
//! A transaction spans the tasks between `transactionBegin` and
//! `transactionCommit` / `transactionRollback` of one request. It is local
//! to the request's storage connection.
//!
//! Rollback works for every backend: before a key is written for the first
//! time inside the transaction, its previous value (or its absence) is
//! recorded in an undo journal. Rolling back replays the journal in reverse.
//!
//! Change events of writes inside a transaction are held back until commit
//! and discarded on rollback.

use crate::container::{self, EntityContainer, ExecutionMode};
use crate::context::SyncContext;
use crate::error::{TaskExecuteError, TaskResult};
use crate::events::ChangeEvent;
use crate::protocol::{DeleteEntities, UpsertEntities};
use crate::types::{JsonEntity, JsonKey, JsonValue};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

/// Transaction state of a request context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionState {
    Idle,
    Active,
}

/// Previous state of one written key
pub struct UndoRecord {
    pub container: Arc<dyn EntityContainer>,
    pub key: JsonKey,
    /// `None` if the key did not exist
    pub previous: Option<JsonValue>,
}

/// Undo journal of a transaction
#[derive(Default)]
pub struct UndoJournal {
    records: Vec<UndoRecord>,
    recorded: HashSet<(String, JsonKey)>,
}

impl UndoJournal {
    pub fn is_recorded(&self, container: &str, key: &JsonKey) -> bool {
        self.recorded.contains(&(container.to_string(), key.clone()))
    }

    /// Record the previous state of a key. Only the first write of a key
    /// is kept.
    pub fn record(&mut self, container: Arc<dyn EntityContainer>, key: JsonKey, previous: Option<JsonValue>) {
        if self.recorded.insert((container.name().to_string(), key.clone())) {
            self.records.push(UndoRecord {
                container,
                key,
                previous,
            });
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Active transaction of a request
pub struct Transaction {
    begin_index: usize,
    journal: UndoJournal,
    events: Vec<ChangeEvent>,
}

impl Transaction {
    pub fn new(begin_index: usize) -> Self {
        Transaction {
            begin_index,
            journal: UndoJournal::default(),
            events: Vec::new(),
        }
    }

    /// Index of the `transactionBegin` task
    pub fn begin_index(&self) -> usize {
        self.begin_index
    }

    pub fn journal(&self) -> &UndoJournal {
        &self.journal
    }

    pub fn journal_mut(&mut self) -> &mut UndoJournal {
        &mut self.journal
    }

    /// Hold back a change event until commit
    pub fn defer_event(&mut self, event: ChangeEvent) {
        self.events.push(event);
    }

    /// Keep all writes. Returns the deferred change events.
    pub fn commit(self) -> Vec<ChangeEvent> {
        self.events
    }

    /// Restore every recorded key. Returns the number of restored keys.
    pub async fn rollback(self, ctx: &SyncContext, mode: ExecutionMode) -> TaskResult<usize> {
        let total = self.journal.records.len();
        let mut failed = 0;

        for record in self.journal.records.into_iter().rev() {
            let name = record.container.name().to_string();
            let result = match record.previous {
                Some(value) => {
                    let command = UpsertEntities {
                        container: name,
                        entities: vec![JsonEntity { key: record.key, value }],
                    };
                    container::upsert(record.container.as_ref(), &command, ctx, mode).await
                }
                None => {
                    let command = DeleteEntities {
                        container: name,
                        ids: vec![record.key],
                        all: false,
                    };
                    container::delete(record.container.as_ref(), &command, ctx, mode).await
                }
            };
            match result {
                Ok(errors) if errors.errors.is_empty() => {}
                _ => failed += 1,
            }
        }

        if failed > 0 {
            return Err(TaskExecuteError::database(format!(
                "rollback failed for {} of {} entities",
                failed, total
            )));
        }
        Ok(total)
    }
}
