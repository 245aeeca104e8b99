//! In-memory container backend
//!
//! Entities are kept in a `BTreeMap` so enumeration follows key order.
//! Values at or below `inline_copy_threshold` bytes are copied on every
//! read and write; larger values are shared by reference since stored
//! values are never mutated.

use crate::config::HubConfig;
use crate::container::{ContainerCapabilities, EntityContainer, QueryCollector, QueryPage};
use crate::context::SyncContext;
use crate::cursor::CursorTable;
use crate::database::ContainerFactory;
use crate::error::{EntityError, EntityErrorType, TaskResult};
use crate::merge::{self, Current};
use crate::protocol::{
    CreateEntities, DeleteEntities, EntityErrors, MergeEntities, QueryEntities, ReadEntities,
    UpsertEntities,
};
use crate::types::{EntityValue, JsonKey, JsonValue};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

pub struct MemoryContainer {
    name: String,
    key_name: String,
    entities: RwLock<BTreeMap<JsonKey, JsonValue>>,
    inline_copy_threshold: usize,
    cursors: CursorTable,
}

impl MemoryContainer {
    pub fn new(name: &str, key_name: &str, config: &HubConfig) -> Self {
        MemoryContainer {
            name: name.to_string(),
            key_name: key_name.to_string(),
            entities: RwLock::new(BTreeMap::new()),
            inline_copy_threshold: config.memory.inline_copy_threshold,
            cursors: CursorTable::new(config.cursors.ttl()),
        }
    }

    fn copy_value(&self, value: &JsonValue) -> JsonValue {
        if value.len() <= self.inline_copy_threshold {
            value.deep_copy()
        } else {
            value.clone()
        }
    }

    pub fn len(&self) -> usize {
        self.entities.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.read().is_empty()
    }
}

impl EntityContainer for MemoryContainer {
    fn name(&self) -> &str {
        &self.name
    }

    fn key_name(&self) -> &str {
        &self.key_name
    }

    fn capabilities(&self) -> ContainerCapabilities {
        ContainerCapabilities {
            sync: true,
            native_count: true,
            native_merge: true,
        }
    }

    fn cursors(&self) -> &CursorTable {
        &self.cursors
    }

    fn create_entities(&self, command: &CreateEntities, _ctx: &SyncContext) -> TaskResult<EntityErrors> {
        let mut entities = self.entities.write();
        let mut errors = Vec::new();
        for entity in &command.entities {
            if entities.contains_key(&entity.key) {
                errors.push(EntityError::new(
                    entity.key.clone(),
                    EntityErrorType::WriteError,
                    "entity already exists",
                ));
                continue;
            }
            entities.insert(entity.key.clone(), self.copy_value(&entity.value));
        }
        Ok(EntityErrors { errors })
    }

    fn upsert_entities(&self, command: &UpsertEntities, _ctx: &SyncContext) -> TaskResult<EntityErrors> {
        let mut entities = self.entities.write();
        for entity in &command.entities {
            entities.insert(entity.key.clone(), self.copy_value(&entity.value));
        }
        Ok(EntityErrors::default())
    }

    fn read_entities(&self, command: &ReadEntities, _ctx: &SyncContext) -> TaskResult<Vec<EntityValue>> {
        let entities = self.entities.read();
        Ok(command
            .ids
            .iter()
            .map(|key| match entities.get(key) {
                Some(value) => EntityValue::with_value(key.clone(), self.copy_value(value)),
                None => EntityValue::missing(key.clone()),
            })
            .collect())
    }

    fn query_entities(&self, command: &QueryEntities, ctx: &SyncContext) -> TaskResult<QueryPage> {
        let mut collector = QueryCollector::new(command, &self.cursors, ctx.user_id())?;
        let entities = self.entities.read();
        let lower = match collector.start_after() {
            Some(key) => Bound::Excluded(key.clone()),
            None => Bound::Unbounded,
        };
        let mut iter = entities.range((lower, Bound::Unbounded)).peekable();
        let mut has_more = false;
        while let Some((key, value)) = iter.next() {
            if collector.accept(key.clone(), &self.copy_value(value))?.is_some() {
                has_more = iter.peek().is_some();
                break;
            }
        }
        Ok(collector.finish(has_more))
    }

    fn delete_entities(&self, command: &DeleteEntities, _ctx: &SyncContext) -> TaskResult<EntityErrors> {
        let mut entities = self.entities.write();
        if command.all {
            entities.clear();
        } else {
            for key in &command.ids {
                entities.remove(key);
            }
        }
        Ok(EntityErrors::default())
    }

    fn count_all(&self, _ctx: &SyncContext) -> TaskResult<usize> {
        Ok(self.entities.read().len())
    }

    /// Single pass merge under the write lock
    fn merge_entities(&self, command: &MergeEntities, ctx: &SyncContext) -> TaskResult<EntityErrors> {
        let mut entities = self.entities.write();
        let mut errors = Vec::new();
        let candidates = {
            let mut patcher = ctx.pools().patchers.acquire();
            merge::apply_patches(
                &command.patches,
                |key| match entities.get(key) {
                    Some(value) => Current::Value(value.clone()),
                    None => Current::Missing,
                },
                &mut patcher,
                &mut errors,
            )
        };
        let candidates = merge::validate_candidates(ctx.database().schema(), &self.name, candidates, &mut errors);
        for candidate in candidates {
            let value = self.copy_value(&candidate.value);
            entities.insert(candidate.key, value);
        }
        Ok(EntityErrors { errors })
    }
}

/// Creates `MemoryContainer`s
pub struct MemoryBackend {
    config: HubConfig,
}

impl MemoryBackend {
    pub fn new(config: &HubConfig) -> Self {
        MemoryBackend { config: config.clone() }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        MemoryBackend::new(&HubConfig::default())
    }
}

impl ContainerFactory for MemoryBackend {
    fn kind(&self) -> &'static str {
        "memory"
    }

    fn create_container(&self, name: &str, key_name: &str) -> Arc<dyn EntityContainer> {
        Arc::new(MemoryContainer::new(name, key_name, &self.config))
    }
}
