//! JSON merge patch (RFC 7396)
//!
//! The generic merge pipeline reads the patched keys, applies the patches,
//! validates the candidates against the database schema and writes them
//! back with an upsert. Backends with a native merge reuse
//! `apply_patches` and `validate_candidates`, so both paths report the same
//! entity errors for the same input.

use crate::container::{self, EntityContainer, ExecutionMode};
use crate::context::SyncContext;
use crate::error::{EntityError, EntityErrorType, TaskResult};
use crate::protocol::{EntityErrors, EntityPatch, MergeEntities, UpsertEntities};
use crate::schema::DatabaseSchema;
use crate::types::{EntityState, JsonEntity, JsonKey, JsonValue};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

/// Apply `patch` to `target` in place
pub fn merge_patch(target: &mut Value, patch: &Value) {
    let patch_members = match patch {
        Value::Object(members) => members,
        other => {
            *target = other.clone();
            return;
        }
    };
    if !target.is_object() {
        *target = Value::Object(serde_json::Map::new());
    }
    if let Value::Object(target_members) = target {
        for (name, value) in patch_members {
            if value.is_null() {
                target_members.remove(name);
            } else {
                let entry = target_members.entry(name.clone()).or_insert(Value::Null);
                merge_patch(entry, value);
            }
        }
    }
}

/// Reusable patch applier. Checked out from `SharedPools::patchers`.
#[derive(Default)]
pub struct Patcher {
    output: Vec<u8>,
}

impl Patcher {
    pub fn reset(&mut self) {
        self.output.clear();
    }

    /// Merge `patch` into `current` and serialize the result
    pub fn apply(&mut self, current: &JsonValue, patch: &JsonValue) -> Result<JsonValue, String> {
        let mut target = current
            .parse()
            .map_err(|e| format!("invalid stored JSON: {}", e))?;
        let patch = patch.parse().map_err(|e| format!("invalid patch: {}", e))?;
        merge_patch(&mut target, &patch);

        self.output.clear();
        serde_json::to_writer(&mut self.output, &target).map_err(|e| e.to_string())?;
        Ok(JsonValue::from_bytes(self.output.as_slice()))
    }
}

/// Current stored state of a patched key
pub enum Current {
    Value(JsonValue),
    Missing,
    /// Reading the key failed
    Failed(String),
}

impl From<&EntityState> for Current {
    fn from(state: &EntityState) -> Self {
        match state {
            EntityState::Value(v) => Current::Value(v.clone()),
            EntityState::Missing => Current::Missing,
            EntityState::Error(e) => Current::Failed(e.message.clone()),
        }
    }
}

fn patch_error(key: &JsonKey, message: impl Into<String>) -> EntityError {
    EntityError::new(key.clone(), EntityErrorType::PatchError, message)
}

/// Apply patches in order. A key patched twice sees the result of the
/// first patch. Failed keys are reported in `errors` and skipped.
pub fn apply_patches<F>(
    patches: &[EntityPatch],
    mut current: F,
    patcher: &mut Patcher,
    errors: &mut Vec<EntityError>,
) -> Vec<JsonEntity>
where
    F: FnMut(&JsonKey) -> Current,
{
    let mut candidates: Vec<JsonEntity> = Vec::with_capacity(patches.len());
    let mut positions: HashMap<JsonKey, usize> = HashMap::new();
    // keys already failed keep failing for later patches
    let mut failed: HashSet<JsonKey> = HashSet::new();

    for patch in patches {
        if failed.contains(&patch.key) {
            continue;
        }
        let state = match positions.get(&patch.key) {
            Some(&pos) => Current::Value(candidates[pos].value.clone()),
            None => current(&patch.key),
        };
        let stored = match state {
            Current::Value(value) if value.is_null() => Err(patch_error(&patch.key, "entity is null")),
            Current::Value(value) => Ok(value),
            Current::Missing => Err(patch_error(&patch.key, "patch target not found")),
            Current::Failed(message) => Err(patch_error(&patch.key, format!("read failed: {}", message))),
        };
        let merged = stored.and_then(|value| {
            patcher
                .apply(&value, &patch.patch)
                .map_err(|message| patch_error(&patch.key, message))
        });
        match merged {
            Ok(value) => match positions.get(&patch.key) {
                Some(&pos) => candidates[pos].value = value,
                None => {
                    positions.insert(patch.key.clone(), candidates.len());
                    candidates.push(JsonEntity { key: patch.key.clone(), value });
                }
            },
            Err(error) => {
                if let Some(pos) = positions.remove(&patch.key) {
                    candidates.remove(pos);
                    for p in positions.values_mut() {
                        if *p > pos {
                            *p -= 1;
                        }
                    }
                }
                failed.insert(patch.key.clone());
                errors.push(error);
            }
        }
    }
    candidates
}

/// Validate each candidate on its own. Invalid ones are reported in
/// `errors` and removed.
pub fn validate_candidates(
    schema: Option<&DatabaseSchema>,
    container: &str,
    candidates: Vec<JsonEntity>,
    errors: &mut Vec<EntityError>,
) -> Vec<JsonEntity> {
    let schema = match schema {
        Some(schema) => schema,
        None => return candidates,
    };
    candidates
        .into_iter()
        .filter(|candidate| match schema.validate_entity(container, &candidate.value) {
            Ok(()) => true,
            Err(message) => {
                errors.push(patch_error(&candidate.key, format!("validation failed: {}", message)));
                false
            }
        })
        .collect()
}

/// Generic read → patch → validate → upsert pipeline
pub async fn merge_entities(
    c: &dyn EntityContainer,
    command: &MergeEntities,
    ctx: &SyncContext,
    mode: ExecutionMode,
) -> TaskResult<EntityErrors> {
    let mut ids: Vec<JsonKey> = Vec::with_capacity(command.patches.len());
    for patch in &command.patches {
        if !ids.contains(&patch.key) {
            ids.push(patch.key.clone());
        }
    }
    let read = container::read_keys(c, ids, ctx, mode).await?;
    let stored: HashMap<JsonKey, EntityState> = read.into_iter().map(|e| (e.key, e.state)).collect();

    let mut errors = Vec::new();
    let candidates = {
        let mut patcher = ctx.pools().patchers.acquire();
        apply_patches(
            &command.patches,
            |key| stored.get(key).map(Current::from).unwrap_or(Current::Missing),
            &mut patcher,
            &mut errors,
        )
    };
    let candidates = validate_candidates(ctx.database().schema(), c.name(), candidates, &mut errors);

    if !candidates.is_empty() {
        let upsert = UpsertEntities {
            container: command.container.clone(),
            entities: candidates,
        };
        let written = container::upsert(c, &upsert, ctx, mode).await?;
        errors.extend(written.errors);
    }
    Ok(EntityErrors { errors })
}
