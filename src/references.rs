//! Foreign key resolution
//!
//! Read and query tasks may carry a tree of `References`. For each level the
//! resolver parses every loaded entity once, evaluates all selectors of the
//! level on it, deduplicates the collected keys per reference and issues a
//! single batched read per reference. Nested references recurse on the
//! entities just read.
//!
//! A failing branch records an error string and leaves its siblings alone.
//! An entity whose selector cannot be evaluated gets a `ParseError` in place
//! of its value.

use crate::container::{self, ExecutionMode};
use crate::context::SyncContext;
use crate::database::Database;
use crate::error::{EntityError, EntityErrorType};
use crate::protocol::{KeyOrder, References, ReferencesResult};
use crate::types::{EntityState, EntityValue, JsonKey};
use futures_util::future::BoxFuture;
use serde_json::Value;
use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Step {
    Field(String),
    AllItems,
    Item(usize),
}

/// Compiled selector path such as `.items[*].article`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    steps: Vec<Step>,
}

impl Selector {
    pub fn parse(path: &str) -> Result<Selector, String> {
        let mut steps = Vec::new();
        let mut rest = path.strip_prefix('.').unwrap_or(path);
        if rest.is_empty() {
            return Err(format!("invalid selector '{}': empty path", path));
        }
        while !rest.is_empty() {
            if let Some(after) = rest.strip_prefix('[') {
                let end = after
                    .find(']')
                    .ok_or_else(|| format!("invalid selector '{}': missing ']'", path))?;
                let index = &after[..end];
                if index == "*" {
                    steps.push(Step::AllItems);
                } else {
                    let index = index
                        .parse::<usize>()
                        .map_err(|_| format!("invalid selector '{}': bad index '{}'", path, index))?;
                    steps.push(Step::Item(index));
                }
                rest = &after[end + 1..];
                rest = rest.strip_prefix('.').unwrap_or(rest);
            } else {
                let end = rest.find(|c: char| c == '.' || c == '[').unwrap_or(rest.len());
                let name = &rest[..end];
                if name.is_empty() {
                    return Err(format!("invalid selector '{}': empty field name", path));
                }
                steps.push(Step::Field(name.to_string()));
                rest = &rest[end..];
                if rest.starts_with('.') {
                    rest = &rest[1..];
                    if rest.is_empty() {
                        return Err(format!("invalid selector '{}': trailing '.'", path));
                    }
                }
            }
        }
        Ok(Selector { steps })
    }

    /// Values selected from `root`
    pub fn select<'v>(&self, root: &'v Value) -> Vec<&'v Value> {
        let mut current = vec![root];
        for step in &self.steps {
            let mut next = Vec::new();
            for value in current {
                match (step, value) {
                    (Step::Field(name), Value::Object(members)) => next.extend(members.get(name)),
                    (Step::AllItems, Value::Array(items)) => next.extend(items.iter()),
                    (Step::Item(index), Value::Array(items)) => next.extend(items.get(*index)),
                    _ => {}
                }
            }
            current = next;
        }
        current
    }

    /// Keys selected from `root`. `null` values are skipped.
    pub fn select_keys(&self, root: &Value) -> Result<Vec<JsonKey>, String> {
        let mut keys = Vec::new();
        for value in self.select(root) {
            if value.is_null() {
                continue;
            }
            match JsonKey::from_value(value) {
                Some(key) => keys.push(key),
                None => return Err(format!("expect string or integer key, was {}", value)),
            }
        }
        Ok(keys)
    }
}

/// Keys collected for one reference, deduplicated
#[derive(Default)]
struct KeySet {
    keys: Vec<JsonKey>,
    seen: HashSet<JsonKey>,
}

impl KeySet {
    fn extend(&mut self, keys: Vec<JsonKey>) {
        for key in keys {
            if self.seen.insert(key.clone()) {
                self.keys.push(key);
            }
        }
    }

    fn into_ordered(mut self, order: KeyOrder) -> Vec<JsonKey> {
        match order {
            KeyOrder::Unordered => {}
            KeyOrder::Ascending => self.keys.sort(),
            KeyOrder::Descending => self.keys.sort_by(|a, b| b.cmp(a)),
        }
        self.keys
    }
}

/// Resolve `references` for `entities`
pub async fn resolve(
    entities: &mut [EntityValue],
    references: &[References],
    database: &Database,
    ctx: &SyncContext,
    mode: ExecutionMode,
) -> Vec<ReferencesResult> {
    resolve_level(entities, references, String::new(), database, ctx, mode).await
}

fn resolve_level<'a>(
    entities: &'a mut [EntityValue],
    references: &'a [References],
    parent_path: String,
    database: &'a Database,
    ctx: &'a SyncContext,
    mode: ExecutionMode,
) -> BoxFuture<'a, Vec<ReferencesResult>> {
    Box::pin(async move {
        if references.is_empty() {
            return Vec::new();
        }
        let selectors: Vec<Result<Selector, String>> =
            references.iter().map(|r| Selector::parse(&r.selector)).collect();
        let key_sets = collect_keys(entities, references, &selectors);

        let mut results = Vec::with_capacity(references.len());
        for ((reference, selector), keys) in references.iter().zip(&selectors).zip(key_sets) {
            let path = format!("{}{}", parent_path, reference.selector);
            let mut result = ReferencesResult {
                container: reference.container.clone(),
                key_name: reference.key_name.clone(),
                path: path.clone(),
                ..Default::default()
            };
            if let Err(message) = selector {
                result.error = Some(message.clone());
                results.push(result);
                continue;
            }
            let ids = keys.into_ordered(reference.order);
            if ids.is_empty() {
                results.push(result);
                continue;
            }
            let target = match database.container(&reference.container) {
                Ok(target) => target,
                Err(error) => {
                    result.error = Some(format!("read references failed at '{}': {}", path, error.message));
                    results.push(result);
                    continue;
                }
            };
            match container::read_keys(target.as_ref(), ids, ctx, mode).await {
                Ok(mut read) => {
                    let nested_path = format!("{} > ", path);
                    result.references =
                        resolve_level(&mut read, &reference.references, nested_path, database, ctx, mode).await;
                    result.entities = read;
                }
                Err(error) => {
                    result.error = Some(format!("read references failed at '{}': {}", path, error.message));
                }
            }
            results.push(result);
        }
        results
    })
}

/// One pass over the entities: parse each once and run every selector
fn collect_keys(
    entities: &mut [EntityValue],
    references: &[References],
    selectors: &[Result<Selector, String>],
) -> Vec<KeySet> {
    let mut key_sets: Vec<KeySet> = references.iter().map(|_| KeySet::default()).collect();
    for entity in entities.iter_mut() {
        let value = match &entity.state {
            EntityState::Value(value) => value,
            _ => continue,
        };
        let parsed = match value.parse() {
            Ok(parsed) => parsed,
            Err(e) => {
                let error = EntityError::new(entity.key.clone(), EntityErrorType::ParseError, format!("invalid JSON: {}", e));
                entity.set_error(error);
                continue;
            }
        };
        let mut selected = Vec::with_capacity(references.len());
        let mut failure = None;
        for (reference, selector) in references.iter().zip(selectors) {
            let keys = match selector {
                Ok(selector) => selector.select_keys(&parsed),
                Err(_) => Ok(Vec::new()),
            };
            match keys {
                Ok(keys) => selected.push(keys),
                Err(message) => {
                    failure = Some(format!("reference '{}' {}", reference.selector, message));
                    break;
                }
            }
        }
        match failure {
            Some(message) => {
                let error = EntityError::new(entity.key.clone(), EntityErrorType::ParseError, message);
                entity.set_error(error);
            }
            None => {
                for (set, keys) in key_sets.iter_mut().zip(selected) {
                    set.extend(keys);
                }
            }
        }
    }
    key_sets
}
