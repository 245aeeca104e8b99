//! Compiled query filters
//!
//! Filter expressions are compiled outside of the hub. A `Filter` wraps the
//! resulting predicate together with its source text, which is only used for
//! diagnostics and serialization.

use crate::types::JsonValue;
use serde::{Serialize, Serializer};
use std::fmt;
use std::sync::Arc;

type Predicate = dyn Fn(&serde_json::Value) -> Result<bool, String> + Send + Sync;

/// Boolean filter evaluated against stored entity values
#[derive(Clone)]
pub struct Filter {
    source: String,
    predicate: Option<Arc<Predicate>>,
}

impl Filter {
    /// The unconditional filter: every entity matches
    pub fn all() -> Self {
        Filter {
            source: "true".to_string(),
            predicate: None,
        }
    }

    pub fn new<F>(source: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&serde_json::Value) -> Result<bool, String> + Send + Sync + 'static,
    {
        Filter {
            source: source.into(),
            predicate: Some(Arc::new(predicate)),
        }
    }

    /// Filter comparing one top level field against a value
    pub fn field_equals(field: &str, expected: serde_json::Value) -> Self {
        let name = field.to_string();
        Filter::new(format!(".{} == {}", field, expected), move |value| {
            Ok(value.get(&name) == Some(&expected))
        })
    }

    /// True if the filter matches every entity without evaluation
    pub fn is_unconditional(&self) -> bool {
        self.predicate.is_none()
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate against a serialized entity
    pub fn matches(&self, value: &JsonValue) -> Result<bool, String> {
        let predicate = match &self.predicate {
            None => return Ok(true),
            Some(p) => p,
        };
        let parsed = value.parse().map_err(|e| format!("invalid JSON: {}", e))?;
        predicate(&parsed)
    }
}

impl Default for Filter {
    fn default() -> Self {
        Filter::all()
    }
}

impl fmt::Debug for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Filter({})", self.source)
    }
}

impl Serialize for Filter {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.source)
    }
}
