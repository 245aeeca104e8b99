//! Schema System
//!
//! Optional schema bound to a database. It names the containers of the
//! database and the entity type stored in each of them. Databases without a
//! schema accept any container name and any JSON document.

use crate::types::{JsonEntity, JsonKey, JsonValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Schema of a database: container name → entity type
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseSchema {
    containers: BTreeMap<String, EntityType>,
}

impl DatabaseSchema {
    pub fn new() -> Self {
        DatabaseSchema::default()
    }

    /// Parse a schema from JSON: `{"containers": {"<name>": <EntityType>}}`
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn with_container(mut self, name: &str, entity_type: EntityType) -> Self {
        self.containers.insert(name.to_string(), entity_type);
        self
    }

    pub fn has_container(&self, name: &str) -> bool {
        self.containers.contains_key(name)
    }

    pub fn entity_type(&self, container: &str) -> Option<&EntityType> {
        self.containers.get(container)
    }

    pub fn container_names(&self) -> Vec<String> {
        self.containers.keys().cloned().collect()
    }

    /// Validate one document stored in `container`
    pub fn validate_entity(&self, container: &str, value: &JsonValue) -> Result<(), String> {
        let entity_type = self
            .entity_type(container)
            .ok_or_else(|| format!("container not found: {}", container))?;
        let parsed = value.parse().map_err(|e| format!("invalid JSON: {}", e))?;
        entity_type.validate(&parsed)
    }

    /// Validate a batch, one error per invalid entity. Valid entities never
    /// depend on invalid siblings.
    pub fn validate_entities(&self, container: &str, entities: &[JsonEntity]) -> Vec<ValidationError> {
        entities
            .iter()
            .filter_map(|entity| {
                self.validate_entity(container, &entity.value)
                    .err()
                    .map(|message| ValidationError {
                        key: entity.key.clone(),
                        message,
                    })
            })
            .collect()
    }
}

/// Type of the entities in one container
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityType {
    #[serde(default = "default_key_name")]
    pub key_name: String,
    #[serde(default)]
    pub fields: Vec<Field>,
    #[serde(default)]
    pub allow_extra_fields: bool,
}

fn default_key_name() -> String {
    "id".to_string()
}

impl EntityType {
    pub fn new() -> Self {
        EntityType {
            key_name: default_key_name(),
            fields: Vec::new(),
            allow_extra_fields: false,
        }
    }

    pub fn with_key_name(mut self, key_name: &str) -> Self {
        self.key_name = key_name.to_string();
        self
    }

    pub fn with_field(mut self, field: Field) -> Self {
        self.fields.push(field);
        self
    }

    pub fn allow_extra_fields(mut self) -> Self {
        self.allow_extra_fields = true;
        self
    }

    pub fn get_field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Check a parsed document. Returns the first violation found.
    pub fn validate(&self, value: &Value) -> Result<(), String> {
        let members = value
            .as_object()
            .ok_or_else(|| format!("expect object, was {}", json_type_name(value)))?;

        for field in &self.fields {
            match members.get(&field.name) {
                None | Some(Value::Null) if field.required => {
                    return Err(format!("missing required field '{}'", field.name));
                }
                None | Some(Value::Null) => {}
                Some(v) if !field.field_type.matches(v) => {
                    return Err(format!(
                        "field '{}' expect {}, was {}",
                        field.name,
                        field.field_type,
                        json_type_name(v)
                    ));
                }
                Some(_) => {}
            }
        }

        if !self.allow_extra_fields {
            for name in members.keys() {
                if name != &self.key_name && self.get_field(name).is_none() {
                    return Err(format!("unknown field '{}'", name));
                }
            }
        }
        Ok(())
    }
}

impl Default for EntityType {
    fn default() -> Self {
        EntityType::new()
    }
}

/// Field definition within an entity type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
}

impl Field {
    pub fn new(name: &str, field_type: FieldType) -> Self {
        Field {
            name: name.to_string(),
            field_type,
            required: false,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// Supported field types
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    String,
    Integer,
    Number,
    Boolean,
    Object,
    Array(Box<FieldType>),
    Any,
}

impl FieldType {
    /// Check if a JSON value matches this type
    pub fn matches(&self, value: &Value) -> bool {
        match (self, value) {
            (FieldType::Any, _) => true,
            (FieldType::String, Value::String(_)) => true,
            (FieldType::Integer, Value::Number(n)) => n.is_i64() || n.is_u64(),
            // Allow integers for numbers
            (FieldType::Number, Value::Number(_)) => true,
            (FieldType::Boolean, Value::Bool(_)) => true,
            (FieldType::Object, Value::Object(_)) => true,
            (FieldType::Array(inner), Value::Array(items)) => items.iter().all(|item| inner.matches(item)),
            _ => false,
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::String => write!(f, "string"),
            FieldType::Integer => write!(f, "integer"),
            FieldType::Number => write!(f, "number"),
            FieldType::Boolean => write!(f, "boolean"),
            FieldType::Object => write!(f, "object"),
            FieldType::Array(inner) => write!(f, "array<{}>", inner),
            FieldType::Any => write!(f, "any"),
        }
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Schema violation of one entity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub key: JsonKey,
    pub message: String,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.key, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn article_schema() -> DatabaseSchema {
        DatabaseSchema::new().with_container(
            "articles",
            EntityType::new()
                .with_field(Field::new("name", FieldType::String).required())
                .with_field(Field::new("price", FieldType::Number))
                .with_field(Field::new("tags", FieldType::Array(Box::new(FieldType::String)))),
        )
    }

    #[test]
    fn test_valid_entity() {
        let schema = article_schema();
        let value = JsonValue::from_value(&json!({"id": 1, "name": "pen", "price": 2, "tags": ["a"]}));
        assert!(schema.validate_entity("articles", &value).is_ok());
    }

    #[test]
    fn test_required_field_missing() {
        let schema = article_schema();
        let value = JsonValue::from_value(&json!({"price": 2.5}));
        assert_eq!(
            schema.validate_entity("articles", &value),
            Err("missing required field 'name'".to_string())
        );
    }

    #[test]
    fn test_type_mismatch_and_unknown_field() {
        let schema = article_schema();
        let wrong_type = JsonValue::from_value(&json!({"name": 5}));
        assert_eq!(
            schema.validate_entity("articles", &wrong_type),
            Err("field 'name' expect string, was number".to_string())
        );

        let extra = JsonValue::from_value(&json!({"name": "pen", "color": "red"}));
        assert_eq!(
            schema.validate_entity("articles", &extra),
            Err("unknown field 'color'".to_string())
        );
    }

    #[test]
    fn test_validate_entities_reports_each_invalid() {
        let schema = article_schema();
        let entities = vec![
            JsonEntity::new(1, json!({"name": "ok"})),
            JsonEntity::new(2, json!({})),
            JsonEntity::new(3, json!("text")),
        ];
        let errors = schema.validate_entities("articles", &entities);
        let keys: Vec<_> = errors.iter().map(|e| e.key.clone()).collect();
        assert_eq!(keys, vec![JsonKey::from(2), JsonKey::from(3)]);
    }

    #[test]
    fn test_schema_from_json() {
        let schema = DatabaseSchema::from_json(
            r#"{"containers": {"users": {"fields": [{"name": "age", "field_type": "Integer", "required": true}]}}}"#,
        )
        .unwrap();
        assert!(schema.has_container("users"));
        assert_eq!(schema.entity_type("users").unwrap().key_name, "id");
        assert!(schema
            .validate_entity("users", &JsonValue::from_value(&json!({"age": 1.5})))
            .is_err());
    }
}
