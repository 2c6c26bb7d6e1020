//! A lightweight structural-predicate schema check.
//!
//! Schema validation is treated as a predicate at the component boundary,
//! not a JSON Schema engine (no `$ref`, `oneOf`, `allOf`, numeric ranges
//! beyond type). It checks the shape that
//! actually matters for wire messages in this system: which fields must be
//! present, and their primitive JSON type.

use serde_json::Value;
use std::collections::HashMap;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FieldType {
    String,
    Number,
    Bool,
    Object,
    Array,
    Any,
}

impl FieldType {
    fn matches(&self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Number => value.is_number(),
            FieldType::Bool => value.is_boolean(),
            FieldType::Object => value.is_object(),
            FieldType::Array => value.is_array(),
            FieldType::Any => true,
        }
    }
}

/// Required top-level fields and their expected primitive types.
#[derive(Clone, Debug, Default)]
pub struct Schema {
    required: HashMap<String, FieldType>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn require(mut self, field: impl Into<String>, ty: FieldType) -> Self {
        self.required.insert(field.into(), ty);
        self
    }

    pub fn validate(&self, message: &Value) -> bool {
        let Some(object) = message.as_object() else {
            return self.required.is_empty();
        };
        self.required.iter().all(|(field, ty)| {
            object.get(field).map(|v| ty.matches(v)).unwrap_or(false)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_required_field_fails() {
        let schema = Schema::new().require("Uuid", FieldType::String);
        assert!(!schema.validate(&json!({"State": "SUCCESS"})));
    }

    #[test]
    fn wrong_type_fails() {
        let schema = Schema::new().require("Uuid", FieldType::String);
        assert!(!schema.validate(&json!({"Uuid": 5})));
    }

    #[test]
    fn satisfied_schema_passes() {
        let schema = Schema::new()
            .require("Uuid", FieldType::String)
            .require("State", FieldType::String);
        assert!(schema.validate(&json!({"Uuid": "abc", "State": "SUCCESS"})));
    }
}
