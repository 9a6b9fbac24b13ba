use chrono::DateTime;
use serde_json::Value;

use crate::error::{Result, SchemaError};
use crate::schema::{BsonType, FieldSpec, JsonSchema, Record};

const MAX_COLLECTION_NAME_LEN: usize = 120;

/// Name and document checks shared by the catalog and the storage backends
#[derive(Debug, Copy, Clone)]
pub struct DocumentValidator;

impl DocumentValidator {
    /// Validate a collection name.
    ///
    /// Names are restricted to ASCII letters, digits, `_` and `-` so they can
    /// be used verbatim as identifiers by every backend.
    pub fn validate_collection_name(name: &str) -> Result<()> {
        if name.trim().is_empty() {
            return Err(SchemaError::InvalidDefinition(
                "Collection name cannot be empty".to_string(),
            ));
        }

        if name.len() > MAX_COLLECTION_NAME_LEN {
            return Err(SchemaError::InvalidDefinition(format!(
                "Collection name too long (max {MAX_COLLECTION_NAME_LEN} bytes): {name}"
            )));
        }

        if name.starts_with("system.") {
            return Err(SchemaError::InvalidDefinition(format!(
                "Collection name uses the reserved system prefix: {name}"
            )));
        }

        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(SchemaError::InvalidDefinition(format!(
                "Collection name contains invalid characters: {name:?}"
            )));
        }

        Ok(())
    }

    /// Validate a field name: an ASCII identifier
    pub fn validate_field_name(name: &str) -> Result<()> {
        let mut chars = name.chars();
        let valid = match chars.next() {
            Some(first) => {
                (first.is_ascii_alphabetic() || first == '_')
                    && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
            }
            None => false,
        };

        if valid {
            Ok(())
        } else {
            Err(SchemaError::InvalidDefinition(format!(
                "Invalid field name: {name:?}"
            )))
        }
    }

    /// Check a schema for internal consistency
    pub fn validate_schema(collection: &str, schema: &JsonSchema) -> Result<()> {
        if schema.bson_type != BsonType::Object {
            return Err(SchemaError::InvalidDefinition(format!(
                "{collection}: top-level bsonType must be object, got {}",
                schema.bson_type
            )));
        }

        for name in schema.properties.keys() {
            Self::validate_field_name(name)?;
        }

        for required in &schema.required {
            if !schema.properties.contains_key(required) {
                return Err(SchemaError::InvalidDefinition(format!(
                    "{collection}: required field '{required}' is not declared in properties"
                )));
            }
        }

        Ok(())
    }

    /// Every way `record` breaks `schema`. Empty when the document is valid.
    ///
    /// Fields not declared in the schema are accepted, as the engine does
    /// for validators without `additionalProperties`.
    #[must_use]
    pub fn violations(schema: &JsonSchema, record: &Record) -> Vec<String> {
        let mut violations = Vec::new();

        for required in &schema.required {
            if !record.contains_key(required) {
                violations.push(format!("missing required field '{required}'"));
            }
        }

        for (name, spec) in &schema.properties {
            if let Some(value) = record.get(name) {
                check_value(name, spec, value, &mut violations);
            }
        }

        violations
    }

    /// Reject `record` if it breaks the schema of `collection`
    pub fn validate_document(collection: &str, schema: &JsonSchema, record: &Record) -> Result<()> {
        let violations = Self::violations(schema, record);
        if violations.is_empty() {
            Ok(())
        } else {
            Err(SchemaError::DocumentValidation {
                collection: collection.to_string(),
                violations,
            })
        }
    }

    /// Whether `value` has the given storage type
    #[must_use]
    pub fn matches_type(bson_type: BsonType, value: &Value) -> bool {
        match bson_type {
            BsonType::String => value.is_string(),
            BsonType::Array => value.is_array(),
            BsonType::Date => is_extended_json_date(value),
            BsonType::Object => value.is_object() && !is_extended_json_date(value),
        }
    }
}

fn check_value(path: &str, spec: &FieldSpec, value: &Value, violations: &mut Vec<String>) {
    if !DocumentValidator::matches_type(spec.bson_type, value) {
        violations.push(format!(
            "field '{path}' must be of type {}, got {}",
            spec.bson_type,
            describe(value)
        ));
        return;
    }

    if let (Some(items), Value::Array(elements)) = (&spec.items, value) {
        for (i, element) in elements.iter().enumerate() {
            check_value(&format!("{path}.{i}"), items, element, violations);
        }
    }
}

// Accepts the relaxed and canonical extended JSON forms of a date.
fn is_extended_json_date(value: &Value) -> bool {
    let Some(map) = value.as_object() else {
        return false;
    };
    if map.len() != 1 {
        return false;
    }
    match map.get("$date") {
        Some(Value::String(text)) => DateTime::parse_from_rfc3339(text).is_ok(),
        Some(Value::Number(n)) => n.is_i64(),
        Some(Value::Object(inner)) => match (inner.len(), inner.get("$numberLong")) {
            (1, Some(Value::String(millis))) => millis.parse::<i64>().is_ok(),
            _ => false,
        },
        _ => false,
    }
}

fn describe(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) if is_extended_json_date(value) => "date",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Record {
        match value {
            Value::Object(map) => map,
            _ => Record::new(),
        }
    }

    #[test]
    fn test_date_forms() {
        assert!(DocumentValidator::matches_type(
            BsonType::Date,
            &json!({"$date": "2023-05-01T10:00:00Z"})
        ));
        assert!(DocumentValidator::matches_type(BsonType::Date, &json!({"$date": 1_682_935_200_000_i64})));
        assert!(DocumentValidator::matches_type(
            BsonType::Date,
            &json!({"$date": {"$numberLong": "1682935200000"}})
        ));
        assert!(!DocumentValidator::matches_type(BsonType::Date, &json!("2023-05-01")));
        assert!(!DocumentValidator::matches_type(BsonType::Date, &json!({"$date": "yesterday"})));
    }

    #[test]
    fn test_date_is_not_an_object() {
        assert!(!DocumentValidator::matches_type(
            BsonType::Object,
            &json!({"$date": "2023-05-01T10:00:00Z"})
        ));
        assert!(DocumentValidator::matches_type(BsonType::Object, &json!({"urls": 3})));
    }

    #[test]
    fn test_array_items_are_checked() {
        let schema = JsonSchema::default().property(
            "colonnes",
            FieldSpec::new(BsonType::Array).of(FieldSpec::new(BsonType::String)),
        );
        let violations =
            DocumentValidator::violations(&schema, &record(json!({"colonnes": ["a", 2, "c"]})));
        assert_eq!(violations, vec!["field 'colonnes.1' must be of type string, got number"]);
    }

    #[test]
    fn test_null_is_not_a_string() {
        let schema = JsonSchema::default().property("sujet", FieldSpec::new(BsonType::String));
        assert_eq!(
            DocumentValidator::violations(&schema, &record(json!({"sujet": null}))).len(),
            1
        );
    }

    #[test]
    fn test_field_names() {
        assert!(DocumentValidator::validate_field_name("hash").is_ok());
        assert!(DocumentValidator::validate_field_name("_id").is_ok());
        assert!(DocumentValidator::validate_field_name("").is_err());
        assert!(DocumentValidator::validate_field_name("1abc").is_err());
        assert!(DocumentValidator::validate_field_name("a.b").is_err());
        assert!(DocumentValidator::validate_field_name("$where").is_err());
    }
}
