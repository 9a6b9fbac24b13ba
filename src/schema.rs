//! Collection schema definitions
//!
//! A schema is plain data in the shape the storage engine understands:
//! `{bsonType, required, properties}`. Nothing here knows about a specific
//! collection; the concrete definitions live in the catalog.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// A stored document.
pub type Record = serde_json::Map<String, Value>;

/// Well-known collection names of the errol database
pub mod collections {
    /// Labelled ham/spam mails
    pub const HAM_SPAM: &str = "ham_spam";
    /// SpamAssassin public corpus
    pub const SPAMASSASSIN: &str = "spamassassin";
    /// Mails collected from support tickets
    pub const KAAMELOTT: &str = "kaamelott";
    /// Registry of persisted models
    pub const TRAINED_MODELS: &str = "trained_models";
}

/// Well-known field names
pub mod fields {
    /// Unique identifier of a mail
    pub const HASH: &str = "hash";
    /// Cleaned message body
    pub const MESSAGE: &str = "message";
}

/// Storage type of a field. The set is closed on purpose: these are the
/// only types the errol collections declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BsonType {
    /// UTF-8 string
    String,
    /// Embedded document
    Object,
    /// Ordered sequence
    Array,
    /// Point in time
    Date,
}

impl BsonType {
    /// Name used in validators
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Object => "object",
            Self::Array => "array",
            Self::Date => "date",
        }
    }
}

impl fmt::Display for BsonType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declaration of one property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FieldSpec {
    /// Declared type
    pub bson_type: BsonType,
    /// Free text shown by the engine on validation failures
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Element type, for arrays
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<FieldSpec>>,
}

impl FieldSpec {
    /// Field of the given type without description
    #[must_use]
    pub const fn new(bson_type: BsonType) -> Self {
        Self {
            bson_type,
            description: None,
            items: None,
        }
    }

    /// Attach a description
    #[must_use]
    pub fn describe(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    /// Constrain array elements
    #[must_use]
    pub fn of(mut self, items: Self) -> Self {
        self.items = Some(Box::new(items));
        self
    }
}

/// `$jsonSchema` body of a collection validator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct JsonSchema {
    /// Always `object` for a document
    #[serde(default = "object_type")]
    pub bson_type: BsonType,
    /// Fields that must be present. The engine rejects an empty list, so it
    /// is omitted when empty.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,
    /// Declared fields
    #[serde(default)]
    pub properties: BTreeMap<String, FieldSpec>,
}

const fn object_type() -> BsonType {
    BsonType::Object
}

impl Default for JsonSchema {
    fn default() -> Self {
        Self {
            bson_type: BsonType::Object,
            required: Vec::new(),
            properties: BTreeMap::new(),
        }
    }
}

impl JsonSchema {
    /// Declare a property
    #[must_use]
    pub fn property(mut self, name: &str, spec: FieldSpec) -> Self {
        self.properties.insert(name.to_string(), spec);
        self
    }

    /// Mark fields as required, keeping declaration order
    #[must_use]
    pub fn require(mut self, names: &[&str]) -> Self {
        for name in names {
            if !self.required.iter().any(|r| r == name) {
                self.required.push((*name).to_string());
            }
        }
        self
    }

    /// Whether `field` must be present
    #[must_use]
    pub fn is_required(&self, field: &str) -> bool {
        self.required.iter().any(|r| r == field)
    }

    /// Validator document as sent to the engine: `{"$jsonSchema": {...}}`
    pub fn to_validator(&self) -> crate::error::Result<Value> {
        Ok(json!({ "$jsonSchema": serde_json::to_value(self)? }))
    }

    /// Read back a validator document produced by [`JsonSchema::to_validator`]
    pub fn from_validator(validator: &Value) -> crate::error::Result<Self> {
        let body = validator.get("$jsonSchema").ok_or_else(|| {
            crate::error::SchemaError::InvalidDefinition(
                "validator has no $jsonSchema member".to_string(),
            )
        })?;
        Ok(serde_json::from_value(body.clone())?)
    }
}

/// Single-field ascending index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IndexSpec {
    /// Indexed field
    pub field: String,
    /// Reject duplicate values
    #[serde(default = "default_unique")]
    pub unique: bool,
}

const fn default_unique() -> bool {
    true
}

impl IndexSpec {
    /// Unique index on `field`
    #[must_use]
    pub fn unique(field: &str) -> Self {
        Self {
            field: field.to_string(),
            unique: true,
        }
    }

    /// Engine-side index name, `<field>_1` like MongoDB's default
    #[must_use]
    pub fn name(&self) -> String {
        format!("{}_1", self.field)
    }
}

/// Everything needed to provision one collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CollectionDefinition {
    /// Collection name
    pub name: String,
    /// Document validator
    #[serde(default)]
    pub validator: JsonSchema,
    /// Indexes to build after the collection exists
    #[serde(default)]
    pub indexes: Vec<IndexSpec>,
}

impl CollectionDefinition {
    /// Definition without indexes
    #[must_use]
    pub fn new(name: &str, validator: JsonSchema) -> Self {
        Self {
            name: name.to_string(),
            validator,
            indexes: Vec::new(),
        }
    }

    /// Add a unique index on `field`
    #[must_use]
    pub fn with_unique_index(mut self, field: &str) -> Self {
        self.indexes.push(IndexSpec::unique(field));
        self
    }
}
