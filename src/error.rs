//! Error types for the errol-schema library.
//!
//! Every storage backend maps its engine-specific failures onto these kinds so
//! the initializer can reason about them without knowing which engine it
//! talks to.

use thiserror::Error;

/// Errors that can occur while provisioning the document database.
#[derive(Error, Debug)]
pub enum SchemaError {
    /// The collection already exists in the database
    #[error("Collection already exists: {collection}")]
    CollectionAlreadyExists {
        /// Name of the collection
        collection: String,
    },

    /// The collection exists with a definition that differs from the requested one
    #[error("Schema conflict on collection {collection}: {reason}")]
    SchemaConflict {
        /// Name of the collection
        collection: String,
        /// What differs
        reason: String,
    },

    /// Unique index creation found duplicate values already stored
    #[error("Constraint violation: duplicate values for field '{field}' in collection {collection}")]
    ConstraintViolation {
        /// Name of the collection
        collection: String,
        /// Field the unique index was requested on
        field: String,
    },

    /// The storage engine could not be reached
    #[error("Connection error: {0}")]
    Connection(String),

    /// The collection does not exist
    #[error("Collection not found: {0}")]
    CollectionNotFound(String),

    /// A document was rejected by the collection validator
    #[error("Document rejected by validator of {collection}: {}", .violations.join("; "))]
    DocumentValidation {
        /// Name of the collection
        collection: String,
        /// Human readable violations
        violations: Vec<String>,
    },

    /// A document collided with a unique index
    #[error("Duplicate key on field '{field}' in collection {collection}")]
    DuplicateKey {
        /// Name of the collection
        collection: String,
        /// Indexed field
        field: String,
    },

    /// Two selected profiles define the same collection differently
    #[error("Collection {collection} is defined differently by profiles {}", .profiles.join(", "))]
    AmbiguousDefinition {
        /// Name of the collection
        collection: String,
        /// Profiles that disagree
        profiles: Vec<String>,
    },

    /// A schema definition is malformed
    #[error("Invalid schema definition: {0}")]
    InvalidDefinition(String),

    /// The requested profile is not in the catalog
    #[error("Unknown schema profile: {0}")]
    UnknownProfile(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Any other failure reported by the storage engine
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML catalog errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// File I/O errors
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SchemaError {
    /// Short, stable label used for metrics and structured logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::CollectionAlreadyExists { .. } => "collection_already_exists",
            Self::SchemaConflict { .. } => "schema_conflict",
            Self::ConstraintViolation { .. } => "constraint_violation",
            Self::Connection(_) => "connection",
            Self::CollectionNotFound(_) => "collection_not_found",
            Self::DocumentValidation { .. } => "document_validation",
            Self::DuplicateKey { .. } => "duplicate_key",
            Self::AmbiguousDefinition { .. } => "ambiguous_definition",
            Self::InvalidDefinition(_) => "invalid_definition",
            Self::UnknownProfile(_) => "unknown_profile",
            Self::InvalidConfig(_) => "invalid_config",
            Self::Storage(_) => "storage",
            Self::Serialization(_) => "serialization",
            Self::Yaml(_) => "yaml",
            Self::Io(_) => "io",
        }
    }
}

/// Convenience type alias for Result with `SchemaError`
pub type Result<T> = std::result::Result<T, SchemaError>;

impl From<r2d2::Error> for SchemaError {
    fn from(err: r2d2::Error) -> Self {
        Self::Connection(err.to_string())
    }
}

impl From<rusqlite::Error> for SchemaError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::SqliteFailure(ref e, _)
                if matches!(
                    e.code,
                    rusqlite::ErrorCode::CannotOpen
                        | rusqlite::ErrorCode::NotADatabase
                        | rusqlite::ErrorCode::PermissionDenied
                ) =>
            {
                Self::Connection(err.to_string())
            }
            other => Self::Storage(other.to_string()),
        }
    }
}
