//! Errol Schema - Document Database Provisioning
//!
//! A Rust library for provisioning the `errol` document database: validated
//! collections for collected mails and trained models, and unique indexes on
//! mail hashes.
//!
//! # Features
//!
//! - Collection definitions kept as data in a YAML catalog of schema versions
//! - Idempotent provisioning: re-running on a provisioned database is a no-op
//! - MongoDB backend and a local SQLite document store
//! - Read-only drift detection

/// Schema catalog of named schema versions
pub mod catalog;
/// Configuration management
pub mod config;
/// Error types
pub mod error;
/// Schema initializer
pub mod initializer;
/// Logging setup and utilities
pub mod logging;
/// Metrics collection
pub mod metrics;
/// Collection schema definitions
pub mod schema;
/// Document stores
pub mod store;
/// Name and document validation
pub mod validation;

// Re-export key components for easier access
pub use catalog::{SchemaCatalog, SchemaProfile};
pub use error::{Result, SchemaError};
pub use initializer::{ConflictPolicy, InitOptions, InitReport, SchemaInitializer};
pub use schema::{BsonType, CollectionDefinition, FieldSpec, IndexSpec, JsonSchema, Record};
pub use store::{DocumentStore, MongoStore, SqliteStore};
