//! Storage collaborators
//!
//! The initializer only talks to [`DocumentStore`]. `MongoStore` is the
//! production engine; `SqliteStore` keeps the same guarantees in a local
//! file and backs the test-suite.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::schema::{IndexSpec, Record};

pub mod mongo;
pub mod sqlite;

pub use mongo::MongoStore;
pub use sqlite::SqliteStore;

/// A document database holding validated collections
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Names of the existing collections
    async fn list_collections(&self) -> Result<Vec<String>>;

    /// Validator of a collection: `None` if the collection does not exist,
    /// `Some(Value::Null)` if it exists without validator
    async fn collection_validator(&self, collection: &str) -> Result<Option<Value>>;

    /// Create a collection enforcing `validator`.
    /// Fails with `CollectionAlreadyExists` if the name is taken.
    async fn create_collection(&self, collection: &str, validator: &Value) -> Result<()>;

    /// Replace the validator of an existing collection
    async fn update_validator(&self, collection: &str, validator: &Value) -> Result<()>;

    /// Single-field indexes of a collection
    async fn list_indexes(&self, collection: &str) -> Result<Vec<IndexSpec>>;

    /// Build a unique ascending index on `field`.
    /// Fails with `ConstraintViolation` if stored documents already collide.
    async fn create_unique_index(&self, collection: &str, field: &str) -> Result<()>;

    /// Write one document through the collection validator and indexes
    async fn insert_one(&self, collection: &str, document: &Record) -> Result<()>;

    /// Number of documents in a collection
    async fn count_documents(&self, collection: &str) -> Result<u64>;
}
