use std::fs;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use serde_json::Value;
use tracing::{debug, info};

use super::DocumentStore;
use crate::error::{Result, SchemaError};
use crate::schema::{IndexSpec, JsonSchema, Record};
use crate::validation::DocumentValidator;

// Type alias for the database connection pool
pub type DbPool = Pool<SqliteConnectionManager>;
/// Connection checked out of [`DbPool`]
pub type DbConnection = r2d2::PooledConnection<SqliteConnectionManager>;

const CATALOG_DDL: &str = "
CREATE TABLE IF NOT EXISTS _errol_collections (
    name TEXT PRIMARY KEY NOT NULL,
    validator TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);
CREATE TABLE IF NOT EXISTS _errol_indexes (
    collection TEXT NOT NULL REFERENCES _errol_collections(name),
    field TEXT NOT NULL,
    is_unique INTEGER NOT NULL,
    PRIMARY KEY (collection, field)
);
";

/// Document store kept in a single SQLite file.
///
/// Each collection is a table of JSON documents. Validators are stored in a
/// catalog table and enforced before every write; unique indexes are SQLite
/// expression indexes, so duplicates are rejected by the engine itself.
pub struct SqliteStore {
    pool: DbPool,
    database: String,
}

impl SqliteStore {
    /// Open (or create) the store at `path`
    pub fn open(path: &Path, database: &str, max_connections: u32) -> Result<Self> {
        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            conn.busy_timeout(Duration::from_secs(5))?;
            conn.execute_batch("PRAGMA foreign_keys = ON;")
        });
        let pool = Pool::builder().max_size(max_connections).build(manager)?;

        let conn = pool.get()?;
        Self::run_migrations(&conn)?;

        info!(path = %path.display(), database, "Opened SQLite document store");
        Ok(Self {
            pool,
            database: database.to_string(),
        })
    }

    /// Name of the logical database
    #[must_use]
    pub fn database(&self) -> &str {
        &self.database
    }

    fn run_migrations(conn: &Connection) -> Result<()> {
        conn.execute_batch(CATALOG_DDL)?;
        Ok(())
    }

    /// Get a connection from the pool
    pub fn get_connection(&self) -> Result<DbConnection> {
        Ok(self.pool.get()?)
    }

    fn stored_validator(conn: &Connection, collection: &str) -> Result<Option<Value>> {
        let raw: Option<String> = conn
            .query_row(
                "SELECT validator FROM _errol_collections WHERE name = ?1",
                params![collection],
                |row| row.get(0),
            )
            .optional()?;

        raw.map(|text| serde_json::from_str(&text).map_err(SchemaError::from))
            .transpose()
    }

    fn stored_indexes(conn: &Connection, collection: &str) -> Result<Vec<IndexSpec>> {
        let mut stmt = conn.prepare(
            "SELECT field, is_unique FROM _errol_indexes WHERE collection = ?1 ORDER BY field",
        )?;
        let indexes = stmt
            .query_map(params![collection], |row| {
                Ok(IndexSpec {
                    field: row.get(0)?,
                    unique: row.get(1)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(indexes)
    }

    // Another provisioner may register the same name between our lookup and this insert.
    fn register_collection(conn: &Connection, collection: &str, validator: &Value) -> Result<()> {
        match conn.execute(
            "INSERT INTO _errol_collections (name, validator) VALUES (?1, ?2)",
            params![collection, serde_json::to_string(validator)?],
        ) {
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => Err(SchemaError::CollectionAlreadyExists {
                collection: collection.to_string(),
            }),
            Err(err) => Err(err.into()),
        }
    }

    fn require_collection(conn: &Connection, collection: &str) -> Result<Value> {
        Self::stored_validator(conn, collection)?
            .ok_or_else(|| SchemaError::CollectionNotFound(collection.to_string()))
    }
}

fn table_name(collection: &str) -> String {
    format!("\"coll_{collection}\"")
}

// Neither collection nor field names may contain '.', so names never collide.
fn index_name(collection: &str, field: &str) -> String {
    format!("idx_{collection}.{field}")
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn list_collections(&self) -> Result<Vec<String>> {
        let conn = self.get_connection()?;
        let mut stmt = conn.prepare("SELECT name FROM _errol_collections ORDER BY name")?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(names)
    }

    async fn collection_validator(&self, collection: &str) -> Result<Option<Value>> {
        let conn = self.get_connection()?;
        Self::stored_validator(&conn, collection)
    }

    async fn create_collection(&self, collection: &str, validator: &Value) -> Result<()> {
        DocumentValidator::validate_collection_name(collection)?;
        if !validator.is_null() {
            JsonSchema::from_validator(validator)?;
        }

        let mut conn = self.get_connection()?;
        let tx = conn.transaction()?;

        if Self::stored_validator(&tx, collection)?.is_some() {
            return Err(SchemaError::CollectionAlreadyExists {
                collection: collection.to_string(),
            });
        }

        Self::register_collection(&tx, collection, validator)?;
        tx.execute_batch(&format!(
            "CREATE TABLE {} (id INTEGER PRIMARY KEY AUTOINCREMENT, doc TEXT NOT NULL)",
            table_name(collection)
        ))?;
        tx.commit()?;

        debug!(collection, "Created collection table");
        Ok(())
    }

    async fn update_validator(&self, collection: &str, validator: &Value) -> Result<()> {
        if !validator.is_null() {
            JsonSchema::from_validator(validator)?;
        }

        let conn = self.get_connection()?;
        let updated = conn.execute(
            "UPDATE _errol_collections SET validator = ?2 WHERE name = ?1",
            params![collection, serde_json::to_string(validator)?],
        )?;

        if updated == 0 {
            return Err(SchemaError::CollectionNotFound(collection.to_string()));
        }
        Ok(())
    }

    async fn list_indexes(&self, collection: &str) -> Result<Vec<IndexSpec>> {
        let conn = self.get_connection()?;
        Self::require_collection(&conn, collection)?;
        Self::stored_indexes(&conn, collection)
    }

    async fn create_unique_index(&self, collection: &str, field: &str) -> Result<()> {
        DocumentValidator::validate_field_name(field)?;

        let mut conn = self.get_connection()?;
        let tx = conn.transaction()?;
        Self::require_collection(&tx, collection)?;

        if let Some(existing) = Self::stored_indexes(&tx, collection)?
            .into_iter()
            .find(|i| i.field == field)
        {
            if existing.unique {
                return Ok(());
            }
            return Err(SchemaError::SchemaConflict {
                collection: collection.to_string(),
                reason: format!("non-unique index already exists on '{field}'"),
            });
        }

        // A missing field indexes as one shared null key.
        let ddl = format!(
            "CREATE UNIQUE INDEX \"{}\" ON {} (coalesce(json_extract(doc, '$.{field}'), x'00'))",
            index_name(collection, field),
            table_name(collection)
        );
        match tx.execute_batch(&ddl) {
            Ok(()) => {}
            Err(err) if is_unique_violation(&err) => {
                return Err(SchemaError::ConstraintViolation {
                    collection: collection.to_string(),
                    field: field.to_string(),
                });
            }
            Err(err) => return Err(err.into()),
        }

        tx.execute(
            "INSERT INTO _errol_indexes (collection, field, is_unique) VALUES (?1, ?2, 1)",
            params![collection, field],
        )?;
        tx.commit()?;
        Ok(())
    }

    async fn insert_one(&self, collection: &str, document: &Record) -> Result<()> {
        let conn = self.get_connection()?;
        let validator = Self::require_collection(&conn, collection)?;

        if !validator.is_null() {
            let schema = JsonSchema::from_validator(&validator)?;
            DocumentValidator::validate_document(collection, &schema, document)?;
        }

        let body = serde_json::to_string(document)?;
        let result = conn.execute(
            &format!("INSERT INTO {} (doc) VALUES (?1)", table_name(collection)),
            params![body],
        );

        match result {
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => {
                let message = err.to_string();
                let indexes = Self::stored_indexes(&conn, collection)?;
                let field = indexes
                    .iter()
                    .find(|i| message.contains(&format!("'{}'", index_name(collection, &i.field))))
                    .or_else(|| indexes.first())
                    .map_or_else(|| "_id".to_string(), |i| i.field.clone());
                Err(SchemaError::DuplicateKey {
                    collection: collection.to_string(),
                    field,
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn count_documents(&self, collection: &str) -> Result<u64> {
        let conn = self.get_connection()?;
        Self::require_collection(&conn, collection)?;
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", table_name(collection)),
            [],
            |row| row.get(0),
        )?;
        Ok(u64::try_from(count).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn open_store() -> (TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("errol.db"), "errol", 2).unwrap();
        (dir, store)
    }

    fn doc(value: Value) -> Record {
        value.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn test_create_collection_twice_fails() {
        let (_dir, store) = open_store();
        store.create_collection("ham_spam", &Value::Null).await.unwrap();
        let err = store.create_collection("ham_spam", &Value::Null).await.unwrap_err();
        assert!(matches!(err, SchemaError::CollectionAlreadyExists { .. }));
    }

    #[tokio::test]
    async fn test_validator_is_stored_verbatim() {
        let (_dir, store) = open_store();
        let validator = json!({"$jsonSchema": {"bsonType": "object", "required": ["message"],
            "properties": {"message": {"bsonType": "string"}}}});
        store.create_collection("spamassassin", &validator).await.unwrap();
        assert_eq!(
            store.collection_validator("spamassassin").await.unwrap(),
            Some(validator)
        );
        assert_eq!(store.collection_validator("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_missing_field_counts_as_one_null_key() {
        let (_dir, store) = open_store();
        store.create_collection("kaamelott", &Value::Null).await.unwrap();
        store.create_unique_index("kaamelott", "hash").await.unwrap();

        store.insert_one("kaamelott", &doc(json!({"message": "a"}))).await.unwrap();
        let err = store
            .insert_one("kaamelott", &doc(json!({"message": "b"})))
            .await
            .unwrap_err();
        assert!(matches!(err, SchemaError::DuplicateKey { field, .. } if field == "hash"));
    }

    #[tokio::test]
    async fn test_index_on_missing_collection() {
        let (_dir, store) = open_store();
        let err = store.create_unique_index("ham_spam", "hash").await.unwrap_err();
        assert!(matches!(err, SchemaError::CollectionNotFound(name) if name == "ham_spam"));
    }

    #[tokio::test]
    async fn test_rejects_unsafe_collection_name() {
        let (_dir, store) = open_store();
        let err = store
            .create_collection("ham\"; DROP TABLE x; --", &Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, SchemaError::InvalidDefinition(_)));
    }

    #[test]
    fn test_concurrent_registration_is_already_exists() {
        let (_dir, store) = open_store();
        let conn = store.get_connection().unwrap();
        SqliteStore::register_collection(&conn, "ham_spam", &Value::Null).unwrap();

        let err = SqliteStore::register_collection(&conn, "ham_spam", &Value::Null).unwrap_err();
        assert!(matches!(err, SchemaError::CollectionAlreadyExists { collection } if collection == "ham_spam"));
    }

    #[tokio::test]
    async fn test_duplicate_reports_exact_field() {
        let (_dir, store) = open_store();
        store.create_collection("c", &Value::Null).await.unwrap();
        store.create_unique_index("c", "hash").await.unwrap();
        store.create_unique_index("c", "hash2").await.unwrap();

        store.insert_one("c", &doc(json!({"hash": "a", "hash2": "x"}))).await.unwrap();
        let err = store
            .insert_one("c", &doc(json!({"hash": "b", "hash2": "x"})))
            .await
            .unwrap_err();
        assert!(matches!(err, SchemaError::DuplicateKey { field, .. } if field == "hash2"));
    }
}
