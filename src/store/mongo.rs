use std::time::Duration;

use async_trait::async_trait;
use futures_util::TryStreamExt;
use mongodb::bson::{doc, Bson, Document};
use mongodb::error::{Error as MongoError, ErrorKind, WriteFailure};
use mongodb::options::{ClientOptions, IndexOptions};
use mongodb::{Client, Database, IndexModel};
use serde_json::Value;
use tracing::{debug, info};

use super::DocumentStore;
use crate::config::MongoConfig;
use crate::error::{Result, SchemaError};
use crate::schema::{IndexSpec, Record};

const NAMESPACE_EXISTS: i32 = 48;
const NAMESPACE_NOT_FOUND: i32 = 26;
const DUPLICATE_KEY: i32 = 11000;
const DOCUMENT_VALIDATION_FAILURE: i32 = 121;
const INDEX_OPTIONS_CONFLICT: i32 = 85;
const INDEX_KEY_SPECS_CONFLICT: i32 = 86;

/// MongoDB backed document store
pub struct MongoStore {
    client: Client,
    db: Database,
}

impl MongoStore {
    /// Connect to the server described by `config` and check it answers
    pub async fn connect(config: &MongoConfig) -> Result<Self> {
        let uri = config.connection_uri();
        let mut options = ClientOptions::parse(&uri).await.map_err(connection_error)?;
        options.app_name = Some(env!("CARGO_PKG_NAME").to_string());
        options.connect_timeout = Some(Duration::from_secs(config.connect_timeout_secs));
        options.server_selection_timeout =
            Some(Duration::from_secs(config.server_selection_timeout_secs));

        let client = Client::with_options(options).map_err(connection_error)?;
        let db = client.database(&config.db);

        db.run_command(doc! { "ping": 1 })
            .await
            .map_err(connection_error)?;

        info!(host = %config.host, port = config.port, database = %config.db, "Connected to MongoDB");
        Ok(Self { client, db })
    }

    /// Name of the database
    #[must_use]
    pub fn database(&self) -> &str {
        self.db.name()
    }

    /// Underlying driver client, for callers sharing the connection
    #[must_use]
    pub const fn client(&self) -> &Client {
        &self.client
    }

    fn collection(&self, name: &str) -> mongodb::Collection<Document> {
        self.db.collection::<Document>(name)
    }
}

fn error_code(err: &MongoError) -> Option<i32> {
    match err.kind.as_ref() {
        ErrorKind::Command(command) => Some(command.code),
        ErrorKind::Write(WriteFailure::WriteError(write)) => Some(write.code),
        ErrorKind::Write(WriteFailure::WriteConcernError(concern)) => Some(concern.code),
        _ => None,
    }
}

fn is_connection_failure(err: &MongoError) -> bool {
    matches!(
        err.kind.as_ref(),
        ErrorKind::ServerSelection { .. }
            | ErrorKind::Io(_)
            | ErrorKind::Authentication { .. }
            | ErrorKind::DnsResolve { .. }
            | ErrorKind::ConnectionPoolCleared { .. }
    )
}

fn connection_error(err: MongoError) -> SchemaError {
    SchemaError::Connection(err.to_string())
}

fn storage_error(err: MongoError) -> SchemaError {
    if is_connection_failure(&err) {
        SchemaError::Connection(err.to_string())
    } else {
        SchemaError::Storage(err.to_string())
    }
}

fn to_document(value: &Value) -> Result<Document> {
    match Bson::try_from(value.clone()) {
        Ok(Bson::Document(document)) => Ok(document),
        Ok(other) => Err(SchemaError::InvalidDefinition(format!(
            "expected a document, got {:?}",
            other.element_type()
        ))),
        Err(err) => Err(SchemaError::InvalidDefinition(err.to_string())),
    }
}

/// Index named in an E11000 message: `... index: hash_1 dup key: ...`
fn duplicate_key_field(message: &str) -> String {
    message
        .split("index: ")
        .nth(1)
        .and_then(|rest| rest.split_whitespace().next())
        .map(|index| index.strip_suffix("_1").unwrap_or(index))
        .filter(|field| !field.is_empty())
        .unwrap_or("_id")
        .to_string()
}

fn single_field(keys: &Document) -> Option<String> {
    if keys.len() != 1 {
        return None;
    }
    let (field, direction) = keys.iter().next()?;
    let ascending = match direction {
        Bson::Int32(d) => *d == 1,
        Bson::Int64(d) => *d == 1,
        Bson::Double(d) => (*d - 1.0).abs() < f64::EPSILON,
        _ => false,
    };
    ascending.then(|| field.clone())
}

#[async_trait]
impl DocumentStore for MongoStore {
    async fn list_collections(&self) -> Result<Vec<String>> {
        let mut names = self
            .db
            .list_collection_names()
            .await
            .map_err(storage_error)?;
        names.sort();
        Ok(names)
    }

    async fn collection_validator(&self, collection: &str) -> Result<Option<Value>> {
        let mut cursor = self
            .db
            .list_collections()
            .filter(doc! { "name": collection })
            .await
            .map_err(storage_error)?;

        let Some(spec) = cursor.try_next().await.map_err(storage_error)? else {
            return Ok(None);
        };

        Ok(Some(spec.options.validator.map_or(Value::Null, |validator| {
            Bson::Document(validator).into_relaxed_extjson()
        })))
    }

    async fn create_collection(&self, collection: &str, validator: &Value) -> Result<()> {
        let action = self.db.create_collection(collection);
        let result = if validator.is_null() {
            action.await
        } else {
            action.validator(to_document(validator)?).await
        };

        match result {
            Ok(()) => {
                debug!(collection, "createCollection succeeded");
                Ok(())
            }
            Err(err) if error_code(&err) == Some(NAMESPACE_EXISTS) => {
                Err(SchemaError::CollectionAlreadyExists {
                    collection: collection.to_string(),
                })
            }
            Err(err) => Err(storage_error(err)),
        }
    }

    async fn update_validator(&self, collection: &str, validator: &Value) -> Result<()> {
        let validator = if validator.is_null() {
            Document::new()
        } else {
            to_document(validator)?
        };

        match self
            .db
            .run_command(doc! { "collMod": collection, "validator": validator })
            .await
        {
            Ok(_) => Ok(()),
            Err(err) if error_code(&err) == Some(NAMESPACE_NOT_FOUND) => {
                Err(SchemaError::CollectionNotFound(collection.to_string()))
            }
            Err(err) => Err(storage_error(err)),
        }
    }

    async fn list_indexes(&self, collection: &str) -> Result<Vec<IndexSpec>> {
        let models: Vec<IndexModel> = match self.collection(collection).list_indexes().await {
            Ok(cursor) => cursor.try_collect().await.map_err(storage_error)?,
            Err(err) if error_code(&err) == Some(NAMESPACE_NOT_FOUND) => {
                return Err(SchemaError::CollectionNotFound(collection.to_string()));
            }
            Err(err) => return Err(storage_error(err)),
        };

        let mut indexes: Vec<IndexSpec> = models
            .into_iter()
            .filter_map(|model| {
                let field = single_field(&model.keys)?;
                if field == "_id" {
                    return None;
                }
                let unique = model.options.and_then(|o| o.unique).unwrap_or(false);
                Some(IndexSpec { field, unique })
            })
            .collect();
        indexes.sort_by(|a, b| a.field.cmp(&b.field));
        Ok(indexes)
    }

    async fn create_unique_index(&self, collection: &str, field: &str) -> Result<()> {
        // createIndexes would silently create a missing collection.
        if self.collection_validator(collection).await?.is_none() {
            return Err(SchemaError::CollectionNotFound(collection.to_string()));
        }

        let mut keys = Document::new();
        keys.insert(field, 1_i32);
        let model = IndexModel::builder()
            .keys(keys)
            .options(IndexOptions::builder().unique(true).build())
            .build();

        match self.collection(collection).create_index(model).await {
            Ok(created) => {
                debug!(collection, index = %created.index_name, "createIndexes succeeded");
                Ok(())
            }
            Err(err) if error_code(&err) == Some(DUPLICATE_KEY) => {
                Err(SchemaError::ConstraintViolation {
                    collection: collection.to_string(),
                    field: field.to_string(),
                })
            }
            Err(err)
                if matches!(
                    error_code(&err),
                    Some(INDEX_OPTIONS_CONFLICT | INDEX_KEY_SPECS_CONFLICT)
                ) =>
            {
                Err(SchemaError::SchemaConflict {
                    collection: collection.to_string(),
                    reason: format!("conflicting index already exists on '{field}': {err}"),
                })
            }
            Err(err) => Err(storage_error(err)),
        }
    }

    async fn insert_one(&self, collection: &str, document: &Record) -> Result<()> {
        let document = to_document(&Value::Object(document.clone()))?;

        match self.collection(collection).insert_one(document).await {
            Ok(_) => Ok(()),
            Err(err) => match (error_code(&err), err.kind.as_ref()) {
                (Some(DUPLICATE_KEY), ErrorKind::Write(WriteFailure::WriteError(write))) => {
                    Err(SchemaError::DuplicateKey {
                        collection: collection.to_string(),
                        field: duplicate_key_field(&write.message),
                    })
                }
                (Some(DOCUMENT_VALIDATION_FAILURE), ErrorKind::Write(WriteFailure::WriteError(write))) => {
                    let mut violations = vec![write.message.clone()];
                    if let Some(details) = &write.details {
                        violations.push(Bson::Document(details.clone()).into_relaxed_extjson().to_string());
                    }
                    Err(SchemaError::DocumentValidation {
                        collection: collection.to_string(),
                        violations,
                    })
                }
                _ => Err(storage_error(err)),
            },
        }
    }

    async fn count_documents(&self, collection: &str) -> Result<u64> {
        self.collection(collection)
            .count_documents(doc! {})
            .await
            .map_err(storage_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_duplicate_key_field() {
        let message = r#"E11000 duplicate key error collection: errol.ham_spam index: hash_1 dup key: { hash: "abc" }"#;
        assert_eq!(duplicate_key_field(message), "hash");
        assert_eq!(duplicate_key_field("E11000 duplicate key error"), "_id");
    }

    #[test]
    fn test_single_field_index() {
        assert_eq!(single_field(&doc! { "hash": 1 }), Some("hash".to_string()));
        assert_eq!(single_field(&doc! { "hash": -1 }), None);
        assert_eq!(single_field(&doc! { "hash": 1, "langue": 1 }), None);
    }

    #[test]
    fn test_extended_json_date_becomes_bson_date() {
        let document = to_document(&json!({"creation": {"$date": "2023-05-01T10:00:00Z"}})).unwrap();
        assert!(matches!(document.get("creation"), Some(Bson::DateTime(_))));
    }

    #[test]
    fn test_validator_converts_to_document() {
        let validator = json!({"$jsonSchema": {"bsonType": "object", "required": ["message"]}});
        let document = to_document(&validator).unwrap();
        assert!(document.get_document("$jsonSchema").is_ok());
    }
}
