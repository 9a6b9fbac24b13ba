//! Schema initializer
//!
//! Brings a database in line with a set of collection definitions. Every
//! step checks what is already there first, so running it again on a
//! provisioned database changes nothing.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde_json::Value;
use tracing::{error, info, warn};

use crate::catalog::{SchemaCatalog, SchemaProfile};
use crate::error::{Result, SchemaError};
use crate::logging::OperationTimer;
use crate::metrics::MetricsCollector;
use crate::schema::{CollectionDefinition, JsonSchema};
use crate::store::DocumentStore;
use crate::validation::DocumentValidator;

/// What to do when a collection exists with a different validator
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConflictPolicy {
    /// Report a `SchemaConflict`
    #[default]
    Fail,
    /// Replace the stored validator
    Update,
}

impl FromStr for ConflictPolicy {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fail" => Ok(Self::Fail),
            "update" => Ok(Self::Update),
            other => Err(SchemaError::InvalidConfig(format!(
                "unknown conflict policy: {other}"
            ))),
        }
    }
}

/// Initializer settings
#[derive(Debug, Clone, Copy, Default)]
pub struct InitOptions {
    /// Handling of diverging validators
    pub on_conflict: ConflictPolicy,
}

/// Result of `ensure_collection`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionOutcome {
    /// The collection did not exist
    Created,
    /// The collection already had this validator
    Unchanged,
    /// The validator was replaced
    Updated,
}

impl CollectionOutcome {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Unchanged => "unchanged",
            Self::Updated => "updated",
        }
    }
}

/// Result of `ensure_unique_index`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexOutcome {
    /// The index was built
    Created,
    /// A unique index on the field already existed
    Unchanged,
}

impl IndexOutcome {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Unchanged => "unchanged",
        }
    }
}

/// Outcome for one collection and its indexes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionReport {
    pub collection: String,
    pub outcome: CollectionOutcome,
    pub indexes: Vec<(String, IndexOutcome)>,
}

/// Outcome of a full run
#[derive(Debug, Clone, Default)]
pub struct InitReport {
    pub collections: Vec<CollectionReport>,
    pub duration: Duration,
}

impl InitReport {
    /// True when the run found everything already in place
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.collections.iter().all(|c| {
            c.outcome == CollectionOutcome::Unchanged
                && c.indexes.iter().all(|(_, o)| *o == IndexOutcome::Unchanged)
        })
    }
}

/// Difference between the database and the expected definitions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Drift {
    MissingCollection { collection: String },
    ValidatorMismatch { collection: String },
    MissingIndex { collection: String, field: String },
    IndexNotUnique { collection: String, field: String },
}

impl fmt::Display for Drift {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingCollection { collection } => write!(f, "{collection}: collection missing"),
            Self::ValidatorMismatch { collection } => {
                write!(f, "{collection}: stored validator differs")
            }
            Self::MissingIndex { collection, field } => {
                write!(f, "{collection}: no index on '{field}'")
            }
            Self::IndexNotUnique { collection, field } => {
                write!(f, "{collection}: index on '{field}' is not unique")
            }
        }
    }
}

/// Provisions collections on a caller-owned store
pub struct SchemaInitializer<'a, S: DocumentStore + ?Sized> {
    store: &'a S,
    options: InitOptions,
    metrics: MetricsCollector,
}

impl<'a, S: DocumentStore + ?Sized> SchemaInitializer<'a, S> {
    pub fn new(store: &'a S, options: InitOptions) -> Self {
        Self {
            store,
            options,
            metrics: MetricsCollector::default(),
        }
    }

    /// Make sure `name` exists and enforces `schema`
    pub async fn ensure_collection(&self, name: &str, schema: &JsonSchema) -> Result<CollectionOutcome> {
        let result = self.ensure_collection_inner(name, schema).await;
        match &result {
            Ok(outcome) => {
                info!(collection = name, outcome = outcome.as_str(), "Collection ensured");
                self.metrics.record_collection(outcome.as_str());
            }
            Err(err) => self.report_error("ensure_collection", name, err),
        }
        result
    }

    async fn ensure_collection_inner(&self, name: &str, schema: &JsonSchema) -> Result<CollectionOutcome> {
        DocumentValidator::validate_collection_name(name)?;
        DocumentValidator::validate_schema(name, schema)?;
        let wanted = schema.to_validator()?;

        if let Some(existing) = self.store.collection_validator(name).await? {
            return self.reconcile(name, &existing, &wanted).await;
        }

        match self.store.create_collection(name, &wanted).await {
            Ok(()) => Ok(CollectionOutcome::Created),
            Err(SchemaError::CollectionAlreadyExists { .. }) => {
                // Created concurrently since the lookup.
                warn!(collection = name, "Collection appeared during creation, comparing validators");
                let existing = self
                    .store
                    .collection_validator(name)
                    .await?
                    .ok_or_else(|| SchemaError::CollectionNotFound(name.to_string()))?;
                self.reconcile(name, &existing, &wanted).await
            }
            Err(err) => Err(err),
        }
    }

    async fn reconcile(&self, name: &str, existing: &Value, wanted: &Value) -> Result<CollectionOutcome> {
        if existing == wanted {
            return Ok(CollectionOutcome::Unchanged);
        }

        match self.options.on_conflict {
            ConflictPolicy::Fail => Err(SchemaError::SchemaConflict {
                collection: name.to_string(),
                reason: "stored validator differs from the requested one".to_string(),
            }),
            ConflictPolicy::Update => {
                self.store.update_validator(name, wanted).await?;
                Ok(CollectionOutcome::Updated)
            }
        }
    }

    /// Make sure writes to `collection` cannot repeat a value of `field`
    pub async fn ensure_unique_index(&self, collection: &str, field: &str) -> Result<IndexOutcome> {
        let result = self.ensure_unique_index_inner(collection, field).await;
        match &result {
            Ok(outcome) => {
                info!(collection, field, outcome = outcome.as_str(), "Unique index ensured");
                self.metrics.record_index(outcome.as_str());
            }
            Err(err) => self.report_error("ensure_unique_index", collection, err),
        }
        result
    }

    async fn ensure_unique_index_inner(&self, collection: &str, field: &str) -> Result<IndexOutcome> {
        DocumentValidator::validate_field_name(field)?;

        let existing = self.store.list_indexes(collection).await?;
        match existing.iter().find(|i| i.field == field) {
            Some(index) if index.unique => Ok(IndexOutcome::Unchanged),
            Some(_) => Err(SchemaError::SchemaConflict {
                collection: collection.to_string(),
                reason: format!("index on '{field}' exists but is not unique"),
            }),
            None => {
                self.store.create_unique_index(collection, field).await?;
                Ok(IndexOutcome::Created)
            }
        }
    }

    /// Provision one collection and its indexes
    pub async fn apply(&self, definition: &CollectionDefinition) -> Result<CollectionReport> {
        let outcome = self
            .ensure_collection(&definition.name, &definition.validator)
            .await?;

        let mut indexes = Vec::with_capacity(definition.indexes.len());
        for index in &definition.indexes {
            let index_outcome = self.ensure_unique_index(&definition.name, &index.field).await?;
            indexes.push((index.field.clone(), index_outcome));
        }

        Ok(CollectionReport {
            collection: definition.name.clone(),
            outcome,
            indexes,
        })
    }

    /// Provision every collection of the selected profiles, in order
    pub async fn run(&self, profiles: &[&SchemaProfile]) -> Result<InitReport> {
        let timer = OperationTimer::new("schema_init");
        let plan = SchemaCatalog::plan(profiles)?;

        info!(
            profiles = ?profiles.iter().map(|p| p.name.as_str()).collect::<Vec<_>>(),
            collections = plan.len(),
            "Applying schema plan"
        );

        let mut collections = Vec::with_capacity(plan.len());
        for definition in &plan {
            collections.push(self.apply(definition).await?);
        }

        let duration = timer.finish();
        self.metrics.record_run(duration);
        Ok(InitReport {
            collections,
            duration,
        })
    }

    /// Compare the database with the selected profiles without changing it
    pub async fn verify(&self, profiles: &[&SchemaProfile]) -> Result<Vec<Drift>> {
        let plan = SchemaCatalog::plan(profiles)?;
        let mut drifts = Vec::new();

        for definition in &plan {
            let name = &definition.name;
            let Some(existing) = self.store.collection_validator(name).await? else {
                drifts.push(Drift::MissingCollection {
                    collection: name.clone(),
                });
                continue;
            };

            if existing != definition.validator.to_validator()? {
                drifts.push(Drift::ValidatorMismatch {
                    collection: name.clone(),
                });
            }

            let indexes = self.store.list_indexes(name).await?;
            for wanted in &definition.indexes {
                match indexes.iter().find(|i| i.field == wanted.field) {
                    None => drifts.push(Drift::MissingIndex {
                        collection: name.clone(),
                        field: wanted.field.clone(),
                    }),
                    Some(found) if !found.unique => drifts.push(Drift::IndexNotUnique {
                        collection: name.clone(),
                        field: wanted.field.clone(),
                    }),
                    Some(_) => {}
                }
            }
        }

        for drift in &drifts {
            warn!(%drift, "Schema drift");
        }
        Ok(drifts)
    }

    fn report_error(&self, operation: &str, collection: &str, err: &SchemaError) {
        error!(operation, collection, kind = err.kind(), error = %err, "Schema operation failed");
        self.metrics.record_error(err.kind());
    }
}
