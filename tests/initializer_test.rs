//! Provisioning tests against the SQLite document store

use serde_json::{json, Value};
use tempfile::TempDir;

use errol_schema::initializer::{CollectionOutcome, Drift, IndexOutcome};
use errol_schema::{
    ConflictPolicy, DocumentStore, InitOptions, Record, SchemaCatalog, SchemaError, SchemaInitializer,
    SqliteStore,
};

fn open_store() -> (TempDir, SqliteStore) {
    let dir = tempfile::tempdir().expect("Failed to create temp directory");
    let store = SqliteStore::open(&dir.path().join("errol.db"), "errol", 2)
        .expect("Failed to open store");
    (dir, store)
}

fn doc(value: Value) -> Record {
    value.as_object().cloned().unwrap_or_default()
}

async fn provision(store: &SqliteStore, profiles: &[&str]) -> errol_schema::Result<errol_schema::InitReport> {
    let catalog = SchemaCatalog::builtin()?;
    let selected = catalog.select(profiles)?;
    SchemaInitializer::new(store, InitOptions::default())
        .run(&selected)
        .await
}

#[tokio::test]
async fn test_first_run_creates_everything() {
    let (_dir, store) = open_store();
    let report = provision(&store, &["ham_spam", "kaamelott"]).await.unwrap();

    let outcomes: Vec<_> = report
        .collections
        .iter()
        .map(|c| (c.collection.as_str(), c.outcome))
        .collect();
    assert_eq!(
        outcomes,
        vec![
            ("ham_spam", CollectionOutcome::Created),
            ("kaamelott", CollectionOutcome::Created),
            ("trained_models", CollectionOutcome::Created),
        ]
    );
    assert_eq!(report.collections[0].indexes, vec![("hash".to_string(), IndexOutcome::Created)]);
    assert!(report.collections[2].indexes.is_empty());
    assert!(!report.is_noop());

    assert_eq!(
        store.list_collections().await.unwrap(),
        vec!["ham_spam", "kaamelott", "trained_models"]
    );
}

#[tokio::test]
async fn test_rerun_is_noop() {
    let (_dir, store) = open_store();
    provision(&store, &["ham_spam", "kaamelott"]).await.unwrap();

    let report = provision(&store, &["ham_spam", "kaamelott"]).await.unwrap();
    assert!(report.is_noop());
    assert_eq!(report.collections.len(), 3);
}

#[tokio::test]
async fn test_ham_spam_rejects_missing_message() {
    let (_dir, store) = open_store();
    provision(&store, &["ham_spam"]).await.unwrap();

    let err = store
        .insert_one("ham_spam", &doc(json!({"hash": "h1", "sujet": "hello"})))
        .await
        .unwrap_err();
    match err {
        SchemaError::DocumentValidation { collection, violations } => {
            assert_eq!(collection, "ham_spam");
            assert!(violations.iter().any(|v| v.contains("'message'")));
        }
        other => panic!("expected validation error, got {other:?}"),
    }
    assert_eq!(store.count_documents("ham_spam").await.unwrap(), 0);
}

#[tokio::test]
async fn test_ham_spam_rejects_duplicate_hash() {
    let (_dir, store) = open_store();
    provision(&store, &["ham_spam"]).await.unwrap();

    store
        .insert_one("ham_spam", &doc(json!({"hash": "h1", "message": "first"})))
        .await
        .unwrap();
    let err = store
        .insert_one("ham_spam", &doc(json!({"hash": "h1", "message": "second"})))
        .await
        .unwrap_err();

    assert!(matches!(err, SchemaError::DuplicateKey { ref field, .. } if field == "hash"));
    assert_eq!(store.count_documents("ham_spam").await.unwrap(), 1);
}

#[tokio::test]
async fn test_trained_models_accepts_empty_document() {
    let (_dir, store) = open_store();
    provision(&store, &["kaamelott"]).await.unwrap();

    store.insert_one("trained_models", &Record::new()).await.unwrap();
    assert_eq!(store.count_documents("trained_models").await.unwrap(), 1);
}

#[tokio::test]
async fn test_legacy_spamassassin_accepts_message_without_hash() {
    let (_dir, store) = open_store();
    provision(&store, &["spamassassin_v1"]).await.unwrap();

    store
        .insert_one("spamassassin", &doc(json!({"message": "no hash here"})))
        .await
        .unwrap();
    assert_eq!(store.count_documents("spamassassin").await.unwrap(), 1);
}

#[tokio::test]
async fn test_required_fields_come_from_catalog() {
    let (_dir, store) = open_store();
    let raw = r"
database: errol
profiles:
  - name: strict
    collections:
      - name: trained_models
        validator:
          required: [name, chemin]
          properties:
            name: { bsonType: string }
            chemin: { bsonType: string }
";
    let catalog = SchemaCatalog::from_yaml_str(raw).unwrap();
    let selected = catalog.select(&["strict"]).unwrap();
    SchemaInitializer::new(&store, InitOptions::default())
        .run(&selected)
        .await
        .unwrap();

    let err = store.insert_one("trained_models", &Record::new()).await.unwrap_err();
    assert!(matches!(err, SchemaError::DocumentValidation { .. }));
    store
        .insert_one("trained_models", &doc(json!({"name": "bayes", "chemin": "/m/bayes"})))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_index_names_do_not_collide_across_collections() {
    let (_dir, store) = open_store();
    let raw = r"
database: errol
profiles:
  - name: underscores
    collections:
      - name: ham_spam
        validator:
          properties:
            hash: { bsonType: string }
        indexes:
          - field: hash
      - name: ham
        validator:
          properties:
            spam_hash: { bsonType: string }
        indexes:
          - field: spam_hash
";
    let catalog = SchemaCatalog::from_yaml_str(raw).unwrap();
    let selected = catalog.select(&["underscores"]).unwrap();
    let report = SchemaInitializer::new(&store, InitOptions::default())
        .run(&selected)
        .await
        .unwrap();

    assert_eq!(report.collections[1].indexes, vec![("spam_hash".to_string(), IndexOutcome::Created)]);
    store.insert_one("ham", &doc(json!({"spam_hash": "h1"}))).await.unwrap();
    let err = store
        .insert_one("ham", &doc(json!({"spam_hash": "h1"})))
        .await
        .unwrap_err();
    assert!(matches!(err, SchemaError::DuplicateKey { ref field, .. } if field == "spam_hash"));
}

#[tokio::test]
async fn test_changed_validator_conflicts_by_default() {
    let (_dir, store) = open_store();
    provision(&store, &["spamassassin_v1"]).await.unwrap();

    let err = provision(&store, &["spamassassin_v3"]).await.unwrap_err();
    assert!(matches!(err, SchemaError::SchemaConflict { ref collection, .. } if collection == "spamassassin"));
}

#[tokio::test]
async fn test_update_policy_migrates_validator() {
    let (_dir, store) = open_store();
    provision(&store, &["spamassassin_v1"]).await.unwrap();

    let catalog = SchemaCatalog::builtin().unwrap();
    let selected = catalog.select(&["spamassassin_v2"]).unwrap();
    let options = InitOptions {
        on_conflict: ConflictPolicy::Update,
    };
    let report = SchemaInitializer::new(&store, options).run(&selected).await.unwrap();
    assert_eq!(report.collections[0].outcome, CollectionOutcome::Updated);

    // v2 declares liens, so its type is now enforced
    let err = store
        .insert_one("spamassassin", &doc(json!({"message": "m", "liens": "3"})))
        .await
        .unwrap_err();
    assert!(matches!(err, SchemaError::DocumentValidation { .. }));
}

#[tokio::test]
async fn test_index_on_duplicated_data_is_a_constraint_violation() {
    let (_dir, store) = open_store();
    provision(&store, &["spamassassin_v2"]).await.unwrap();
    for message in ["a", "b"] {
        store
            .insert_one("spamassassin", &doc(json!({"hash": "same", "message": message})))
            .await
            .unwrap();
    }

    let initializer = SchemaInitializer::new(&store, InitOptions::default());
    let err = initializer
        .ensure_unique_index("spamassassin", "hash")
        .await
        .unwrap_err();
    match err {
        SchemaError::ConstraintViolation { collection, field } => {
            assert_eq!(collection, "spamassassin");
            assert_eq!(field, "hash");
        }
        other => panic!("expected constraint violation, got {other:?}"),
    }
    assert!(store.list_indexes("spamassassin").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_ensure_unique_index_twice() {
    let (_dir, store) = open_store();
    provision(&store, &["ham_spam"]).await.unwrap();

    let initializer = SchemaInitializer::new(&store, InitOptions::default());
    assert_eq!(
        initializer.ensure_unique_index("ham_spam", "hash").await.unwrap(),
        IndexOutcome::Unchanged
    );
}

#[tokio::test]
async fn test_conflicting_profiles_touch_nothing() {
    let (_dir, store) = open_store();
    let err = provision(&store, &["spamassassin_v1", "spamassassin_v2"]).await.unwrap_err();

    assert!(matches!(err, SchemaError::AmbiguousDefinition { .. }));
    assert!(store.list_collections().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_verify_reports_drift() {
    let (_dir, store) = open_store();
    let catalog = SchemaCatalog::builtin().unwrap();
    let initializer = SchemaInitializer::new(&store, InitOptions::default());

    let selected = catalog.select(&["ham_spam"]).unwrap();
    assert_eq!(
        initializer.verify(&selected).await.unwrap(),
        vec![Drift::MissingCollection {
            collection: "ham_spam".to_string()
        }]
    );

    store.create_collection("ham_spam", &Value::Null).await.unwrap();
    assert_eq!(
        initializer.verify(&selected).await.unwrap(),
        vec![
            Drift::ValidatorMismatch {
                collection: "ham_spam".to_string()
            },
            Drift::MissingIndex {
                collection: "ham_spam".to_string(),
                field: "hash".to_string()
            },
        ]
    );
}

#[tokio::test]
async fn test_verify_after_init_is_clean() {
    let (_dir, store) = open_store();
    provision(&store, &["ham_spam", "kaamelott"]).await.unwrap();

    let catalog = SchemaCatalog::builtin().unwrap();
    let selected = catalog.select::<&str>(&[]).unwrap();
    let drifts = SchemaInitializer::new(&store, InitOptions::default())
        .verify(&selected)
        .await
        .unwrap();
    assert!(drifts.is_empty());
}

#[tokio::test]
async fn test_store_reopens_with_state() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("errol.db");
    {
        let store = SqliteStore::open(&path, "errol", 1).unwrap();
        provision(&store, &["ham_spam"]).await.unwrap();
    }

    let store = SqliteStore::open(&path, "errol", 1).unwrap();
    assert_eq!(store.database(), "errol");
    let report = provision(&store, &["ham_spam"]).await.unwrap();
    assert!(report.is_noop());
}
