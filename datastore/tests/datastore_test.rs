//! Integration tests for the DataStore facade.
//!
//! Everything runs against in-process storage: the memory driver, or SQLite
//! in memory where a test exercises both.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use harbor_datastore::{
    DataStore, DataStoreConfig, DataStoreError, MemoryDriver, ModelSyncedEvent, SqliteDriver,
};
use harbor_engine::{
    field, ChangeType, Date, DateTime, FieldDef, FieldType, FieldValue, Model, ModelSchema, Page,
    QueryOptions, QuerySortBy, SchemaRegistry, Time,
};

fn registry() -> SchemaRegistry {
    SchemaRegistry::from_schemas(
        1,
        vec![
            ModelSchema::new(
                "Todo",
                vec![
                    FieldDef::required("title", FieldType::String),
                    FieldDef::optional("status", FieldType::String),
                    FieldDef::optional("priority", FieldType::Int),
                    FieldDef::has_many("notes", "Note", "todoId"),
                ],
            ),
            ModelSchema::new(
                "Note",
                vec![
                    FieldDef::required("text", FieldType::String),
                    FieldDef::belongs_to("todoId", "Todo", true),
                ],
            ),
            ModelSchema::new(
                "Sample",
                vec![
                    FieldDef::optional("text", FieldType::String),
                    FieldDef::optional("count", FieldType::Int),
                    FieldDef::optional("ratio", FieldType::Float),
                    FieldDef::optional("done", FieldType::Bool),
                    FieldDef::optional("day", FieldType::Date),
                    FieldDef::optional("at", FieldType::DateTime),
                    FieldDef::optional("clock", FieldType::Time),
                    FieldDef::optional("tags", FieldType::List(Box::new(FieldType::String))),
                ],
            ),
        ],
    )
    .unwrap()
}

fn todo(title: &str, status: &str) -> Model {
    Model::builder("Todo")
        .set("title", title)
        .set("status", status)
        .build()
        .unwrap()
}

async fn configured() -> DataStore {
    let store = DataStore::new(DataStoreConfig::default())
        .with_driver(Arc::new(MemoryDriver::new()));
    store.configure(registry()).await.unwrap();
    store
}

async fn sqlite_configured() -> DataStore {
    let driver = SqliteDriver::connect("sqlite::memory:").await.unwrap();
    let store = DataStore::new(DataStoreConfig::default()).with_driver(Arc::new(driver));
    store.configure(registry()).await.unwrap();
    store
}

/// A fresh SQLite file under the temp dir, and its connection URL.
fn temp_database() -> (std::path::PathBuf, String) {
    let path = std::env::temp_dir().join(format!("harbor-{}.db", uuid::Uuid::new_v4()));
    let url = format!("sqlite://{}?mode=rwc", path.display());
    (path, url)
}

async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("timed out")
}

mod mutation_tests {
    use super::*;

    #[tokio::test]
    async fn test_unmet_save_condition_keeps_stored_record() {
        let store = configured().await;
        let original = store.save(todo("Buy milk", "A")).await.unwrap().item;

        let updated = original.to_builder().set("title", "Buy bread").build().unwrap();
        let err = store
            .save_with_condition(updated, field("status").eq("B"))
            .await
            .unwrap_err();

        assert!(matches!(err, DataStoreError::PredicateConditionFailed { .. }));
        let stored = store.get("Todo", original.id()).await.unwrap();
        assert_eq!(stored, Some(original));
    }

    #[tokio::test]
    async fn test_met_save_condition_updates_record() {
        let store = configured().await;
        let original = store.save(todo("Buy milk", "A")).await.unwrap().item;

        let updated = original.to_builder().set("status", "B").build().unwrap();
        let change = store
            .save_with_condition(updated.clone(), field("status").eq("A"))
            .await
            .unwrap();

        assert_eq!(change.change_type, ChangeType::Update);
        assert_eq!(store.get("Todo", original.id()).await.unwrap(), Some(updated));
    }

    #[tokio::test]
    async fn test_deleted_record_is_not_returned_by_queries() {
        let store = configured().await;
        let kept = store.save(todo("Keep", "X")).await.unwrap().item;
        let gone = store.save(todo("Drop", "X")).await.unwrap().item;

        store.delete(gone.clone()).await.unwrap();

        let found = store.query("Todo", QueryOptions::all()).await.unwrap();
        assert_eq!(found, vec![kept]);
        assert_eq!(store.get("Todo", gone.id()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_delete_cascades_to_children() {
        let store = configured().await;
        let parent = store.save(todo("Parent", "X")).await.unwrap().item;
        let note = Model::builder("Note")
            .set("text", "child")
            .set("todoId", parent.id())
            .build()
            .unwrap();
        store.save(note.clone()).await.unwrap();

        store.delete(parent).await.unwrap();

        assert_eq!(store.get("Note", note.id()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_delete_where_removes_only_matches() {
        let store = configured().await;
        store.save(todo("One", "done")).await.unwrap();
        store.save(todo("Two", "done")).await.unwrap();
        let open = store.save(todo("Three", "open")).await.unwrap().item;

        let deleted = store
            .delete_where("Todo", field("status").eq("done"))
            .await
            .unwrap();

        assert_eq!(deleted.len(), 2);
        assert!(deleted.iter().all(|c| c.change_type == ChangeType::Delete));
        let rest = store.query("Todo", QueryOptions::all()).await.unwrap();
        assert_eq!(rest, vec![open]);
    }

    #[tokio::test]
    async fn test_invalid_model_is_rejected() {
        let store = configured().await;
        let untitled = Model::builder("Todo").set("status", "X").build().unwrap();

        let err = store.save(untitled).await.unwrap_err();
        assert!(matches!(err, DataStoreError::InvalidModel(_)));
        assert!(store.query("Todo", QueryOptions::all()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_non_finite_float_is_rejected() {
        for store in [configured().await, sqlite_configured().await] {
            for ratio in [f64::NAN, f64::INFINITY] {
                let sample = Model::builder("Sample").set("ratio", ratio).build().unwrap();
                let err = store.save(sample).await.unwrap_err();
                assert!(matches!(err, DataStoreError::InvalidModel(_)), "{:?}", err);
            }
            assert!(store.query("Sample", QueryOptions::all()).await.unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn test_predicate_on_unknown_field_is_malformed() {
        let store = configured().await;
        let err = store
            .query("Todo", QueryOptions::matches(field("colour").eq("red")))
            .await
            .unwrap_err();
        assert!(matches!(err, DataStoreError::MalformedPredicate(_)));
    }
}

mod query_tests {
    use super::*;

    #[tokio::test]
    async fn test_todo_scenario_filters_sorts_and_pages() {
        let store = configured().await;
        for (title, status, priority) in [
            ("walk dog", "X", 2),
            ("buy milk", "X", 1),
            ("pay rent", "Y", 3),
            ("call mum", "X", 5),
        ] {
            let model = todo(title, status)
                .to_builder()
                .set("priority", priority)
                .build()
                .unwrap();
            store.save(model).await.unwrap();
        }

        let options = QueryOptions::matches(field("status").eq("X"))
            .sorted_by(QuerySortBy::ascending("title"))
            .paginated(Page::first_page().with_limit(2));
        let titles: Vec<String> = store
            .query("Todo", options)
            .await
            .unwrap()
            .iter()
            .filter_map(|m| m.get("title").and_then(|v| v.as_str()).map(String::from))
            .collect();
        assert_eq!(titles, vec!["buy milk", "call mum"]);

        let urgent = store
            .query(
                "Todo",
                QueryOptions::matches(field("priority").gt(1).and(field("status").ne("Y")))
                    .sorted_by(QuerySortBy::descending("priority")),
            )
            .await
            .unwrap();
        let priorities: Vec<_> = urgent.iter().filter_map(|m| m.get("priority")).cloned().collect();
        assert_eq!(priorities, vec![FieldValue::Int(5), FieldValue::Int(2)]);
    }

    fn sample() -> Model {
        Model::builder("Sample")
            .set("text", "hello")
            .set("count", 42)
            .set("ratio", 0.25)
            .set("done", true)
            .set("day", Date::parse("2024-02-29").unwrap())
            .set("at", DateTime::parse("2024-02-29T12:30:00.250+02:00").unwrap())
            .set("clock", Time::parse("23:59:59").unwrap())
            .set(
                "tags",
                FieldValue::List(vec!["red".into(), "green".into()]),
            )
            .build()
            .unwrap()
    }

    async fn assert_round_trip(store: &DataStore) {
        let saved = store.save(sample()).await.unwrap().item;

        let found = store.query("Sample", QueryOptions::all()).await.unwrap();
        assert_eq!(found, vec![saved.clone()]);
        assert_eq!(store.get("Sample", saved.id()).await.unwrap(), Some(saved));
    }

    #[tokio::test]
    async fn test_scalar_types_round_trip_in_memory() {
        let store = configured().await;
        assert_round_trip(&store).await;
    }

    #[tokio::test]
    async fn test_scalar_types_round_trip_in_sqlite() {
        let driver = SqliteDriver::connect("sqlite::memory:").await.unwrap();
        let store = DataStore::new(DataStoreConfig::default()).with_driver(Arc::new(driver));
        store.configure(registry()).await.unwrap();
        assert_round_trip(&store).await;
    }

    fn at(text: &str) -> Model {
        Model::builder("Sample")
            .set("text", text)
            .set("at", DateTime::parse(text).unwrap())
            .build()
            .unwrap()
    }

    async fn texts(store: &DataStore, options: QueryOptions) -> Vec<String> {
        store
            .query("Sample", options)
            .await
            .unwrap()
            .iter()
            .filter_map(|m| m.get("text").and_then(|v| v.as_str()).map(String::from))
            .collect()
    }

    #[tokio::test]
    async fn test_datetime_filters_agree_across_drivers() {
        for store in [configured().await, sqlite_configured().await] {
            store.save(at("2024-05-01T10:00:00.500Z")).await.unwrap();

            let later = field("at").gt(DateTime::parse("2024-05-01T10:00:00Z").unwrap());
            assert_eq!(
                texts(&store, QueryOptions::matches(later)).await,
                vec!["2024-05-01T10:00:00.500Z"]
            );

            // 11:00 at +02:00 is 09:00 UTC.
            let earlier = field("at").lt(DateTime::parse("2024-05-01T11:00:00+02:00").unwrap());
            assert!(texts(&store, QueryOptions::matches(earlier)).await.is_empty());
        }
    }

    #[tokio::test]
    async fn test_datetime_sort_agrees_across_drivers() {
        for store in [configured().await, sqlite_configured().await] {
            for text in [
                "2024-05-01T10:00:00.500Z",
                "2024-05-01T11:30:00+02:00",
                "2024-05-01T09:30:00-01:00",
            ] {
                store.save(at(text)).await.unwrap();
            }
            let options = QueryOptions::all().sorted_by(QuerySortBy::ascending("at"));
            assert_eq!(
                texts(&store, options).await,
                vec![
                    "2024-05-01T11:30:00+02:00",
                    "2024-05-01T10:00:00.500Z",
                    "2024-05-01T09:30:00-01:00",
                ]
            );
        }
    }

    #[tokio::test]
    async fn test_sqlite_url_from_config_is_used() {
        let config = DataStoreConfig::builder()
            .with_database_url("sqlite::memory:")
            .build()
            .unwrap();
        let store = DataStore::new(config);
        store.configure(registry()).await.unwrap();
        assert_round_trip(&store).await;
    }
}

mod observe_tests {
    use super::*;

    #[tokio::test]
    async fn test_observe_sees_local_changes_in_order() {
        let store = configured().await;
        let mut changes = store.observe().await.unwrap();

        let created = store.save(todo("Buy milk", "A")).await.unwrap().item;
        let updated = created.to_builder().set("status", "B").build().unwrap();
        store.save(updated.clone()).await.unwrap();
        store.delete(updated).await.unwrap();

        let mut seen = Vec::new();
        for _ in 0..3 {
            let change = within(changes.recv()).await.unwrap();
            assert_eq!(change.item.id(), created.id());
            seen.push(change.change_type);
        }
        assert_eq!(seen, vec![ChangeType::Create, ChangeType::Update, ChangeType::Delete]);
    }

    #[tokio::test]
    async fn test_observe_query_batches_until_max_records() {
        let config = DataStoreConfig::builder()
            .with_observe_query_max_records(2)
            .with_observe_query_max_time(Duration::from_secs(60))
            .build()
            .unwrap();
        let store = DataStore::new(config).with_driver(Arc::new(MemoryDriver::new()));
        store.configure(registry()).await.unwrap();

        let mut query = store
            .observe_query("Todo", QueryOptions::matches(field("status").eq("X")))
            .await
            .unwrap();
        let initial = within(query.recv()).await.unwrap().unwrap();
        assert!(initial.items.is_empty());
        assert!(!initial.is_synced);

        store.save(todo("ignored", "Y")).await.unwrap();
        store.save(todo("first", "X")).await.unwrap();
        store.save(todo("second", "X")).await.unwrap();

        let batch = within(query.recv()).await.unwrap().unwrap();
        assert_eq!(batch.items.len(), 2);
        assert_eq!(batch.item_changes.len(), 2);
    }

    #[tokio::test]
    async fn test_observe_query_flushes_after_max_time() {
        let config = DataStoreConfig::builder()
            .with_observe_query_max_records(100)
            .with_observe_query_max_time(Duration::from_millis(50))
            .build()
            .unwrap();
        let store = DataStore::new(config).with_driver(Arc::new(MemoryDriver::new()));
        store.configure(registry()).await.unwrap();

        let mut query = store.observe_query("Todo", QueryOptions::all()).await.unwrap();
        within(query.recv()).await.unwrap().unwrap();

        store.save(todo("lonely", "X")).await.unwrap();
        let snapshot = within(query.recv()).await.unwrap().unwrap();
        assert_eq!(snapshot.items.len(), 1);
        assert_eq!(snapshot.item_changes.len(), 1);
    }

    #[tokio::test]
    async fn test_observe_query_emits_every_change_once_synced() {
        let config = DataStoreConfig::builder()
            .with_observe_query_max_records(100)
            .with_observe_query_max_time(Duration::from_secs(60))
            .build()
            .unwrap();
        let store = DataStore::new(config).with_driver(Arc::new(MemoryDriver::new()));
        store.configure(registry()).await.unwrap();

        let mut query = store.observe_query("Todo", QueryOptions::all()).await.unwrap();
        within(query.recv()).await.unwrap().unwrap();

        store
            .mark_model_synced(ModelSyncedEvent {
                model: "Todo".into(),
                is_full_sync: true,
                ..Default::default()
            })
            .await
            .unwrap();
        let synced = within(query.recv()).await.unwrap().unwrap();
        assert!(synced.is_synced);

        let created = store.save(todo("now", "X")).await.unwrap().item;
        let snapshot = within(query.recv()).await.unwrap().unwrap();
        assert_eq!(snapshot.items, vec![created]);
        assert!(snapshot.is_synced);
    }
}

mod lifecycle_tests {
    use super::*;

    #[tokio::test]
    async fn test_operations_before_configure_fail() {
        let store = DataStore::new(DataStoreConfig::default());
        let err = store.query("Todo", QueryOptions::all()).await.unwrap_err();
        assert_eq!(err, DataStoreError::NotConfigured);
        let err = store.save(todo("early", "X")).await.unwrap_err();
        assert_eq!(err, DataStoreError::NotConfigured);
    }

    #[tokio::test]
    async fn test_configure_twice_is_illegal() {
        let store = configured().await;
        let err = store.configure(registry()).await.unwrap_err();
        assert!(matches!(err, DataStoreError::IllegalState(_)));
    }

    #[tokio::test]
    async fn test_unknown_synced_model_is_rejected() {
        let store = configured().await;
        let err = store
            .mark_model_synced(ModelSyncedEvent {
                model: "Ghost".into(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DataStoreError::InvalidModel(_)));
    }

    #[tokio::test]
    async fn test_clear_erases_records_and_keeps_models() {
        let store = configured().await;
        store.save(todo("gone soon", "X")).await.unwrap();

        store.clear().await.unwrap();

        assert!(store.query("Todo", QueryOptions::all()).await.unwrap().is_empty());
        store.save(todo("after clear", "X")).await.unwrap();
        assert_eq!(store.query("Todo", QueryOptions::all()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_field_names_must_be_identifiers() {
        let result = SchemaRegistry::from_schemas(
            1,
            vec![ModelSchema::new(
                "Clock",
                vec![FieldDef::optional("o'clock", FieldType::String)],
            )],
        );
        let err = DataStoreError::from(result.unwrap_err());
        assert!(matches!(err, DataStoreError::InvalidSchema(_)));

        let registry = SchemaRegistry::from_schemas(
            1,
            vec![ModelSchema::new(
                "Clock",
                vec![FieldDef::optional("oClock", FieldType::String)],
            )],
        )
        .unwrap();
        let memory = DataStore::new(DataStoreConfig::default())
            .with_driver(Arc::new(MemoryDriver::new()));
        let sqlite = DataStore::new(DataStoreConfig::default())
            .with_driver(Arc::new(SqliteDriver::connect("sqlite::memory:").await.unwrap()));
        for store in [memory, sqlite] {
            store.configure(registry.clone()).await.unwrap();
            let clock = Model::builder("Clock").set("oClock", "noon").build().unwrap();
            store.save(clock.clone()).await.unwrap();
            let found = store
                .query("Clock", QueryOptions::matches(field("oClock").eq("noon")))
                .await
                .unwrap();
            assert_eq!(found, vec![clock]);
        }
    }

    #[tokio::test]
    async fn test_sqlite_driver_survives_terminate_and_reconfigure() {
        let (path, url) = temp_database();
        let driver = Arc::new(SqliteDriver::connect(&url).await.unwrap());
        let store = DataStore::new(DataStoreConfig::default()).with_driver(driver);

        store.configure(registry()).await.unwrap();
        let saved = store.save(todo("durable", "X")).await.unwrap().item;
        store.terminate().await.unwrap();

        store.configure(registry()).await.unwrap();
        assert_eq!(store.get("Todo", saved.id()).await.unwrap(), Some(saved));
        store.save(todo("second life", "X")).await.unwrap();
        assert_eq!(store.query("Todo", QueryOptions::all()).await.unwrap().len(), 2);

        store.terminate().await.unwrap();
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn test_stored_fields_dropped_from_schema_are_ignored() {
        let (path, url) = temp_database();
        let driver = Arc::new(SqliteDriver::connect(&url).await.unwrap());
        let store = DataStore::new(DataStoreConfig::default()).with_driver(driver);
        store.configure(registry()).await.unwrap();
        let saved = store.save(todo("legacy", "X")).await.unwrap().item;
        store.wait_for_outbox(Duration::from_secs(5)).await.unwrap();
        store.terminate().await.unwrap();

        // Version 2 of Todo no longer has `status`.
        let narrower = SchemaRegistry::from_schemas(
            2,
            vec![ModelSchema::new(
                "Todo",
                vec![FieldDef::required("title", FieldType::String)],
            )],
        )
        .unwrap();
        store.configure(narrower).await.unwrap();

        let found = store.get("Todo", saved.id()).await.unwrap().unwrap();
        assert_eq!(found.get("title"), Some(&FieldValue::from("legacy")));
        assert_eq!(found.get("status"), None);
        assert_eq!(store.query("Todo", QueryOptions::all()).await.unwrap(), vec![found]);

        store.terminate().await.unwrap();
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn test_terminate_then_reconfigure() {
        let store = configured().await;
        store.terminate().await.unwrap();
        store.terminate().await.unwrap();

        let err = store.query("Todo", QueryOptions::all()).await.unwrap_err();
        assert_eq!(err, DataStoreError::NotConfigured);

        store.configure(registry()).await.unwrap();
        store.save(todo("back", "X")).await.unwrap();
    }
}
