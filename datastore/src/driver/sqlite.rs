//! SQLite storage driver.
//!
//! Each table holds `(id TEXT PRIMARY KEY, payload TEXT, sort_keys TEXT)`.
//! `payload` is the record's JSON and `sort_keys` holds the
//! [`sort_keys`](harbor_engine::sql::sort_keys) of its temporal fields.
//! Predicates run inside SQLite through [`SqlQuery`](harbor_engine::SqlQuery).

use std::collections::HashMap;

use async_trait::async_trait;
use harbor_engine::sql::{quote_identifier, sort_keys, SORT_KEYS_COLUMN};
use harbor_engine::{
    Model, ModelSchema, QueryOptions, SchemaRegistry, SqlBinding, SqlQuery,
    PENDING_MUTATION_TABLE,
};
use sqlx::query::Query;
use sqlx::sqlite::{Sqlite, SqliteArguments, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tokio::sync::RwLock;

use super::{decode_row, DriverWrite, StorageDriver};
use crate::error::Result;

/// Driver backed by an sqlx SQLite pool.
///
/// [`close`](StorageDriver::close) shuts the pool down; the next
/// [`open`](StorageDriver::open) connects a new one with the same options.
#[derive(Debug)]
pub struct SqliteDriver {
    pool: RwLock<SqlitePool>,
    schemas: RwLock<HashMap<String, ModelSchema>>,
}

impl SqliteDriver {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool: RwLock::new(pool),
            schemas: RwLock::new(HashMap::new()),
        }
    }

    /// Connect to `database_url`. In-memory databases get a single
    /// connection since each connection would see its own database.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let max_connections = if database_url.contains(":memory:") { 1 } else { 4 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Handle to the current pool.
    pub async fn pool(&self) -> SqlitePool {
        self.pool.read().await.clone()
    }

    /// Replace a closed pool with a fresh one built from the same options.
    async fn reconnect_if_closed(&self) -> Result<SqlitePool> {
        let mut pool = self.pool.write().await;
        if pool.is_closed() {
            let options = (*pool.connect_options()).clone();
            *pool = pool.options().clone().connect_with(options).await?;
            tracing::debug!("SQLite pool reconnected");
        }
        Ok(pool.clone())
    }

    /// `sort_keys` value for a row of `table`. Tables without a model
    /// schema get an empty object.
    async fn sort_keys_for(&self, table: &str, row: &serde_json::Value) -> Result<String> {
        let keys = match self.schemas.read().await.get(table) {
            Some(schema) => sort_keys(schema, row)?,
            None => serde_json::json!({}),
        };
        Ok(keys.to_string())
    }
}

fn bind_all<'q>(
    mut query: Query<'q, Sqlite, SqliteArguments<'q>>,
    bindings: &'q [SqlBinding],
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    for binding in bindings {
        query = match binding {
            SqlBinding::Null => query.bind(None::<String>),
            SqlBinding::Integer(i) => query.bind(*i),
            SqlBinding::Real(f) => query.bind(*f),
            SqlBinding::Text(s) => query.bind(s.as_str()),
        };
    }
    query
}

fn upsert_sql(table: &str) -> String {
    format!(
        "INSERT INTO {table} (id, payload, {keys}) VALUES (?, ?, ?) \
         ON CONFLICT(id) DO UPDATE SET payload = excluded.payload, {keys} = excluded.{keys}",
        table = quote_identifier(table),
        keys = SORT_KEYS_COLUMN
    )
}

fn delete_sql(table: &str) -> String {
    format!("DELETE FROM {} WHERE id = ?", quote_identifier(table))
}

#[async_trait]
impl StorageDriver for SqliteDriver {
    async fn open(&self, registry: &SchemaRegistry) -> Result<()> {
        let pool = self.reconnect_if_closed().await?;
        let mut names: Vec<String> = registry.schemas().map(|s| s.name.clone()).collect();
        names.push(PENDING_MUTATION_TABLE.to_string());

        for name in &names {
            let sql = format!(
                "CREATE TABLE IF NOT EXISTS {} (id TEXT PRIMARY KEY NOT NULL, \
                 payload TEXT NOT NULL, {} TEXT NOT NULL DEFAULT '{{}}')",
                quote_identifier(name),
                SORT_KEYS_COLUMN
            );
            sqlx::query(&sql).execute(&pool).await?;
        }

        tracing::debug!(tables = names.len(), "SQLite tables ready");
        *self.schemas.write().await = registry
            .schemas()
            .map(|schema| (schema.name.clone(), schema.clone()))
            .collect();
        Ok(())
    }

    async fn upsert(&self, table: &str, id: &str, row: &serde_json::Value) -> Result<()> {
        let payload = serde_json::to_string(row)?;
        let keys = self.sort_keys_for(table, row).await?;
        sqlx::query(&upsert_sql(table))
            .bind(id)
            .bind(payload)
            .bind(keys)
            .execute(&self.pool().await)
            .await?;
        Ok(())
    }

    async fn get(&self, table: &str, id: &str) -> Result<Option<serde_json::Value>> {
        let sql = format!("SELECT payload FROM {} WHERE id = ?", quote_identifier(table));
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool().await)
            .await?;
        match row {
            Some(row) => {
                let payload: String = row.try_get("payload")?;
                Ok(Some(serde_json::from_str(&payload)?))
            }
            None => Ok(None),
        }
    }

    async fn select(&self, schema: &ModelSchema, options: &QueryOptions) -> Result<Vec<Model>> {
        let query = SqlQuery::select(&schema.name, schema, options)?;
        let rows = bind_all(sqlx::query(&query.sql), &query.bindings)
            .fetch_all(&self.pool().await)
            .await?;

        let mut models = Vec::with_capacity(rows.len());
        for row in rows {
            let payload: String = row.try_get("payload")?;
            let value: serde_json::Value = serde_json::from_str(&payload)?;
            models.push(decode_row(schema, &value)?);
        }
        Ok(models)
    }

    async fn scan(&self, table: &str) -> Result<Vec<serde_json::Value>> {
        let sql = format!("SELECT payload FROM {} ORDER BY rowid", quote_identifier(table));
        let rows = sqlx::query(&sql).fetch_all(&self.pool().await).await?;
        rows.iter()
            .map(|row| {
                let payload: String = row.try_get("payload")?;
                Ok(serde_json::from_str(&payload)?)
            })
            .collect()
    }

    async fn delete(&self, table: &str, id: &str) -> Result<bool> {
        let result = sqlx::query(&delete_sql(table))
            .bind(id)
            .execute(&self.pool().await)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn apply_batch(&self, writes: Vec<DriverWrite>) -> Result<()> {
        let mut tx = self.pool().await.begin().await?;
        for write in &writes {
            match write {
                DriverWrite::Upsert { table, id, row } => {
                    let keys = self.sort_keys_for(table, row).await?;
                    sqlx::query(&upsert_sql(table))
                        .bind(id.as_str())
                        .bind(serde_json::to_string(row)?)
                        .bind(keys)
                        .execute(&mut *tx)
                        .await?;
                }
                DriverWrite::Delete { table, id } => {
                    sqlx::query(&delete_sql(table))
                        .bind(id.as_str())
                        .execute(&mut *tx)
                        .await?;
                }
            }
        }
        tx.commit().await?;
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        let mut tables: Vec<String> = self.schemas.read().await.keys().cloned().collect();
        tables.push(PENDING_MUTATION_TABLE.to_string());
        let mut tx = self.pool().await.begin().await?;
        for table in &tables {
            sqlx::query(&format!("DELETE FROM {}", quote_identifier(table)))
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.pool().await.close().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harbor_engine::{field, DateTime, FieldDef, FieldType, Page, QuerySortBy, Time};

    fn registry() -> SchemaRegistry {
        SchemaRegistry::from_schemas(
            1,
            vec![
                ModelSchema::new(
                    "Todo",
                    vec![
                        FieldDef::required("title", FieldType::String),
                        FieldDef::optional("priority", FieldType::Int),
                        FieldDef::optional("done", FieldType::Bool),
                        FieldDef::optional("tags", FieldType::List(Box::new(FieldType::String))),
                    ],
                ),
                ModelSchema::new(
                    "Event",
                    vec![
                        FieldDef::required("name", FieldType::String),
                        FieldDef::optional("at", FieldType::DateTime),
                        FieldDef::optional("slot", FieldType::Time),
                    ],
                ),
            ],
        )
        .unwrap()
    }

    fn event(name: &str, at: &str) -> Model {
        Model::builder("Event")
            .set("name", name)
            .set("at", DateTime::parse(at).unwrap())
            .build()
            .unwrap()
    }

    fn names(models: &[Model]) -> Vec<String> {
        models
            .iter()
            .filter_map(|m| m.get("name").and_then(|v| v.as_str()).map(str::to_string))
            .collect()
    }

    async fn opened() -> SqliteDriver {
        let driver = SqliteDriver::connect("sqlite::memory:").await.unwrap();
        driver.open(&registry()).await.unwrap();
        driver
    }

    fn todo(title: &str, priority: Option<i64>, done: bool, tags: Vec<&str>) -> Model {
        Model::builder("Todo")
            .set("title", title)
            .set("priority", priority)
            .set("done", done)
            .set("tags", tags)
            .build()
            .unwrap()
    }

    async fn seed(driver: &SqliteDriver) -> Vec<Model> {
        let todos = vec![
            todo("alpha", Some(3), false, vec!["home"]),
            todo("beta", Some(1), true, vec!["work", "home"]),
            todo("gamma", None, false, vec![]),
        ];
        for t in &todos {
            driver.upsert("Todo", t.id(), &t.to_json()).await.unwrap();
        }
        todos
    }

    fn titles(models: &[Model]) -> Vec<String> {
        models
            .iter()
            .filter_map(|m| m.get("title").and_then(|v| v.as_str()).map(str::to_string))
            .collect()
    }

    #[tokio::test]
    async fn round_trips_payload() {
        let driver = opened().await;
        let todos = seed(&driver).await;
        let stored = driver.get("Todo", todos[1].id()).await.unwrap();
        assert_eq!(stored, Some(todos[1].to_json()));
    }

    #[tokio::test]
    async fn upsert_replaces_payload() {
        let driver = opened().await;
        let t = todo("before", Some(1), false, vec![]);
        driver.upsert("Todo", t.id(), &t.to_json()).await.unwrap();
        let updated = t.to_builder().set("title", "after").build().unwrap();
        driver.upsert("Todo", t.id(), &updated.to_json()).await.unwrap();
        assert_eq!(driver.scan("Todo").await.unwrap(), vec![updated.to_json()]);
    }

    #[tokio::test]
    async fn select_runs_predicates_in_sql() {
        let registry = registry();
        let schema = registry.get("Todo").unwrap();
        let driver = opened().await;
        seed(&driver).await;

        let found = driver
            .select(schema, &QueryOptions::matches(field("done").eq(true)))
            .await
            .unwrap();
        assert_eq!(titles(&found), vec!["beta"]);

        let found = driver
            .select(schema, &QueryOptions::matches(field("tags").contains("home"))
                .sorted_by(QuerySortBy::ascending("title")))
            .await
            .unwrap();
        assert_eq!(titles(&found), vec!["alpha", "beta"]);

        let found = driver
            .select(schema, &QueryOptions::matches(field("priority").ne(3))
                .sorted_by(QuerySortBy::ascending("title")))
            .await
            .unwrap();
        assert_eq!(titles(&found), vec!["beta", "gamma"]);
    }

    #[tokio::test]
    async fn select_agrees_with_in_memory_evaluation() {
        let registry = registry();
        let schema = registry.get("Todo").unwrap();
        let driver = opened().await;
        let todos = seed(&driver).await;

        let predicates = vec![
            field("priority").gt(1),
            field("priority").eq(harbor_engine::FieldValue::Null),
            field("title").begins_with("al").or(field("done").eq(true)),
            field("tags").not_contains("work").negate(),
            field("priority").between(1, 2).negate(),
        ];
        for predicate in predicates {
            let options = QueryOptions::matches(predicate.clone())
                .sorted_by(QuerySortBy::ascending("title"));
            let from_sql = driver.select(schema, &options).await.unwrap();
            let in_memory = options.apply(schema, todos.clone()).unwrap();
            assert_eq!(titles(&from_sql), titles(&in_memory), "predicate {}", predicate);
        }
    }

    #[tokio::test]
    async fn sorts_nulls_first_and_paginates() {
        let registry = registry();
        let schema = registry.get("Todo").unwrap();
        let driver = opened().await;
        seed(&driver).await;

        let options = QueryOptions::all().sorted_by(QuerySortBy::ascending("priority"));
        let found = driver.select(schema, &options).await.unwrap();
        assert_eq!(titles(&found), vec!["gamma", "beta", "alpha"]);

        let page = options.paginated(Page::starting_at(1).with_limit(2));
        let found = driver.select(schema, &page).await.unwrap();
        assert_eq!(titles(&found), vec!["alpha"]);
    }

    #[tokio::test]
    async fn clear_empties_every_table() {
        let driver = opened().await;
        seed(&driver).await;
        let e = event("launch", "2024-05-01T10:00:00Z");
        driver.upsert("Event", e.id(), &e.to_json()).await.unwrap();

        driver.clear().await.unwrap();
        assert!(driver.scan("Todo").await.unwrap().is_empty());
        assert!(driver.scan("Event").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn temporal_comparisons_use_instants() {
        let registry = registry();
        let schema = registry.get("Event").unwrap();
        let driver = opened().await;
        let events = vec![
            event("half-past", "2024-05-01T10:00:00.500Z"),
            event("nine-utc", "2024-05-01T09:00:00Z"),
            event("early-plus-two", "2024-05-01T11:30:00+02:00"),
            event("late-minus-one", "2024-05-01T09:30:00-01:00"),
            event("ten-plus-one", "2024-05-01T11:00:00+01:00"),
        ];
        for e in &events {
            driver.upsert("Event", e.id(), &e.to_json()).await.unwrap();
        }

        // Fractional seconds and offsets both defeat ordering on ISO text.
        let ten = DateTime::parse("2024-05-01T10:00:00Z").unwrap();
        let quarter_to_ten = DateTime::parse("2024-05-01T11:45:00+02:00").unwrap();
        let found = driver
            .select(
                schema,
                &QueryOptions::matches(field("at").gt(ten.clone()))
                    .sorted_by(QuerySortBy::ascending("name")),
            )
            .await
            .unwrap();
        // Same instant as ten; the wire form breaks the tie.
        assert_eq!(names(&found), vec!["half-past", "late-minus-one", "ten-plus-one"]);

        let found = driver
            .select(
                schema,
                &QueryOptions::matches(field("at").lt(quarter_to_ten.clone()))
                    .sorted_by(QuerySortBy::ascending("name")),
            )
            .await
            .unwrap();
        assert_eq!(names(&found), vec!["early-plus-two", "nine-utc"]);

        let by_instant = driver
            .select(schema, &QueryOptions::all().sorted_by(QuerySortBy::ascending("at")))
            .await
            .unwrap();
        assert_eq!(
            names(&by_instant),
            vec!["nine-utc", "early-plus-two", "ten-plus-one", "half-past", "late-minus-one"]
        );

        let predicates = vec![
            field("at").ge(ten.clone()),
            field("at").le(ten.clone()),
            field("at").eq(ten.clone()),
            field("at").ne(ten.clone()),
            field("at").between(quarter_to_ten, ten).negate(),
        ];
        for predicate in predicates {
            let options = QueryOptions::matches(predicate.clone())
                .sorted_by(QuerySortBy::descending("at"));
            let from_sql = driver.select(schema, &options).await.unwrap();
            let in_memory = options.apply(schema, events.clone()).unwrap();
            assert_eq!(names(&from_sql), names(&in_memory), "predicate {}", predicate);
        }
    }

    #[tokio::test]
    async fn batch_writes_store_sort_keys() {
        let registry = registry();
        let schema = registry.get("Event").unwrap();
        let driver = opened().await;
        let slot = Model::builder("Event")
            .set("name", "standup")
            .set("slot", Time::parse("09:30:00+02:00").unwrap())
            .build()
            .unwrap();
        driver
            .apply_batch(vec![DriverWrite::upsert_model(&slot)])
            .await
            .unwrap();

        let found = driver
            .select(
                schema,
                &QueryOptions::matches(field("slot").lt(Time::parse("08:00:00Z").unwrap())),
            )
            .await
            .unwrap();
        assert_eq!(found, vec![slot]);
    }

    #[tokio::test]
    async fn reopens_after_close() {
        let path = std::env::temp_dir().join(format!("harbor-{}.db", uuid::Uuid::new_v4()));
        let url = format!("sqlite://{}?mode=rwc", path.display());
        let driver = SqliteDriver::connect(&url).await.unwrap();
        driver.open(&registry()).await.unwrap();
        let t = todo("kept", None, false, vec![]);
        driver.upsert("Todo", t.id(), &t.to_json()).await.unwrap();

        driver.close().await.unwrap();
        assert!(driver.get("Todo", t.id()).await.is_err());

        driver.open(&registry()).await.unwrap();
        assert_eq!(driver.get("Todo", t.id()).await.unwrap(), Some(t.to_json()));
        driver.close().await.unwrap();
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn rows_with_dropped_fields_still_decode() {
        let registry = registry();
        let schema = registry.get("Todo").unwrap();
        let driver = opened().await;
        let t = todo("old", Some(2), false, vec![]);
        let mut row = t.to_json();
        row["colour"] = serde_json::json!("red");
        driver.upsert("Todo", t.id(), &row).await.unwrap();

        let found = driver.select(schema, &QueryOptions::all()).await.unwrap();
        assert_eq!(found, vec![t]);
    }

    #[tokio::test]
    async fn failing_batch_rolls_back() {
        let driver = opened().await;
        let t = todo("a", None, false, vec![]);
        let result = driver
            .apply_batch(vec![
                DriverWrite::upsert_model(&t),
                DriverWrite::Delete {
                    table: "Missing".into(),
                    id: "x".into(),
                },
            ])
            .await;
        assert!(result.is_err());
        assert!(driver.scan("Todo").await.unwrap().is_empty());
    }
}
