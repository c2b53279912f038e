//! # Harbor DataStore
//!
//! The async runtime of the Harbor offline data store.
//!
//! Applications save, delete and query typed records against local storage.
//! Every local write is recorded in an outbox before it is applied, so it
//! survives restarts, and is reconciled with a remote system in the
//! background. Remote writes are merged back unless a local mutation for the
//! same record is still pending.
//!
//! ## Components
//!
//! - [`DataStore`]: the facade applications talk to
//! - [`LocalStorageAdapter`]: preconditions, cascades and change publication
//!   over a [`StorageDriver`] ([`MemoryDriver`] or [`SqliteDriver`])
//! - [`Outbox`]: durable queue of pending local mutations
//! - [`Merger`]: applies writes arriving from the remote system
//! - [`Hub`]: lifecycle and outbox events on the `datastore` channel
//!
//! ## Quick Start
//!
//! ```no_run
//! use harbor_datastore::{DataStore, DataStoreConfig};
//! use harbor_engine::{field, FieldDef, FieldType, Model, ModelSchema, QueryOptions, SchemaRegistry};
//!
//! # async fn run() -> harbor_datastore::Result<()> {
//! let registry = SchemaRegistry::from_schemas(
//!     1,
//!     vec![ModelSchema::new(
//!         "Todo",
//!         vec![FieldDef::required("title", FieldType::String)],
//!     )],
//! )?;
//!
//! let store = DataStore::new(DataStoreConfig::default());
//! store.configure(registry).await?;
//!
//! let todo = Model::builder("Todo").set("title", "Buy milk").build()?;
//! store.save(todo).await?;
//!
//! let found = store
//!     .query("Todo", QueryOptions::matches(field("title").begins_with("Buy")))
//!     .await?;
//! assert_eq!(found.len(), 1);
//! # Ok(())
//! # }
//! ```

mod adapter;
mod broker;
mod config;
mod datastore;
mod driver;
mod error;
mod hub;
mod locks;
mod merger;
mod observe_query;
mod outbox;
mod pool;
mod remote;
mod sync_status;
mod telemetry;

pub use adapter::{AdapterState, LocalStorageAdapter};
pub use broker::{ChangeBroker, ChangeStream};
pub use config::{ConfigError, DataStoreConfig};
pub use datastore::DataStore;
pub use driver::{DriverWrite, MemoryDriver, SqliteDriver, StorageDriver};
pub use error::{DataStoreError, Result};
pub use hub::{DataStoreEvent, Hub, HubEvent, ModelSyncedEvent, OutboxMutationEvent, DATASTORE_CHANNEL};
pub use locks::{RecordGuard, RecordLocks};
pub use merger::Merger;
pub use observe_query::{ObserveQuerySettings, QuerySubscription};
pub use outbox::{FailedMutation, Outbox};
pub use pool::WorkerPool;
pub use remote::{LocalOnly, ReconcileOutcome, RemoteReconciler};
pub use sync_status::SyncStatus;
pub use telemetry::{init_tracing, DEFAULT_FILTER};
