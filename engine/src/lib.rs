//! # Harbor Engine
//!
//! The synchronous core of the Harbor offline data store.
//!
//! This crate holds everything about records and queries that does not touch
//! storage or the network: model schemas, typed field values, the predicate
//! language, its SQL translation, and the change records that storage emits.
//! The async runtime lives in `harbor-datastore`.
//!
//! ## Design Principles
//!
//! - **No IO**: nothing here reads files, opens connections or spawns tasks
//! - **Explicit registry**: schemas are passed around as a [`SchemaRegistry`]
//!   value, never looked up from global state
//! - **Structural values**: predicates, records and changes compare by value
//!
//! ## Core Concepts
//!
//! ### Models
//!
//! A [`Model`] is an immutable record with a UUID id and named
//! [`FieldValue`]s. Schemas ([`ModelSchema`]) declare field types,
//! required-ness and `belongsTo` / `hasMany` relations.
//!
//! ### Predicates
//!
//! [`QueryPredicate`] trees are built from [`field`] and combined with
//! `and` / `or` / `negate`. They evaluate in memory and translate to SQL
//! ([`SqlPredicate`]) with the same boolean semantics.
//!
//! ### Changes
//!
//! Every accepted mutation becomes a [`StorageItemChange`]. Local mutations
//! wait in the outbox as [`PendingMutation`]s until reconciled.
//!
//! ## Quick Start
//!
//! ```rust
//! use harbor_engine::{field, FieldDef, FieldType, Model, ModelSchema, QueryOptions, SchemaRegistry};
//!
//! let registry = SchemaRegistry::from_schemas(
//!     1,
//!     vec![ModelSchema::new(
//!         "Todo",
//!         vec![
//!             FieldDef::required("title", FieldType::String),
//!             FieldDef::optional("status", FieldType::String),
//!         ],
//!     )],
//! )
//! .unwrap();
//! let schema = registry.get("Todo").unwrap();
//!
//! let todo = Model::builder("Todo")
//!     .set("title", "Buy milk")
//!     .set("status", "X")
//!     .build_for(schema)
//!     .unwrap();
//!
//! let options = QueryOptions::matches(field("status").eq("X"));
//! let found = options.apply(schema, vec![todo.clone()]).unwrap();
//! assert_eq!(found, vec![todo]);
//! ```

pub mod change;
pub mod error;
pub mod pending;
pub mod predicate;
pub mod query;
pub mod record;
pub mod schema;
pub mod snapshot;
pub mod sql;
pub mod temporal;
pub mod value;

// Re-export main types at crate root
pub use change::{ChangeType, DataStoreItemChange, Initiator, QuerySnapshot, StorageItemChange, SyncOperation};
pub use error::Error;
pub use pending::{MutationState, PendingMutation, RecordKey, PENDING_MUTATION_TABLE};
pub use predicate::{field, GroupType, QueryField, QueryOperator, QueryPredicate};
pub use query::{Page, QueryOptions, QuerySortBy, SortOrder};
pub use record::{FieldFinder, FieldRef, Model, ModelBuilder, TypedModel};
pub use schema::{FieldDef, FieldType, ModelSchema, Relation, SchemaRegistry};
pub use snapshot::{SnapshotMetadata, StoreSnapshot, SNAPSHOT_FORMAT_VERSION};
pub use sql::{SqlBinding, SqlPredicate, SqlQuery};
pub use temporal::{Date, DateTime, Time, Timestamp};
pub use value::FieldValue;

/// Type aliases for clarity
pub type ModelId = String;
pub type ModelName = String;
pub type SchemaVersion = u32;
