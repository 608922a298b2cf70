//! trellis: an embeddable, schema-aware document store over an EAV triple
//! substrate with CRDT write semantics and query subscriptions.
//!
//! Module hierarchy follows dependency order:
//! - error: runtime error kinds
//! - kv: ordered key/value contract + in-memory backend
//! - triple: the `(E, A, V, T, expired)` record and its index keys
//! - codec: plain document ⇄ timestamped entity ⇄ triples
//! - store: scoped triple store, transactions, `_schema` tree
//! - draft: change-tracking write staging
//! - query: fetch + filter evaluation
//! - safety: live-data checks for schema edits
//! - migrate: versioned migration executor
//! - subscribe: reactive query subscriptions
//! - db: the public facade

#![forbid(unsafe_code)]

pub mod codec;
pub mod db;
pub mod draft;
pub mod error;
pub mod kv;
pub mod migrate;
pub mod query;
pub mod safety;
pub mod store;
pub mod subscribe;
pub mod triple;

pub use codec::{Node, TimestampedEntity};
pub use db::{Db, DbOptions};
pub use draft::{EntityDraft, SetDraft};
pub use error::{DbError, DbResult};
pub use kv::{MemoryKv, OrderedKv, OrderedKvTx};
pub use migrate::{Direction, MigrateOp, Migration};
pub use query::Query;
pub use safety::{schema_diff_issues, SchemaDiffIssue};
pub use store::{CommitNote, ScopeSelector, StoreTx, TripleStore, DEFAULT_SCOPE};
pub use subscribe::Subscription;
pub use triple::Triple;

// The domain layer is part of the public surface.
pub use trellis_core as core;
pub use trellis_core::{
    backwards_incompatible_edits, diff_schemas, AttributeDescriptor, ClientId, Clock,
    CollectionDef, CollectionRules, DefaultSpec, EntityId, Filter, Op, Rule, SchemaDiff, Stamp,
    StoreSchema, Value, Variables,
};
