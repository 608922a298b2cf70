//! The embeddable database facade.
//!
//! Wires the triple store, codec, drafts, queries, schema engine, and
//! migrations behind the public surface: insert / update / delete / fetch
//! / subscribe / transact, DDL helpers, migrations, and schema override.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use tracing::debug;
use trellis_core::{
    diff_schemas, validate_external_id, AttributeDescriptor, ClientId, Clock, CollectionDef,
    CoreError, EntityId, Stamp, StoreSchema, Variables,
};
use uuid::Uuid;

use crate::codec::{doc_to_triples, prepare_insert_doc};
use crate::draft::EntityDraft;
use crate::error::{DbError, DbResult};
use crate::kv::{MemoryKv, OrderedKv};
use crate::migrate::{apply_op, migrate, Direction, Migration, MigrateOp};
use crate::query::{entity_matches, run_query, Query};
use crate::safety::{schema_diff_issues, SchemaDiffIssue};
use crate::store::{ScopeSelector, StoreTx, TripleStore, DEFAULT_SCOPE};
use crate::subscribe::{spawn_subscription, Subscription};

/// Construction options. `schema` and `migrations` are mutually exclusive;
/// neither yields a schemaless (dynamic) database.
#[derive(Default)]
pub struct DbOptions {
    pub schema: Option<StoreSchema>,
    pub migrations: Vec<Migration>,
    pub source: Option<Arc<dyn OrderedKv>>,
    pub sources: BTreeMap<String, Arc<dyn OrderedKv>>,
    pub tenant_id: Option<String>,
    pub clock: Option<Arc<Clock>>,
    pub variables: Variables,
}

impl DbOptions {
    pub fn with_schema(mut self, schema: StoreSchema) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn with_migrations(mut self, migrations: Vec<Migration>) -> Self {
        self.migrations = migrations;
        self
    }

    pub fn with_source(mut self, source: Arc<dyn OrderedKv>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_scope(mut self, name: impl Into<String>, source: Arc<dyn OrderedKv>) -> Self {
        self.sources.insert(name.into(), source);
        self
    }

    pub fn with_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant.into());
        self
    }

    pub fn with_clock(mut self, clock: Arc<Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_variables(mut self, variables: Variables) -> Self {
        self.variables = variables;
        self
    }
}

#[derive(Clone)]
pub struct Db {
    store: Arc<TripleStore>,
    variables: Arc<RwLock<Variables>>,
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db").finish_non_exhaustive()
    }
}

impl Db {
    pub fn open(options: DbOptions) -> DbResult<Self> {
        if options.schema.is_some() && !options.migrations.is_empty() {
            return Err(DbError::InvalidOptions {
                reason: "provide either `schema` or `migrations`, not both".into(),
            });
        }

        let mut sources = options.sources;
        if let Some(source) = options.source {
            sources.insert(DEFAULT_SCOPE.to_string(), source);
        }
        if sources.is_empty() {
            sources.insert(DEFAULT_SCOPE.to_string(), Arc::new(MemoryKv::new()));
        }
        let clock = options
            .clock
            .unwrap_or_else(|| Arc::new(Clock::new(ClientId::random())));
        let store = Arc::new(TripleStore::new(sources, clock, options.tenant_id));
        let db = Self {
            store,
            variables: Arc::new(RwLock::new(options.variables)),
        };

        if let Some(schema) = options.schema {
            db.store.transact(None, |tx| match tx.read_schema()? {
                None => tx.write_schema(&schema),
                Some(stored) if stored.version > schema.version => {
                    Err(DbError::SchemaVersionMismatch {
                        stored: stored.version,
                        requested: schema.version,
                    })
                }
                Some(stored) if stored != schema => tx.write_schema(&schema),
                Some(_) => Ok(()),
            })?;
        }
        if !options.migrations.is_empty() {
            migrate(&db.store, &options.migrations, Direction::Up)?;
        }
        Ok(db)
    }

    /// Schemaless in-memory database.
    pub fn schemaless() -> Self {
        Self::open(DbOptions::default())
            .unwrap_or_else(|_| unreachable!("default options are valid"))
    }

    pub fn store(&self) -> &Arc<TripleStore> {
        &self.store
    }

    /// Snapshot of the process-wide variables map.
    pub fn variables(&self) -> Variables {
        self.variables
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Merge new bindings into the variables map. In-flight subscriptions
    /// keep the snapshot they were created with.
    pub fn update_variables(&self, vars: Variables) {
        self.variables
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .extend(vars);
    }

    /// Run `f` inside one transaction across all scopes.
    pub fn transact<T>(&self, f: impl FnOnce(&mut StoreTx<'_>) -> DbResult<T>) -> DbResult<T> {
        self.store.transact(None, f)
    }

    /// Run `f` inside a transaction restricted to the given scopes.
    pub fn transact_scoped<T>(
        &self,
        selector: &ScopeSelector,
        f: impl FnOnce(&mut StoreTx<'_>) -> DbResult<T>,
    ) -> DbResult<T> {
        self.store.transact(Some(selector), f)
    }

    fn collection_def(
        &self,
        tx: &StoreTx<'_>,
        collection: &str,
    ) -> DbResult<Option<CollectionDef>> {
        match tx.read_schema()? {
            None => Ok(None),
            Some(schema) => match schema.collection(collection) {
                Some(def) => Ok(Some(def.clone())),
                None => Err(DbError::CollectionNotFound {
                    collection: collection.to_string(),
                }),
            },
        }
    }

    /// Insert a document; generates an external id when neither the `id`
    /// argument nor an `id` field is present. Returns the commit stamp.
    pub fn insert(
        &self,
        collection: &str,
        doc: serde_json::Value,
        id: Option<&str>,
    ) -> DbResult<Stamp> {
        let serde_json::Value::Object(map) = doc else {
            return Err(CoreError::ValueMismatch {
                attribute: collection.to_string(),
                expected: "document object".into(),
                found: "non-object".into(),
            }
            .into());
        };
        let external = match id {
            Some(explicit) => explicit.to_string(),
            None => match map.get("id") {
                Some(serde_json::Value::String(from_doc)) => from_doc.clone(),
                _ => Uuid::new_v4().simple().to_string(),
            },
        };
        validate_external_id(&external)?;
        let vars = self.variables();

        self.transact(|tx| {
            let def = self.collection_def(tx, collection)?;
            let entity = EntityId::new(collection, &external)?;
            let completed = prepare_insert_doc(collection, def.as_ref(), map, &external)?;
            let stamp = tx.stamp();
            let triples = doc_to_triples(def.as_ref(), &entity, &completed, &stamp)?;
            tx.insert_triples(&triples)?;
            check_write_rules(tx, def.as_ref(), &entity, &vars)?;
            debug!(collection, id = %external, "inserted");
            Ok(stamp)
        })
    }

    /// Mutate one entity through a change-tracking draft.
    pub fn update(
        &self,
        collection: &str,
        id: &str,
        mutator: impl FnOnce(&mut EntityDraft) -> DbResult<()>,
    ) -> DbResult<()> {
        let vars = self.variables();
        self.transact(|tx| {
            let def = self.collection_def(tx, collection)?;
            let entity = EntityId::new(collection, id)?;
            let base = tx
                .materialize(&entity)?
                .ok_or_else(|| DbError::EntityNotFound {
                    collection: collection.to_string(),
                    id: id.to_string(),
                })?;
            let mut draft = EntityDraft::new(collection.to_string(), def.clone(), base);
            mutator(&mut draft)?;
            if !draft.has_changes() {
                return Ok(());
            }
            let stamp = tx.stamp();
            let triples = draft.into_triples(&entity, &stamp);
            tx.insert_triples(&triples)?;
            check_write_rules(tx, def.as_ref(), &entity, &vars)?;
            debug!(collection, id, "updated");
            Ok(())
        })
    }

    /// Tombstone every triple of one entity.
    pub fn delete(&self, collection: &str, id: &str) -> DbResult<()> {
        self.transact(|tx| {
            let entity = EntityId::new(collection, id)?;
            if !tx.expire_entity(&entity)? {
                return Err(DbError::EntityNotFound {
                    collection: collection.to_string(),
                    id: id.to_string(),
                });
            }
            debug!(collection, id, "deleted");
            Ok(())
        })
    }

    pub fn fetch(&self, query: &Query) -> DbResult<Vec<serde_json::Value>> {
        self.fetch_scoped(query, None)
    }

    pub fn fetch_scoped(
        &self,
        query: &Query,
        selector: Option<&ScopeSelector>,
    ) -> DbResult<Vec<serde_json::Value>> {
        let vars = self.variables();
        self.store.transact(selector, |tx| {
            let def = self.collection_def(tx, &query.collection)?;
            run_query(tx, query, def.as_ref(), &vars)
        })
    }

    pub fn fetch_by_id(
        &self,
        collection: &str,
        id: &str,
    ) -> DbResult<Option<serde_json::Value>> {
        self.transact(|tx| {
            let def = self.collection_def(tx, collection)?;
            let entity = EntityId::new(collection, id)?;
            Ok(tx
                .materialize(&entity)?
                .map(|entity| entity.to_plain(def.as_ref())))
        })
    }

    /// Subscribe to a query. The callback receives the initial result and
    /// every changed result after a relevant commit.
    pub fn subscribe(
        &self,
        query: Query,
        on_results: impl Fn(Vec<serde_json::Value>) + Send + 'static,
        on_error: impl Fn(DbError) + Send + 'static,
    ) -> DbResult<Subscription> {
        let def = self.transact(|tx| self.collection_def(tx, &query.collection))?;
        let vars = {
            let mut merged = self.variables();
            merged.extend(query.vars.iter().map(|(k, v)| (k.clone(), v.clone())));
            merged
        };
        Ok(spawn_subscription(
            Arc::clone(&self.store),
            query,
            def,
            vars,
            on_results,
            on_error,
        ))
    }

    /// Current schema, if one has been written.
    pub fn schema(&self) -> DbResult<Option<StoreSchema>> {
        self.transact(|tx| tx.read_schema())
    }

    /// Replace the `_schema` tree wholesale, without data migration. For
    /// test and admin use.
    pub fn override_schema(&self, schema: &StoreSchema) -> DbResult<()> {
        self.transact(|tx| tx.write_schema(schema))
    }

    /// Diff the stored schema against `candidate` and evaluate which
    /// incompatible edits would violate existing data.
    pub fn check_schema_change(
        &self,
        candidate: &StoreSchema,
    ) -> DbResult<Vec<SchemaDiffIssue>> {
        self.transact(|tx| {
            let stored = tx.read_schema()?.unwrap_or_default();
            let diffs = diff_schemas(&stored, candidate);
            schema_diff_issues(tx, &diffs)
        })
    }

    pub fn migrate(&self, migrations: &[Migration], direction: Direction) -> DbResult<()> {
        migrate(&self.store, migrations, direction)
    }

    fn apply_schema_ops(&self, ops: &[MigrateOp]) -> DbResult<()> {
        self.transact(|tx| {
            let mut schema = tx.read_schema()?.unwrap_or_default();
            for op in ops {
                apply_op(tx, &mut schema, op)?;
            }
            tx.write_schema(&schema)
        })
    }

    pub fn create_collection(
        &self,
        name: &str,
        attributes: impl IntoIterator<Item = (&'static str, AttributeDescriptor)>,
    ) -> DbResult<()> {
        self.apply_schema_ops(&[MigrateOp::CreateCollection {
            name: name.to_string(),
            schema: attributes
                .into_iter()
                .map(|(attr, desc)| (attr.to_string(), desc))
                .collect(),
            rules: None,
            permissions: None,
        }])
    }

    pub fn drop_collection(&self, name: &str) -> DbResult<()> {
        self.apply_schema_ops(&[MigrateOp::DropCollection {
            name: name.to_string(),
        }])
    }

    pub fn add_attribute(
        &self,
        collection: &str,
        path: &[&str],
        attribute: AttributeDescriptor,
    ) -> DbResult<()> {
        self.apply_schema_ops(&[MigrateOp::AddAttribute {
            collection: collection.to_string(),
            path: path.iter().map(|s| s.to_string()).collect(),
            attribute,
        }])
    }

    pub fn drop_attribute(&self, collection: &str, path: &[&str]) -> DbResult<()> {
        self.apply_schema_ops(&[MigrateOp::DropAttribute {
            collection: collection.to_string(),
            path: path.iter().map(|s| s.to_string()).collect(),
        }])
    }

    pub fn rename_attribute(
        &self,
        collection: &str,
        path: &[&str],
        new_name: &str,
    ) -> DbResult<()> {
        self.apply_schema_ops(&[MigrateOp::RenameAttribute {
            collection: collection.to_string(),
            path: path.iter().map(|s| s.to_string()).collect(),
            new_name: new_name.to_string(),
        }])
    }
}

/// Re-evaluate the post-image against the collection's write rules.
fn check_write_rules(
    tx: &StoreTx<'_>,
    def: Option<&CollectionDef>,
    entity: &EntityId,
    vars: &Variables,
) -> DbResult<()> {
    let Some(rules) = def.and_then(|d| d.rules.as_ref()) else {
        return Ok(());
    };
    if rules.write.is_empty() {
        return Ok(());
    }
    let Some(post) = tx.materialize(entity)? else {
        return Ok(());
    };
    for (name, rule) in &rules.write {
        if !entity_matches(&post, def, &rule.filter, vars)? {
            return Err(DbError::WriteRuleViolation {
                collection: entity.collection().to_string(),
                rule: name.clone(),
            });
        }
    }
    Ok(())
}
