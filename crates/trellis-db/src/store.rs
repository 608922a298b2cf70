//! Triple store.
//!
//! EAV triples over the ordered-KV adapter, addressed through named
//! storage scopes. All reads and writes go through `StoreTx`; a
//! transaction commits every write scope or none of the caller-visible
//! state changes. The `_schema` tree is ordinary triples under the
//! `_schema` namespace, so DDL shares transactional semantics with data.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_channel::Sender;
use tracing::{debug, warn};
use trellis_core::{AttrPath, Clock, CollectionDef, EntityId, Stamp, StoreSchema, Value};

use crate::codec::TimestampedEntity;
use crate::error::{DbError, DbResult};
use crate::kv::{OrderedKv, OrderedKvTx};
use crate::triple::{
    attribute_prefix, current_triples, entity_prefix, marker_prefix, Triple,
};

/// Name of the scope used when the caller does not configure any.
pub const DEFAULT_SCOPE: &str = "default";

/// Namespace collection holding the schema document.
pub const SCHEMA_COLLECTION: &str = "_schema";
const SCHEMA_ENTITY: &str = "schema";

/// Which storage scopes a transaction reads from and writes to.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScopeSelector {
    pub read: Vec<String>,
    pub write: Vec<String>,
}

impl ScopeSelector {
    pub fn single(scope: impl Into<String>) -> Self {
        let scope = scope.into();
        Self {
            read: vec![scope.clone()],
            write: vec![scope],
        }
    }
}

/// What a committed transaction touched; subscriptions react to these.
#[derive(Clone, Debug)]
pub struct CommitNote {
    pub collections: BTreeSet<String>,
    pub stamp: Option<Stamp>,
}

pub struct TripleStore {
    scopes: BTreeMap<String, Arc<dyn OrderedKv>>,
    clock: Arc<Clock>,
    tenant: Option<String>,
    subscribers: Mutex<Vec<(u64, Sender<CommitNote>)>>,
    next_subscriber: AtomicU64,
}

impl TripleStore {
    pub fn new(
        scopes: BTreeMap<String, Arc<dyn OrderedKv>>,
        clock: Arc<Clock>,
        tenant: Option<String>,
    ) -> Self {
        Self {
            scopes,
            clock,
            tenant,
            subscribers: Mutex::new(Vec::new()),
            next_subscriber: AtomicU64::new(1),
        }
    }

    pub fn clock(&self) -> &Arc<Clock> {
        &self.clock
    }

    pub fn scope_names(&self) -> Vec<String> {
        self.scopes.keys().cloned().collect()
    }

    /// Run `f` inside a transaction. Clean return commits and notifies
    /// subscribers; an error cancels everything and is re-raised.
    pub fn transact<T>(
        &self,
        selector: Option<&ScopeSelector>,
        f: impl FnOnce(&mut StoreTx<'_>) -> DbResult<T>,
    ) -> DbResult<T> {
        let mut tx = self.begin(selector)?;
        match f(&mut tx) {
            Ok(value) => {
                let note = tx.commit()?;
                if let Some(note) = note {
                    self.notify(note);
                }
                Ok(value)
            }
            Err(err) => Err(err),
        }
    }

    fn begin(&self, selector: Option<&ScopeSelector>) -> DbResult<StoreTx<'_>> {
        let all: Vec<String> = self.scopes.keys().cloned().collect();
        let (read, write) = match selector {
            None => (all.clone(), all),
            Some(selector) => (selector.read.clone(), selector.write.clone()),
        };
        let mut txs = BTreeMap::new();
        for name in read.iter().chain(write.iter()) {
            if txs.contains_key(name) {
                continue;
            }
            let kv = self.scopes.get(name).ok_or_else(|| DbError::InvalidOptions {
                reason: format!("unknown storage scope `{name}`"),
            })?;
            txs.insert(name.clone(), kv.begin());
        }
        Ok(StoreTx {
            store: self,
            txs,
            read,
            write,
            stamp: None,
            touched: BTreeSet::new(),
        })
    }

    pub(crate) fn register_subscriber(&self, sender: Sender<CommitNote>) -> u64 {
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, sender));
        id
    }

    pub(crate) fn remove_subscriber(&self, id: u64) {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(existing, _)| *existing != id);
    }

    fn notify(&self, note: CommitNote) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subscribers.retain(|(_, sender)| sender.send(note.clone()).is_ok());
    }
}

/// One open transaction against the triple store.
pub struct StoreTx<'s> {
    store: &'s TripleStore,
    txs: BTreeMap<String, Box<dyn OrderedKvTx>>,
    read: Vec<String>,
    write: Vec<String>,
    stamp: Option<Stamp>,
    touched: BTreeSet<String>,
}

impl StoreTx<'_> {
    /// The transaction's single commit stamp, allocated on first use.
    pub fn stamp(&mut self) -> Stamp {
        if let Some(stamp) = &self.stamp {
            return stamp.clone();
        }
        let stamp = self.store.clock.next();
        self.stamp = Some(stamp.clone());
        stamp
    }

    fn tenant(&self) -> Option<&str> {
        self.store.tenant.as_deref()
    }

    pub fn insert_triple(&mut self, triple: &Triple) -> DbResult<()> {
        let row = triple.encode_row()?;
        let eav = triple.eav_key(self.tenant());
        let ave = triple.ave_key(self.tenant());
        for scope in &self.write {
            if let Some(tx) = self.txs.get_mut(scope) {
                tx.put(eav.clone(), row.clone());
                tx.put(ave.clone(), row.clone());
            }
        }
        self.touched.insert(triple.entity.collection().to_string());
        Ok(())
    }

    pub fn insert_triples(&mut self, triples: &[Triple]) -> DbResult<()> {
        for triple in triples {
            self.insert_triple(triple)?;
        }
        Ok(())
    }

    /// Physically remove a triple from every write scope (both indexes).
    fn remove_triple(&mut self, triple: &Triple) {
        let eav = triple.eav_key(self.tenant());
        let ave = triple.ave_key(self.tenant());
        for scope in &self.write {
            if let Some(tx) = self.txs.get_mut(scope) {
                tx.delete(eav.clone());
                tx.delete(ave.clone());
            }
        }
        self.touched.insert(triple.entity.collection().to_string());
    }

    fn scan(&self, prefix: &[u8]) -> DbResult<Vec<Triple>> {
        let mut merged: BTreeMap<Vec<u8>, Triple> = BTreeMap::new();
        for scope in &self.read {
            let Some(tx) = self.txs.get(scope) else {
                continue;
            };
            for (key, row) in tx.scan_prefix(prefix) {
                merged.insert(key, Triple::decode_row(&row)?);
            }
        }
        Ok(merged.into_values().collect())
    }

    /// Every stored triple (all versions) of one entity.
    pub fn entity_triples(&self, entity: &EntityId) -> DbResult<Vec<Triple>> {
        self.scan(&entity_prefix(self.tenant(), entity))
    }

    /// Every stored triple (all versions) whose attribute extends `path`.
    pub fn triples_by_attribute(&self, path: &AttrPath) -> DbResult<Vec<Triple>> {
        self.scan(&attribute_prefix(self.tenant(), path))
    }

    /// Entities currently alive in a collection, discovered by marker scan.
    pub fn collection_entities(&self, collection: &str) -> DbResult<Vec<EntityId>> {
        let triples = self.scan(&marker_prefix(self.tenant(), collection))?;
        Ok(current_triples(triples)
            .into_iter()
            .filter(|t| t.value == Value::String(collection.to_string()))
            .map(|t| t.entity)
            .collect())
    }

    /// Materialize one entity; `None` when absent or deleted.
    pub fn materialize(&self, entity: &EntityId) -> DbResult<Option<TimestampedEntity>> {
        let triples = self.entity_triples(entity)?;
        Ok(TimestampedEntity::from_triples(triples))
    }

    /// Tombstone every current triple of an entity at the commit stamp.
    pub fn expire_entity(&mut self, entity: &EntityId) -> DbResult<bool> {
        let current = current_triples(self.entity_triples(entity)?);
        if current.is_empty() {
            return Ok(false);
        }
        let stamp = self.stamp();
        for triple in &current {
            self.insert_triple(&triple.expire_at(stamp.clone()))?;
        }
        Ok(true)
    }

    /// Rewrite every triple under `old` (all versions, tombstones
    /// included) to the same position under `new`, preserving stamps. No
    /// triple with the old attribute remains.
    pub fn rewrite_attribute(&mut self, old: &AttrPath, new: &AttrPath) -> DbResult<usize> {
        let triples = self.triples_by_attribute(old)?;
        let mut moved = 0;
        for triple in triples {
            let Some(rest) = triple.attr.strip_prefix(old) else {
                continue;
            };
            let mut segments = new.segments().to_vec();
            segments.extend(rest.iter().cloned());
            let renamed = Triple {
                entity: triple.entity.clone(),
                attr: AttrPath::new(segments),
                value: triple.value.clone(),
                stamp: triple.stamp.clone(),
                expired: triple.expired,
            };
            self.remove_triple(&triple);
            self.insert_triple(&renamed)?;
            moved += 1;
        }
        Ok(moved)
    }

    fn schema_entity() -> EntityId {
        EntityId::new(SCHEMA_COLLECTION, SCHEMA_ENTITY)
            .unwrap_or_else(|_| unreachable!("schema entity id is statically valid"))
    }

    /// Read the schema from the `_schema` tree. A partially-written or
    /// unparseable tree reads as "no schema".
    pub fn read_schema(&self) -> DbResult<Option<StoreSchema>> {
        let Some(entity) = self.materialize(&Self::schema_entity())? else {
            return Ok(None);
        };
        let Some(Value::Number(version)) = entity.value_at(&["version".to_string()]) else {
            return Ok(None);
        };
        let mut schema = StoreSchema {
            version: *version as u64,
            collections: BTreeMap::new(),
            roles: None,
        };
        if let Some(Value::String(raw)) = entity.value_at(&["roles".to_string()]) {
            match serde_json::from_str(raw) {
                Ok(roles) => schema.roles = Some(roles),
                Err(err) => {
                    warn!(error = %err, "unreadable roles blob; treating schema as absent");
                    return Ok(None);
                }
            }
        }
        for (name, node) in entity.collection_leaves() {
            let Value::String(raw) = node else {
                continue;
            };
            match serde_json::from_str::<CollectionDef>(raw) {
                Ok(def) => {
                    schema.collections.insert(name, def);
                }
                Err(err) => {
                    warn!(
                        collection = %name,
                        error = %err,
                        "unreadable collection definition; treating schema as absent"
                    );
                    return Ok(None);
                }
            }
        }
        Ok(Some(schema))
    }

    /// Stored schema version; 0 when no schema has ever been written.
    pub fn schema_version(&self) -> DbResult<u64> {
        Ok(self.read_schema()?.map(|s| s.version).unwrap_or(0))
    }

    /// Replace the `_schema` tree with `schema` inside this transaction.
    ///
    /// One triple per collection keeps subtree granularity: dropping a
    /// collection expires one tuple, renames rewrite one tuple.
    pub fn write_schema(&mut self, schema: &StoreSchema) -> DbResult<()> {
        let entity = Self::schema_entity();
        let stamp = self.stamp();

        let mut fresh: Vec<Triple> = Vec::new();
        fresh.push(Triple::marker(entity.clone(), stamp.clone()));
        fresh.push(Triple::new(
            entity.clone(),
            AttrPath::from_slice(&[SCHEMA_COLLECTION, "version"]),
            Value::Number(schema.version as f64),
            stamp.clone(),
        ));
        if let Some(roles) = &schema.roles {
            let raw = serde_json::to_string(roles).map_err(|err| DbError::Storage {
                reason: format!("roles encode: {err}"),
            })?;
            fresh.push(Triple::new(
                entity.clone(),
                AttrPath::from_slice(&[SCHEMA_COLLECTION, "roles"]),
                Value::String(raw),
                stamp.clone(),
            ));
        }
        for (name, def) in &schema.collections {
            let raw = serde_json::to_string(def).map_err(|err| DbError::Storage {
                reason: format!("collection `{name}` encode: {err}"),
            })?;
            fresh.push(Triple::new(
                entity.clone(),
                AttrPath::new(vec![
                    SCHEMA_COLLECTION.to_string(),
                    "collections".to_string(),
                    name.clone(),
                ]),
                Value::String(raw),
                stamp.clone(),
            ));
        }

        // Expire stale attributes that the new schema no longer writes.
        let fresh_attrs: BTreeSet<&AttrPath> = fresh.iter().map(|t| &t.attr).collect();
        let current = current_triples(self.entity_triples(&entity)?);
        for triple in current {
            if !fresh_attrs.contains(&triple.attr) {
                self.insert_triple(&triple.expire_at(stamp.clone()))?;
            }
        }
        self.insert_triples(&fresh)?;
        debug!(version = schema.version, "schema written");
        Ok(())
    }

    fn commit(mut self) -> DbResult<Option<CommitNote>> {
        let mut note = None;
        if !self.touched.is_empty() {
            note = Some(CommitNote {
                collections: std::mem::take(&mut self.touched),
                stamp: self.stamp.clone(),
            });
        }
        // Read-only scopes roll back by drop; write scopes commit in
        // name order. With a single configured scope (the common case)
        // the commit is atomic; multi-scope setups inherit the adapter's
        // per-scope guarantees.
        let write: BTreeSet<String> = self.write.iter().cloned().collect();
        for (name, tx) in std::mem::take(&mut self.txs) {
            if write.contains(&name) {
                tx.commit()?;
            }
        }
        Ok(note)
    }
}
