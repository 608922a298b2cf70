//! Change-tracking write staging.
//!
//! `update` hands the mutator an `EntityDraft`: reads see staged values
//! first and fall back to the fetched entity; writes stage per-path
//! changes without touching the fetched document. Set-typed paths refuse
//! plain assignment and are mutated through `SetDraft`, which preserves
//! member-level CRDT semantics. At commit the staged map becomes triples
//! at a single stamp.

use std::collections::BTreeMap;

use trellis_core::schema::PathResolution;
use trellis_core::{AttrPath, CollectionDef, CoreError, EntityId, Stamp, Value};

use crate::codec::{coerce_leaf, TimestampedEntity};
use crate::error::{DbError, DbResult};
use crate::triple::Triple;

/// One staged change: an assignment, or removal of the path. Removal is
/// distinct from assigning null - an unset path reads as absent, a null
/// path reads as an explicit null.
enum StagedWrite {
    Value(Value),
    Remove,
}

pub struct EntityDraft {
    collection: String,
    def: Option<CollectionDef>,
    base: TimestampedEntity,
    staged: BTreeMap<Vec<String>, StagedWrite>,
}

impl EntityDraft {
    pub(crate) fn new(
        collection: String,
        def: Option<CollectionDef>,
        base: TimestampedEntity,
    ) -> Self {
        Self {
            collection,
            def,
            base,
            staged: BTreeMap::new(),
        }
    }

    /// Staged value if present, else the fetched value, else `None`.
    /// A staged removal reads as `None`.
    pub fn get(&self, path: &[&str]) -> Option<serde_json::Value> {
        let owned: Vec<String> = path.iter().map(|s| s.to_string()).collect();
        match self.staged.get(&owned) {
            Some(StagedWrite::Value(staged)) => return Some(staged.to_json()),
            Some(StagedWrite::Remove) => return None,
            None => {}
        }
        self.base.value_at(&owned).map(Value::to_json)
    }

    /// Stage an assignment. Record-valued assignments explode into their
    /// leaves; set-typed paths are rejected.
    pub fn set(&mut self, path: &[&str], value: serde_json::Value) -> DbResult<()> {
        let owned: Vec<String> = path.iter().map(|s| s.to_string()).collect();
        self.stage(owned, &value)
    }

    fn stage(&mut self, path: Vec<String>, json: &serde_json::Value) -> DbResult<()> {
        let resolution = self.def.as_ref().map(|d| d.resolve_path(&path));
        match resolution {
            Some(PathResolution::Unknown) => {
                return Err(CoreError::UnknownAttribute {
                    collection: self.collection.clone(),
                    attribute: path.join("."),
                }
                .into());
            }
            Some(PathResolution::Set(_)) | Some(PathResolution::SetMember { .. }) => {
                return Err(DbError::SetAssignment {
                    collection: self.collection.clone(),
                    attribute: path.join("."),
                });
            }
            Some(PathResolution::Record(_)) => {
                let serde_json::Value::Object(map) = json else {
                    return Err(CoreError::ValueMismatch {
                        attribute: path.join("."),
                        expected: "record".into(),
                        found: "leaf".into(),
                    }
                    .into());
                };
                for (name, child) in map {
                    let mut deeper = path.clone();
                    deeper.push(name.clone());
                    self.stage(deeper, child)?;
                }
                return Ok(());
            }
            Some(PathResolution::Leaf(desc)) => {
                let desc = desc.clone();
                let value = coerce_leaf(Some(&desc), &path, json)?;
                self.staged.insert(path, StagedWrite::Value(value));
                return Ok(());
            }
            None => {}
        }
        // Schemaless: objects explode, leaves stage as-is.
        if let serde_json::Value::Object(map) = json {
            if !(map.len() == 1 && map.contains_key("$date")) {
                for (name, child) in map {
                    let mut deeper = path.clone();
                    deeper.push(name.clone());
                    self.stage(deeper, child)?;
                }
                return Ok(());
            }
        }
        let value = coerce_leaf(None, &path, json)?;
        self.staged.insert(path, StagedWrite::Value(value));
        Ok(())
    }

    /// Stage removal of the attribute at `path`. The path (and everything
    /// below it) reads as absent afterwards. Only optional attributes may
    /// be unset when a schema is present.
    pub fn unset(&mut self, path: &[&str]) -> DbResult<()> {
        let owned: Vec<String> = path.iter().map(|s| s.to_string()).collect();
        match self.def.as_ref().map(|d| d.resolve_path(&owned)) {
            Some(PathResolution::Unknown) => {
                return Err(CoreError::UnknownAttribute {
                    collection: self.collection.clone(),
                    attribute: owned.join("."),
                }
                .into());
            }
            Some(PathResolution::SetMember { .. }) => {
                return Err(DbError::SetAssignment {
                    collection: self.collection.clone(),
                    attribute: owned.join("."),
                });
            }
            Some(PathResolution::Leaf(desc))
            | Some(PathResolution::Set(desc))
            | Some(PathResolution::Record(desc)) => {
                if !desc.is_optional() {
                    return Err(CoreError::ValueMismatch {
                        attribute: owned.join("."),
                        expected: desc.type_tag().to_string(),
                        found: "unset".into(),
                    }
                    .into());
                }
            }
            None => {}
        }

        // Tombstone everything already staged below the path, then every
        // current leaf of the fetched entity below it.
        let mut tombstoned = false;
        let staged_below: Vec<Vec<String>> = self
            .staged
            .keys()
            .filter(|key| key.len() >= owned.len() && key[..owned.len()] == owned[..])
            .cloned()
            .collect();
        for key in staged_below {
            self.staged.insert(key, StagedWrite::Remove);
            tombstoned = true;
        }
        for leaf in self.base.leaf_paths_under(&owned) {
            self.staged.insert(leaf, StagedWrite::Remove);
            tombstoned = true;
        }
        if !tombstoned {
            self.staged.insert(owned, StagedWrite::Remove);
        }
        Ok(())
    }

    /// Handle for a set-typed path: `add`, `remove`, `has`.
    pub fn set_of(&mut self, path: &[&str]) -> DbResult<SetDraft<'_>> {
        let owned: Vec<String> = path.iter().map(|s| s.to_string()).collect();
        let items = match self.def.as_ref().map(|d| d.resolve_path(&owned)) {
            Some(PathResolution::Set(set)) => set.set_items().cloned(),
            Some(_) => {
                return Err(CoreError::UnknownAttribute {
                    collection: self.collection.clone(),
                    attribute: format!("{} (not a set)", owned.join(".")),
                }
                .into());
            }
            None => None,
        };
        Ok(SetDraft {
            draft: self,
            path: owned,
            items,
        })
    }

    /// Convert staged changes into triples at the commit stamp. Removals
    /// become tombstones.
    pub(crate) fn into_triples(self, entity: &EntityId, stamp: &Stamp) -> Vec<Triple> {
        self.staged
            .into_iter()
            .map(|(path, write)| {
                let mut segments = Vec::with_capacity(path.len() + 1);
                segments.push(self.collection.clone());
                segments.extend(path);
                let attr = AttrPath::new(segments);
                match write {
                    StagedWrite::Value(value) => {
                        Triple::new(entity.clone(), attr, value, stamp.clone())
                    }
                    StagedWrite::Remove => Triple {
                        entity: entity.clone(),
                        attr,
                        value: Value::Null,
                        stamp: stamp.clone(),
                        expired: true,
                    },
                }
            })
            .collect()
    }

    pub fn has_changes(&self) -> bool {
        !self.staged.is_empty()
    }
}

/// Mutation handle for one set-typed path.
pub struct SetDraft<'d> {
    draft: &'d mut EntityDraft,
    path: Vec<String>,
    items: Option<trellis_core::AttributeDescriptor>,
}

impl SetDraft<'_> {
    fn member_segment(&self, member: &serde_json::Value) -> DbResult<String> {
        let value = coerce_leaf(self.items.as_ref(), &self.path, member)?;
        Ok(value.segment())
    }

    /// Stage membership for `member`.
    pub fn add(&mut self, member: serde_json::Value) -> DbResult<()> {
        let segment = self.member_segment(&member)?;
        let mut path = self.path.clone();
        path.push(segment);
        self.draft
            .staged
            .insert(path, StagedWrite::Value(Value::Boolean(true)));
        Ok(())
    }

    /// Stage a member tombstone for `member`.
    pub fn remove(&mut self, member: serde_json::Value) -> DbResult<()> {
        let segment = self.member_segment(&member)?;
        let mut path = self.path.clone();
        path.push(segment);
        self.draft
            .staged
            .insert(path, StagedWrite::Value(Value::Boolean(false)));
        Ok(())
    }

    /// Staged membership first, then the fetched set.
    pub fn has(&self, member: &serde_json::Value) -> DbResult<bool> {
        let segment = self.member_segment(member)?;
        let mut path = self.path.clone();
        path.push(segment.clone());
        match self.draft.staged.get(&path) {
            Some(StagedWrite::Value(Value::Boolean(present))) => return Ok(*present),
            Some(StagedWrite::Remove) => return Ok(false),
            _ => {}
        }
        Ok(self
            .draft
            .base
            .set_members(&self.path)
            .get(&segment)
            .copied()
            .unwrap_or(false))
    }
}
