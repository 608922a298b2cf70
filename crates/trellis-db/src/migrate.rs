//! Migration executor.
//!
//! A migration carries `up`/`down` operation sequences and a version gate:
//! `up` applies when its parent matches the stored version, `down` when
//! its own version does. Gated-out migrations are logged and skipped. Each
//! migration runs in one transaction; the version tuple advances in that
//! same transaction, so an error leaves the schema untouched.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use trellis_core::{AttrPath, AttributeDescriptor, CollectionDef, CollectionRules, StoreSchema};

use crate::error::{DbError, DbResult};
use crate::store::{StoreTx, TripleStore};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
}

/// One schema-changing operation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum MigrateOp {
    CreateCollection {
        name: String,
        #[serde(default)]
        schema: BTreeMap<String, AttributeDescriptor>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rules: Option<CollectionRules>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        permissions: Option<serde_json::Value>,
    },
    DropCollection {
        name: String,
    },
    AddAttribute {
        collection: String,
        path: Vec<String>,
        attribute: AttributeDescriptor,
    },
    DropAttribute {
        collection: String,
        path: Vec<String>,
    },
    RenameAttribute {
        collection: String,
        path: Vec<String>,
        new_name: String,
    },
}

/// Versioned operation pair. `up` moves `parent -> version`, `down` moves
/// `version -> parent`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Migration {
    pub version: u64,
    pub parent: u64,
    #[serde(default)]
    pub up: Vec<MigrateOp>,
    #[serde(default)]
    pub down: Vec<MigrateOp>,
}

/// Apply a migration list in the given direction.
pub fn migrate(
    store: &TripleStore,
    migrations: &[Migration],
    direction: Direction,
) -> DbResult<()> {
    let mut ordered: Vec<&Migration> = migrations.iter().collect();
    match direction {
        Direction::Up => ordered.sort_by_key(|m| m.version),
        Direction::Down => ordered.sort_by_key(|m| std::cmp::Reverse(m.version)),
    }

    for migration in ordered {
        let result = store.transact(None, |tx| {
            let current = tx.schema_version()?;
            let (gated, target) = match direction {
                Direction::Up => (migration.parent == current, migration.version),
                Direction::Down => (migration.version == current, migration.parent),
            };
            if !gated {
                warn!(
                    version = migration.version,
                    parent = migration.parent,
                    current,
                    ?direction,
                    "migration gate does not match; skipping"
                );
                return Ok(false);
            }
            let mut schema = tx.read_schema()?.unwrap_or_default();
            let ops = match direction {
                Direction::Up => &migration.up,
                Direction::Down => &migration.down,
            };
            for op in ops {
                apply_op(tx, &mut schema, op)?;
            }
            schema.version = target;
            tx.write_schema(&schema)?;
            Ok(true)
        });
        match result {
            Ok(true) => info!(version = migration.version, ?direction, "migration applied"),
            Ok(false) => {}
            Err(err) => {
                error!(version = migration.version, %err, "migration failed; version not advanced");
                return Err(err);
            }
        }
    }
    Ok(())
}

/// Apply one operation to both the schema document and, where the
/// operation touches stored data, the data triples.
pub fn apply_op(tx: &mut StoreTx<'_>, schema: &mut StoreSchema, op: &MigrateOp) -> DbResult<()> {
    match op {
        MigrateOp::CreateCollection {
            name,
            schema: attributes,
            rules,
            permissions,
        } => {
            if schema.collections.contains_key(name) {
                return Err(DbError::InvalidMigrationOperation {
                    reason: format!("collection `{name}` already exists"),
                });
            }
            schema.collections.insert(
                name.clone(),
                CollectionDef {
                    schema: attributes.clone(),
                    rules: rules.clone(),
                    permissions: permissions.clone(),
                },
            );
            Ok(())
        }
        MigrateOp::DropCollection { name } => {
            if schema.collections.remove(name).is_none() {
                return Err(DbError::InvalidMigrationOperation {
                    reason: format!("collection `{name}` does not exist"),
                });
            }
            // Purge data so a future collection of the same name starts
            // from nothing.
            for entity in tx.collection_entities(name)? {
                tx.expire_entity(&entity)?;
            }
            Ok(())
        }
        MigrateOp::AddAttribute {
            collection,
            path,
            attribute,
        } => {
            let (map, name) = attribute_slot(schema, collection, path)?;
            if map.contains_key(name) {
                return Err(DbError::InvalidMigrationOperation {
                    reason: format!("attribute `{}` already exists", path.join(".")),
                });
            }
            map.insert(name.to_string(), attribute.clone());
            Ok(())
        }
        MigrateOp::DropAttribute { collection, path } => {
            let (map, name) = attribute_slot(schema, collection, path)?;
            if map.remove(name).is_none() {
                return Err(DbError::InvalidMigrationOperation {
                    reason: format!("attribute `{}` does not exist", path.join(".")),
                });
            }
            Ok(())
        }
        MigrateOp::RenameAttribute {
            collection,
            path,
            new_name,
        } => {
            let (map, name) = attribute_slot(schema, collection, path)?;
            let Some(descriptor) = map.remove(name) else {
                return Err(DbError::InvalidMigrationOperation {
                    reason: format!("attribute `{}` does not exist", path.join(".")),
                });
            };
            if map.contains_key(new_name) {
                return Err(DbError::InvalidMigrationOperation {
                    reason: format!("attribute `{new_name}` already exists"),
                });
            }
            map.insert(new_name.clone(), descriptor);

            let mut old_segments = vec![collection.clone()];
            old_segments.extend(path.iter().cloned());
            let mut new_segments = old_segments.clone();
            let last = new_segments.len() - 1;
            new_segments[last] = new_name.clone();
            let moved = tx.rewrite_attribute(
                &AttrPath::new(old_segments),
                &AttrPath::new(new_segments),
            )?;
            info!(
                collection = %collection,
                from = %path.join("."),
                to = %new_name,
                moved,
                "attribute renamed"
            );
            Ok(())
        }
    }
}

/// Resolve the attribute map containing the final path segment, walking
/// through records (and `Optional` wrappers) for nested paths.
fn attribute_slot<'a>(
    schema: &'a mut StoreSchema,
    collection: &str,
    path: &'a [String],
) -> DbResult<(&'a mut BTreeMap<String, AttributeDescriptor>, &'a str)> {
    let Some((last, parents)) = path.split_last() else {
        return Err(DbError::InvalidMigrationOperation {
            reason: "empty attribute path".into(),
        });
    };
    let def = schema.collections.get_mut(collection).ok_or_else(|| {
        DbError::InvalidMigrationOperation {
            reason: format!("collection `{collection}` does not exist"),
        }
    })?;
    let mut map = &mut def.schema;
    for segment in parents {
        let mut node = map.get_mut(segment).ok_or_else(|| {
            DbError::InvalidMigrationOperation {
                reason: format!("attribute `{}` does not exist", path.join(".")),
            }
        })?;
        loop {
            match node {
                AttributeDescriptor::Optional { inner } => node = inner.as_mut(),
                AttributeDescriptor::Record { fields } => {
                    map = fields;
                    break;
                }
                _ => {
                    return Err(DbError::InvalidMigrationOperation {
                        reason: format!(
                            "attribute `{}` does not traverse a record",
                            path.join(".")
                        ),
                    })
                }
            }
        }
    }
    Ok((map, last.as_str()))
}
