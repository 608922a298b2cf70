//! Schema diff engine.
//!
//! `diff_schemas` computes a structured diff between two schema versions;
//! `backwards_incompatible_edits` classifies which entries could, on some
//! database state, invalidate existing data. The classifier is static - it
//! never looks at a database. The live-data oracle lives in `trellis-db`.
//!
//! Classification rules:
//! - delete of a non-optional attribute
//! - insert of a non-optional attribute into an existing collection
//! - type change
//! - optional -> required
//! - nullable -> non-nullable
//! - enum introduced, or narrowed to anything but a superset (dropping the
//!   enum entirely is safe; note the narrowing verdict is about the schema,
//!   not the data - a database whose values happen to satisfy the new enum
//!   still passes the live-data check)
//! - record field edits diff at their own nested paths; type changes and
//!   required additions classify through the rules above, and field
//!   removal inside a record is unsafe regardless of the field's
//!   optionality (only top-level optional attributes may be deleted
//!   freely)
//! - set item type change, item nullability tightening, item enum narrowing

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::schema::{
    AttributeDescriptor, CollectionDef, CollectionRules, DefaultSpec, StoreSchema, TypeOptions,
};
use crate::value::Value;

/// Old/new pair for one changed facet. Swapping the diff direction swaps
/// the orientation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transition<T> {
    pub from: T,
    pub to: T,
}

impl<T> Transition<T> {
    fn new(from: T, to: T) -> Self {
        Self { from, to }
    }
}

/// The differing facets of an updated descriptor. Only changed facets are
/// present.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DescriptorChanges {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_change: Option<Transition<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optional: Option<Transition<bool>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nullable: Option<Transition<bool>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Transition<Option<DefaultSpec>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enumeration: Option<Transition<Option<Vec<Value>>>>,
    /// Full before/after item descriptors when a set's item type changed
    /// in any way.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set_items: Option<Transition<AttributeDescriptor>>,
}

impl DescriptorChanges {
    pub fn is_empty(&self) -> bool {
        self.type_change.is_none()
            && self.optional.is_none()
            && self.nullable.is_none()
            && self.default.is_none()
            && self.enumeration.is_none()
            && self.set_items.is_none()
    }
}

/// Edit to one attribute path of one collection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum AttributeDiffOp {
    Insert {
        metadata: AttributeDescriptor,
        is_new_collection: bool,
    },
    Delete {
        metadata: AttributeDescriptor,
    },
    Update {
        changes: DescriptorChanges,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AttributeDiff {
    pub collection: String,
    pub attribute: Vec<String>,
    #[serde(flatten)]
    pub op: AttributeDiffOp,
}

/// One diff record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SchemaDiff {
    CollectionAttribute(AttributeDiff),
    CollectionRules { collection: String },
    CollectionPermissions { collection: String },
    Roles,
}

impl SchemaDiff {
    /// Stable ordering key: `(collection, attribute path, discriminant)`.
    fn sort_key(&self) -> (&str, &[String], u8) {
        const NO_PATH: &[String] = &[];
        match self {
            SchemaDiff::CollectionAttribute(diff) => {
                (diff.collection.as_str(), diff.attribute.as_slice(), 0)
            }
            SchemaDiff::CollectionRules { collection } => (collection.as_str(), NO_PATH, 1),
            SchemaDiff::CollectionPermissions { collection } => {
                (collection.as_str(), NO_PATH, 2)
            }
            SchemaDiff::Roles => ("", NO_PATH, 3),
        }
    }
}

/// Structured diff of two schemas, deterministically ordered.
pub fn diff_schemas(old: &StoreSchema, new: &StoreSchema) -> Vec<SchemaDiff> {
    let mut out = Vec::new();

    let names: BTreeSet<&String> = old.collections.keys().chain(new.collections.keys()).collect();
    for name in names {
        diff_collection(
            name,
            old.collection(name),
            new.collection(name),
            &mut out,
        );
    }

    if old.roles != new.roles {
        out.push(SchemaDiff::Roles);
    }

    out.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
    out
}

fn diff_collection(
    name: &str,
    old: Option<&CollectionDef>,
    new: Option<&CollectionDef>,
    out: &mut Vec<SchemaDiff>,
) {
    static EMPTY: std::sync::OnceLock<CollectionDef> = std::sync::OnceLock::new();
    let empty = EMPTY.get_or_init(CollectionDef::default);

    let is_new_collection = old.is_none();
    let old_def = old.unwrap_or(empty);
    let new_def = new.unwrap_or(empty);

    diff_attribute_maps(
        name,
        &[],
        &old_def.schema,
        &new_def.schema,
        is_new_collection,
        out,
    );

    let old_rules = old.and_then(|d| d.rules.as_ref());
    let new_rules = new.and_then(|d| d.rules.as_ref());
    if rules_differ(old_rules, new_rules) {
        out.push(SchemaDiff::CollectionRules {
            collection: name.to_string(),
        });
    }

    let old_perms = old.and_then(|d| d.permissions.as_ref());
    let new_perms = new.and_then(|d| d.permissions.as_ref());
    if old_perms != new_perms {
        out.push(SchemaDiff::CollectionPermissions {
            collection: name.to_string(),
        });
    }
}

fn rules_differ(old: Option<&CollectionRules>, new: Option<&CollectionRules>) -> bool {
    // An absent rules blob and an empty one mean the same thing.
    static EMPTY: std::sync::OnceLock<CollectionRules> = std::sync::OnceLock::new();
    let empty = EMPTY.get_or_init(CollectionRules::default);
    old.unwrap_or(empty) != new.unwrap_or(empty)
}

fn diff_attribute_maps(
    collection: &str,
    prefix: &[String],
    old: &std::collections::BTreeMap<String, AttributeDescriptor>,
    new: &std::collections::BTreeMap<String, AttributeDescriptor>,
    is_new_collection: bool,
    out: &mut Vec<SchemaDiff>,
) {
    let names: BTreeSet<&String> = old.keys().chain(new.keys()).collect();
    for name in names {
        let mut path = prefix.to_vec();
        path.push(name.clone());
        match (old.get(name), new.get(name)) {
            (None, Some(added)) => out.push(SchemaDiff::CollectionAttribute(AttributeDiff {
                collection: collection.to_string(),
                attribute: path,
                op: AttributeDiffOp::Insert {
                    metadata: added.clone(),
                    is_new_collection,
                },
            })),
            (Some(removed), None) => out.push(SchemaDiff::CollectionAttribute(AttributeDiff {
                collection: collection.to_string(),
                attribute: path,
                op: AttributeDiffOp::Delete {
                    metadata: removed.clone(),
                },
            })),
            (Some(before), Some(after)) => {
                diff_descriptor(collection, path, before, after, out);
            }
            (None, None) => unreachable!("name came from one of the maps"),
        }
    }
}

fn diff_descriptor(
    collection: &str,
    path: Vec<String>,
    old: &AttributeDescriptor,
    new: &AttributeDescriptor,
    out: &mut Vec<SchemaDiff>,
) {
    let (old_inner, old_optional) = old.unwrap_optional();
    let (new_inner, new_optional) = new.unwrap_optional();

    let mut changes = DescriptorChanges::default();
    if old_optional != new_optional {
        changes.optional = Some(Transition::new(old_optional, new_optional));
    }

    if old.type_tag() != new.type_tag() {
        changes.type_change = Some(Transition::new(
            old.type_tag().to_string(),
            new.type_tag().to_string(),
        ));
        diff_options(old.options(), new.options(), &mut changes);
        out.push(SchemaDiff::CollectionAttribute(AttributeDiff {
            collection: collection.to_string(),
            attribute: path,
            op: AttributeDiffOp::Update { changes },
        }));
        return;
    }

    match (old_inner, new_inner) {
        (
            AttributeDescriptor::Record { fields: old_fields },
            AttributeDescriptor::Record { fields: new_fields },
        ) => {
            // Field edits surface at their own nested paths.
            if !changes.is_empty() {
                out.push(SchemaDiff::CollectionAttribute(AttributeDiff {
                    collection: collection.to_string(),
                    attribute: path.clone(),
                    op: AttributeDiffOp::Update { changes },
                }));
            }
            diff_attribute_maps(collection, &path, old_fields, new_fields, false, out);
        }
        (
            AttributeDescriptor::Set {
                items: old_items, ..
            },
            AttributeDescriptor::Set {
                items: new_items, ..
            },
        ) => {
            diff_options(old.options(), new.options(), &mut changes);
            if old_items != new_items {
                changes.set_items = Some(Transition::new(
                    (**old_items).clone(),
                    (**new_items).clone(),
                ));
            }
            if !changes.is_empty() {
                out.push(SchemaDiff::CollectionAttribute(AttributeDiff {
                    collection: collection.to_string(),
                    attribute: path,
                    op: AttributeDiffOp::Update { changes },
                }));
            }
        }
        _ => {
            diff_options(old.options(), new.options(), &mut changes);
            if !changes.is_empty() {
                out.push(SchemaDiff::CollectionAttribute(AttributeDiff {
                    collection: collection.to_string(),
                    attribute: path,
                    op: AttributeDiffOp::Update { changes },
                }));
            }
        }
    }
}

fn diff_options(
    old: Option<&TypeOptions>,
    new: Option<&TypeOptions>,
    changes: &mut DescriptorChanges,
) {
    let (Some(old), Some(new)) = (old, new) else {
        return;
    };
    if old.nullable != new.nullable {
        changes.nullable = Some(Transition::new(old.nullable, new.nullable));
    }
    if old.default != new.default {
        changes.default = Some(Transition::new(old.default.clone(), new.default.clone()));
    }
    if old.enumeration != new.enumeration {
        changes.enumeration = Some(Transition::new(
            old.enumeration.clone(),
            new.enumeration.clone(),
        ));
    }
}

/// Filter a diff down to the edits that could invalidate existing data.
pub fn backwards_incompatible_edits(diffs: &[SchemaDiff]) -> Vec<SchemaDiff> {
    diffs
        .iter()
        .filter(|diff| is_backwards_incompatible(diff))
        .cloned()
        .collect()
}

/// Whether one diff entry is backwards-incompatible.
pub fn is_backwards_incompatible(diff: &SchemaDiff) -> bool {
    let SchemaDiff::CollectionAttribute(attr) = diff else {
        // Rule, permission, and role edits never touch stored data.
        return false;
    };
    match &attr.op {
        AttributeDiffOp::Insert {
            metadata,
            is_new_collection,
        } => !is_new_collection && !metadata.is_optional(),
        AttributeDiffOp::Delete { metadata } => {
            // A path deeper than one segment is a field inside a record;
            // removing one is unsafe even when the field is optional.
            attr.attribute.len() > 1 || !metadata.is_optional()
        }
        AttributeDiffOp::Update { changes } => update_is_incompatible(changes),
    }
}

fn update_is_incompatible(changes: &DescriptorChanges) -> bool {
    if changes.type_change.is_some() {
        return true;
    }
    if changes
        .optional
        .as_ref()
        .is_some_and(|t| t.from && !t.to)
    {
        return true;
    }
    if changes
        .nullable
        .as_ref()
        .is_some_and(|t| t.from && !t.to)
    {
        return true;
    }
    if changes
        .enumeration
        .as_ref()
        .is_some_and(|t| enum_is_narrowing(&t.from, &t.to))
    {
        return true;
    }
    if changes
        .set_items
        .as_ref()
        .is_some_and(|t| set_items_incompatible(&t.from, &t.to))
    {
        return true;
    }
    false
}

fn enum_is_narrowing(from: &Option<Vec<Value>>, to: &Option<Vec<Value>>) -> bool {
    match (from, to) {
        // Dropping the constraint cannot invalidate anything.
        (_, None) => false,
        // Introducing one can: data may already hold other values.
        (None, Some(_)) => true,
        // Narrowing is unsafe unless the new set is a superset of the old.
        (Some(old), Some(new)) => !old.iter().all(|v| new.contains(v)),
    }
}

fn set_items_incompatible(from: &AttributeDescriptor, to: &AttributeDescriptor) -> bool {
    if from.type_tag() != to.type_tag() {
        return true;
    }
    let from_nullable = from.options().is_some_and(|o| o.nullable);
    let to_nullable = to.options().is_some_and(|o| o.nullable);
    if from_nullable && !to_nullable {
        return true;
    }
    let from_enum = from.options().and_then(|o| o.enumeration.clone());
    let to_enum = to.options().and_then(|o| o.enumeration.clone());
    enum_is_narrowing(&from_enum, &to_enum)
}
