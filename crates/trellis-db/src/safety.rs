//! Data-safety checker.
//!
//! Given a schema diff and a live database, decide which backwards-
//! incompatible edits would actually violate data that exists right now.
//! This is a read-only oracle: data shape mismatches are verdicts, never
//! errors. Probes prefer attribute-index scans over full collection scans;
//! only missing-value probes need the collection's entity list.

use std::collections::BTreeSet;

use tracing::debug;
use trellis_core::diff::{AttributeDiff, AttributeDiffOp, DescriptorChanges};
use trellis_core::{
    is_backwards_incompatible, AttrPath, AttributeDescriptor, EntityId, SchemaDiff, Value,
};

use crate::error::DbResult;
use crate::store::StoreTx;
use crate::triple::current_triples;

/// Verdict for one backwards-incompatible edit against this database.
#[derive(Clone, Debug)]
pub struct SchemaDiffIssue {
    pub diff: SchemaDiff,
    pub violates_existing_data: bool,
    pub reason: Option<String>,
}

/// Evaluate every backwards-incompatible edit in `diffs` against the data
/// visible inside `tx` (in-progress writes participate).
pub fn schema_diff_issues(
    tx: &StoreTx<'_>,
    diffs: &[SchemaDiff],
) -> DbResult<Vec<SchemaDiffIssue>> {
    let mut issues = Vec::new();
    for diff in diffs {
        if !is_backwards_incompatible(diff) {
            continue;
        }
        let SchemaDiff::CollectionAttribute(attr) = diff else {
            continue;
        };
        let verdict = probe(tx, attr)?;
        debug!(
            collection = %attr.collection,
            attribute = %attr.attribute.join("."),
            violates = verdict.is_some(),
            "schema edit probed"
        );
        issues.push(SchemaDiffIssue {
            diff: diff.clone(),
            violates_existing_data: verdict.is_some(),
            reason: verdict,
        });
    }
    Ok(issues)
}

/// `Some(reason)` when the edit violates existing data.
fn probe(tx: &StoreTx<'_>, diff: &AttributeDiff) -> DbResult<Option<String>> {
    match &diff.op {
        AttributeDiffOp::Insert { .. } => missing_value_probe(tx, diff),
        AttributeDiffOp::Delete { metadata } => delete_probe(tx, diff, metadata),
        AttributeDiffOp::Update { changes } => update_probe(tx, diff, changes),
    }
}

fn attr_path(diff: &AttributeDiff) -> AttrPath {
    let mut segments = Vec::with_capacity(diff.attribute.len() + 1);
    segments.push(diff.collection.clone());
    segments.extend(diff.attribute.iter().cloned());
    AttrPath::new(segments)
}

/// Current scalar values at the edit's exact path: `(entity, value)`.
fn values_at(tx: &StoreTx<'_>, diff: &AttributeDiff) -> DbResult<Vec<(EntityId, Value)>> {
    let path = attr_path(diff);
    let triples = current_triples(tx.triples_by_attribute(&path)?);
    Ok(triples
        .into_iter()
        .filter(|t| t.attr == path)
        .map(|t| (t.entity, t.value))
        .collect())
}

/// Current triples strictly below the edit's path (set members, record
/// fields).
fn children_at(
    tx: &StoreTx<'_>,
    diff: &AttributeDiff,
) -> DbResult<Vec<(EntityId, String, Value)>> {
    let path = attr_path(diff);
    let triples = current_triples(tx.triples_by_attribute(&path)?);
    Ok(triples
        .into_iter()
        .filter_map(|t| {
            let rest = t.attr.strip_prefix(&path)?;
            let segment = rest.first()?.clone();
            Some((t.entity, segment, t.value))
        })
        .collect())
}

/// True when any entity in the collection has no value at the path -
/// shared by the non-optional-insert and required-ification probes.
fn missing_value_probe(tx: &StoreTx<'_>, diff: &AttributeDiff) -> DbResult<Option<String>> {
    let mut present: BTreeSet<EntityId> = values_at(tx, diff)?
        .into_iter()
        .map(|(entity, _)| entity)
        .collect();
    // Structured values (set members, record leaves) also count as present.
    present.extend(children_at(tx, diff)?.into_iter().map(|(entity, _, _)| entity));

    for entity in tx.collection_entities(&diff.collection)? {
        if !present.contains(&entity) {
            return Ok(Some(format!(
                "entity `{entity}` has no value at `{}`",
                diff.attribute.join(".")
            )));
        }
    }
    Ok(None)
}

fn delete_probe(
    tx: &StoreTx<'_>,
    diff: &AttributeDiff,
    metadata: &AttributeDescriptor,
) -> DbResult<Option<String>> {
    if metadata.set_items().is_some() {
        // Current membership only; tombstoned members don't block.
        for (entity, segment, value) in children_at(tx, diff)? {
            if value == Value::Boolean(true) {
                return Ok(Some(format!(
                    "entity `{entity}` still has member `{segment}` in `{}`",
                    diff.attribute.join(".")
                )));
            }
        }
        return Ok(None);
    }
    if metadata.record_fields().is_some() {
        if let Some((entity, segment, _)) = children_at(tx, diff)?.into_iter().next() {
            return Ok(Some(format!(
                "entity `{entity}` has data at `{}.{segment}`",
                diff.attribute.join(".")
            )));
        }
        return Ok(None);
    }
    for (entity, value) in values_at(tx, diff)? {
        if !value.is_null() {
            return Ok(Some(format!(
                "entity `{entity}` has value {value} at `{}`",
                diff.attribute.join(".")
            )));
        }
    }
    Ok(None)
}

fn update_probe(
    tx: &StoreTx<'_>,
    diff: &AttributeDiff,
    changes: &DescriptorChanges,
) -> DbResult<Option<String>> {
    if let Some(change) = &changes.type_change {
        if let Some(reason) = type_change_probe(tx, diff, &change.to)? {
            return Ok(Some(reason));
        }
    }
    if changes.optional.as_ref().is_some_and(|t| t.from && !t.to) {
        if let Some(reason) = missing_value_probe(tx, diff)? {
            return Ok(Some(reason));
        }
    }
    if changes.nullable.as_ref().is_some_and(|t| t.from && !t.to) {
        for (entity, value) in values_at(tx, diff)? {
            if value.is_null() {
                return Ok(Some(format!(
                    "entity `{entity}` holds null at `{}`",
                    diff.attribute.join(".")
                )));
            }
        }
    }
    if let Some(change) = &changes.enumeration {
        // Removing the enum can never violate; values that happen to
        // satisfy a narrowed enum pass.
        if let Some(allowed) = &change.to {
            for (entity, value) in values_at(tx, diff)? {
                if !value.is_null() && !allowed.contains(&value) {
                    return Ok(Some(format!(
                        "entity `{entity}` holds {value} at `{}`, not in the enum",
                        diff.attribute.join(".")
                    )));
                }
            }
        }
    }
    if let Some(change) = &changes.set_items {
        if let Some(reason) = set_items_probe(tx, diff, &change.from, &change.to)? {
            return Ok(Some(reason));
        }
    }
    Ok(None)
}

fn type_change_probe(
    tx: &StoreTx<'_>,
    diff: &AttributeDiff,
    to_tag: &str,
) -> DbResult<Option<String>> {
    let structural = matches!(to_tag, "set" | "record");
    for (entity, value) in values_at(tx, diff)? {
        if value.is_null() {
            continue;
        }
        if structural || !value_matches_tag(&value, to_tag) {
            return Ok(Some(format!(
                "entity `{entity}` holds a {} at `{}`, target type is {to_tag}",
                value.type_label(),
                diff.attribute.join(".")
            )));
        }
    }
    if structural {
        return Ok(None);
    }
    // Scalar target, structured data present underneath the path.
    if let Some((entity, _, _)) = children_at(tx, diff)?.into_iter().next() {
        return Ok(Some(format!(
            "entity `{entity}` has structured data at `{}`, target type is {to_tag}",
            diff.attribute.join(".")
        )));
    }
    Ok(None)
}

fn set_items_probe(
    tx: &StoreTx<'_>,
    diff: &AttributeDiff,
    from_items: &AttributeDescriptor,
    to_items: &AttributeDescriptor,
) -> DbResult<Option<String>> {
    for (entity, segment, value) in children_at(tx, diff)? {
        if value != Value::Boolean(true) {
            continue; // tombstoned member
        }
        let violation = match from_items.parse_segment(&segment) {
            None => true,
            Some(member) => {
                !to_items.accepts_type(&member)
                    || to_items
                        .options()
                        .and_then(|o| o.enumeration.as_ref())
                        .is_some_and(|allowed| !allowed.contains(&member))
            }
        };
        if violation {
            return Ok(Some(format!(
                "entity `{entity}` has member `{segment}` in `{}` outside the new item type",
                diff.attribute.join(".")
            )));
        }
    }
    Ok(None)
}

fn value_matches_tag(value: &Value, tag: &str) -> bool {
    matches!(
        (tag, value),
        ("id" | "string", Value::String(_))
            | ("number", Value::Number(_))
            | ("boolean", Value::Boolean(_))
            | ("date", Value::Date(_))
    )
}
