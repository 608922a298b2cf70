//! Document codec.
//!
//! Bidirectional mapping between plain JSON documents, timestamped
//! entities, and triples. Records recurse without emitting anything for
//! the parent; sets emit one boolean triple per member with the member
//! rendered into the attribute path.

use std::collections::BTreeMap;

use serde_json::Map as JsonMap;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use trellis_core::schema::PathResolution;
use trellis_core::{
    AttributeDescriptor, AttrPath, CollectionDef, CoreError, EntityId, Stamp, Value,
};

use crate::error::DbResult;
use crate::triple::{current_triples, Triple};

/// Fill generated values and check required attributes before a document
/// is exploded into triples. Returns the completed document.
pub fn prepare_insert_doc(
    collection: &str,
    def: Option<&CollectionDef>,
    mut doc: JsonMap<String, serde_json::Value>,
    external_id: &str,
) -> DbResult<JsonMap<String, serde_json::Value>> {
    doc.insert(
        "id".to_string(),
        serde_json::Value::String(external_id.to_string()),
    );
    let Some(def) = def else {
        return Ok(doc);
    };
    complete_fields(collection, &def.schema, &mut doc)?;
    Ok(doc)
}

fn complete_fields(
    collection: &str,
    fields: &BTreeMap<String, AttributeDescriptor>,
    doc: &mut JsonMap<String, serde_json::Value>,
) -> DbResult<()> {
    for (name, desc) in fields {
        let (inner, optional) = desc.unwrap_optional();
        if let Some(existing) = doc.get_mut(name) {
            // Recurse so record defaults fill even when the record is given.
            if let (Some(record_fields), serde_json::Value::Object(map)) =
                (inner.record_fields(), existing)
            {
                complete_fields(collection, record_fields, map)?;
            }
            continue;
        }
        if let Some(spec) = desc.options().and_then(|o| o.default.as_ref()) {
            let value = spec.materialize()?;
            doc.insert(name.clone(), plain_json(&value));
            continue;
        }
        if let Some(record_fields) = inner.record_fields() {
            let mut map = JsonMap::new();
            complete_fields(collection, record_fields, &mut map)?;
            doc.insert(name.clone(), serde_json::Value::Object(map));
            continue;
        }
        if optional {
            continue;
        }
        if inner.set_items().is_some() {
            doc.insert(name.clone(), serde_json::Value::Array(Vec::new()));
            continue;
        }
        return Err(CoreError::ValueMismatch {
            attribute: format!("{collection}.{name}"),
            expected: inner.type_tag().to_string(),
            found: "missing".into(),
        }
        .into());
    }
    Ok(())
}

/// Explode a plain document into triples at one stamp, including the
/// collection-membership marker.
pub fn doc_to_triples(
    def: Option<&CollectionDef>,
    entity: &EntityId,
    doc: &JsonMap<String, serde_json::Value>,
    stamp: &Stamp,
) -> DbResult<Vec<Triple>> {
    let mut out = vec![Triple::marker(entity.clone(), stamp.clone())];
    walk_object(def, entity, &[], doc, stamp, &mut out)?;
    Ok(out)
}

fn walk_object(
    def: Option<&CollectionDef>,
    entity: &EntityId,
    path: &[String],
    doc: &JsonMap<String, serde_json::Value>,
    stamp: &Stamp,
    out: &mut Vec<Triple>,
) -> DbResult<()> {
    for (name, json) in doc {
        let mut child = path.to_vec();
        child.push(name.clone());
        walk_value(def, entity, &child, json, stamp, out)?;
    }
    Ok(())
}

fn walk_value(
    def: Option<&CollectionDef>,
    entity: &EntityId,
    path: &[String],
    json: &serde_json::Value,
    stamp: &Stamp,
    out: &mut Vec<Triple>,
) -> DbResult<()> {
    let collection = entity.collection();
    let resolution = def.map(|d| d.resolve_path(path));
    if def.is_some() && matches!(resolution, Some(PathResolution::Unknown)) {
        return Err(CoreError::UnknownAttribute {
            collection: collection.to_string(),
            attribute: path.join("."),
        }
        .into());
    }

    match json {
        serde_json::Value::Array(members) => {
            let items = match resolution {
                Some(PathResolution::Set(set)) => set.set_items(),
                Some(_) => {
                    return Err(CoreError::ValueMismatch {
                        attribute: path.join("."),
                        expected: described_type(&resolution),
                        found: "array".into(),
                    }
                    .into())
                }
                None => None,
            };
            for member in members {
                let value = coerce_leaf(items, path, member)?;
                out.push(Triple::new(
                    entity.clone(),
                    attr_of(collection, path).child(value.segment()),
                    Value::Boolean(true),
                    stamp.clone(),
                ));
            }
            Ok(())
        }
        serde_json::Value::Object(map) if !is_date_tag(map) => match resolution {
            Some(PathResolution::Record(_)) | None => {
                walk_object(def, entity, path, map, stamp, out)
            }
            Some(_) => Err(CoreError::ValueMismatch {
                attribute: path.join("."),
                expected: described_type(&resolution),
                found: "object".into(),
            }
            .into()),
        },
        leaf => {
            let desc = match resolution {
                Some(PathResolution::Leaf(desc)) => Some(desc),
                Some(PathResolution::Set(_)) | Some(PathResolution::SetMember { .. }) => {
                    return Err(CoreError::ValueMismatch {
                        attribute: path.join("."),
                        expected: "set".into(),
                        found: leaf_label(leaf).into(),
                    }
                    .into())
                }
                Some(PathResolution::Record(_)) => {
                    return Err(CoreError::ValueMismatch {
                        attribute: path.join("."),
                        expected: "record".into(),
                        found: leaf_label(leaf).into(),
                    }
                    .into())
                }
                _ => None,
            };
            let value = coerce_leaf(desc, path, leaf)?;
            out.push(Triple::new(
                entity.clone(),
                attr_of(collection, path),
                value,
                stamp.clone(),
            ));
            Ok(())
        }
    }
}

fn described_type(resolution: &Option<PathResolution<'_>>) -> String {
    match resolution {
        Some(PathResolution::Leaf(desc)) => desc.type_tag().to_string(),
        Some(PathResolution::Set(_)) => "set".into(),
        Some(PathResolution::Record(_)) => "record".into(),
        _ => "value".into(),
    }
}

fn leaf_label(json: &serde_json::Value) -> &'static str {
    match json {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

fn is_date_tag(map: &JsonMap<String, serde_json::Value>) -> bool {
    map.len() == 1 && map.contains_key("$date")
}

/// Convert one JSON leaf to a value, coercing RFC 3339 strings into dates
/// when the descriptor asks for one, then check it against the schema.
pub fn coerce_leaf(
    desc: Option<&AttributeDescriptor>,
    path: &[String],
    json: &serde_json::Value,
) -> DbResult<Value> {
    let attribute = path.join(".");
    let value = match (desc, json) {
        (Some(d), serde_json::Value::String(raw)) if d.type_tag() == "date" => {
            OffsetDateTime::parse(raw, &Rfc3339)
                .map(Value::Date)
                .map_err(|err| CoreError::ValueMismatch {
                    attribute: attribute.clone(),
                    expected: "date".into(),
                    found: format!("`{raw}` ({err})"),
                })?
        }
        _ => Value::from_json(json).map_err(|reason| CoreError::ValueMismatch {
            attribute: attribute.clone(),
            expected: "leaf".into(),
            found: reason,
        })?,
    };
    if let Some(desc) = desc {
        desc.check_value(&attribute, &value)?;
    }
    Ok(value)
}

fn attr_of(collection: &str, path: &[String]) -> AttrPath {
    let mut segments = Vec::with_capacity(path.len() + 1);
    segments.push(collection.to_string());
    segments.extend(path.iter().cloned());
    AttrPath::new(segments)
}

/// One node of a timestamped entity: leaves carry their latest stamp.
#[derive(Clone, Debug, PartialEq)]
pub enum Node {
    Leaf { value: Value, stamp: Stamp },
    Branch(BTreeMap<String, Node>),
}

/// In-memory materialization of one entity with per-leaf stamps.
#[derive(Clone, Debug, PartialEq)]
pub struct TimestampedEntity {
    pub id: EntityId,
    root: BTreeMap<String, Node>,
}

impl TimestampedEntity {
    /// Reduce raw triples (all versions) into the current entity. `None`
    /// when the entity has no live collection marker.
    pub fn from_triples(triples: Vec<Triple>) -> Option<Self> {
        let current = current_triples(triples);
        let id = current
            .iter()
            .find(|t| t.is_marker())
            .map(|t| t.entity.clone())?;
        let mut root = BTreeMap::new();
        for triple in &current {
            if triple.is_marker() {
                continue;
            }
            // Strip the collection prefix from the attribute path.
            let Some(rest) = triple
                .attr
                .strip_prefix(&AttrPath::from_slice(&[id.collection()]))
            else {
                continue;
            };
            insert_node(&mut root, rest, triple);
        }
        Some(Self { id, root })
    }

    pub fn node_at(&self, path: &[String]) -> Option<&Node> {
        let (first, rest) = path.split_first()?;
        let mut node = self.root.get(first)?;
        for segment in rest {
            match node {
                Node::Branch(children) => node = children.get(segment)?,
                Node::Leaf { .. } => return None,
            }
        }
        Some(node)
    }

    /// Current leaf value at a path; `None` for missing paths or subtrees.
    pub fn value_at(&self, path: &[String]) -> Option<&Value> {
        match self.node_at(path)? {
            Node::Leaf { value, .. } => Some(value),
            Node::Branch(_) => None,
        }
    }

    /// Current set membership at a path: member segment -> present.
    pub fn set_members(&self, path: &[String]) -> BTreeMap<String, bool> {
        match self.node_at(path) {
            Some(Node::Branch(children)) => children
                .iter()
                .filter_map(|(segment, node)| match node {
                    Node::Leaf {
                        value: Value::Boolean(present),
                        ..
                    } => Some((segment.clone(), *present)),
                    _ => None,
                })
                .collect(),
            _ => BTreeMap::new(),
        }
    }

    /// Full paths of every leaf at or below `path`.
    pub fn leaf_paths_under(&self, path: &[String]) -> Vec<Vec<String>> {
        let Some(node) = self.node_at(path) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        collect_leaf_paths(node, path.to_vec(), &mut out);
        out
    }

    /// Leaf values directly under the `collections` branch, keyed by
    /// collection name. Used by the schema reader.
    pub fn collection_leaves(&self) -> Vec<(String, &Value)> {
        match self.root.get("collections") {
            Some(Node::Branch(children)) => children
                .iter()
                .filter_map(|(name, node)| match node {
                    Node::Leaf { value, .. } => Some((name.clone(), value)),
                    Node::Branch(_) => None,
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Drop timestamps; sets keep only members whose latest value is true.
    pub fn to_plain(&self, def: Option<&CollectionDef>) -> serde_json::Value {
        let mut out = JsonMap::new();
        for (name, node) in &self.root {
            let desc = def.and_then(|d| d.attribute(name));
            out.insert(name.clone(), render_node(node, desc));
        }
        serde_json::Value::Object(out)
    }
}

fn collect_leaf_paths(node: &Node, path: Vec<String>, out: &mut Vec<Vec<String>>) {
    match node {
        Node::Leaf { .. } => out.push(path),
        Node::Branch(children) => {
            for (name, child) in children {
                let mut deeper = path.clone();
                deeper.push(name.clone());
                collect_leaf_paths(child, deeper, out);
            }
        }
    }
}

fn insert_node(root: &mut BTreeMap<String, Node>, path: &[String], triple: &Triple) {
    let Some((first, rest)) = path.split_first() else {
        return;
    };
    if rest.is_empty() {
        root.insert(
            first.clone(),
            Node::Leaf {
                value: triple.value.clone(),
                stamp: triple.stamp.clone(),
            },
        );
        return;
    }
    let entry = root
        .entry(first.clone())
        .or_insert_with(|| Node::Branch(BTreeMap::new()));
    if let Node::Branch(children) = entry {
        insert_node(children, rest, triple);
    }
}

fn render_node(node: &Node, desc: Option<&AttributeDescriptor>) -> serde_json::Value {
    match node {
        Node::Leaf { value, .. } => plain_json(value),
        Node::Branch(children) => {
            let set_items = desc.and_then(|d| d.set_items());
            let is_schemaless_set = desc.is_none()
                && !children.is_empty()
                && children
                    .values()
                    .all(|n| matches!(n, Node::Leaf { value: Value::Boolean(_), .. }));
            if set_items.is_some() || is_schemaless_set {
                let members = children
                    .iter()
                    .filter(|(_, node)| {
                        matches!(
                            node,
                            Node::Leaf {
                                value: Value::Boolean(true),
                                ..
                            }
                        )
                    })
                    .map(|(segment, _)| segment_json(segment, set_items))
                    .collect();
                return serde_json::Value::Array(members);
            }
            let fields = desc.and_then(|d| d.record_fields());
            let mut out = JsonMap::new();
            for (name, child) in children {
                let child_desc = fields.and_then(|f| f.get(name));
                out.insert(name.clone(), render_node(child, child_desc));
            }
            serde_json::Value::Object(out)
        }
    }
}

/// Plain-document rendering: dates become bare RFC 3339 strings so the
/// insert → fetch round trip is the identity.
fn plain_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Date(_) => serde_json::Value::String(value.segment()),
        other => other.to_json(),
    }
}

fn segment_json(segment: &str, items: Option<&AttributeDescriptor>) -> serde_json::Value {
    if let Some(items) = items {
        if let Some(value) = items.parse_segment(segment) {
            return plain_json(&value);
        }
        return serde_json::Value::String(segment.to_string());
    }
    // Schemaless: infer the member type from its canonical rendering.
    if segment == "true" {
        return serde_json::Value::Bool(true);
    }
    if segment == "false" {
        return serde_json::Value::Bool(false);
    }
    if let Ok(n) = segment.parse::<f64>() {
        if let Some(num) = serde_json::Number::from_f64(n) {
            return serde_json::Value::Number(num);
        }
    }
    serde_json::Value::String(segment.to_string())
}
