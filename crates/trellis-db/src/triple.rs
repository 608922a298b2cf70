//! Triples and their index keying.
//!
//! Every triple is written under two tuple keys: EAV (entity-major, for
//! materializing one document) and AVE (attribute-major, for attribute
//! scans and collection discovery). The row payload carries the full
//! triple, so keys never need decoding.

use serde::{Deserialize, Serialize};
use trellis_core::attr::COLLECTION_MARKER;
use trellis_core::{AttrPath, EntityId, Stamp, Value};

use crate::error::{DbError, DbResult};
use crate::kv::tuple::{encode_key, encode_prefix, KeyPart};

const EAV_TAG: &str = "eav";
const AVE_TAG: &str = "ave";

/// The atomic unit of state: `(E, A, V, T, expired)`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Triple {
    pub entity: EntityId,
    pub attr: AttrPath,
    pub value: Value,
    pub stamp: Stamp,
    #[serde(default)]
    pub expired: bool,
}

impl Triple {
    pub fn new(entity: EntityId, attr: AttrPath, value: Value, stamp: Stamp) -> Self {
        Self {
            entity,
            attr,
            value,
            stamp,
            expired: false,
        }
    }

    /// Synthetic membership marker: `(E, ["_collection"], name, T)`.
    pub fn marker(entity: EntityId, stamp: Stamp) -> Self {
        let collection = entity.collection().to_string();
        Self::new(
            entity,
            AttrPath::marker(),
            Value::String(collection),
            stamp,
        )
    }

    pub fn is_marker(&self) -> bool {
        self.attr.segments() == [COLLECTION_MARKER]
    }

    /// Same triple with the tombstone flag raised at a later stamp.
    pub fn expire_at(&self, stamp: Stamp) -> Self {
        Self {
            entity: self.entity.clone(),
            attr: self.attr.clone(),
            value: self.value.clone(),
            stamp,
            expired: true,
        }
    }

    fn key_tail(&self) -> [KeyPart; 2] {
        [
            KeyPart::U64(self.stamp.tick),
            KeyPart::text(self.stamp.client.as_str()),
        ]
    }

    pub fn eav_key(&self, tenant: Option<&str>) -> Vec<u8> {
        let mut parts = tenant_parts(tenant);
        parts.push(KeyPart::text(EAV_TAG));
        parts.push(KeyPart::text(self.entity.to_string()));
        parts.extend(self.attr.iter().map(KeyPart::text));
        parts.extend(self.key_tail());
        encode_key(&parts)
    }

    pub fn ave_key(&self, tenant: Option<&str>) -> Vec<u8> {
        let mut parts = tenant_parts(tenant);
        parts.push(KeyPart::text(AVE_TAG));
        parts.extend(self.attr.iter().map(KeyPart::text));
        parts.push(KeyPart::from(&self.value));
        parts.push(KeyPart::text(self.entity.to_string()));
        parts.extend(self.key_tail());
        encode_key(&parts)
    }

    pub fn encode_row(&self) -> DbResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|err| DbError::Storage {
            reason: format!("triple encode: {err}"),
        })
    }

    pub fn decode_row(raw: &[u8]) -> DbResult<Self> {
        serde_json::from_slice(raw).map_err(|err| DbError::Storage {
            reason: format!("triple decode: {err}"),
        })
    }
}

fn tenant_parts(tenant: Option<&str>) -> Vec<KeyPart> {
    match tenant {
        Some(id) => vec![KeyPart::text(id)],
        None => Vec::new(),
    }
}

/// Scan prefix covering every triple of one entity.
pub fn entity_prefix(tenant: Option<&str>, entity: &EntityId) -> Vec<u8> {
    let mut parts = tenant_parts(tenant);
    parts.push(KeyPart::text(EAV_TAG));
    parts.push(KeyPart::text(entity.to_string()));
    encode_prefix(&parts)
}

/// Scan prefix covering every triple whose attribute starts with `path`.
pub fn attribute_prefix(tenant: Option<&str>, path: &AttrPath) -> Vec<u8> {
    let mut parts = tenant_parts(tenant);
    parts.push(KeyPart::text(AVE_TAG));
    parts.extend(path.iter().map(KeyPart::text));
    encode_prefix(&parts)
}

/// Scan prefix for collection-membership markers of one collection.
pub fn marker_prefix(tenant: Option<&str>, collection: &str) -> Vec<u8> {
    let mut parts = tenant_parts(tenant);
    parts.push(KeyPart::text(AVE_TAG));
    parts.push(KeyPart::text(COLLECTION_MARKER));
    parts.push(KeyPart::text(collection));
    encode_prefix(&parts)
}

/// Reduce a triple set to the current value per `(entity, attribute)`:
/// the highest stamp wins, tombstones drop the pair.
pub fn current_triples(mut triples: Vec<Triple>) -> Vec<Triple> {
    use std::collections::BTreeMap;
    triples.sort_by(|a, b| {
        (&a.entity, &a.attr, &a.stamp)
            .cmp(&(&b.entity, &b.attr, &b.stamp))
    });
    let mut latest: BTreeMap<(EntityId, AttrPath), Triple> = BTreeMap::new();
    for triple in triples {
        latest.insert((triple.entity.clone(), triple.attr.clone()), triple);
    }
    latest
        .into_values()
        .filter(|triple| !triple.expired)
        .collect()
}
