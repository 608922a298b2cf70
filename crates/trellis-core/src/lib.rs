//! Domain types for trellis.
//!
//! Module hierarchy follows type dependency order:
//! - error: domain refusal states
//! - identity: ClientId, EntityId
//! - time: hybrid logical stamps
//! - value: primitive triple leaves
//! - attr: attribute paths
//! - filter: where-predicates
//! - schema: attribute descriptors, collections, rules, roles
//! - diff: schema diff engine + backwards-compatibility classifier

#![forbid(unsafe_code)]

pub mod attr;
pub mod diff;
pub mod error;
pub mod filter;
pub mod identity;
pub mod schema;
pub mod time;
pub mod value;

pub use attr::{AttrPath, COLLECTION_MARKER};
pub use diff::{
    backwards_incompatible_edits, diff_schemas, is_backwards_incompatible, AttributeDiff,
    AttributeDiffOp, DescriptorChanges, SchemaDiff, Transition,
};
pub use error::CoreError;
pub use filter::{apply_scalar_op, like_match, Clause, Filter, Op, Operand, Variables};
pub use identity::{validate_external_id, ClientId, EntityId, ENTITY_ID_SEPARATOR};
pub use schema::{
    AttributeDescriptor, CollectionDef, CollectionRules, DefaultFn, DefaultSpec, PathResolution,
    RoleDef, Rule, StoreSchema, TypeOptions,
};
pub use time::{Clock, Stamp, WallSource};
pub use value::{compare_values, Value};
