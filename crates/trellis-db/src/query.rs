//! Queries and filter evaluation.
//!
//! A query names a collection, carries where-predicates, and may bind its
//! own variables on top of the DB-wide scope. Evaluation runs against
//! timestamped entities; missing paths compare as null.

use serde::{Deserialize, Serialize};
use trellis_core::schema::PathResolution;
use trellis_core::{apply_scalar_op, Clause, CollectionDef, Filter, Operand, Value, Variables};

use crate::codec::TimestampedEntity;
use crate::error::DbResult;
use crate::store::StoreTx;

/// A fetch/subscribe request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub collection: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<Filter>,
    #[serde(default, skip_serializing_if = "Variables::is_empty")]
    pub vars: Variables,
}

impl Query {
    pub fn collection(name: impl Into<String>) -> Self {
        Self {
            collection: name.into(),
            filters: Vec::new(),
            vars: Variables::new(),
        }
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn var(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.vars.insert(name.into(), value);
        self
    }
}

/// Whether an entity satisfies every filter (top level is a conjunction).
pub fn entity_matches(
    entity: &TimestampedEntity,
    def: Option<&CollectionDef>,
    filters: &[Filter],
    vars: &Variables,
) -> DbResult<bool> {
    for filter in filters {
        if !eval_filter(entity, def, filter, vars)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn eval_filter(
    entity: &TimestampedEntity,
    def: Option<&CollectionDef>,
    filter: &Filter,
    vars: &Variables,
) -> DbResult<bool> {
    match filter {
        Filter::Const(b) => Ok(*b),
        Filter::And(filters) => {
            for f in filters {
                if !eval_filter(entity, def, f, vars)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        Filter::Or(filters) => {
            for f in filters {
                if eval_filter(entity, def, f, vars)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        Filter::Where(clause) => eval_clause(entity, def, clause, vars),
    }
}

fn eval_clause(
    entity: &TimestampedEntity,
    def: Option<&CollectionDef>,
    clause: &Clause,
    vars: &Variables,
) -> DbResult<bool> {
    let operand = clause.value.resolve(vars)?;

    if clause.op.is_set_op() {
        let Operand::Value(target) = &operand else {
            return Ok(false);
        };
        let target = coerce_set_target(def, &clause.path, target);
        let members = entity.set_members(&clause.path);
        let present = members.get(&target.segment()).copied().unwrap_or(false);
        return Ok(match clause.op {
            trellis_core::Op::Has => present,
            _ => !present,
        });
    }

    Ok(apply_scalar_op(clause.op, entity.value_at(&clause.path), &operand))
}

/// Member operands arrive as JSON leaves; date-typed sets need the member
/// re-parsed so its path segment matches what the codec wrote.
fn coerce_set_target(
    def: Option<&CollectionDef>,
    path: &[String],
    target: &Value,
) -> Value {
    let items = def.and_then(|d| match d.resolve_path(path) {
        PathResolution::Set(set) => set.set_items(),
        _ => None,
    });
    match (items, target) {
        (Some(items), Value::String(raw)) => {
            items.parse_segment(raw).unwrap_or_else(|| target.clone())
        }
        _ => target.clone(),
    }
}

/// Run a query inside a transaction: scan the collection, filter, and
/// return plain documents in entity-id order.
pub fn run_query(
    tx: &StoreTx<'_>,
    query: &Query,
    def: Option<&CollectionDef>,
    base_vars: &Variables,
) -> DbResult<Vec<serde_json::Value>> {
    let mut vars = base_vars.clone();
    vars.extend(query.vars.iter().map(|(k, v)| (k.clone(), v.clone())));

    let mut results = Vec::new();
    for id in tx.collection_entities(&query.collection)? {
        let Some(entity) = tx.materialize(&id)? else {
            continue;
        };
        if entity_matches(&entity, def, &query.filters, &vars)? {
            results.push(entity.to_plain(def));
        }
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_core::{AttrPath, AttributeDescriptor, ClientId, EntityId, Op, Stamp};

    use crate::triple::Triple;

    fn stamp(tick: u64) -> Stamp {
        Stamp::new(tick, ClientId::new("c1").expect("valid client id"))
    }

    fn entity_with(fields: &[(&[&str], Value)]) -> TimestampedEntity {
        let id = EntityId::new("users", "u1").expect("valid");
        let mut triples = vec![Triple::marker(id.clone(), stamp(1))];
        for (path, value) in fields {
            let mut segments = vec!["users".to_string()];
            segments.extend(path.iter().map(|s| s.to_string()));
            triples.push(Triple::new(
                id.clone(),
                AttrPath::new(segments),
                value.clone(),
                stamp(1),
            ));
        }
        TimestampedEntity::from_triples(triples).expect("alive")
    }

    #[test]
    fn scalar_ops_against_current_values() {
        let entity = entity_with(&[(&["age"], Value::from(30.0))]);
        let vars = Variables::new();
        let older = Filter::where_(&["age"], Op::Gte, Value::from(18.0));
        assert!(entity_matches(&entity, None, &[older], &vars).expect("evals"));
        let younger = Filter::where_(&["age"], Op::Lt, Value::from(18.0));
        assert!(!entity_matches(&entity, None, &[younger], &vars).expect("evals"));
    }

    #[test]
    fn has_checks_membership() {
        let entity = entity_with(&[
            (&["tags", "rust"], Value::Boolean(true)),
            (&["tags", "go"], Value::Boolean(false)),
        ]);
        let vars = Variables::new();
        let has_rust = Filter::where_(&["tags"], Op::Has, Value::from("rust"));
        let has_go = Filter::where_(&["tags"], Op::Has, Value::from("go"));
        let not_has_go = Filter::where_(&["tags"], Op::NotHas, Value::from("go"));
        assert!(entity_matches(&entity, None, &[has_rust], &vars).expect("evals"));
        assert!(!entity_matches(&entity, None, &[has_go], &vars).expect("evals"));
        assert!(entity_matches(&entity, None, &[not_has_go], &vars).expect("evals"));
    }

    #[test]
    fn and_or_const_combinators() {
        let entity = entity_with(&[(&["name"], Value::from("ada"))]);
        let vars = Variables::new();
        let both = Filter::And(vec![
            Filter::where_(&["name"], Op::Eq, Value::from("ada")),
            Filter::Const(true),
        ]);
        assert!(entity_matches(&entity, None, &[both], &vars).expect("evals"));
        let either = Filter::Or(vec![
            Filter::Const(false),
            Filter::where_(&["name"], Op::Like, Value::from("a%")),
        ]);
        assert!(entity_matches(&entity, None, &[either], &vars).expect("evals"));
        assert!(
            !entity_matches(&entity, None, &[Filter::Const(false)], &vars).expect("evals")
        );
    }

    #[test]
    fn unresolved_variable_raises() {
        let entity = entity_with(&[(&["name"], Value::from("ada"))]);
        let filter = Filter::where_(&["name"], Op::Eq, Value::from("$who"));
        let err = entity_matches(&entity, None, &[filter], &Variables::new())
            .expect_err("unbound variable");
        assert_eq!(err.kind(), "SessionVariableNotFound");
    }

    #[test]
    fn query_vars_overlay_resolves() {
        let entity = entity_with(&[(&["name"], Value::from("ada"))]);
        let mut vars = Variables::new();
        vars.insert("who".into(), serde_json::json!("ada"));
        let filter = Filter::where_(&["name"], Op::Eq, Value::from("$who"));
        assert!(entity_matches(&entity, None, &[filter], &vars).expect("evals"));
    }

    #[test]
    fn date_set_members_match_by_segment() {
        let def = CollectionDef::new([
            ("id", AttributeDescriptor::id()),
            (
                "when",
                AttributeDescriptor::set(AttributeDescriptor::date()),
            ),
        ]);
        let entity = entity_with(&[(
            &["when", "2024-03-01T12:00:00Z"],
            Value::Boolean(true),
        )]);
        let vars = Variables::new();
        let has = Filter::where_(
            &["when"],
            Op::Has,
            Value::from("2024-03-01T12:00:00Z"),
        );
        assert!(entity_matches(&entity, Some(&def), &[has], &vars).expect("evals"));
    }
}
