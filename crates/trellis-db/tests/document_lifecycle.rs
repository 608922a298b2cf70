//! End-to-end document lifecycle: insert → fetch → update → delete, set
//! semantics, write rules, filters, and subscriptions.

use std::sync::mpsc;
use std::time::Duration;

use serde_json::json;
use trellis_db::core::attr::AttrPath;
use trellis_db::core::schema::Rule;
use trellis_db::{
    AttributeDescriptor, CollectionDef, CollectionRules, Db, DbOptions, DefaultSpec, Filter, Op,
    Query, StoreSchema, Value, Variables,
};

fn users_schema() -> StoreSchema {
    StoreSchema::new(
        1,
        [(
            "users",
            CollectionDef::new([
                ("id", AttributeDescriptor::id()),
                ("name", AttributeDescriptor::string()),
                ("age", AttributeDescriptor::number().optional()),
                (
                    "status",
                    AttributeDescriptor::string()
                        .with_default(DefaultSpec::literal(json!("active"))),
                ),
                (
                    "tags",
                    AttributeDescriptor::set(AttributeDescriptor::string()),
                ),
                (
                    "address",
                    AttributeDescriptor::record([
                        ("city", AttributeDescriptor::string()),
                        ("zip", AttributeDescriptor::string().optional()),
                    ])
                    .optional(),
                ),
            ]),
        )],
    )
}

fn users_db() -> Db {
    Db::open(DbOptions::default().with_schema(users_schema())).expect("opens")
}

#[test]
fn insert_then_fetch_by_id_round_trips() {
    let db = users_db();
    db.insert(
        "users",
        json!({
            "name": "ada",
            "age": 36.0,
            "tags": ["logic", "math"],
            "address": { "city": "london" },
        }),
        Some("u1"),
    )
    .expect("inserts");

    let fetched = db
        .fetch_by_id("users", "u1")
        .expect("fetches")
        .expect("present");
    assert_eq!(
        fetched,
        json!({
            "id": "u1",
            "name": "ada",
            "age": 36.0,
            "status": "active",
            "tags": ["logic", "math"],
            "address": { "city": "london" },
        })
    );
}

#[test]
fn generated_ids_are_returned_by_fetch() {
    let db = users_db();
    db.insert("users", json!({ "name": "grace" }), None)
        .expect("inserts");
    let results = db.fetch(&Query::collection("users")).expect("fetches");
    assert_eq!(results.len(), 1);
    let id = results[0]["id"].as_str().expect("id is a string");
    assert!(!id.is_empty());
    assert!(!id.contains('#'));
}

#[test]
fn ids_with_separator_are_rejected() {
    let db = users_db();
    let err = db
        .insert("users", json!({ "name": "x" }), Some("a#b"))
        .expect_err("separator is forbidden");
    assert_eq!(err.kind(), "InvalidEntityId");
}

#[test]
fn update_stages_through_the_draft() {
    let db = users_db();
    db.insert("users", json!({ "name": "ada" }), Some("u1"))
        .expect("inserts");

    db.update("users", "u1", |draft| {
        assert_eq!(draft.get(&["name"]), Some(json!("ada")));
        draft.set(&["name"], json!("lovelace"))?;
        assert_eq!(draft.get(&["name"]), Some(json!("lovelace")));
        draft.set(&["address"], json!({ "city": "paris" }))?;
        Ok(())
    })
    .expect("updates");

    let fetched = db
        .fetch_by_id("users", "u1")
        .expect("fetches")
        .expect("present");
    assert_eq!(fetched["name"], json!("lovelace"));
    assert_eq!(fetched["address"]["city"], json!("paris"));
}

#[test]
fn unset_removes_an_optional_attribute() {
    let db = users_db();
    db.insert("users", json!({ "name": "ada", "age": 36.0 }), Some("u1"))
        .expect("inserts");

    db.update("users", "u1", |draft| draft.unset(&["age"]))
        .expect("updates");
    let fetched = db.fetch_by_id("users", "u1").expect("fetches").expect("present");
    assert!(fetched.get("age").is_none());

    // required attributes cannot be unset; the transaction aborts
    let err = db
        .update("users", "u1", |draft| draft.unset(&["name"]))
        .expect_err("name is required");
    assert_eq!(err.kind(), "ValueTypeMismatch");
    let fetched = db.fetch_by_id("users", "u1").expect("fetches").expect("present");
    assert_eq!(fetched["name"], json!("ada"));
}

#[test]
fn update_of_missing_entity_is_entity_not_found() {
    let db = users_db();
    let err = db
        .update("users", "ghost", |_| Ok(()))
        .expect_err("missing entity");
    assert_eq!(err.kind(), "EntityNotFound");
}

#[test]
fn unknown_attribute_fails_the_update() {
    let db = users_db();
    db.insert("users", json!({ "name": "ada" }), Some("u1"))
        .expect("inserts");
    let err = db
        .update("users", "u1", |draft| draft.set(&["nope"], json!(1)))
        .expect_err("unknown attribute");
    assert_eq!(err.kind(), "UnknownAttribute");
    // the failed transaction left the entity untouched
    let fetched = db
        .fetch_by_id("users", "u1")
        .expect("fetches")
        .expect("present");
    assert_eq!(fetched["name"], json!("ada"));
}

#[test]
fn set_operations_commute_within_a_transaction() {
    let db = users_db();
    db.insert("users", json!({ "name": "ada", "tags": ["a"] }), Some("u1"))
        .expect("inserts");

    // add then remove leaves the member out
    db.update("users", "u1", |draft| {
        let mut tags = draft.set_of(&["tags"])?;
        tags.add(json!("x"))?;
        tags.remove(json!("x"))?;
        Ok(())
    })
    .expect("updates");
    let fetched = db.fetch_by_id("users", "u1").expect("fetches").expect("present");
    assert_eq!(fetched["tags"], json!(["a"]));

    // remove then add leaves the member in
    db.update("users", "u1", |draft| {
        let mut tags = draft.set_of(&["tags"])?;
        tags.remove(json!("y"))?;
        tags.add(json!("y"))?;
        Ok(())
    })
    .expect("updates");
    let fetched = db.fetch_by_id("users", "u1").expect("fetches").expect("present");
    assert_eq!(fetched["tags"], json!(["a", "y"]));
}

#[test]
fn set_membership_across_transactions_orders_by_stamp() {
    let db = users_db();
    db.insert("users", json!({ "name": "ada", "tags": ["a"] }), Some("u1"))
        .expect("inserts");
    db.update("users", "u1", |draft| draft.set_of(&["tags"])?.add(json!("b")))
        .expect("adds");
    db.update("users", "u1", |draft| draft.set_of(&["tags"])?.remove(json!("a")))
        .expect("removes");

    let fetched = db.fetch_by_id("users", "u1").expect("fetches").expect("present");
    assert_eq!(fetched["tags"], json!(["b"]));
}

#[test]
fn delete_tombstones_the_whole_entity() {
    let db = users_db();
    db.insert("users", json!({ "name": "ada" }), Some("u1"))
        .expect("inserts");
    db.delete("users", "u1").expect("deletes");

    assert_eq!(db.fetch_by_id("users", "u1").expect("fetches"), None);
    assert!(db.fetch(&Query::collection("users")).expect("fetches").is_empty());

    let err = db.delete("users", "u1").expect_err("already gone");
    assert_eq!(err.kind(), "EntityNotFound");
}

#[test]
fn write_rule_rejects_and_writes_nothing() {
    let mut schema = users_schema();
    let mut rules = CollectionRules::default();
    rules
        .write
        .insert("deny".into(), Rule::new(vec![Filter::Const(false)]));
    schema
        .collections
        .get_mut("users")
        .expect("users exists")
        .rules = Some(rules);

    let db = Db::open(DbOptions::default().with_schema(schema)).expect("opens");
    let err = db
        .insert("users", json!({ "name": "ada" }), Some("u1"))
        .expect_err("rule rejects");
    assert_eq!(err.kind(), "WriteRuleViolation");

    // nothing committed: no entity, no triples
    assert_eq!(db.fetch_by_id("users", "u1").expect("fetches"), None);
    let leftovers = db
        .transact(|tx| tx.triples_by_attribute(&AttrPath::from_slice(&["users"])))
        .expect("scans");
    assert!(leftovers.is_empty());
}

#[test]
fn write_rule_consults_the_post_image() {
    let mut schema = users_schema();
    let mut rules = CollectionRules::default();
    rules.write.insert(
        "adults_only".into(),
        Rule::new(vec![Filter::where_(&["age"], Op::Gte, Value::from(18.0))]),
    );
    schema
        .collections
        .get_mut("users")
        .expect("users exists")
        .rules = Some(rules);
    let db = Db::open(DbOptions::default().with_schema(schema)).expect("opens");

    db.insert("users", json!({ "name": "ada", "age": 36.0 }), Some("u1"))
        .expect("passes the rule");

    let err = db
        .update("users", "u1", |draft| draft.set(&["age"], json!(12.0)))
        .expect_err("post-image violates the rule");
    assert_eq!(err.kind(), "WriteRuleViolation");

    let fetched = db.fetch_by_id("users", "u1").expect("fetches").expect("present");
    assert_eq!(fetched["age"], json!(36.0));
}

#[test]
fn fetch_filters_with_variables() {
    let db = users_db();
    db.insert("users", json!({ "name": "ada", "age": 36.0 }), Some("u1"))
        .expect("inserts");
    db.insert("users", json!({ "name": "alan", "age": 41.0 }), Some("u2"))
        .expect("inserts");

    let by_name = Query::collection("users")
        .filter(Filter::where_(&["name"], Op::Eq, Value::from("$who")))
        .var("who", json!("ada"));
    let results = db.fetch(&by_name).expect("fetches");
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["id"], json!("u1"));

    let unbound = Query::collection("users")
        .filter(Filter::where_(&["name"], Op::Eq, Value::from("$missing")));
    let err = db.fetch(&unbound).expect_err("unbound variable");
    assert_eq!(err.kind(), "SessionVariableNotFound");

    let mut vars = Variables::new();
    vars.insert("missing".into(), json!("alan"));
    db.update_variables(vars);
    let results = db.fetch(&unbound).expect("now bound");
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["id"], json!("u2"));
}

#[test]
fn has_filter_targets_set_membership() {
    let db = users_db();
    db.insert(
        "users",
        json!({ "name": "ada", "tags": ["logic", "math"] }),
        Some("u1"),
    )
    .expect("inserts");
    db.insert("users", json!({ "name": "alan", "tags": ["crypto"] }), Some("u2"))
        .expect("inserts");

    let logicians = Query::collection("users")
        .filter(Filter::where_(&["tags"], Op::Has, Value::from("logic")));
    let results = db.fetch(&logicians).expect("fetches");
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["id"], json!("u1"));

    let not_crypto = Query::collection("users")
        .filter(Filter::where_(&["tags"], Op::NotHas, Value::from("crypto")));
    let results = db.fetch(&not_crypto).expect("fetches");
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["id"], json!("u1"));
}

#[test]
fn subscription_sees_initial_and_changed_results() {
    let db = users_db();
    db.insert("users", json!({ "name": "ada" }), Some("u1"))
        .expect("inserts");

    let (sender, receiver) = mpsc::channel();
    let subscription = db
        .subscribe(
            Query::collection("users"),
            move |results| {
                sender.send(results).ok();
            },
            |err| panic!("subscription error: {err}"),
        )
        .expect("subscribes");

    let initial = receiver
        .recv_timeout(Duration::from_secs(5))
        .expect("initial result");
    assert_eq!(initial.len(), 1);

    db.insert("users", json!({ "name": "alan" }), Some("u2"))
        .expect("inserts");
    let changed = receiver
        .recv_timeout(Duration::from_secs(5))
        .expect("changed result");
    assert_eq!(changed.len(), 2);

    subscription.unsubscribe();
    subscription.unsubscribe(); // idempotent

    db.insert("users", json!({ "name": "kurt" }), Some("u3"))
        .expect("inserts");
    assert!(receiver.recv_timeout(Duration::from_millis(200)).is_err());
}

#[test]
fn schemaless_db_accepts_any_shape() {
    let db = Db::schemaless();
    db.insert(
        "notes",
        json!({ "title": "hello", "meta": { "stars": 5.0 } }),
        Some("n1"),
    )
    .expect("inserts");
    let fetched = db.fetch_by_id("notes", "n1").expect("fetches").expect("present");
    assert_eq!(fetched["title"], json!("hello"));
    assert_eq!(fetched["meta"]["stars"], json!(5.0));
}

#[test]
fn unknown_collection_is_rejected_when_a_schema_exists() {
    let db = users_db();
    let err = db
        .insert("ghosts", json!({ "name": "casper" }), None)
        .expect_err("not in the schema");
    assert_eq!(err.kind(), "CollectionNotFound");
}

#[test]
fn dates_round_trip_through_schema_coercion() {
    let schema = StoreSchema::new(
        1,
        [(
            "events",
            CollectionDef::new([
                ("id", AttributeDescriptor::id()),
                ("at", AttributeDescriptor::date()),
            ]),
        )],
    );
    let db = Db::open(DbOptions::default().with_schema(schema)).expect("opens");
    db.insert("events", json!({ "at": "2024-03-01T12:00:00Z" }), Some("e1"))
        .expect("inserts");
    let fetched = db.fetch_by_id("events", "e1").expect("fetches").expect("present");
    assert_eq!(fetched["at"], json!("2024-03-01T12:00:00Z"));

    let before = Query::collection("events").filter(Filter::where_(
        &["at"],
        Op::Lt,
        Value::Date(
            time::OffsetDateTime::parse(
                "2025-01-01T00:00:00Z",
                &time::format_description::well_known::Rfc3339,
            )
            .expect("parses"),
        ),
    ));
    assert_eq!(db.fetch(&before).expect("fetches").len(), 1);
}
