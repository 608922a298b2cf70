//! Schema diff classification, live-data safety checks, migrations, and
//! schema storage behavior.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde_json::json;
use trellis_db::core::attr::AttrPath;
use trellis_db::core::diff::{AttributeDiffOp, SchemaDiff};
use trellis_db::{
    backwards_incompatible_edits, diff_schemas, AttributeDescriptor, CollectionDef, Db,
    DbOptions, Direction, MemoryKv, MigrateOp, Migration, OrderedKv, Query, StoreSchema, Value,
};

fn collection(attrs: Vec<(&'static str, AttributeDescriptor)>) -> CollectionDef {
    CollectionDef::new(attrs)
}

/// The mixed 10-edit diff: exactly 7 edits are backwards-incompatible.
#[test]
fn classification_of_a_mixed_diff() {
    let old = StoreSchema::new(
        1,
        [(
            "stress",
            collection(vec![
                ("id", AttributeDescriptor::id()),
                ("number", AttributeDescriptor::string()),
                ("optionalBoolean", AttributeDescriptor::boolean().optional()),
                ("nullableDate", AttributeDescriptor::date().nullable()),
                (
                    "booleanSet",
                    AttributeDescriptor::set(AttributeDescriptor::boolean()),
                ),
                (
                    "recordWithKeys",
                    AttributeDescriptor::record([("a", AttributeDescriptor::string())]),
                ),
                (
                    "record",
                    AttributeDescriptor::record([("x", AttributeDescriptor::string())]),
                ),
                ("stringToOptional", AttributeDescriptor::string()),
                ("nonNullToNull", AttributeDescriptor::string()),
                ("withDefault", AttributeDescriptor::string()),
            ]),
        )],
    );
    let new = StoreSchema::new(
        2,
        [(
            "stress",
            collection(vec![
                ("id", AttributeDescriptor::id()),
                ("number", AttributeDescriptor::number()),
                ("optionalBoolean", AttributeDescriptor::boolean()),
                ("nullableDate", AttributeDescriptor::date()),
                (
                    "booleanSet",
                    AttributeDescriptor::set(AttributeDescriptor::string()),
                ),
                (
                    "recordWithKeys",
                    AttributeDescriptor::record([("a", AttributeDescriptor::number())]),
                ),
                ("new", AttributeDescriptor::string()),
                ("stringToOptional", AttributeDescriptor::string().optional()),
                ("nonNullToNull", AttributeDescriptor::string().nullable()),
                (
                    "withDefault",
                    AttributeDescriptor::string().with_default(
                        trellis_db::DefaultSpec::literal(json!("d")),
                    ),
                ),
            ]),
        )],
    );

    let diffs = diff_schemas(&old, &new);
    assert_eq!(diffs.len(), 10, "one record per edited path: {diffs:#?}");

    let incompatible = backwards_incompatible_edits(&diffs);
    assert_eq!(incompatible.len(), 7, "{incompatible:#?}");

    let flagged: BTreeSet<String> = incompatible
        .iter()
        .filter_map(|diff| match diff {
            SchemaDiff::CollectionAttribute(attr) => Some(attr.attribute[0].clone()),
            _ => None,
        })
        .collect();
    let expected: BTreeSet<String> = [
        "number",
        "optionalBoolean",
        "nullableDate",
        "booleanSet",
        "recordWithKeys",
        "new",
        "record",
    ]
    .into_iter()
    .map(str::to_string)
    .collect();
    assert_eq!(flagged, expected);
}

#[test]
fn diff_of_identical_schemas_is_empty_end_to_end() {
    let schema = StoreSchema::new(
        3,
        [(
            "c",
            collection(vec![
                ("id", AttributeDescriptor::id()),
                ("tags", AttributeDescriptor::set(AttributeDescriptor::string())),
            ]),
        )],
    );
    assert!(diff_schemas(&schema, &schema).is_empty());
}

fn enum_abc() -> AttributeDescriptor {
    AttributeDescriptor::string().with_enum(vec![
        Value::from("a"),
        Value::from("b"),
        Value::from("c"),
    ])
}

/// Enum narrowing: unsafe in the abstract, but violating only when data
/// actually sits outside the new enum.
#[test]
fn enum_introduction_checks_live_data() {
    let v1 = StoreSchema::new(
        1,
        [(
            "c",
            collection(vec![
                ("id", AttributeDescriptor::id()),
                ("status", AttributeDescriptor::string()),
            ]),
        )],
    );
    let candidate = StoreSchema::new(
        2,
        [(
            "c",
            collection(vec![("id", AttributeDescriptor::id()), ("status", enum_abc())]),
        )],
    );
    let db = Db::open(DbOptions::default().with_schema(v1)).expect("opens");

    // empty database: unsafe edit, but nothing violates
    let issues = db.check_schema_change(&candidate).expect("checks");
    assert_eq!(issues.len(), 1);
    assert!(!issues[0].violates_existing_data);
    assert!(issues[0].reason.is_none());

    // a value outside the enum violates
    db.insert("c", json!({ "status": "e" }), Some("x1")).expect("inserts");
    let issues = db.check_schema_change(&candidate).expect("checks");
    assert_eq!(issues.len(), 1);
    assert!(issues[0].violates_existing_data);
    assert!(issues[0].reason.is_some());

    // updating the value back inside the enum clears the violation
    db.update("c", "x1", |draft| draft.set(&["status"], json!("a")))
        .expect("updates");
    let issues = db.check_schema_change(&candidate).expect("checks");
    assert_eq!(issues.len(), 1);
    assert!(!issues[0].violates_existing_data);
}

#[test]
fn enum_widening_yields_no_incompatible_edits() {
    let old = StoreSchema::new(
        1,
        [(
            "c",
            collection(vec![("id", AttributeDescriptor::id()), ("status", enum_abc())]),
        )],
    );
    let new = StoreSchema::new(
        2,
        [(
            "c",
            collection(vec![
                ("id", AttributeDescriptor::id()),
                (
                    "status",
                    AttributeDescriptor::string().with_enum(vec![
                        Value::from("a"),
                        Value::from("b"),
                        Value::from("c"),
                        Value::from("d"),
                    ]),
                ),
            ]),
        )],
    );
    let diffs = diff_schemas(&old, &new);
    assert_eq!(diffs.len(), 1);
    assert!(backwards_incompatible_edits(&diffs).is_empty());

    let db = Db::open(DbOptions::default().with_schema(old)).expect("opens");
    db.insert("c", json!({ "status": "a" }), Some("x1")).expect("inserts");
    let issues = db.check_schema_change(&new).expect("checks");
    assert!(issues.is_empty());
}

/// A backwards-compatible diff never flags data, whatever the state.
#[test]
fn compatible_edits_never_violate() {
    let v1 = StoreSchema::new(
        1,
        [(
            "c",
            collection(vec![
                ("id", AttributeDescriptor::id()),
                ("name", AttributeDescriptor::string()),
            ]),
        )],
    );
    let candidate = StoreSchema::new(
        2,
        [(
            "c",
            collection(vec![
                ("id", AttributeDescriptor::id()),
                ("name", AttributeDescriptor::string().optional().nullable()),
                ("note", AttributeDescriptor::string().optional()),
            ]),
        )],
    );
    let db = Db::open(DbOptions::default().with_schema(v1)).expect("opens");
    for i in 0..5 {
        db.insert("c", json!({ "name": format!("n{i}") }), None)
            .expect("inserts");
    }
    assert!(db.check_schema_change(&candidate).expect("checks").is_empty());
}

/// An empty collection yields no violations for any edit of it.
#[test]
fn empty_collection_is_always_safe() {
    let v1 = StoreSchema::new(
        1,
        [(
            "c",
            collection(vec![
                ("id", AttributeDescriptor::id()),
                ("name", AttributeDescriptor::string()),
                ("tags", AttributeDescriptor::set(AttributeDescriptor::boolean())),
            ]),
        )],
    );
    let candidate = StoreSchema::new(
        2,
        [(
            "c",
            collection(vec![
                ("id", AttributeDescriptor::id()),
                ("name", AttributeDescriptor::number()),
                ("tags", AttributeDescriptor::set(AttributeDescriptor::string())),
                ("required", AttributeDescriptor::date()),
            ]),
        )],
    );
    let db = Db::open(DbOptions::default().with_schema(v1)).expect("opens");
    let issues = db.check_schema_change(&candidate).expect("checks");
    assert!(!issues.is_empty());
    assert!(issues.iter().all(|i| !i.violates_existing_data));
}

#[test]
fn required_insert_and_delete_probe_live_data() {
    let v1 = StoreSchema::new(
        1,
        [(
            "c",
            collection(vec![
                ("id", AttributeDescriptor::id()),
                ("name", AttributeDescriptor::string().optional()),
            ]),
        )],
    );
    // delete `name`, add required `email`
    let candidate = StoreSchema::new(
        2,
        [(
            "c",
            collection(vec![
                ("id", AttributeDescriptor::id()),
                ("email", AttributeDescriptor::string()),
            ]),
        )],
    );
    let db = Db::open(DbOptions::default().with_schema(v1)).expect("opens");
    db.insert("c", json!({}), Some("x1")).expect("inserts");

    // `name` was optional and absent, so only the required insert violates
    let issues = db.check_schema_change(&candidate).expect("checks");
    assert_eq!(issues.len(), 1);
    let SchemaDiff::CollectionAttribute(attr) = &issues[0].diff else {
        panic!("attribute diff expected");
    };
    assert_eq!(attr.attribute, vec!["email".to_string()]);
    assert!(matches!(attr.op, AttributeDiffOp::Insert { .. }));
    assert!(issues[0].violates_existing_data);
}

#[test]
fn type_change_probe_matches_runtime_types() {
    let v1 = StoreSchema::new(
        1,
        [(
            "c",
            collection(vec![
                ("id", AttributeDescriptor::id()),
                ("score", AttributeDescriptor::string().nullable()),
            ]),
        )],
    );
    let candidate = StoreSchema::new(
        2,
        [(
            "c",
            collection(vec![
                ("id", AttributeDescriptor::id()),
                ("score", AttributeDescriptor::number().nullable()),
            ]),
        )],
    );
    let db = Db::open(DbOptions::default().with_schema(v1)).expect("opens");

    // explicit null does not violate a type change
    db.insert("c", json!({ "score": null }), Some("x1")).expect("inserts");
    let issues = db.check_schema_change(&candidate).expect("checks");
    assert_eq!(issues.len(), 1);
    assert!(!issues[0].violates_existing_data);

    db.insert("c", json!({ "score": "high" }), Some("x2")).expect("inserts");
    let issues = db.check_schema_change(&candidate).expect("checks");
    assert!(issues[0].violates_existing_data);
}

#[test]
fn rename_preserves_data_and_clears_old_triples() {
    let schema = StoreSchema::new(
        1,
        [(
            "users",
            collection(vec![
                ("id", AttributeDescriptor::id()),
                ("name", AttributeDescriptor::string()),
            ]),
        )],
    );
    let db = Db::open(DbOptions::default().with_schema(schema)).expect("opens");
    db.insert("users", json!({ "name": "x" }), Some("u1")).expect("inserts");

    db.rename_attribute("users", &["name"], "fullName").expect("renames");

    let fetched = db.fetch_by_id("users", "u1").expect("fetches").expect("present");
    assert_eq!(fetched["fullName"], json!("x"));
    assert!(fetched.get("name").is_none());

    let old_triples = db
        .transact(|tx| tx.triples_by_attribute(&AttrPath::from_slice(&["users", "name"])))
        .expect("scans");
    assert!(old_triples.is_empty());

    let schema = db.schema().expect("reads").expect("present");
    let def = schema.collection("users").expect("users exists");
    assert!(def.attribute("fullName").is_some());
    assert!(def.attribute("name").is_none());
}

fn users_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            parent: 0,
            up: vec![MigrateOp::CreateCollection {
                name: "users".into(),
                schema: BTreeMap::from([
                    ("id".to_string(), AttributeDescriptor::id()),
                    ("name".to_string(), AttributeDescriptor::string()),
                ]),
                rules: None,
                permissions: None,
            }],
            down: vec![MigrateOp::DropCollection {
                name: "users".into(),
            }],
        },
        Migration {
            version: 2,
            parent: 1,
            up: vec![MigrateOp::AddAttribute {
                collection: "users".into(),
                path: vec!["age".into()],
                attribute: AttributeDescriptor::number().optional(),
            }],
            down: vec![MigrateOp::DropAttribute {
                collection: "users".into(),
                path: vec!["age".into()],
            }],
        },
    ]
}

#[test]
fn migrations_apply_up_and_down_with_version_gates() {
    let db = Db::open(DbOptions::default().with_migrations(users_migrations()))
        .expect("opens and migrates");
    let schema = db.schema().expect("reads").expect("present");
    assert_eq!(schema.version, 2);
    assert!(schema
        .collection("users")
        .expect("users")
        .attribute("age")
        .is_some());

    db.insert("users", json!({ "name": "ada", "age": 36.0 }), Some("u1"))
        .expect("inserts");

    // down from 2 to 1
    let migrations = users_migrations();
    db.migrate(&migrations[1..], Direction::Down).expect("down");
    let schema = db.schema().expect("reads").expect("present");
    assert_eq!(schema.version, 1);
    assert!(schema
        .collection("users")
        .expect("users")
        .attribute("age")
        .is_none());

    // a migration whose parent doesn't match is skipped, not an error
    let orphan = Migration {
        version: 9,
        parent: 7,
        up: vec![MigrateOp::CreateCollection {
            name: "orphan".into(),
            schema: BTreeMap::new(),
            rules: None,
            permissions: None,
        }],
        down: vec![],
    };
    db.migrate(&[orphan], Direction::Up).expect("skips");
    let schema = db.schema().expect("reads").expect("present");
    assert_eq!(schema.version, 1);
    assert!(schema.collection("orphan").is_none());
}

#[test]
fn failed_migration_leaves_schema_untouched() {
    let db = Db::open(DbOptions::default().with_migrations(users_migrations()))
        .expect("opens");
    // dropping a non-existent attribute fails the whole migration
    let broken = Migration {
        version: 3,
        parent: 2,
        up: vec![
            MigrateOp::AddAttribute {
                collection: "users".into(),
                path: vec!["nick".into()],
                attribute: AttributeDescriptor::string().optional(),
            },
            MigrateOp::DropAttribute {
                collection: "users".into(),
                path: vec!["ghost".into()],
            },
        ],
        down: vec![],
    };
    let err = db.migrate(&[broken], Direction::Up).expect_err("fails");
    assert_eq!(err.kind(), "InvalidMigrationOperation");

    let schema = db.schema().expect("reads").expect("present");
    assert_eq!(schema.version, 2, "version tuple did not advance");
    assert!(schema
        .collection("users")
        .expect("users")
        .attribute("nick")
        .is_none());
}

#[test]
fn providing_schema_and_migrations_is_an_error() {
    let err = Db::open(
        DbOptions::default()
            .with_schema(StoreSchema::new(1, []))
            .with_migrations(users_migrations()),
    )
    .expect_err("mutually exclusive");
    assert_eq!(err.kind(), "InvalidOptions");
}

#[test]
fn stale_schema_on_open_is_a_version_mismatch() {
    let kv: Arc<dyn OrderedKv> = Arc::new(MemoryKv::new());
    let v2 = StoreSchema::new(
        2,
        [("c", collection(vec![("id", AttributeDescriptor::id())]))],
    );
    Db::open(DbOptions::default().with_schema(v2).with_source(Arc::clone(&kv)))
        .expect("first open");

    let v1 = StoreSchema::new(
        1,
        [("c", collection(vec![("id", AttributeDescriptor::id())]))],
    );
    let err = Db::open(DbOptions::default().with_schema(v1).with_source(kv))
        .expect_err("older than stored");
    assert_eq!(err.kind(), "SchemaVersionMismatch");
}

#[test]
fn drop_collection_purges_data() {
    let db = Db::open(DbOptions::default().with_migrations(users_migrations()))
        .expect("opens");
    db.insert("users", json!({ "name": "ada" }), Some("u1")).expect("inserts");
    db.drop_collection("users").expect("drops");

    let schema = db.schema().expect("reads").expect("present");
    assert!(schema.collection("users").is_none());
    let markers = db
        .transact(|tx| tx.collection_entities("users"))
        .expect("scans");
    assert!(markers.is_empty());
}

#[test]
fn override_schema_replaces_wholesale() {
    let db = Db::schemaless();
    assert!(db.schema().expect("reads").is_none());

    let schema = StoreSchema::new(
        7,
        [("c", collection(vec![("id", AttributeDescriptor::id())]))],
    );
    db.override_schema(&schema).expect("overrides");
    assert_eq!(db.schema().expect("reads"), Some(schema.clone()));

    let smaller = StoreSchema::new(
        8,
        [("d", collection(vec![("id", AttributeDescriptor::id())]))],
    );
    db.override_schema(&smaller).expect("overrides again");
    let stored = db.schema().expect("reads").expect("present");
    assert!(stored.collection("c").is_none());
    assert!(stored.collection("d").is_some());
}

/// A partially-written or corrupt `_schema` tree reads as "no schema".
#[test]
fn corrupt_schema_tree_reads_as_schemaless() {
    use trellis_db::core::{EntityId, Value as CoreValue};
    use trellis_db::Triple;

    let db = Db::schemaless();
    let schema = StoreSchema::new(
        1,
        [("c", collection(vec![("id", AttributeDescriptor::id())]))],
    );
    db.override_schema(&schema).expect("overrides");
    assert!(db.schema().expect("reads").is_some());

    db.transact(|tx| {
        let entity = EntityId::new("_schema", "schema").expect("valid");
        let stamp = tx.stamp();
        tx.insert_triple(&Triple::new(
            entity,
            AttrPath::from_slice(&["_schema", "collections", "broken"]),
            CoreValue::String("{not json".into()),
            stamp,
        ))
    })
    .expect("writes garbage");

    assert!(db.schema().expect("tolerates").is_none());

    // schemaless fallback still accepts writes
    db.insert("anything", json!({ "x": 1.0 }), Some("a1")).expect("inserts");
    assert_eq!(
        db.fetch(&Query::collection("anything")).expect("fetches").len(),
        1
    );
}
