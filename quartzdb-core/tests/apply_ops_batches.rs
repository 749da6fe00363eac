// tests/apply_ops_batches.rs
// Batch application across collections: the atomic all-CRUD path with
// rollback, and the sequential fallback for batches containing commands.

use quartzdb_core::apply_ops::{apply_ops, delete_op, insert_op, update_op};
use quartzdb_core::collection::CollectionOptions;
use quartzdb_core::database::Database;
use quartzdb_core::op_observer::test_support::RecordingObserver;
use quartzdb_core::op_observer::NoopObserver;
use serde_json::json;
use std::sync::Arc;

#[test]
fn atomic_batch_spans_collections() {
    let db = Database::new("app", Arc::new(NoopObserver)).unwrap();
    db.create_collection("users", CollectionOptions::default()).unwrap();
    db.create_collection("audit", CollectionOptions::default()).unwrap();

    let result = apply_ops(
        &db,
        &json!([
            insert_op("app.users", json!({"_id": 1, "name": "ada"})),
            insert_op("app.audit", json!({"_id": 1, "what": "user created"})),
            update_op("app.users", json!(1), json!({"$set": {"active": true}})),
        ]),
    )
    .unwrap();
    assert_eq!(result.applied, 3);
    assert_eq!(result.results, vec![true, true, true]);

    let users = db.get_collection("users").unwrap();
    let (_, doc) = users.find_record_by_id(&json!(1)).unwrap();
    assert_eq!(doc["active"], json!(true));
}

#[test]
fn atomic_failure_rolls_back_across_collections() {
    let db = Database::new("app", Arc::new(NoopObserver)).unwrap();
    db.create_collection("a", CollectionOptions::default()).unwrap();
    db.create_collection("b", CollectionOptions::default()).unwrap();
    let a = db.get_collection("a").unwrap();
    let b = db.get_collection("b").unwrap();
    b.insert_document(&json!({"_id": 1, "keep": true})).unwrap();

    let err = apply_ops(
        &db,
        &json!([
            insert_op("app.a", json!({"_id": 1})),
            delete_op("app.b", json!(1)),
            // Missing target: the batch fails here.
            update_op("app.b", json!(99), json!({"$set": {"x": 1}})),
        ]),
    );
    assert!(err.is_err());

    // Both earlier effects undone.
    assert_eq!(a.num_records(), 0);
    let (_, doc) = b.find_record_by_id(&json!(1)).unwrap();
    assert_eq!(doc["keep"], json!(true));
}

#[test]
fn mixed_command_and_crud_falls_back_to_sequential() {
    let observer = Arc::new(RecordingObserver::default());
    let db = Database::new("app", Arc::clone(&observer) as _).unwrap();
    db.create_collection("c", CollectionOptions::default()).unwrap();
    let c = db.get_collection("c").unwrap();
    c.insert_document(&json!({"_id": 1, "n": 0})).unwrap();
    observer.events.lock().clear();

    let result = apply_ops(
        &db,
        &json!([
            update_op("app.c", json!(1), json!({"$inc": {"n": 1}})),
            {"op": "c", "ns": "app.$cmd", "o": {"create": "fresh"}},
        ]),
    )
    .unwrap();
    assert_eq!(result.applied, 2);
    assert_eq!(result.results, vec![true, true]);
    assert!(db.get_collection("fresh").is_some());

    // Sequential path reports each operation individually, never as one
    // collective applyOps record.
    let events = observer.events.lock();
    assert!(events.iter().any(|e| e.starts_with("update app.c")));
    assert!(events.iter().any(|e| e.starts_with("create app.fresh")));
    assert!(!events.iter().any(|e| e.starts_with("applyOps")));
}

#[test]
fn sequential_fallback_stops_at_the_first_failure() {
    let db = Database::new("app", Arc::new(NoopObserver)).unwrap();
    let result = apply_ops(
        &db,
        &json!([
            {"op": "c", "ns": "app.$cmd", "o": {"create": "c"}},
            delete_op("app.c", json!(404)),
            insert_op("app.c", json!({"_id": 1})),
        ]),
    )
    .unwrap();
    assert_eq!(result.applied, 1);
    assert_eq!(result.results, vec![true, false]);
    // The insert after the failure never ran.
    assert_eq!(db.get_collection("c").unwrap().num_records(), 0);
}

#[test]
fn atomic_batch_emits_one_observer_record() {
    let observer = Arc::new(RecordingObserver::default());
    let db = Database::new("app", Arc::clone(&observer) as _).unwrap();
    db.create_collection("c", CollectionOptions::default()).unwrap();
    observer.events.lock().clear();

    apply_ops(
        &db,
        &json!([
            insert_op("app.c", json!({"_id": 1})),
            insert_op("app.c", json!({"_id": 2})),
            update_op("app.c", json!(1), json!({"$set": {"x": 1}})),
        ]),
    )
    .unwrap();

    let events = observer.events.lock();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0], "applyOps app");
}
