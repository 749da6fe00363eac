// tests/consistency.rs
// Property test: any interleaving of inserts, updates and deletes leaves
// every ready index holding exactly the keys generated by the live
// document set. Orphaned or missing index entries fail the property.

use proptest::prelude::*;
use quartzdb_core::collection::{Collection, CollectionOptions};
use quartzdb_core::index_catalog::IndexDescriptor;
use quartzdb_core::index_key::{generate_keys, KeyPattern};
use quartzdb_core::op_observer::NoopObserver;
use quartzdb_core::record_store::ScanDirection;
use serde_json::json;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

#[derive(Debug, Clone)]
enum Op {
    Insert { id: i64, a: i64, tags: Vec<String> },
    Update { id: i64, a: i64, tags: Vec<String> },
    Delete { id: i64 },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    let tags = prop::collection::vec("[a-d]", 0..3);
    prop_oneof![
        (0..20i64, 0..5i64, tags.clone())
            .prop_map(|(id, a, tags)| Op::Insert { id, a, tags }),
        (0..20i64, 0..5i64, tags).prop_map(|(id, a, tags)| Op::Update { id, a, tags }),
        (0..20i64).prop_map(|id| Op::Delete { id }),
    ]
}

fn check_index_consistency(c: &Collection) {
    let live_docs: Vec<serde_json::Value> = {
        let store = c.record_store().read();
        store
            .record_ids(ScanDirection::Forward)
            .into_iter()
            .filter_map(|rid| store.data_for(rid))
            .collect()
    };

    let catalog = c.index_catalog().read();
    for entry in catalog.ready_entries() {
        let mut expected: u64 = 0;
        for doc in &live_docs {
            let keys = generate_keys(
                doc,
                &entry.descriptor.key_pattern,
                entry.descriptor.sparse,
            )
            .unwrap();
            expected += keys.len() as u64;
        }
        assert_eq!(
            entry.access().num_entries(),
            expected,
            "index {} out of sync with {} live documents",
            entry.descriptor.name,
            live_docs.len()
        );
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn indexes_track_the_live_document_set(ops in prop::collection::vec(op_strategy(), 1..40)) {
        let c = Collection::new(
            "test.prop",
            CollectionOptions::default(),
            Arc::new(NoopObserver),
            Arc::new(AtomicBool::new(true)),
        )
        .unwrap();
        c.create_index(IndexDescriptor::new("a_1", KeyPattern::single("a"))).unwrap();
        c.create_index(IndexDescriptor::new("tags_1", KeyPattern::single("tags"))).unwrap();

        for op in ops {
            match op {
                Op::Insert { id, a, tags } => {
                    // Fails on duplicate _id; collection state must be
                    // untouched either way.
                    let _ = c.insert_document(&json!({"_id": id, "a": a, "tags": tags}));
                }
                Op::Update { id, a, tags } => {
                    if let Some((rid, _)) = c.find_record_by_id(&json!(id)) {
                        c.update_document(rid, &json!({"_id": id, "a": a, "tags": tags}))
                            .unwrap();
                    }
                }
                Op::Delete { id } => {
                    if let Some((rid, _)) = c.find_record_by_id(&json!(id)) {
                        c.delete_document(rid, false).unwrap();
                    }
                }
            }
            check_index_consistency(&c);
        }
    }
}
