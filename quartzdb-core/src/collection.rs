// src/collection.rs
// One collection: a record store, its index catalog, and the machinery that
// keeps queries coherent across writes. The write path maintains every
// index (ready and in-progress) per document, rolling the record back when
// indexing fails so the store and the catalog never disagree.

use crate::cursor_manager::{CursorManager, InvalidationType};
use crate::document::{extract_id, generate_object_id, values_equal};
use crate::error::{QuartzError, Result};
use crate::index_catalog::{IndexCatalog, IndexDescriptor, ID_INDEX_NAME};
use crate::notifier::CappedInsertNotifier;
use crate::op_observer::OpObserver;
use crate::plan_cache::PlanCache;
use crate::record_store::{MemoryRecordStore, RecordId, RecordStore, UpdatedLocation};
use crate::{log_debug, log_error};
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct CollectionOptions {
    pub capped: bool,
    /// Skip the automatic _id index. Used for internal collections.
    pub no_id_index: bool,
}

pub struct Collection {
    ns: String,
    record_store: RwLock<Box<dyn RecordStore>>,
    index_catalog: RwLock<IndexCatalog>,
    plan_cache: PlanCache,
    cursor_manager: CursorManager,
    notifier: Arc<CappedInsertNotifier>,
    observer: Arc<dyn OpObserver>,
    /// Shared with the owning database. Cleared on step-down; writes
    /// arriving while it is clear fail with NotPrimary.
    write_gate: Arc<AtomicBool>,
    /// Set while an atomic batch is applied, which reports itself to the
    /// observer as a single record instead of per-operation callbacks.
    observer_muted: AtomicBool,
}

pub fn validate_namespace(ns: &str) -> Result<()> {
    let (db, coll) = ns
        .split_once('.')
        .ok_or_else(|| QuartzError::InvalidNamespace(ns.to_string()))?;
    if db.is_empty() || coll.is_empty() || ns.contains('\0') || db.contains('$') {
        return Err(QuartzError::InvalidNamespace(ns.to_string()));
    }
    Ok(())
}

impl Collection {
    pub fn new(
        ns: &str,
        options: CollectionOptions,
        observer: Arc<dyn OpObserver>,
        write_gate: Arc<AtomicBool>,
    ) -> Result<Self> {
        validate_namespace(ns)?;
        let store: Box<dyn RecordStore> = if options.capped {
            Box::new(MemoryRecordStore::new_capped())
        } else {
            Box::new(MemoryRecordStore::new())
        };
        let mut catalog = IndexCatalog::new();
        if !options.no_id_index {
            catalog.register_build(IndexDescriptor::id_descriptor())?;
            catalog.commit_build(ID_INDEX_NAME)?;
        }
        Ok(Collection {
            ns: ns.to_string(),
            record_store: RwLock::new(store),
            index_catalog: RwLock::new(catalog),
            plan_cache: PlanCache::new(),
            cursor_manager: CursorManager::new(),
            notifier: Arc::new(CappedInsertNotifier::new()),
            observer,
            write_gate,
            observer_muted: AtomicBool::new(false),
        })
    }

    // ---- accessors ----

    pub fn ns(&self) -> &str {
        &self.ns
    }

    pub fn is_capped(&self) -> bool {
        self.record_store.read().is_capped()
    }

    pub fn num_records(&self) -> u64 {
        self.record_store.read().num_records()
    }

    pub fn record_store(&self) -> &RwLock<Box<dyn RecordStore>> {
        &self.record_store
    }

    pub fn index_catalog(&self) -> &RwLock<IndexCatalog> {
        &self.index_catalog
    }

    pub fn plan_cache(&self) -> &PlanCache {
        &self.plan_cache
    }

    pub fn cursor_manager(&self) -> &CursorManager {
        &self.cursor_manager
    }

    pub fn notifier(&self) -> Arc<CappedInsertNotifier> {
        Arc::clone(&self.notifier)
    }

    pub fn observer(&self) -> Arc<dyn OpObserver> {
        Arc::clone(&self.observer)
    }

    pub(crate) fn set_observer_muted(&self, muted: bool) {
        self.observer_muted.store(muted, Ordering::Release);
    }

    fn notify<F: FnOnce(&dyn OpObserver)>(&self, f: F) {
        if !self.observer_muted.load(Ordering::Acquire) {
            f(self.observer.as_ref());
        }
    }

    /// Point lookup through the _id index.
    pub fn find_record_by_id(&self, id_value: &Value) -> Option<(RecordId, Value)> {
        let key = crate::index_key::IndexKey::from(id_value);
        let record_id = {
            let catalog = self.index_catalog.read();
            let entry = catalog.id_index()?;
            entry.access().lookup(&key).first().copied()?
        };
        let doc = self.record_store.read().data_for(record_id)?;
        Some((record_id, doc))
    }

    fn check_write_gate(&self) -> Result<()> {
        if !self.write_gate.load(Ordering::Acquire) {
            return Err(QuartzError::NotPrimary(self.ns.clone()));
        }
        Ok(())
    }

    // ---- writes ----

    /// Insert one document. The record lands first; if any index then
    /// rejects its keys, the record insert is undone and the error
    /// propagates with the collection unchanged.
    pub fn insert_document(&self, doc: &Value) -> Result<RecordId> {
        self.check_write_gate()?;
        if !doc.is_object() {
            return Err(QuartzError::InvalidIdField(
                "documents must be objects".into(),
            ));
        }
        {
            let catalog = self.index_catalog.read();
            if catalog.id_index().is_some() && extract_id(doc).is_none() {
                return Err(QuartzError::InvalidIdField(
                    "document is missing an _id field".into(),
                ));
            }
        }

        let record_id = self.record_store.write().insert_record(doc)?;

        if let Err(e) = self.index_catalog.write().index_record(doc, record_id) {
            if self.is_capped() {
                // A capped store may already have pushed out old records to
                // make room; the insert cannot be cleanly undone.
                log_error!(
                    "index maintenance failed on capped collection {}: {}",
                    self.ns,
                    e
                );
                return Err(QuartzError::Internal(format!(
                    "failed to index capped collection insert: {}",
                    e
                )));
            }
            self.record_store.write().delete_record(record_id)?;
            return Err(e);
        }

        if self.is_capped() {
            self.notifier.notify_all();
        }
        self.notify(|obs| obs.on_insert(&self.ns, doc));
        self.plan_cache.notify_of_write_op();
        Ok(record_id)
    }

    /// Insert, filling in a generated `_id` when the document has none.
    /// Returns the record id and the document as stored.
    pub fn insert_document_auto_id(&self, doc: &Value) -> Result<(RecordId, Value)> {
        let stored = match doc {
            Value::Object(map) if !map.contains_key("_id") => {
                let mut map = map.clone();
                let mut with_id = serde_json::Map::with_capacity(map.len() + 1);
                with_id.insert("_id".to_string(), generate_object_id());
                with_id.append(&mut map);
                Value::Object(with_id)
            }
            other => other.clone(),
        };
        let record_id = self.insert_document(&stored)?;
        Ok((record_id, stored))
    }

    /// Replace the document at `record_id` with `new_doc`.
    ///
    /// Index tickets are validated before any state changes, so duplicate
    /// key errors leave the collection untouched. A record that no longer
    /// fits its slot moves; the old location is invalidated as a deletion
    /// and index entries are rebuilt at the new location.
    pub fn update_document(&self, record_id: RecordId, new_doc: &Value) -> Result<UpdatedLocation> {
        self.check_write_gate()?;
        let old_doc = self
            .record_store
            .read()
            .data_for(record_id)
            .ok_or_else(|| QuartzError::DocumentNotFound(format!("{}", record_id)))?;

        match (extract_id(&old_doc), extract_id(new_doc)) {
            (Some(old_id), Some(new_id)) if !values_equal(&old_id, &new_id) => {
                return Err(QuartzError::InvalidIdField(
                    "the _id field is immutable".into(),
                ));
            }
            (Some(_), None) => {
                return Err(QuartzError::InvalidIdField(
                    "update cannot remove the _id field".into(),
                ));
            }
            _ => {}
        }

        let tickets = self
            .index_catalog
            .read()
            .validate_update(&old_doc, new_doc, record_id)?;

        let location = self.record_store.write().update_record(record_id, new_doc)?;

        match location {
            UpdatedLocation::InPlace(rid) => {
                self.cursor_manager
                    .invalidate_document(rid, InvalidationType::Mutation);
                self.index_catalog.write().commit_update(&tickets)?;
            }
            UpdatedLocation::Moved(new_rid) => {
                // The old location is dead; executors holding it must
                // detach as if the record were deleted.
                self.cursor_manager
                    .invalidate_document(record_id, InvalidationType::Deletion);
                let mut catalog = self.index_catalog.write();
                catalog.unindex_record(&old_doc, record_id);
                if let Err(e) = catalog.index_record(new_doc, new_rid) {
                    // Validation passed, so this is unexpected. Put the old
                    // document back before surfacing the error.
                    drop(catalog);
                    self.restore_after_failed_move(new_rid, &old_doc)?;
                    return Err(e);
                }
            }
        }

        self.notify(|obs| obs.on_update(&self.ns, &old_doc, new_doc));
        self.plan_cache.notify_of_write_op();
        Ok(location)
    }

    fn restore_after_failed_move(&self, new_rid: RecordId, old_doc: &Value) -> Result<()> {
        let mut store = self.record_store.write();
        store.delete_record(new_rid)?;
        let restored = store.insert_record(old_doc)?;
        drop(store);
        self.index_catalog
            .write()
            .index_record(old_doc, restored)
            .map_err(|e| {
                QuartzError::Internal(format!("could not restore indexes after failed move: {}", e))
            })
    }

    /// Delete the document at `record_id`. Refused on capped collections,
    /// whose records only leave by aging out, unless the caller is internal
    /// machinery that knows better.
    pub fn delete_document(&self, record_id: RecordId, allow_capped: bool) -> Result<()> {
        self.check_write_gate()?;
        if self.is_capped() && !allow_capped {
            return Err(QuartzError::InvalidQuery(format!(
                "cannot remove from capped collection {}",
                self.ns
            )));
        }
        let doc = self
            .record_store
            .read()
            .data_for(record_id)
            .ok_or_else(|| QuartzError::DocumentNotFound(format!("{}", record_id)))?;

        self.cursor_manager
            .invalidate_document(record_id, InvalidationType::Deletion);
        self.index_catalog.write().unindex_record(&doc, record_id);
        self.record_store.write().delete_record(record_id)?;

        self.notify(|obs| obs.on_delete(&self.ns, &doc));
        self.plan_cache.notify_of_write_op();
        Ok(())
    }

    // ---- DDL ----

    /// Build an index over the existing documents and commit it. The entry
    /// is registered before the scan, so writes that race the build keep it
    /// current; the builder's idempotent inserts absorb the overlap.
    pub fn create_index(&self, descriptor: IndexDescriptor) -> Result<()> {
        self.check_write_gate()?;
        let name = descriptor.name.clone();
        self.index_catalog.write().register_build(descriptor)?;

        let record_ids = self
            .record_store
            .read()
            .record_ids(crate::record_store::ScanDirection::Forward);
        for rid in record_ids {
            let doc = match self.record_store.read().data_for(rid) {
                Some(doc) => doc,
                // Deleted while we were scanning.
                None => continue,
            };
            let populated = self.index_catalog.write().populate_build(&name, &doc, rid);
            if let Err(e) = populated {
                self.index_catalog.write().abort_build(&name)?;
                return Err(e);
            }
        }

        self.index_catalog.write().commit_build(&name)?;
        log_debug!("created index '{}' on {}", name, self.ns);
        Ok(())
    }

    /// Drop one index. Running queries may be scanning it, so every
    /// registered executor is killed first.
    pub fn drop_index(&self, name: &str) -> Result<()> {
        self.check_write_gate()?;
        self.cursor_manager.kill_all(QuartzError::QueryKilled(format!(
            "index '{}' dropped",
            name
        )));
        self.index_catalog.write().drop_index(name)?;
        self.plan_cache.clear();
        Ok(())
    }

    /// Tear the collection down: kill queries, wake tailable waiters for
    /// the last time. Called by the database on drop.
    pub(crate) fn on_drop(&self) {
        self.cursor_manager
            .kill_all(QuartzError::CollectionNotFound(self.ns.clone()));
        self.notifier.kill();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index_key::KeyPattern;
    use crate::op_observer::NoopObserver;
    use serde_json::json;

    fn coll(ns: &str) -> Collection {
        Collection::new(
            ns,
            CollectionOptions::default(),
            Arc::new(NoopObserver),
            Arc::new(AtomicBool::new(true)),
        )
        .unwrap()
    }

    fn capped(ns: &str) -> Collection {
        Collection::new(
            ns,
            CollectionOptions {
                capped: true,
                no_id_index: false,
            },
            Arc::new(NoopObserver),
            Arc::new(AtomicBool::new(true)),
        )
        .unwrap()
    }

    #[test]
    fn test_namespace_validation() {
        assert!(validate_namespace("test.users").is_ok());
        assert!(validate_namespace("nodot").is_err());
        assert!(validate_namespace(".coll").is_err());
        assert!(validate_namespace("db.").is_err());
        assert!(validate_namespace("d$b.coll").is_err());
    }

    #[test]
    fn test_insert_requires_id_when_id_index_exists() {
        let c = coll("test.a");
        let err = c.insert_document(&json!({"x": 1})).unwrap_err();
        assert!(matches!(err, QuartzError::InvalidIdField(_)));
        c.insert_document(&json!({"_id": 1, "x": 1})).unwrap();
        assert_eq!(c.num_records(), 1);
    }

    #[test]
    fn test_auto_id_fills_missing_id() {
        let c = coll("test.a");
        let (_, stored) = c.insert_document_auto_id(&json!({"x": 1})).unwrap();
        assert!(stored.get("_id").is_some());
        // Existing _id is preserved.
        let (_, stored) = c.insert_document_auto_id(&json!({"_id": 9})).unwrap();
        assert_eq!(stored["_id"], json!(9));
    }

    #[test]
    fn test_duplicate_id_rolls_back_record_insert() {
        let c = coll("test.a");
        c.insert_document(&json!({"_id": 1})).unwrap();
        let err = c.insert_document(&json!({"_id": 1})).unwrap_err();
        assert!(matches!(err, QuartzError::DuplicateKey(_)));
        assert_eq!(c.num_records(), 1);
        assert_eq!(
            c.index_catalog().read().id_index().unwrap().access().num_entries(),
            1
        );
    }

    #[test]
    fn test_update_rejects_id_change() {
        let c = coll("test.a");
        let rid = c.insert_document(&json!({"_id": 1, "x": 1})).unwrap();
        let err = c.update_document(rid, &json!({"_id": 2, "x": 1})).unwrap_err();
        assert!(matches!(err, QuartzError::InvalidIdField(_)));
        let err = c.update_document(rid, &json!({"x": 1})).unwrap_err();
        assert!(matches!(err, QuartzError::InvalidIdField(_)));
        // Same _id is fine.
        c.update_document(rid, &json!({"_id": 1, "x": 2})).unwrap();
    }

    #[test]
    fn test_update_duplicate_key_leaves_state_untouched() {
        let c = coll("test.a");
        c.create_index(IndexDescriptor::new("x_1", KeyPattern::single("x")).unique(true))
            .unwrap();
        c.insert_document(&json!({"_id": 1, "x": 1})).unwrap();
        let rid = c.insert_document(&json!({"_id": 2, "x": 2})).unwrap();

        let err = c.update_document(rid, &json!({"_id": 2, "x": 1})).unwrap_err();
        assert!(matches!(err, QuartzError::DuplicateKey(_)));
        // Document unchanged.
        let doc = c.record_store().read().data_for(rid).unwrap();
        assert_eq!(doc["x"], json!(2));
    }

    #[test]
    fn test_delete_refused_on_capped() {
        let c = capped("test.log");
        let rid = c.insert_document(&json!({"_id": 1})).unwrap();
        assert!(c.delete_document(rid, false).is_err());
        c.delete_document(rid, true).unwrap();
        assert_eq!(c.num_records(), 0);
    }

    #[test]
    fn test_capped_insert_bumps_notifier() {
        let c = capped("test.log");
        let notifier = c.notifier();
        assert_eq!(notifier.version(), 0);
        c.insert_document(&json!({"_id": 1})).unwrap();
        assert_eq!(notifier.version(), 1);
    }

    #[test]
    fn test_create_index_over_existing_documents() {
        let c = coll("test.a");
        c.insert_document(&json!({"_id": 1, "x": 5})).unwrap();
        c.insert_document(&json!({"_id": 2, "x": 7})).unwrap();
        c.create_index(IndexDescriptor::new("x_1", KeyPattern::single("x")))
            .unwrap();
        let catalog = c.index_catalog().read();
        let entry = catalog.find_index_by_name("x_1", false).unwrap();
        assert_eq!(entry.access().num_entries(), 2);
    }

    #[test]
    fn test_create_unique_index_fails_on_existing_duplicates() {
        let c = coll("test.a");
        c.insert_document(&json!({"_id": 1, "x": 5})).unwrap();
        c.insert_document(&json!({"_id": 2, "x": 5})).unwrap();
        let err = c
            .create_index(IndexDescriptor::new("x_1", KeyPattern::single("x")).unique(true))
            .unwrap_err();
        assert!(matches!(err, QuartzError::DuplicateKey(_)));
        // The failed build leaves no trace.
        assert!(c.index_catalog().read().find_index_by_name("x_1", true).is_none());
    }

    #[test]
    fn test_drop_index_kills_registered_executors() {
        let c = coll("test.a");
        c.create_index(IndexDescriptor::new("x_1", KeyPattern::single("x")))
            .unwrap();
        let (_, handle) = c.cursor_manager().register();
        c.drop_index("x_1").unwrap();
        assert!(handle.is_killed());
    }

    #[test]
    fn test_write_gate_blocks_writes() {
        let gate = Arc::new(AtomicBool::new(true));
        let c = Collection::new(
            "test.a",
            CollectionOptions::default(),
            Arc::new(NoopObserver),
            Arc::clone(&gate),
        )
        .unwrap();
        c.insert_document(&json!({"_id": 1})).unwrap();
        gate.store(false, Ordering::Release);
        let err = c.insert_document(&json!({"_id": 2})).unwrap_err();
        assert!(matches!(err, QuartzError::NotPrimary(_)));
    }
}
