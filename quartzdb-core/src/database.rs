// src/database.rs
// A database: a named set of collections behind one write gate. Stepping
// down clears the gate, and every write arriving afterwards fails with
// NotPrimary until a step-up restores it.

use crate::collection::{validate_namespace, Collection, CollectionOptions};
use crate::error::{QuartzError, Result};
use crate::log_info;
use crate::op_observer::OpObserver;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub struct Database {
    name: String,
    collections: RwLock<HashMap<String, Arc<Collection>>>,
    observer: Arc<dyn OpObserver>,
    primary: Arc<AtomicBool>,
}

impl Database {
    pub fn new(name: &str, observer: Arc<dyn OpObserver>) -> Result<Self> {
        if name.is_empty() || name.contains('.') || name.contains('\0') || name.contains('$') {
            return Err(QuartzError::InvalidNamespace(name.to_string()));
        }
        Ok(Database {
            name: name.to_string(),
            collections: RwLock::new(HashMap::new()),
            observer,
            primary: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn observer(&self) -> Arc<dyn OpObserver> {
        Arc::clone(&self.observer)
    }

    // ---- primary gate ----

    pub fn is_primary(&self) -> bool {
        self.primary.load(Ordering::Acquire)
    }

    /// Step up or down. The gate is shared with every collection, so a
    /// step-down takes effect on in-flight write paths at their next check.
    pub fn set_primary(&self, primary: bool) {
        self.primary.store(primary, Ordering::Release);
        log_info!(
            "database '{}' stepped {}",
            self.name,
            if primary { "up" } else { "down" }
        );
    }

    fn check_primary(&self) -> Result<()> {
        if !self.is_primary() {
            return Err(QuartzError::NotPrimary(self.name.clone()));
        }
        Ok(())
    }

    // ---- collection management ----

    fn full_ns(&self, coll_name: &str) -> String {
        format!("{}.{}", self.name, coll_name)
    }

    pub fn create_collection(
        &self,
        coll_name: &str,
        options: CollectionOptions,
    ) -> Result<Arc<Collection>> {
        self.check_primary()?;
        let ns = self.full_ns(coll_name);
        validate_namespace(&ns)?;
        let mut collections = self.collections.write();
        if collections.contains_key(coll_name) {
            return Err(QuartzError::CollectionExists(ns));
        }
        let collection = Arc::new(Collection::new(
            &ns,
            options,
            Arc::clone(&self.observer),
            Arc::clone(&self.primary),
        )?);
        collections.insert(coll_name.to_string(), Arc::clone(&collection));
        self.observer.on_create_collection(&ns);
        Ok(collection)
    }

    pub fn get_collection(&self, coll_name: &str) -> Option<Arc<Collection>> {
        self.collections.read().get(coll_name).cloned()
    }

    /// Fetch or implicitly create, the way a first insert does.
    pub fn get_or_create_collection(&self, coll_name: &str) -> Result<Arc<Collection>> {
        if let Some(collection) = self.get_collection(coll_name) {
            return Ok(collection);
        }
        self.create_collection(coll_name, CollectionOptions::default())
    }

    /// Drop one collection: running queries are killed with a terminal
    /// status and tailable waiters wake for the last time.
    pub fn drop_collection(&self, coll_name: &str) -> Result<()> {
        self.check_primary()?;
        let collection = self
            .collections
            .write()
            .remove(coll_name)
            .ok_or_else(|| QuartzError::CollectionNotFound(self.full_ns(coll_name)))?;
        collection.on_drop();
        self.observer.on_drop_collection(collection.ns());
        Ok(())
    }

    pub fn drop_all_collections(&self) -> Result<()> {
        self.check_primary()?;
        let drained: Vec<_> = self.collections.write().drain().collect();
        for (_, collection) in drained {
            collection.on_drop();
            self.observer.on_drop_collection(collection.ns());
        }
        Ok(())
    }

    pub fn collection_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.collections.read().keys().cloned().collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op_observer::NoopObserver;
    use serde_json::json;

    fn db() -> Database {
        Database::new("test", Arc::new(NoopObserver)).unwrap()
    }

    #[test]
    fn test_database_name_validation() {
        assert!(Database::new("ok", Arc::new(NoopObserver)).is_ok());
        assert!(Database::new("", Arc::new(NoopObserver)).is_err());
        assert!(Database::new("a.b", Arc::new(NoopObserver)).is_err());
    }

    #[test]
    fn test_create_get_drop() {
        let db = db();
        let c = db.create_collection("users", CollectionOptions::default()).unwrap();
        assert_eq!(c.ns(), "test.users");
        assert!(db.get_collection("users").is_some());
        assert!(matches!(
            db.create_collection("users", CollectionOptions::default()),
            Err(QuartzError::CollectionExists(_))
        ));

        db.drop_collection("users").unwrap();
        assert!(db.get_collection("users").is_none());
        assert!(matches!(
            db.drop_collection("users"),
            Err(QuartzError::CollectionNotFound(_))
        ));
    }

    #[test]
    fn test_drop_kills_queries_and_notifier() {
        let db = db();
        let c = db
            .create_collection(
                "log",
                CollectionOptions {
                    capped: true,
                    no_id_index: false,
                },
            )
            .unwrap();
        let (_, handle) = c.cursor_manager().register();
        let notifier = c.notifier();

        db.drop_collection("log").unwrap();
        assert!(handle.is_killed());
        assert!(notifier.is_dead());
    }

    #[test]
    fn test_step_down_blocks_writes_everywhere() {
        let db = db();
        let c = db.create_collection("a", CollectionOptions::default()).unwrap();
        c.insert_document(&json!({"_id": 1})).unwrap();

        db.set_primary(false);
        assert!(matches!(
            c.insert_document(&json!({"_id": 2})),
            Err(QuartzError::NotPrimary(_))
        ));
        assert!(matches!(
            db.create_collection("b", CollectionOptions::default()),
            Err(QuartzError::NotPrimary(_))
        ));
        assert!(db.drop_collection("a").is_err());

        db.set_primary(true);
        c.insert_document(&json!({"_id": 2})).unwrap();
    }

    #[test]
    fn test_collection_names_sorted() {
        let db = db();
        db.create_collection("zeta", CollectionOptions::default()).unwrap();
        db.create_collection("alpha", CollectionOptions::default()).unwrap();
        assert_eq!(db.collection_names(), vec!["alpha", "zeta"]);
    }
}
