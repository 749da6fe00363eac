// src/op_observer.rs
// Hook points the write path fires after each successful state change.
// Replication and diagnostics plug in here; the core never depends on what
// an observer does with the callbacks.

use serde_json::Value;

pub trait OpObserver: Send + Sync {
    fn on_insert(&self, ns: &str, doc: &Value);
    fn on_update(&self, ns: &str, old_doc: &Value, new_doc: &Value);
    fn on_delete(&self, ns: &str, doc: &Value);
    /// One record for an atomic applyOps batch, instead of per-operation
    /// callbacks for its contents.
    fn on_apply_ops(&self, db_name: &str, ops: &Value);
    fn on_create_collection(&self, ns: &str);
    fn on_drop_collection(&self, ns: &str);
}

/// Default observer: does nothing.
pub struct NoopObserver;

impl OpObserver for NoopObserver {
    fn on_insert(&self, _ns: &str, _doc: &Value) {}
    fn on_update(&self, _ns: &str, _old_doc: &Value, _new_doc: &Value) {}
    fn on_delete(&self, _ns: &str, _doc: &Value) {}
    fn on_apply_ops(&self, _db_name: &str, _ops: &Value) {}
    fn on_create_collection(&self, _ns: &str) {}
    fn on_drop_collection(&self, _ns: &str) {}
}

pub mod test_support {
    //! Observer doubles for tests. Kept in the library so integration
    //! tests can use them.
    use super::*;
    use parking_lot::Mutex;

    /// Records every callback for assertions in tests.
    #[derive(Default)]
    pub struct RecordingObserver {
        pub events: Mutex<Vec<String>>,
    }

    impl OpObserver for RecordingObserver {
        fn on_insert(&self, ns: &str, doc: &Value) {
            self.events.lock().push(format!("insert {} {}", ns, doc));
        }
        fn on_update(&self, ns: &str, _old: &Value, new_doc: &Value) {
            self.events.lock().push(format!("update {} {}", ns, new_doc));
        }
        fn on_delete(&self, ns: &str, doc: &Value) {
            self.events.lock().push(format!("delete {} {}", ns, doc));
        }
        fn on_apply_ops(&self, db_name: &str, _ops: &Value) {
            self.events.lock().push(format!("applyOps {}", db_name));
        }
        fn on_create_collection(&self, ns: &str) {
            self.events.lock().push(format!("create {}", ns));
        }
        fn on_drop_collection(&self, ns: &str) {
            self.events.lock().push(format!("drop {}", ns));
        }
    }
}
