// src/cursor_manager.rs
// Registry of live executors on one collection. Writers and DDL reach
// in-flight queries through it: document mutations queue invalidation
// notices, collection drops set a kill status. Executors own their handle;
// the registry keeps only weak references, so a dropped executor needs no
// explicit cleanup beyond deregistering.

use crate::error::QuartzError;
use crate::record_store::RecordId;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// What happened to a record an executor may be holding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidationType {
    /// Record is gone or moved; in-flight members must detach from it.
    Deletion,
    /// Record still exists but its bytes changed.
    Mutation,
}

/// Per-executor slot for kill status and queued invalidations. The executor
/// drains the queue at the top of each getNext call; the first kill reason
/// wins and later ones are ignored.
pub struct KillHandle {
    kill_status: Mutex<Option<QuartzError>>,
    invalidations: Mutex<Vec<(RecordId, InvalidationType)>>,
}

impl KillHandle {
    fn new() -> Self {
        KillHandle {
            kill_status: Mutex::new(None),
            invalidations: Mutex::new(Vec::new()),
        }
    }

    pub fn kill(&self, reason: QuartzError) {
        let mut status = self.kill_status.lock();
        if status.is_none() {
            *status = Some(reason);
        }
    }

    pub fn kill_status(&self) -> Option<QuartzError> {
        self.kill_status.lock().clone()
    }

    pub fn is_killed(&self) -> bool {
        self.kill_status.lock().is_some()
    }

    pub fn push_invalidation(&self, record_id: RecordId, kind: InvalidationType) {
        self.invalidations.lock().push((record_id, kind));
    }

    pub fn drain_invalidations(&self) -> Vec<(RecordId, InvalidationType)> {
        std::mem::take(&mut *self.invalidations.lock())
    }
}

pub struct CursorManager {
    handles: DashMap<u64, Weak<KillHandle>>,
    next_id: AtomicU64,
}

impl CursorManager {
    pub fn new() -> Self {
        CursorManager {
            handles: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a new executor. The returned handle is owned by the
    /// executor; the id deregisters it.
    pub fn register(&self) -> (u64, Arc<KillHandle>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = Arc::new(KillHandle::new());
        self.handles.insert(id, Arc::downgrade(&handle));
        (id, handle)
    }

    pub fn deregister(&self, id: u64) {
        self.handles.remove(&id);
    }

    /// Kill every registered executor with a clone of `reason`. Dead weak
    /// references are swept out as a side effect.
    pub fn kill_all(&self, reason: QuartzError) {
        self.handles.retain(|_, weak| match weak.upgrade() {
            Some(handle) => {
                handle.kill(reason.clone());
                true
            }
            None => false,
        });
    }

    /// Broadcast a document-level invalidation to every live executor.
    pub fn invalidate_document(&self, record_id: RecordId, kind: InvalidationType) {
        self.handles.retain(|_, weak| match weak.upgrade() {
            Some(handle) => {
                handle.push_invalidation(record_id, kind);
                true
            }
            None => false,
        });
    }

    pub fn num_registered(&self) -> usize {
        self.handles.len()
    }
}

impl Default for CursorManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_deregister() {
        let mgr = CursorManager::new();
        let (id, _handle) = mgr.register();
        assert_eq!(mgr.num_registered(), 1);
        mgr.deregister(id);
        assert_eq!(mgr.num_registered(), 0);
    }

    #[test]
    fn test_first_kill_reason_wins() {
        let mgr = CursorManager::new();
        let (_, handle) = mgr.register();
        handle.kill(QuartzError::CollectionNotFound("test.a".into()));
        handle.kill(QuartzError::QueryKilled("later".into()));
        assert_eq!(
            handle.kill_status(),
            Some(QuartzError::CollectionNotFound("test.a".into()))
        );
    }

    #[test]
    fn test_kill_all_reaches_every_handle() {
        let mgr = CursorManager::new();
        let (_, h1) = mgr.register();
        let (_, h2) = mgr.register();
        mgr.kill_all(QuartzError::QueryKilled("collection dropped".into()));
        assert!(h1.is_killed());
        assert!(h2.is_killed());
    }

    #[test]
    fn test_dropped_handles_are_swept() {
        let mgr = CursorManager::new();
        let (_, h1) = mgr.register();
        {
            let (_, _h2) = mgr.register();
        }
        mgr.kill_all(QuartzError::QueryKilled("x".into()));
        assert_eq!(mgr.num_registered(), 1);
        assert!(h1.is_killed());
    }

    #[test]
    fn test_invalidations_queue_and_drain() {
        let mgr = CursorManager::new();
        let (_, handle) = mgr.register();
        mgr.invalidate_document(RecordId(3), InvalidationType::Deletion);
        mgr.invalidate_document(RecordId(4), InvalidationType::Mutation);
        let drained = handle.drain_invalidations();
        assert_eq!(
            drained,
            vec![
                (RecordId(3), InvalidationType::Deletion),
                (RecordId(4), InvalidationType::Mutation)
            ]
        );
        assert!(handle.drain_invalidations().is_empty());
    }
}
