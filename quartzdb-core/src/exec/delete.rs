// src/exec/delete.rs
// Deletes the documents its child produces. Each victim is re-validated
// against the current snapshot before the delete, since the child may have
// staged it before a yield. Transient write conflicts hand the member back
// to the executor through NEED_YIELD and retry after restore.

use crate::collection::Collection;
use crate::cursor_manager::InvalidationType;
use crate::error::Result;
use crate::exec::{CommonStats, PlanStage, PlanStageStats, StageType, WorkStatus};
use crate::query::matches;
use crate::record_store::RecordId;
use crate::working_set::{MemberState, WorkingSet, WorkingSetId};
use serde_json::Value;
use std::sync::Arc;

pub struct DeleteStage {
    collection: Arc<Collection>,
    child: Box<dyn PlanStage>,
    filter: Option<Value>,
    is_multi: bool,
    /// Member waiting to be retried after a write-conflict yield.
    retry_member: Option<WorkingSetId>,
    docs_deleted: u64,
    done: bool,
    stats: CommonStats,
}

impl DeleteStage {
    pub fn new(
        collection: Arc<Collection>,
        child: Box<dyn PlanStage>,
        filter: Option<Value>,
        is_multi: bool,
    ) -> Self {
        DeleteStage {
            collection,
            child,
            filter,
            is_multi,
            retry_member: None,
            docs_deleted: 0,
            done: false,
            stats: CommonStats::default(),
        }
    }

    pub fn docs_deleted(&self) -> u64 {
        self.docs_deleted
    }

    fn attempt_delete(&mut self, ws: &mut WorkingSet, id: WorkingSetId) -> WorkStatus {
        let record_id = match ws.get(id).record_id {
            Some(rid) => rid,
            None => {
                // Detached by an invalidation; the record is already gone.
                ws.free(id);
                return self.stats.tally(WorkStatus::NeedTime);
            }
        };

        // Re-validate when the world moved since the member was staged.
        let current_snapshot = self.collection.record_store().read().snapshot_id();
        if ws.get(id).snapshot_id != current_snapshot {
            let doc = self.collection.record_store().read().data_for(record_id);
            let doc = match doc {
                Some(doc) => doc,
                None => {
                    ws.free(id);
                    return self.stats.tally(WorkStatus::NeedTime);
                }
            };
            if let Some(filter) = &self.filter {
                match matches(&doc, filter) {
                    Ok(true) => {}
                    Ok(false) => {
                        ws.free(id);
                        return self.stats.tally(WorkStatus::NeedTime);
                    }
                    Err(e) => {
                        ws.free(id);
                        let err_id = ws.make_error(e);
                        return self.stats.tally(WorkStatus::Failure(err_id));
                    }
                }
            }
            ws.get_mut(id).obj = Some(doc);
            ws.get_mut(id).snapshot_id = current_snapshot;
        }

        match self.collection.delete_document(record_id, false) {
            Ok(()) => {
                self.docs_deleted += 1;
                if !self.is_multi {
                    self.done = true;
                }
                // Hand the pre-image up, detached from the dead record.
                let member = ws.get_mut(id);
                member.state = MemberState::OwnedObj;
                member.record_id = None;
                member.key_data.clear();
                self.stats.tally(WorkStatus::Advanced(id))
            }
            Err(e) if e.is_transient() => {
                self.retry_member = Some(id);
                self.stats.tally(WorkStatus::NeedYield(Some(id)))
            }
            Err(e) => {
                ws.free(id);
                let err_id = ws.make_error(e);
                self.stats.tally(WorkStatus::Failure(err_id))
            }
        }
    }
}

impl PlanStage for DeleteStage {
    fn work(&mut self, ws: &mut WorkingSet) -> WorkStatus {
        if self.done {
            return self.stats.tally(WorkStatus::Eof);
        }
        if let Some(id) = self.retry_member.take() {
            return self.attempt_delete(ws, id);
        }
        match self.child.work(ws) {
            WorkStatus::Advanced(id) => self.attempt_delete(ws, id),
            WorkStatus::Eof => {
                self.done = true;
                self.stats.tally(WorkStatus::Eof)
            }
            other => self.stats.tally(other),
        }
    }

    fn save_state(&mut self) {
        self.child.save_state();
    }

    fn restore_state(&mut self) -> Result<()> {
        self.child.restore_state()
    }

    fn invalidate(&mut self, ws: &mut WorkingSet, record_id: RecordId, kind: InvalidationType) {
        if let Some(id) = self.retry_member {
            if ws.get(id).record_id == Some(record_id) && kind == InvalidationType::Deletion {
                // Someone else deleted our victim while we were yielded.
                ws.free(id);
                self.retry_member = None;
            }
        }
        self.child.invalidate(ws, record_id, kind);
    }

    fn is_eof(&self) -> bool {
        self.done
    }

    fn stage_type(&self) -> StageType {
        StageType::Delete
    }

    fn stats(&self) -> PlanStageStats {
        let mut stats = PlanStageStats::new(StageType::Delete, self.stats.clone());
        stats.specific = Some(format!(
            "multi={} docsDeleted={}",
            self.is_multi, self.docs_deleted
        ));
        stats.children.push(self.child.stats());
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::CollectionOptions;
    use crate::exec::collection_scan::CollectionScanStage;
    use crate::op_observer::NoopObserver;
    use crate::record_store::ScanDirection;
    use serde_json::json;
    use std::sync::atomic::AtomicBool;

    fn collection(n: usize) -> Arc<Collection> {
        let c = Collection::new(
            "test.delete",
            CollectionOptions::default(),
            Arc::new(NoopObserver),
            Arc::new(AtomicBool::new(true)),
        )
        .unwrap();
        for i in 0..n {
            c.insert_document(&json!({"_id": i, "x": i % 2})).unwrap();
        }
        Arc::new(c)
    }

    fn delete_stage(c: &Arc<Collection>, filter: Value, multi: bool) -> DeleteStage {
        let scan = CollectionScanStage::new(
            Arc::clone(c),
            ScanDirection::Forward,
            Some(filter.clone()),
        );
        DeleteStage::new(Arc::clone(c), Box::new(scan), Some(filter), multi)
    }

    fn run_to_eof(stage: &mut DeleteStage, ws: &mut WorkingSet) -> Vec<Value> {
        let mut pre_images = Vec::new();
        loop {
            match stage.work(ws) {
                WorkStatus::Advanced(id) => {
                    pre_images.push(ws.get(id).obj.clone().unwrap());
                    ws.free(id);
                }
                WorkStatus::NeedTime => {}
                WorkStatus::Eof => return pre_images,
                other => panic!("unexpected status {:?}", other),
            }
        }
    }

    #[test]
    fn test_single_delete_stops_after_first() {
        let c = collection(4);
        let mut stage = delete_stage(&c, json!({"x": 0}), false);
        let mut ws = WorkingSet::new();
        let pre_images = run_to_eof(&mut stage, &mut ws);
        assert_eq!(pre_images.len(), 1);
        assert_eq!(stage.docs_deleted(), 1);
        assert_eq!(c.num_records(), 3);
    }

    #[test]
    fn test_multi_delete_removes_every_match() {
        let c = collection(6);
        let mut stage = delete_stage(&c, json!({"x": 1}), true);
        let mut ws = WorkingSet::new();
        let pre_images = run_to_eof(&mut stage, &mut ws);
        assert_eq!(pre_images.len(), 3);
        assert_eq!(c.num_records(), 3);
        // Pre-images are the documents as they were before deletion.
        assert!(pre_images.iter().all(|d| d["x"] == json!(1)));
    }

    #[test]
    fn test_write_conflict_yields_then_retries() {
        let c = collection(2);
        let mut stage = delete_stage(&c, json!({}), false);
        let mut ws = WorkingSet::new();

        c.record_store().write().inject_write_conflicts(1);
        let status = loop {
            match stage.work(&mut ws) {
                WorkStatus::NeedTime => {}
                other => break other,
            }
        };
        assert!(matches!(status, WorkStatus::NeedYield(Some(_))));

        stage.save_state();
        stage.restore_state().unwrap();
        // Retry succeeds once the conflict is spent.
        let pre_images = run_to_eof(&mut stage, &mut ws);
        assert_eq!(pre_images.len(), 1);
        assert_eq!(c.num_records(), 1);
    }

    #[test]
    fn test_victim_deleted_during_yield_is_skipped() {
        let c = collection(2);
        let mut stage = delete_stage(&c, json!({}), true);
        let mut ws = WorkingSet::new();

        c.record_store().write().inject_write_conflicts(1);
        let victim = loop {
            match stage.work(&mut ws) {
                WorkStatus::NeedTime => {}
                WorkStatus::NeedYield(Some(id)) => break ws.get(id).record_id.unwrap(),
                other => panic!("unexpected status {:?}", other),
            }
        };

        // A competing writer removes the victim while we are yielded.
        c.delete_document(victim, false).unwrap();
        stage.invalidate(&mut ws, victim, InvalidationType::Deletion);
        stage.restore_state().unwrap();

        let pre_images = run_to_eof(&mut stage, &mut ws);
        // Only the remaining document is deleted by this stage.
        assert_eq!(pre_images.len(), 1);
        assert_eq!(c.num_records(), 0);
    }
}
