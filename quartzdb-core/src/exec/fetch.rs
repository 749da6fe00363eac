// src/exec/fetch.rs
// Turns index entries into documents. Entries whose record vanished between
// the index scan and the fetch are dropped, not errors; a stale index entry
// after a yield is a normal race.

use crate::collection::Collection;
use crate::cursor_manager::InvalidationType;
use crate::error::Result;
use crate::exec::{CommonStats, PlanStage, PlanStageStats, StageType, WorkStatus};
use crate::query::matches;
use crate::record_store::RecordId;
use crate::working_set::{MemberState, WorkingSet};
use serde_json::Value;
use std::sync::Arc;

pub struct FetchStage {
    collection: Arc<Collection>,
    child: Box<dyn PlanStage>,
    filter: Option<Value>,
    stats: CommonStats,
}

impl FetchStage {
    pub fn new(collection: Arc<Collection>, child: Box<dyn PlanStage>, filter: Option<Value>) -> Self {
        FetchStage {
            collection,
            child,
            filter,
            stats: CommonStats::default(),
        }
    }
}

impl PlanStage for FetchStage {
    fn work(&mut self, ws: &mut WorkingSet) -> WorkStatus {
        let child_status = self.child.work(ws);
        let id = match child_status {
            WorkStatus::Advanced(id) => id,
            other => return self.stats.tally(other),
        };

        if !ws.get(id).has_obj() {
            let record_id = match ws.get(id).record_id {
                Some(rid) => rid,
                None => return self.stats.tally(WorkStatus::Advanced(id)),
            };
            let (doc, snapshot) = {
                let store = self.collection.record_store().read();
                (store.data_for(record_id), store.snapshot_id())
            };
            match doc {
                Some(doc) => {
                    let member = ws.get_mut(id);
                    member.state = MemberState::RidAndObj;
                    member.obj = Some(doc);
                    member.snapshot_id = snapshot;
                }
                None => {
                    // Record deleted after the index entry was read.
                    ws.free(id);
                    return self.stats.tally(WorkStatus::NeedTime);
                }
            }
        }

        if let Some(filter) = &self.filter {
            let doc = ws.get(id).obj.as_ref().expect("populated above");
            match matches(doc, filter) {
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
        self.stats.tally(WorkStatus::Advanced(id))
    }

    fn save_state(&mut self) {
        self.child.save_state();
    }

    fn restore_state(&mut self) -> Result<()> {
        self.child.restore_state()
    }

    fn invalidate(&mut self, ws: &mut WorkingSet, record_id: RecordId, kind: InvalidationType) {
        self.child.invalidate(ws, record_id, kind);
    }

    fn is_eof(&self) -> bool {
        self.child.is_eof()
    }

    fn stage_type(&self) -> StageType {
        StageType::Fetch
    }

    fn stats(&self) -> PlanStageStats {
        let mut stats = PlanStageStats::new(StageType::Fetch, self.stats.clone());
        stats.children.push(self.child.stats());
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::CollectionOptions;
    use crate::exec::index_scan::IndexScanStage;
    use crate::index_access::IndexBounds;
    use crate::index_catalog::IndexDescriptor;
    use crate::index_key::KeyPattern;
    use crate::op_observer::NoopObserver;
    use serde_json::json;
    use std::sync::atomic::AtomicBool;

    fn collection() -> Arc<Collection> {
        let c = Collection::new(
            "test.fetch",
            CollectionOptions::default(),
            Arc::new(NoopObserver),
            Arc::new(AtomicBool::new(true)),
        )
        .unwrap();
        c.create_index(IndexDescriptor::new("x_1", KeyPattern::single("x")))
            .unwrap();
        Arc::new(c)
    }

    fn fetch_over_index(c: &Arc<Collection>, filter: Option<Value>) -> FetchStage {
        let scan = IndexScanStage::new(Arc::clone(c), "x_1", IndexBounds::all(), true);
        FetchStage::new(Arc::clone(c), Box::new(scan), filter)
    }

    #[test]
    fn test_fetch_populates_documents_in_key_order() {
        let c = collection();
        c.insert_document(&json!({"_id": 1, "x": 2})).unwrap();
        c.insert_document(&json!({"_id": 2, "x": 1})).unwrap();

        let mut stage = fetch_over_index(&c, None);
        let mut ws = WorkingSet::new();
        let mut ids = Vec::new();
        loop {
            match stage.work(&mut ws) {
                WorkStatus::Advanced(id) => {
                    let member = ws.get(id);
                    assert_eq!(member.state, MemberState::RidAndObj);
                    ids.push(member.obj.as_ref().unwrap()["_id"].clone());
                    ws.free(id);
                }
                WorkStatus::NeedTime => {}
                WorkStatus::Eof => break,
                other => panic!("unexpected status {:?}", other),
            }
        }
        assert_eq!(ids, vec![json!(2), json!(1)]);
    }

    #[test]
    fn test_fetch_filter_drops_non_matching() {
        let c = collection();
        c.insert_document(&json!({"_id": 1, "x": 1, "y": "keep"})).unwrap();
        c.insert_document(&json!({"_id": 2, "x": 2, "y": "drop"})).unwrap();

        let mut stage = fetch_over_index(&c, Some(json!({"y": "keep"})));
        let mut ws = WorkingSet::new();
        let mut count = 0;
        loop {
            match stage.work(&mut ws) {
                WorkStatus::Advanced(id) => {
                    count += 1;
                    ws.free(id);
                }
                WorkStatus::NeedTime => {}
                WorkStatus::Eof => break,
                other => panic!("unexpected status {:?}", other),
            }
        }
        assert_eq!(count, 1);
    }
}
