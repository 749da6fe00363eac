// src/exec/id_hack.rs
// Fast path for {_id: <value>} queries: one point lookup on the _id index,
// one fetch, no planning.

use crate::collection::Collection;
use crate::cursor_manager::InvalidationType;
use crate::error::{QuartzError, Result};
use crate::exec::{CommonStats, PlanStage, PlanStageStats, StageType, WorkStatus};
use crate::index_key::IndexKey;
use crate::record_store::RecordId;
use crate::working_set::{MemberState, WorkingSet};
use serde_json::Value;
use std::sync::Arc;

pub struct IdHackStage {
    collection: Arc<Collection>,
    id_value: Value,
    done: bool,
    stats: CommonStats,
}

impl IdHackStage {
    pub fn new(collection: Arc<Collection>, id_value: Value) -> Self {
        IdHackStage {
            collection,
            id_value,
            done: false,
            stats: CommonStats::default(),
        }
    }
}

impl PlanStage for IdHackStage {
    fn work(&mut self, ws: &mut WorkingSet) -> WorkStatus {
        if self.done {
            return self.stats.tally(WorkStatus::Eof);
        }
        self.done = true;

        let key = IndexKey::from(&self.id_value);
        let record_id = {
            let catalog = self.collection.index_catalog().read();
            let entry = match catalog.id_index() {
                Some(entry) => entry,
                None => {
                    let id = ws.make_error(QuartzError::IndexNotFound("_id_".into()));
                    return self.stats.tally(WorkStatus::Failure(id));
                }
            };
            entry.access().lookup(&key).first().copied()
        };

        let record_id = match record_id {
            Some(rid) => rid,
            None => return self.stats.tally(WorkStatus::Eof),
        };

        let (doc, snapshot) = {
            let store = self.collection.record_store().read();
            (store.data_for(record_id), store.snapshot_id())
        };
        match doc {
            Some(doc) => {
                let id = ws.allocate();
                let member = ws.get_mut(id);
                member.state = MemberState::RidAndObj;
                member.record_id = Some(record_id);
                member.obj = Some(doc);
                member.snapshot_id = snapshot;
                self.stats.tally(WorkStatus::Advanced(id))
            }
            None => self.stats.tally(WorkStatus::Eof),
        }
    }

    fn save_state(&mut self) {}

    fn restore_state(&mut self) -> Result<()> {
        Ok(())
    }

    fn invalidate(&mut self, _ws: &mut WorkingSet, _record_id: RecordId, _kind: InvalidationType) {}

    fn is_eof(&self) -> bool {
        self.done
    }

    fn stage_type(&self) -> StageType {
        StageType::IdHack
    }

    fn stats(&self) -> PlanStageStats {
        let mut stats = PlanStageStats::new(StageType::IdHack, self.stats.clone());
        stats.specific = Some(self.id_value.to_string());
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::CollectionOptions;
    use crate::op_observer::NoopObserver;
    use serde_json::json;
    use std::sync::atomic::AtomicBool;

    fn collection() -> Arc<Collection> {
        let c = Collection::new(
            "test.idhack",
            CollectionOptions::default(),
            Arc::new(NoopObserver),
            Arc::new(AtomicBool::new(true)),
        )
        .unwrap();
        c.insert_document(&json!({"_id": 1, "x": "a"})).unwrap();
        c.insert_document(&json!({"_id": 2, "x": "b"})).unwrap();
        Arc::new(c)
    }

    #[test]
    fn test_point_lookup() {
        let mut stage = IdHackStage::new(collection(), json!(2));
        let mut ws = WorkingSet::new();
        match stage.work(&mut ws) {
            WorkStatus::Advanced(id) => {
                assert_eq!(ws.get(id).obj.as_ref().unwrap()["x"], json!("b"));
            }
            other => panic!("unexpected status {:?}", other),
        }
        assert_eq!(stage.work(&mut ws), WorkStatus::Eof);
    }

    #[test]
    fn test_missing_id_is_eof() {
        let mut stage = IdHackStage::new(collection(), json!(99));
        let mut ws = WorkingSet::new();
        assert_eq!(stage.work(&mut ws), WorkStatus::Eof);
    }
}
