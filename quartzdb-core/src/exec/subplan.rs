// src/exec/subplan.rs
// Executes a top-level $or as the union of independently planned branches,
// run one after another. A document matching several branches is emitted
// once; record ids seen by earlier branches are suppressed in later ones.

use crate::cursor_manager::InvalidationType;
use crate::error::Result;
use crate::exec::{CommonStats, PlanStage, PlanStageStats, StageType, WorkStatus};
use crate::record_store::RecordId;
use crate::working_set::WorkingSet;
use std::collections::HashSet;

pub struct SubplanStage {
    branches: Vec<Box<dyn PlanStage>>,
    current: usize,
    seen: HashSet<RecordId>,
    stats: CommonStats,
}

impl SubplanStage {
    pub fn new(branches: Vec<Box<dyn PlanStage>>) -> Self {
        SubplanStage {
            branches,
            current: 0,
            seen: HashSet::new(),
            stats: CommonStats::default(),
        }
    }
}

impl PlanStage for SubplanStage {
    fn work(&mut self, ws: &mut WorkingSet) -> WorkStatus {
        loop {
            let branch = match self.branches.get_mut(self.current) {
                Some(branch) => branch,
                None => return self.stats.tally(WorkStatus::Eof),
            };
            match branch.work(ws) {
                WorkStatus::Advanced(id) => {
                    if let Some(rid) = ws.get(id).record_id {
                        if !self.seen.insert(rid) {
                            // Already produced by an earlier branch.
                            ws.free(id);
                            return self.stats.tally(WorkStatus::NeedTime);
                        }
                    }
                    return self.stats.tally(WorkStatus::Advanced(id));
                }
                WorkStatus::Eof => {
                    self.current += 1;
                    continue;
                }
                other => return self.stats.tally(other),
            }
        }
    }

    fn save_state(&mut self) {
        for branch in &mut self.branches {
            branch.save_state();
        }
    }

    fn restore_state(&mut self) -> Result<()> {
        for branch in &mut self.branches {
            branch.restore_state()?;
        }
        Ok(())
    }

    fn invalidate(&mut self, ws: &mut WorkingSet, record_id: RecordId, kind: InvalidationType) {
        for branch in &mut self.branches {
            branch.invalidate(ws, record_id, kind);
        }
    }

    fn is_eof(&self) -> bool {
        self.current >= self.branches.len()
    }

    fn stage_type(&self) -> StageType {
        StageType::Subplan
    }

    fn stats(&self) -> PlanStageStats {
        let mut stats = PlanStageStats::new(StageType::Subplan, self.stats.clone());
        stats.specific = Some(format!("branches={}", self.branches.len()));
        for branch in &self.branches {
            stats.children.push(branch.stats());
        }
        stats
    }

    fn pick_best_plan(&mut self, ws: &mut WorkingSet) -> Result<()> {
        for branch in &mut self.branches {
            branch.pick_best_plan(ws)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::{Collection, CollectionOptions};
    use crate::exec::fetch::FetchStage;
    use crate::exec::index_scan::IndexScanStage;
    use crate::index_access::IndexBounds;
    use crate::index_catalog::IndexDescriptor;
    use crate::index_key::{IndexKey, KeyPattern};
    use crate::op_observer::NoopObserver;
    use serde_json::json;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    fn collection() -> Arc<Collection> {
        let c = Collection::new(
            "test.subplan",
            CollectionOptions::default(),
            Arc::new(NoopObserver),
            Arc::new(AtomicBool::new(true)),
        )
        .unwrap();
        c.create_index(IndexDescriptor::new("a_1", KeyPattern::single("a")))
            .unwrap();
        c.create_index(IndexDescriptor::new("b_1", KeyPattern::single("b")))
            .unwrap();
        // Document 2 matches both $or branches below.
        c.insert_document(&json!({"_id": 1, "a": 1, "b": 0})).unwrap();
        c.insert_document(&json!({"_id": 2, "a": 1, "b": 9})).unwrap();
        c.insert_document(&json!({"_id": 3, "a": 0, "b": 9})).unwrap();
        c.insert_document(&json!({"_id": 4, "a": 0, "b": 0})).unwrap();
        Arc::new(c)
    }

    fn branch(c: &Arc<Collection>, index: &str, key: i64) -> Box<dyn PlanStage> {
        let scan = IndexScanStage::new(
            Arc::clone(c),
            index,
            IndexBounds::point(IndexKey::Int(key)),
            true,
        );
        Box::new(FetchStage::new(Arc::clone(c), Box::new(scan), None))
    }

    #[test]
    fn test_or_union_dedups_across_branches() {
        let c = collection();
        // {$or: [{a: 1}, {b: 9}]}
        let mut stage = SubplanStage::new(vec![branch(&c, "a_1", 1), branch(&c, "b_1", 9)]);
        let mut ws = WorkingSet::new();
        stage.pick_best_plan(&mut ws).unwrap();

        let mut ids = Vec::new();
        loop {
            match stage.work(&mut ws) {
                WorkStatus::Advanced(id) => {
                    ids.push(ws.get(id).obj.as_ref().unwrap()["_id"].as_i64().unwrap());
                    ws.free(id);
                }
                WorkStatus::NeedTime => {}
                WorkStatus::Eof => break,
                other => panic!("unexpected status {:?}", other),
            }
        }
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(stage.is_eof());
    }
}
