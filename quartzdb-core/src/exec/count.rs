// src/exec/count.rs
// Counts matching documents, applying skip and limit to the tally. With no
// filter the record store already knows the answer and no scan runs. The
// result is delivered as a single {"n": <count>} member before EOF.

use crate::collection::Collection;
use crate::cursor_manager::InvalidationType;
use crate::error::Result;
use crate::exec::{CommonStats, PlanStage, PlanStageStats, StageType, WorkStatus};
use crate::record_store::RecordId;
use crate::working_set::{MemberState, WorkingSet};
use serde_json::json;
use std::sync::Arc;

pub struct CountStage {
    collection: Arc<Collection>,
    child: Option<Box<dyn PlanStage>>,
    skip: u64,
    limit: Option<u64>,
    skipped: u64,
    count: u64,
    done: bool,
    stats: CommonStats,
}

impl CountStage {
    /// Trivial count: no predicate, answered from collection metadata.
    pub fn trivial(collection: Arc<Collection>, skip: u64, limit: Option<u64>) -> Self {
        CountStage {
            collection,
            child: None,
            skip,
            limit,
            skipped: 0,
            count: 0,
            done: false,
            stats: CommonStats::default(),
        }
    }

    /// Counting over a child plan that produces the matching documents.
    pub fn over_plan(
        collection: Arc<Collection>,
        child: Box<dyn PlanStage>,
        skip: u64,
        limit: Option<u64>,
    ) -> Self {
        CountStage {
            collection,
            child: Some(child),
            skip,
            limit,
            skipped: 0,
            count: 0,
            done: false,
            stats: CommonStats::default(),
        }
    }

    fn emit_result(&mut self, ws: &mut WorkingSet) -> WorkStatus {
        self.done = true;
        let id = ws.allocate();
        let member = ws.get_mut(id);
        member.state = MemberState::OwnedObj;
        member.obj = Some(json!({"n": self.count}));
        self.stats.tally(WorkStatus::Advanced(id))
    }

    fn limit_reached(&self) -> bool {
        matches!(self.limit, Some(limit) if self.count >= limit)
    }
}

impl PlanStage for CountStage {
    fn work(&mut self, ws: &mut WorkingSet) -> WorkStatus {
        if self.done {
            return self.stats.tally(WorkStatus::Eof);
        }

        let limit_reached = self.limit_reached();
        let child = match &mut self.child {
            None => {
                let total = self.collection.num_records();
                let after_skip = total.saturating_sub(self.skip);
                self.count = match self.limit {
                    Some(limit) => after_skip.min(limit),
                    None => after_skip,
                };
                return self.emit_result(ws);
            }
            Some(child) => child,
        };

        if limit_reached {
            return self.emit_result(ws);
        }

        match child.work(ws) {
            WorkStatus::Advanced(id) => {
                ws.free(id);
                if self.skipped < self.skip {
                    self.skipped += 1;
                } else {
                    self.count += 1;
                }
                self.stats.tally(WorkStatus::NeedTime)
            }
            WorkStatus::Eof => self.emit_result(ws),
            other => self.stats.tally(other),
        }
    }

    fn save_state(&mut self) {
        if let Some(child) = &mut self.child {
            child.save_state();
        }
    }

    fn restore_state(&mut self) -> Result<()> {
        match &mut self.child {
            Some(child) => child.restore_state(),
            None => Ok(()),
        }
    }

    fn invalidate(&mut self, ws: &mut WorkingSet, record_id: RecordId, kind: InvalidationType) {
        if let Some(child) = &mut self.child {
            child.invalidate(ws, record_id, kind);
        }
    }

    fn is_eof(&self) -> bool {
        self.done
    }

    fn stage_type(&self) -> StageType {
        StageType::Count
    }

    fn stats(&self) -> PlanStageStats {
        let mut stats = PlanStageStats::new(StageType::Count, self.stats.clone());
        stats.specific = Some(format!("skip={} limit={:?}", self.skip, self.limit));
        if let Some(child) = &self.child {
            stats.children.push(child.stats());
        }
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
            "test.count",
            CollectionOptions::default(),
            Arc::new(NoopObserver),
            Arc::new(AtomicBool::new(true)),
        )
        .unwrap();
        for i in 0..n {
            c.insert_document(&json!({"_id": i, "x": i})).unwrap();
        }
        Arc::new(c)
    }

    fn run(stage: &mut CountStage) -> u64 {
        let mut ws = WorkingSet::new();
        loop {
            match stage.work(&mut ws) {
                WorkStatus::Advanced(id) => {
                    return ws.get(id).obj.as_ref().unwrap()["n"].as_u64().unwrap();
                }
                WorkStatus::NeedTime => {}
                other => panic!("unexpected status {:?}", other),
            }
        }
    }

    #[test]
    fn test_trivial_count_uses_metadata() {
        let c = collection(10);
        assert_eq!(run(&mut CountStage::trivial(Arc::clone(&c), 0, None)), 10);
        assert_eq!(run(&mut CountStage::trivial(Arc::clone(&c), 3, None)), 7);
        assert_eq!(run(&mut CountStage::trivial(Arc::clone(&c), 3, Some(5))), 5);
        assert_eq!(run(&mut CountStage::trivial(Arc::clone(&c), 20, None)), 0);
    }

    #[test]
    fn test_counting_over_a_filtered_plan() {
        let c = collection(10);
        let scan = CollectionScanStage::new(
            Arc::clone(&c),
            ScanDirection::Forward,
            Some(json!({"x": {"$lt": 6}})),
        );
        let mut stage = CountStage::over_plan(Arc::clone(&c), Box::new(scan), 2, Some(3));
        // 6 matches, skip 2, limit 3.
        assert_eq!(run(&mut stage), 3);
    }

    #[test]
    fn test_count_is_eof_after_result() {
        let c = collection(1);
        let mut stage = CountStage::trivial(c, 0, None);
        let mut ws = WorkingSet::new();
        assert!(matches!(stage.work(&mut ws), WorkStatus::Advanced(_)));
        assert_eq!(stage.work(&mut ws), WorkStatus::Eof);
        assert!(stage.is_eof());
    }
}
