// src/exec/collection_scan.rs
// Full scan over the record store in id order. One record per work() call.
// Tailable scans never report EOF; they park at the end of the store and
// pick up records inserted later.

use crate::collection::Collection;
use crate::cursor_manager::InvalidationType;
use crate::error::{QuartzError, Result};
use crate::exec::{CommonStats, PlanStage, PlanStageStats, StageType, WorkStatus};
use crate::query::matches;
use crate::record_store::{RecordId, ScanDirection};
use crate::working_set::{MemberState, WorkingSet};
use serde_json::Value;
use std::sync::Arc;

pub struct CollectionScanStage {
    collection: Arc<Collection>,
    direction: ScanDirection,
    filter: Option<Value>,
    tailable: bool,
    /// Resume point. next_record treats it as exclusive, so a deleted
    /// record is still a valid position.
    last_seen: Option<RecordId>,
    eof: bool,
    stats: CommonStats,
}

impl CollectionScanStage {
    pub fn new(
        collection: Arc<Collection>,
        direction: ScanDirection,
        filter: Option<Value>,
    ) -> Self {
        CollectionScanStage {
            collection,
            direction,
            filter,
            tailable: false,
            last_seen: None,
            eof: false,
            stats: CommonStats::default(),
        }
    }

    pub fn tailable(mut self) -> Self {
        self.tailable = true;
        self
    }
}

impl PlanStage for CollectionScanStage {
    fn work(&mut self, ws: &mut WorkingSet) -> WorkStatus {
        if self.eof {
            return self.stats.tally(WorkStatus::Eof);
        }
        if self.tailable && self.collection.notifier().is_dead() {
            let id = ws.make_error(QuartzError::QueryKilled(format!(
                "collection {} dropped during tailable scan",
                self.collection.ns()
            )));
            return self.stats.tally(WorkStatus::Dead(id));
        }

        let (next, doc, snapshot) = {
            let store = self.collection.record_store().read();
            match store.next_record(self.last_seen, self.direction) {
                Some(id) => (Some(id), store.data_for(id), store.snapshot_id()),
                None => (None, None, store.snapshot_id()),
            }
        };

        let record_id = match next {
            Some(id) => id,
            None => {
                if self.tailable {
                    // Stay live; the executor decides whether to wait.
                    return self.stats.tally(WorkStatus::Eof);
                }
                self.eof = true;
                return self.stats.tally(WorkStatus::Eof);
            }
        };
        self.last_seen = Some(record_id);

        let doc = match doc {
            Some(doc) => doc,
            None => return self.stats.tally(WorkStatus::NeedTime),
        };

        if let Some(filter) = &self.filter {
            match matches(&doc, filter) {
                Ok(true) => {}
                Ok(false) => return self.stats.tally(WorkStatus::NeedTime),
                Err(e) => {
                    let id = ws.make_error(e);
                    return self.stats.tally(WorkStatus::Failure(id));
                }
            }
        }

        let id = ws.allocate();
        let member = ws.get_mut(id);
        member.state = MemberState::RidAndObj;
        member.record_id = Some(record_id);
        member.obj = Some(doc);
        member.snapshot_id = snapshot;
        self.stats.tally(WorkStatus::Advanced(id))
    }

    fn save_state(&mut self) {}

    fn restore_state(&mut self) -> Result<()> {
        // The resume point is exclusive and tolerates deletion, so nothing
        // needs rebuilding.
        Ok(())
    }

    fn invalidate(&mut self, _ws: &mut WorkingSet, _record_id: RecordId, _kind: InvalidationType) {}

    fn is_eof(&self) -> bool {
        self.eof
    }

    fn stage_type(&self) -> StageType {
        StageType::CollScan
    }

    fn stats(&self) -> PlanStageStats {
        let mut stats = PlanStageStats::new(StageType::CollScan, self.stats.clone());
        stats.specific = Some(format!(
            "direction={:?} tailable={}",
            self.direction, self.tailable
        ));
        stats
    }
}
