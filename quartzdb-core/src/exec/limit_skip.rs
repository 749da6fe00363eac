// src/exec/limit_skip.rs

use crate::cursor_manager::InvalidationType;
use crate::error::Result;
use crate::exec::{CommonStats, PlanStage, PlanStageStats, StageType, WorkStatus};
use crate::record_store::RecordId;
use crate::working_set::WorkingSet;

/// Drops the first `skip` results and caps output at `limit`. Lives at the
/// top of find plans; count folds the same arithmetic into its tally
/// instead.
pub struct LimitSkipStage {
    child: Box<dyn PlanStage>,
    skip: usize,
    limit: Option<usize>,
    skipped: usize,
    returned: usize,
    done: bool,
    stats: CommonStats,
}

impl LimitSkipStage {
    pub fn new(child: Box<dyn PlanStage>, skip: usize, limit: Option<usize>) -> Self {
        LimitSkipStage {
            child,
            skip,
            limit,
            skipped: 0,
            returned: 0,
            done: false,
            stats: CommonStats::default(),
        }
    }
}

impl PlanStage for LimitSkipStage {
    fn work(&mut self, ws: &mut WorkingSet) -> WorkStatus {
        if self.done {
            return self.stats.tally(WorkStatus::Eof);
        }
        if matches!(self.limit, Some(limit) if self.returned >= limit) {
            self.done = true;
            return self.stats.tally(WorkStatus::Eof);
        }
        match self.child.work(ws) {
            WorkStatus::Advanced(id) => {
                if self.skipped < self.skip {
                    self.skipped += 1;
                    ws.free(id);
                    return self.stats.tally(WorkStatus::NeedTime);
                }
                self.returned += 1;
                self.stats.tally(WorkStatus::Advanced(id))
            }
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
        self.child.invalidate(ws, record_id, kind);
    }

    fn is_eof(&self) -> bool {
        self.done
    }

    fn stage_type(&self) -> StageType {
        StageType::LimitSkip
    }

    fn stats(&self) -> PlanStageStats {
        let mut stats = PlanStageStats::new(StageType::LimitSkip, self.stats.clone());
        stats.specific = Some(format!("skip={} limit={:?}", self.skip, self.limit));
        stats.children.push(self.child.stats());
        stats
    }

    fn pick_best_plan(&mut self, ws: &mut WorkingSet) -> Result<()> {
        self.child.pick_best_plan(ws)
    }
}
