// src/exec/filter.rs

use crate::cursor_manager::InvalidationType;
use crate::error::{QuartzError, Result};
use crate::exec::{CommonStats, PlanStage, PlanStageStats, StageType, WorkStatus};
use crate::query::matches;
use crate::record_store::RecordId;
use crate::working_set::WorkingSet;
use serde_json::Value;

/// Passes through members whose document satisfies the predicate, dropping
/// the rest with NEED_TIME. Members without a document cannot be judged and
/// fail the query.
pub struct FilterStage {
    child: Box<dyn PlanStage>,
    filter: Value,
    stats: CommonStats,
}

impl FilterStage {
    pub fn new(child: Box<dyn PlanStage>, filter: Value) -> Self {
        FilterStage {
            child,
            filter,
            stats: CommonStats::default(),
        }
    }
}

impl PlanStage for FilterStage {
    fn work(&mut self, ws: &mut WorkingSet) -> WorkStatus {
        let id = match self.child.work(ws) {
            WorkStatus::Advanced(id) => id,
            other => return self.stats.tally(other),
        };
        let doc = match &ws.get(id).obj {
            Some(doc) => doc,
            None => {
                ws.free(id);
                let err_id = ws.make_error(QuartzError::Internal(
                    "filter stage received a member without a document".into(),
                ));
                return self.stats.tally(WorkStatus::Failure(err_id));
            }
        };
        match matches(doc, &self.filter) {
            Ok(true) => self.stats.tally(WorkStatus::Advanced(id)),
            Ok(false) => {
                ws.free(id);
                self.stats.tally(WorkStatus::NeedTime)
            }
            Err(e) => {
                ws.free(id);
                let err_id = ws.make_error(e);
                self.stats.tally(WorkStatus::Failure(err_id))
            }
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
        self.child.is_eof()
    }

    fn stage_type(&self) -> StageType {
        StageType::Filter
    }

    fn stats(&self) -> PlanStageStats {
        let mut stats = PlanStageStats::new(StageType::Filter, self.stats.clone());
        stats.specific = Some(self.filter.to_string());
        stats.children.push(self.child.stats());
        stats
    }
}
