// src/exec/cached_plan.rs
// Replays a plan recovered from the plan cache, on probation: the cached
// plan gets a work budget proportional to its recorded trial cost, and if
// it underperforms the cache entry is evicted and execution falls back to a
// fresh multi-plan selection.

use crate::collection::Collection;
use crate::cursor_manager::InvalidationType;
use crate::error::{QuartzError, Result};
use crate::exec::{CommonStats, PlanStage, PlanStageStats, StageType, WorkStatus};
use crate::log_debug;
use crate::record_store::RecordId;
use crate::working_set::{WorkingSet, WorkingSetId};
use std::collections::VecDeque;
use std::sync::Arc;

/// Budget multiplier over the cached plan's recorded works.
const REPLAN_FACTOR: u64 = 10;
const MIN_TRIAL_WORKS: u64 = 100;
const TRIAL_RESULTS: usize = 101;

enum Mode {
    Probation,
    Cached,
    Fallback,
}

pub struct CachedPlanStage {
    collection: Arc<Collection>,
    shape_key: u64,
    cached_works: u64,
    cached_root: Box<dyn PlanStage>,
    fallback_root: Box<dyn PlanStage>,
    mode: Mode,
    buffered: VecDeque<WorkingSetId>,
    cached_hit_eof: bool,
    stats: CommonStats,
}

impl CachedPlanStage {
    pub fn new(
        collection: Arc<Collection>,
        shape_key: u64,
        cached_works: u64,
        cached_root: Box<dyn PlanStage>,
        fallback_root: Box<dyn PlanStage>,
    ) -> Self {
        CachedPlanStage {
            collection,
            shape_key,
            cached_works,
            cached_root,
            fallback_root,
            mode: Mode::Probation,
            buffered: VecDeque::new(),
            cached_hit_eof: false,
            stats: CommonStats::default(),
        }
    }

    fn run_probation(&mut self, ws: &mut WorkingSet) -> Result<()> {
        let budget = (self.cached_works * REPLAN_FACTOR).max(MIN_TRIAL_WORKS);
        for _ in 0..budget {
            match self.cached_root.work(ws) {
                WorkStatus::Advanced(id) => {
                    self.buffered.push_back(id);
                    if self.buffered.len() >= TRIAL_RESULTS {
                        self.mode = Mode::Cached;
                        return Ok(());
                    }
                }
                WorkStatus::NeedTime | WorkStatus::NeedYield(_) => {}
                WorkStatus::Eof => {
                    self.cached_hit_eof = true;
                    self.mode = Mode::Cached;
                    return Ok(());
                }
                WorkStatus::Failure(id) | WorkStatus::Dead(id) => {
                    ws.free(id);
                    self.replan(ws);
                    return Ok(());
                }
            }
        }
        // Budget exhausted without finishing: the data has drifted from
        // whatever made this plan win.
        self.replan(ws);
        Ok(())
    }

    fn replan(&mut self, ws: &mut WorkingSet) {
        log_debug!("cached plan for shape {:#x} evicted, replanning", self.shape_key);
        self.collection.plan_cache().remove(self.shape_key);
        for id in self.buffered.drain(..) {
            ws.free(id);
        }
        self.mode = Mode::Fallback;
    }
}

impl PlanStage for CachedPlanStage {
    fn work(&mut self, ws: &mut WorkingSet) -> WorkStatus {
        if matches!(self.mode, Mode::Probation) {
            if let Err(e) = self.run_probation(ws) {
                let id = ws.make_error(e);
                return self.stats.tally(WorkStatus::Failure(id));
            }
        }
        match self.mode {
            Mode::Probation => unreachable!("probation resolved above"),
            Mode::Cached => {
                if let Some(id) = self.buffered.pop_front() {
                    return self.stats.tally(WorkStatus::Advanced(id));
                }
                if self.cached_hit_eof {
                    return self.stats.tally(WorkStatus::Eof);
                }
                let status = self.cached_root.work(ws);
                self.stats.tally(status)
            }
            Mode::Fallback => {
                let status = self.fallback_root.work(ws);
                self.stats.tally(status)
            }
        }
    }

    fn save_state(&mut self) {
        self.cached_root.save_state();
        self.fallback_root.save_state();
    }

    fn restore_state(&mut self) -> Result<()> {
        match self.mode {
            Mode::Fallback => self.fallback_root.restore_state(),
            _ => self.cached_root.restore_state(),
        }
    }

    fn invalidate(&mut self, ws: &mut WorkingSet, record_id: RecordId, kind: InvalidationType) {
        self.cached_root.invalidate(ws, record_id, kind);
        self.fallback_root.invalidate(ws, record_id, kind);
        let mut kept = VecDeque::with_capacity(self.buffered.len());
        for id in self.buffered.drain(..) {
            let member = ws.get_mut(id);
            if member.record_id == Some(record_id) {
                if member.has_obj() {
                    member.make_obj_owned();
                    kept.push_back(id);
                } else {
                    ws.free(id);
                }
            } else {
                kept.push_back(id);
            }
        }
        self.buffered = kept;
    }

    fn is_eof(&self) -> bool {
        match self.mode {
            Mode::Probation => false,
            Mode::Cached => self.buffered.is_empty() && (self.cached_hit_eof || self.cached_root.is_eof()),
            Mode::Fallback => self.fallback_root.is_eof(),
        }
    }

    fn stage_type(&self) -> StageType {
        StageType::CachedPlan
    }

    fn stats(&self) -> PlanStageStats {
        let mut stats = PlanStageStats::new(StageType::CachedPlan, self.stats.clone());
        stats.specific = Some(format!("shape={:#x} cachedWorks={}", self.shape_key, self.cached_works));
        stats.children.push(self.cached_root.stats());
        stats.children.push(self.fallback_root.stats());
        stats
    }

    fn pick_best_plan(&mut self, ws: &mut WorkingSet) -> Result<()> {
        if matches!(self.mode, Mode::Probation) {
            self.run_probation(ws)?;
        }
        if matches!(self.mode, Mode::Fallback) {
            self.fallback_root.pick_best_plan(ws)?;
        }
        Ok(())
    }
}
