// src/exec/multi_plan.rs
// Competitive plan selection: every candidate plan is worked round-robin
// for a bounded trial, the most productive one wins, and its trial results
// are replayed before fresh execution continues. The winner is recorded in
// the plan cache under the query's shape.

use crate::collection::Collection;
use crate::cursor_manager::InvalidationType;
use crate::error::{QuartzError, Result};
use crate::exec::{CommonStats, PlanStage, PlanStageStats, StageType, WorkStatus};
use crate::log_debug;
use crate::plan_cache::CachedSolution;
use crate::record_store::RecordId;
use crate::working_set::{WorkingSet, WorkingSetId};
use std::collections::VecDeque;
use std::sync::Arc;

/// Work calls granted to each candidate during the trial.
const TRIAL_WORKS: u64 = 100;
/// A candidate that produces this many results ends the trial early.
const TRIAL_RESULTS: usize = 101;

struct Candidate {
    root: Box<dyn PlanStage>,
    index_name: Option<String>,
    buffered: VecDeque<WorkingSetId>,
    advanced: usize,
    hit_eof: bool,
    failure: Option<QuartzError>,
}

pub struct MultiPlanStage {
    collection: Arc<Collection>,
    shape_key: Option<u64>,
    candidates: Vec<Candidate>,
    winner: Option<usize>,
    stats: CommonStats,
}

impl MultiPlanStage {
    pub fn new(collection: Arc<Collection>, shape_key: Option<u64>) -> Self {
        MultiPlanStage {
            collection,
            shape_key,
            candidates: Vec::new(),
            winner: None,
            stats: CommonStats::default(),
        }
    }

    /// `index_name` identifies the plan in the cache; None marks a
    /// collection scan candidate.
    pub fn add_candidate(&mut self, root: Box<dyn PlanStage>, index_name: Option<String>) {
        self.candidates.push(Candidate {
            root,
            index_name,
            buffered: VecDeque::new(),
            advanced: 0,
            hit_eof: false,
            failure: None,
        });
    }

    pub fn best_plan_index_name(&self) -> Option<&str> {
        self.winner
            .and_then(|i| self.candidates[i].index_name.as_deref())
    }

    fn run_trial(&mut self, ws: &mut WorkingSet) -> Result<()> {
        'trial: for _ in 0..TRIAL_WORKS {
            for candidate in self.candidates.iter_mut() {
                if candidate.hit_eof || candidate.failure.is_some() {
                    continue;
                }
                match candidate.root.work(ws) {
                    WorkStatus::Advanced(id) => {
                        candidate.buffered.push_back(id);
                        candidate.advanced += 1;
                        if candidate.advanced >= TRIAL_RESULTS {
                            break 'trial;
                        }
                    }
                    WorkStatus::NeedTime | WorkStatus::NeedYield(_) => {}
                    WorkStatus::Eof => {
                        candidate.hit_eof = true;
                        break 'trial;
                    }
                    WorkStatus::Failure(id) | WorkStatus::Dead(id) => {
                        let err = ws
                            .get(id)
                            .status
                            .clone()
                            .unwrap_or_else(|| QuartzError::Internal("plan trial failed".into()));
                        ws.free(id);
                        candidate.failure = Some(err);
                    }
                }
            }
            if self.candidates.iter().all(|c| c.failure.is_some()) {
                break;
            }
        }

        // EOF during the trial beats raw productivity: that plan is done.
        let winner = self
            .candidates
            .iter()
            .enumerate()
            .filter(|(_, c)| c.failure.is_none())
            .max_by_key(|(_, c)| (c.hit_eof, c.advanced))
            .map(|(i, _)| i);

        let winner = match winner {
            Some(i) => i,
            None => {
                let err = self
                    .candidates
                    .iter_mut()
                    .find_map(|c| c.failure.take())
                    .unwrap_or_else(|| QuartzError::Internal("no viable plan".into()));
                return Err(err);
            }
        };
        self.winner = Some(winner);
        log_debug!(
            "multi-plan winner: {:?} ({} advances, eof={})",
            self.candidates[winner].index_name,
            self.candidates[winner].advanced,
            self.candidates[winner].hit_eof
        );

        // Losers release their trial results.
        for (i, candidate) in self.candidates.iter_mut().enumerate() {
            if i != winner {
                for id in candidate.buffered.drain(..) {
                    ws.free(id);
                }
            }
        }

        if let Some(key) = self.shape_key {
            self.collection.plan_cache().set(
                key,
                CachedSolution {
                    index_name: self.candidates[winner].index_name.clone(),
                    works: self.candidates[winner].advanced as u64,
                },
            );
        }
        Ok(())
    }
}

impl PlanStage for MultiPlanStage {
    fn work(&mut self, ws: &mut WorkingSet) -> WorkStatus {
        let winner = match self.winner {
            Some(winner) => winner,
            None => {
                if let Err(e) = self.run_trial(ws) {
                    let id = ws.make_error(e);
                    return self.stats.tally(WorkStatus::Failure(id));
                }
                self.winner.expect("trial picked a winner")
            }
        };
        let candidate = &mut self.candidates[winner];
        if let Some(id) = candidate.buffered.pop_front() {
            return self.stats.tally(WorkStatus::Advanced(id));
        }
        if candidate.hit_eof {
            return self.stats.tally(WorkStatus::Eof);
        }
        let status = candidate.root.work(ws);
        self.stats.tally(status)
    }

    fn save_state(&mut self) {
        for candidate in &mut self.candidates {
            candidate.root.save_state();
        }
    }

    fn restore_state(&mut self) -> Result<()> {
        match self.winner {
            Some(i) => self.candidates[i].root.restore_state(),
            None => {
                for candidate in &mut self.candidates {
                    candidate.root.restore_state()?;
                }
                Ok(())
            }
        }
    }

    fn invalidate(&mut self, ws: &mut WorkingSet, record_id: RecordId, kind: InvalidationType) {
        for candidate in &mut self.candidates {
            candidate.root.invalidate(ws, record_id, kind);
            // Buffered trial results may hold the invalidated record.
            let mut kept = VecDeque::with_capacity(candidate.buffered.len());
            for id in candidate.buffered.drain(..) {
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
            candidate.buffered = kept;
        }
    }

    fn is_eof(&self) -> bool {
        match self.winner {
            Some(i) => {
                let candidate = &self.candidates[i];
                candidate.buffered.is_empty() && (candidate.hit_eof || candidate.root.is_eof())
            }
            None => false,
        }
    }

    fn stage_type(&self) -> StageType {
        StageType::MultiPlan
    }

    fn stats(&self) -> PlanStageStats {
        let mut stats = PlanStageStats::new(StageType::MultiPlan, self.stats.clone());
        stats.specific = Some(format!(
            "candidates={} winner={:?}",
            self.candidates.len(),
            self.best_plan_index_name()
        ));
        for candidate in &self.candidates {
            stats.children.push(candidate.root.stats());
        }
        stats
    }

    fn pick_best_plan(&mut self, ws: &mut WorkingSet) -> Result<()> {
        if self.winner.is_none() {
            self.run_trial(ws)?;
        }
        Ok(())
    }
}
