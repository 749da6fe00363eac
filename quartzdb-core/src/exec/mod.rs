// src/exec/mod.rs
// The stage tree. Each stage implements one operator in a pulled-execution
// pipeline: the executor calls work() on the root, the root calls its
// children, and documents flow upward as working set ids.

pub mod cached_plan;
pub mod collection_scan;
pub mod count;
pub mod delete;
pub mod distinct;
pub mod fetch;
pub mod filter;
pub mod group;
pub mod id_hack;
pub mod index_scan;
pub mod limit_skip;
pub mod multi_plan;
pub mod subplan;
pub mod text_or;
pub mod update;

use crate::cursor_manager::InvalidationType;
use crate::error::Result;
use crate::record_store::RecordId;
use crate::working_set::{WorkingSet, WorkingSetId};

/// Result of one work() call. A stage either produces a member, asks for
/// more time, asks the executor to yield, finishes, or fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkStatus {
    /// A member is ready in the working set.
    Advanced(WorkingSetId),
    /// Progress was made but nothing is ready yet.
    NeedTime,
    /// The stage hit a condition that requires releasing locks before
    /// retrying, typically a write conflict. The optional member carries
    /// state the stage wants preserved across the yield.
    NeedYield(Option<WorkingSetId>),
    /// No more results will ever be produced.
    Eof,
    /// Unrecoverable error; the member holds the status payload.
    Failure(WorkingSetId),
    /// The plan was killed out from under the stage mid-work.
    Dead(WorkingSetId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageType {
    CollScan,
    IndexScan,
    Fetch,
    Filter,
    IdHack,
    LimitSkip,
    Count,
    Delete,
    Update,
    TextOr,
    MultiPlan,
    CachedPlan,
    Subplan,
    Distinct,
    Group,
}

/// Counters every stage keeps.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommonStats {
    pub works: u64,
    pub advanced: u64,
    pub need_time: u64,
    pub need_yield: u64,
    pub is_eof: bool,
}

impl CommonStats {
    /// Record `status` in the counters and pass it through.
    pub fn tally(&mut self, status: WorkStatus) -> WorkStatus {
        self.works += 1;
        match status {
            WorkStatus::Advanced(_) => self.advanced += 1,
            WorkStatus::NeedTime => self.need_time += 1,
            WorkStatus::NeedYield(_) => self.need_yield += 1,
            WorkStatus::Eof => self.is_eof = true,
            _ => {}
        }
        status
    }
}

/// Snapshot of one stage's counters plus its children's, mirroring the
/// shape of the plan tree.
#[derive(Debug, Clone)]
pub struct PlanStageStats {
    pub stage_type: StageType,
    pub common: CommonStats,
    pub specific: Option<String>,
    pub children: Vec<PlanStageStats>,
}

impl PlanStageStats {
    pub fn new(stage_type: StageType, common: CommonStats) -> Self {
        PlanStageStats {
            stage_type,
            common,
            specific: None,
            children: Vec::new(),
        }
    }

    pub fn total_works(&self) -> u64 {
        self.common.works + self.children.iter().map(|c| c.total_works()).sum::<u64>()
    }
}

pub trait PlanStage: Send {
    /// Do one unit of work. Never blocks and never does unbounded work.
    fn work(&mut self, ws: &mut WorkingSet) -> WorkStatus;

    /// Release storage-level state ahead of a yield. Must be cheap and
    /// infallible; stages downgrade to positional bookmarks here.
    fn save_state(&mut self);

    /// Re-acquire state after a yield. Fails if the world changed in a way
    /// the stage cannot recover from.
    fn restore_state(&mut self) -> Result<()>;

    /// A record was deleted or mutated while the plan was suspended.
    /// Stages holding the record either buffer it as owned or forget it
    /// before execution resumes.
    fn invalidate(&mut self, ws: &mut WorkingSet, record_id: RecordId, kind: InvalidationType);

    fn is_eof(&self) -> bool;

    fn stage_type(&self) -> StageType;

    fn stats(&self) -> PlanStageStats;

    /// Plan-selection stages resolve their choice here before the first
    /// work() call; everything else has nothing to pick.
    fn pick_best_plan(&mut self, _ws: &mut WorkingSet) -> Result<()> {
        Ok(())
    }
}
