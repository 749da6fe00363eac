// src/exec/distinct.rs
// Collects the distinct values of one field across the child's documents.
// Array values fan out to their elements, matching index key generation.
// The result is a single {"values": [...]} member, values in first-seen
// order.

use crate::cursor_manager::InvalidationType;
use crate::document::get_path;
use crate::error::Result;
use crate::exec::{CommonStats, PlanStage, PlanStageStats, StageType, WorkStatus};
use crate::record_store::RecordId;
use crate::working_set::{MemberState, WorkingSet};
use serde_json::{json, Value};
use std::collections::HashSet;

pub struct DistinctStage {
    child: Box<dyn PlanStage>,
    field: String,
    seen: HashSet<String>,
    values: Vec<Value>,
    done: bool,
    stats: CommonStats,
}

impl DistinctStage {
    pub fn new(child: Box<dyn PlanStage>, field: &str) -> Self {
        DistinctStage {
            child,
            field: field.to_string(),
            seen: HashSet::new(),
            values: Vec::new(),
            done: false,
            stats: CommonStats::default(),
        }
    }

    fn record_value(&mut self, value: &Value) {
        match value {
            Value::Array(elems) => {
                for elem in elems {
                    self.record_value(elem);
                }
            }
            other => {
                // Serialized form as the dedup key; Value is not hashable.
                let key = other.to_string();
                if self.seen.insert(key) {
                    self.values.push(other.clone());
                }
            }
        }
    }
}

impl PlanStage for DistinctStage {
    fn work(&mut self, ws: &mut WorkingSet) -> WorkStatus {
        if self.done {
            return self.stats.tally(WorkStatus::Eof);
        }
        match self.child.work(ws) {
            WorkStatus::Advanced(id) => {
                if let Some(doc) = &ws.get(id).obj {
                    if let Some(value) = get_path(doc, &self.field) {
                        let value = value.clone();
                        self.record_value(&value);
                    }
                }
                ws.free(id);
                self.stats.tally(WorkStatus::NeedTime)
            }
            WorkStatus::Eof => {
                self.done = true;
                let id = ws.allocate();
                let member = ws.get_mut(id);
                member.state = MemberState::OwnedObj;
                member.obj = Some(json!({"values": self.values.clone()}));
                self.stats.tally(WorkStatus::Advanced(id))
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
        StageType::Distinct
    }

    fn stats(&self) -> PlanStageStats {
        let mut stats = PlanStageStats::new(StageType::Distinct, self.stats.clone());
        stats.specific = Some(self.field.clone());
        stats.children.push(self.child.stats());
        stats
    }
}
