// src/exec/group.rs
// Grouping with built-in accumulators. Documents are bucketed by the value
// at the key path, each bucket folding its accumulators as members arrive;
// buckets drain one per work() call after the child is exhausted, ordered
// by key for deterministic output.

use crate::cursor_manager::InvalidationType;
use crate::document::{compare_values, get_path};
use crate::error::Result;
use crate::exec::{CommonStats, PlanStage, PlanStageStats, StageType, WorkStatus};
use crate::record_store::RecordId;
use crate::working_set::{MemberState, WorkingSet};
use serde_json::{json, Map, Value};
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub enum Accumulator {
    Count,
    Sum(String),
    Avg(String),
    Min(String),
    Max(String),
}

#[derive(Debug, Clone)]
pub struct GroupSpec {
    pub key_path: String,
    /// Output field name paired with how to compute it.
    pub accumulators: Vec<(String, Accumulator)>,
}

#[derive(Clone)]
struct Bucket {
    key: Value,
    count: u64,
    sums: Vec<f64>,
    counts: Vec<u64>,
    mins: Vec<Option<Value>>,
    maxs: Vec<Option<Value>>,
}

impl Bucket {
    fn new(key: Value, num_accs: usize) -> Self {
        Bucket {
            key,
            count: 0,
            sums: vec![0.0; num_accs],
            counts: vec![0; num_accs],
            mins: vec![None; num_accs],
            maxs: vec![None; num_accs],
        }
    }
}

pub struct GroupStage {
    child: Box<dyn PlanStage>,
    spec: GroupSpec,
    buckets: HashMap<String, Bucket>,
    drained: Option<Vec<Bucket>>,
    pos: usize,
    eof: bool,
    stats: CommonStats,
}

impl GroupStage {
    pub fn new(child: Box<dyn PlanStage>, spec: GroupSpec) -> Self {
        GroupStage {
            child,
            spec,
            buckets: HashMap::new(),
            drained: None,
            pos: 0,
            eof: false,
            stats: CommonStats::default(),
        }
    }

    fn absorb(&mut self, doc: &Value) {
        let key = get_path(doc, &self.spec.key_path)
            .cloned()
            .unwrap_or(Value::Null);
        let num_accs = self.spec.accumulators.len();
        let bucket = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| Bucket::new(key, num_accs));
        bucket.count += 1;
        for (i, (_, acc)) in self.spec.accumulators.iter().enumerate() {
            let path = match acc {
                Accumulator::Count => continue,
                Accumulator::Sum(p) | Accumulator::Avg(p) | Accumulator::Min(p)
                | Accumulator::Max(p) => p,
            };
            let value = match get_path(doc, path) {
                Some(v) => v,
                None => continue,
            };
            match acc {
                Accumulator::Count => {}
                Accumulator::Sum(_) | Accumulator::Avg(_) => {
                    if let Some(n) = value.as_f64() {
                        bucket.sums[i] += n;
                        bucket.counts[i] += 1;
                    }
                }
                Accumulator::Min(_) => {
                    let replace = match &bucket.mins[i] {
                        Some(current) => compare_values(value, current).is_lt(),
                        None => true,
                    };
                    if replace {
                        bucket.mins[i] = Some(value.clone());
                    }
                }
                Accumulator::Max(_) => {
                    let replace = match &bucket.maxs[i] {
                        Some(current) => compare_values(value, current).is_gt(),
                        None => true,
                    };
                    if replace {
                        bucket.maxs[i] = Some(value.clone());
                    }
                }
            }
        }
    }

    fn emit_bucket(&self, bucket: &Bucket) -> Value {
        let mut out = Map::new();
        out.insert("_id".to_string(), bucket.key.clone());
        for (i, (name, acc)) in self.spec.accumulators.iter().enumerate() {
            let value = match acc {
                Accumulator::Count => json!(bucket.count),
                Accumulator::Sum(_) => number(bucket.sums[i]),
                Accumulator::Avg(_) => {
                    if bucket.counts[i] == 0 {
                        Value::Null
                    } else {
                        json!(bucket.sums[i] / bucket.counts[i] as f64)
                    }
                }
                Accumulator::Min(_) => bucket.mins[i].clone().unwrap_or(Value::Null),
                Accumulator::Max(_) => bucket.maxs[i].clone().unwrap_or(Value::Null),
            };
            out.insert(name.clone(), value);
        }
        Value::Object(out)
    }
}

fn number(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        json!(n as i64)
    } else {
        json!(n)
    }
}

impl PlanStage for GroupStage {
    fn work(&mut self, ws: &mut WorkingSet) -> WorkStatus {
        if self.eof {
            return self.stats.tally(WorkStatus::Eof);
        }
        if let Some(drained) = &self.drained {
            if self.pos >= drained.len() {
                self.eof = true;
                return self.stats.tally(WorkStatus::Eof);
            }
            let doc = self.emit_bucket(&drained[self.pos]);
            self.pos += 1;
            let id = ws.allocate();
            let member = ws.get_mut(id);
            member.state = MemberState::OwnedObj;
            member.obj = Some(doc);
            return self.stats.tally(WorkStatus::Advanced(id));
        }
        match self.child.work(ws) {
            WorkStatus::Advanced(id) => {
                if let Some(doc) = ws.get(id).obj.clone() {
                    self.absorb(&doc);
                }
                ws.free(id);
                self.stats.tally(WorkStatus::NeedTime)
            }
            WorkStatus::Eof => {
                let mut drained: Vec<Bucket> = self.buckets.drain().map(|(_, b)| b).collect();
                drained.sort_by(|a, b| compare_values(&a.key, &b.key));
                self.drained = Some(drained);
                self.stats.tally(WorkStatus::NeedTime)
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
        self.eof
    }

    fn stage_type(&self) -> StageType {
        StageType::Group
    }

    fn stats(&self) -> PlanStageStats {
        let mut stats = PlanStageStats::new(StageType::Group, self.stats.clone());
        stats.specific = Some(format!("key={}", self.spec.key_path));
        stats.children.push(self.child.stats());
        stats
    }
}
