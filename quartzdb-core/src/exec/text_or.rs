// src/exec/text_or.rs
// Union over a text index: one bounded scan per search term, scores summed
// per record across terms. Results are buffered during the scan phase and
// drained in descending score order, so emission is deterministic and a
// record matching several terms surfaces once with its combined score.

use crate::collection::Collection;
use crate::cursor_manager::InvalidationType;
use crate::error::{QuartzError, Result};
use crate::exec::{CommonStats, PlanStage, PlanStageStats, StageType, WorkStatus};
use crate::index_access::IndexBounds;
use crate::index_key::IndexKey;
use crate::record_store::RecordId;
use crate::working_set::{MemberState, WorkingSet};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

enum Phase {
    /// One term scanned per work() call.
    Scanning { next_term: usize },
    /// Scored results sorted and ready to emit.
    Draining { ordered: Vec<(RecordId, f64)>, pos: usize },
}

pub struct TextOrStage {
    collection: Arc<Collection>,
    index_name: String,
    terms: Vec<String>,
    scores: HashMap<RecordId, f64>,
    phase: Phase,
    eof: bool,
    stats: CommonStats,
}

impl TextOrStage {
    pub fn new(collection: Arc<Collection>, index_name: &str, terms: Vec<String>) -> Self {
        TextOrStage {
            collection,
            index_name: index_name.to_string(),
            terms,
            scores: HashMap::new(),
            phase: Phase::Scanning { next_term: 0 },
            eof: false,
            stats: CommonStats::default(),
        }
    }

    fn scan_term(&mut self, term: &str) -> Result<()> {
        let catalog = self.collection.index_catalog().read();
        let entry = catalog
            .find_index_by_name(&self.index_name, false)
            .ok_or_else(|| QuartzError::IndexNotFound(self.index_name.clone()))?;
        let bounds = IndexBounds::compound_prefix(IndexKey::String(term.to_lowercase()));
        for (key, record_id) in entry.access().scan(&bounds, true) {
            let score = match &key {
                IndexKey::Compound(parts) => match parts.get(1) {
                    Some(IndexKey::Float(f)) => f.0,
                    Some(IndexKey::Int(i)) => *i as f64,
                    _ => 1.0,
                },
                _ => 1.0,
            };
            *self.scores.entry(record_id).or_insert(0.0) += score;
        }
        Ok(())
    }

    fn start_draining(&mut self) {
        let mut ordered: Vec<(RecordId, f64)> = self.scores.drain().collect();
        // Descending score; record id breaks ties for a stable order.
        ordered.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        self.phase = Phase::Draining { ordered, pos: 0 };
    }
}

impl PlanStage for TextOrStage {
    fn work(&mut self, ws: &mut WorkingSet) -> WorkStatus {
        if self.eof {
            return self.stats.tally(WorkStatus::Eof);
        }
        loop {
            match &mut self.phase {
                Phase::Scanning { next_term } => {
                    if *next_term >= self.terms.len() {
                        self.start_draining();
                        continue;
                    }
                    let term = self.terms[*next_term].clone();
                    *next_term += 1;
                    if let Err(e) = self.scan_term(&term) {
                        let id = ws.make_error(e);
                        return self.stats.tally(WorkStatus::Failure(id));
                    }
                    return self.stats.tally(WorkStatus::NeedTime);
                }
                Phase::Draining { ordered, pos } => {
                    let (record_id, score) = loop {
                        if *pos >= ordered.len() {
                            self.eof = true;
                            return self.stats.tally(WorkStatus::Eof);
                        }
                        let entry = ordered[*pos];
                        *pos += 1;
                        break entry;
                    };
                    let (doc, snapshot) = {
                        let store = self.collection.record_store().read();
                        (store.data_for(record_id), store.snapshot_id())
                    };
                    let mut doc = match doc {
                        Some(doc) => doc,
                        // Deleted between scan and drain.
                        None => return self.stats.tally(WorkStatus::NeedTime),
                    };
                    if let Some(obj) = doc.as_object_mut() {
                        obj.insert("$textScore".to_string(), json!(score));
                    }
                    let id = ws.allocate();
                    let member = ws.get_mut(id);
                    member.state = MemberState::RidAndObj;
                    member.record_id = Some(record_id);
                    member.obj = Some(doc);
                    member.snapshot_id = snapshot;
                    return self.stats.tally(WorkStatus::Advanced(id));
                }
            }
        }
    }

    fn save_state(&mut self) {}

    fn restore_state(&mut self) -> Result<()> {
        Ok(())
    }

    fn invalidate(&mut self, _ws: &mut WorkingSet, record_id: RecordId, kind: InvalidationType) {
        if kind != InvalidationType::Deletion {
            return;
        }
        self.scores.remove(&record_id);
        if let Phase::Draining { ordered, pos } = &mut self.phase {
            // Keep already-emitted entries; drop the pending occurrence.
            if let Some(i) = ordered[*pos..].iter().position(|(rid, _)| *rid == record_id) {
                ordered.remove(*pos + i);
            }
        }
    }

    fn is_eof(&self) -> bool {
        self.eof
    }

    fn stage_type(&self) -> StageType {
        StageType::TextOr
    }

    fn stats(&self) -> PlanStageStats {
        let mut stats = PlanStageStats::new(StageType::TextOr, self.stats.clone());
        stats.specific = Some(format!("index={} terms={:?}", self.index_name, self.terms));
        stats
    }
}
