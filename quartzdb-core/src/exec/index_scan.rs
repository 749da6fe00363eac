// src/exec/index_scan.rs
// Bounded walk over one index. Emits members in key order, one entry per
// work() call, deduplicating record ids so multikey fan-out never returns
// the same document twice.

use crate::collection::Collection;
use crate::cursor_manager::InvalidationType;
use crate::error::{QuartzError, Result};
use crate::exec::{CommonStats, PlanStage, PlanStageStats, StageType, WorkStatus};
use crate::index_access::IndexBounds;
use crate::index_key::IndexKey;
use crate::record_store::RecordId;
use crate::working_set::{IndexKeyDatum, MemberState, WorkingSet};
use std::collections::HashSet;
use std::sync::Arc;

pub struct IndexScanStage {
    collection: Arc<Collection>,
    index_name: String,
    bounds: IndexBounds,
    forward: bool,
    /// Entries not yet emitted, loaded on first work and reloaded on
    /// restore. Front of the queue is the next entry.
    pending: Option<Vec<(IndexKey, RecordId)>>,
    last_emitted: Option<(IndexKey, RecordId)>,
    returned: HashSet<RecordId>,
    eof: bool,
    stats: CommonStats,
}

impl IndexScanStage {
    pub fn new(
        collection: Arc<Collection>,
        index_name: &str,
        bounds: IndexBounds,
        forward: bool,
    ) -> Self {
        IndexScanStage {
            collection,
            index_name: index_name.to_string(),
            bounds,
            forward,
            pending: None,
            last_emitted: None,
            returned: HashSet::new(),
            eof: false,
            stats: CommonStats::default(),
        }
    }

    fn load_pending(&mut self) -> Result<Vec<(IndexKey, RecordId)>> {
        let catalog = self.collection.index_catalog().read();
        let entry = catalog
            .find_index_by_name(&self.index_name, false)
            .ok_or_else(|| QuartzError::IndexNotFound(self.index_name.clone()))?;
        let mut entries = entry.access().scan(&self.bounds, self.forward);
        // Skip everything at or before the resume point.
        if let Some(last) = &self.last_emitted {
            let pos = entries.iter().position(|e| e == last);
            match pos {
                Some(i) => entries.drain(..=i),
                // The resume entry vanished; keep only entries past it in
                // scan order.
                None => {
                    let keep_from = entries
                        .iter()
                        .position(|(k, _)| {
                            if self.forward {
                                *k > last.0
                            } else {
                                *k < last.0
                            }
                        })
                        .unwrap_or(entries.len());
                    entries.drain(..keep_from)
                }
            };
        }
        Ok(entries)
    }
}

impl PlanStage for IndexScanStage {
    fn work(&mut self, ws: &mut WorkingSet) -> WorkStatus {
        if self.eof {
            return self.stats.tally(WorkStatus::Eof);
        }
        if self.pending.is_none() {
            match self.load_pending() {
                Ok(entries) => self.pending = Some(entries),
                Err(e) => {
                    let id = ws.make_error(e);
                    return self.stats.tally(WorkStatus::Failure(id));
                }
            }
        }

        let pending = self.pending.as_mut().expect("loaded above");
        let (key, record_id) = loop {
            match pending.first() {
                None => {
                    self.eof = true;
                    return self.stats.tally(WorkStatus::Eof);
                }
                Some(_) => {
                    let entry = pending.remove(0);
                    self.last_emitted = Some(entry.clone());
                    if self.returned.insert(entry.1) {
                        break entry;
                    }
                    // Duplicate rid from multikey fan-out.
                    return self.stats.tally(WorkStatus::NeedTime);
                }
            }
        };

        let snapshot = self.collection.record_store().read().snapshot_id();
        let id = ws.allocate();
        let member = ws.get_mut(id);
        member.state = MemberState::RidAndIdx;
        member.record_id = Some(record_id);
        member.key_data.push(IndexKeyDatum {
            index_name: self.index_name.clone(),
            key,
        });
        member.snapshot_id = snapshot;
        self.stats.tally(WorkStatus::Advanced(id))
    }

    fn save_state(&mut self) {
        // Drop the materialized entries; restore rebuilds them from the
        // live index past the resume point.
        self.pending = None;
    }

    fn restore_state(&mut self) -> Result<()> {
        if !self.eof {
            self.pending = Some(self.load_pending()?);
        }
        Ok(())
    }

    fn invalidate(&mut self, _ws: &mut WorkingSet, record_id: RecordId, kind: InvalidationType) {
        if kind == InvalidationType::Deletion {
            if let Some(pending) = &mut self.pending {
                pending.retain(|(_, rid)| *rid != record_id);
            }
        }
    }

    fn is_eof(&self) -> bool {
        self.eof
    }

    fn stage_type(&self) -> StageType {
        StageType::IndexScan
    }

    fn stats(&self) -> PlanStageStats {
        let mut stats = PlanStageStats::new(StageType::IndexScan, self.stats.clone());
        stats.specific = Some(format!("index={} forward={}", self.index_name, self.forward));
        stats
    }
}
