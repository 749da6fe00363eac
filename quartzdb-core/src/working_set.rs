// src/working_set.rs
// Shared value arena for one execution tree. Stages hand each other small
// integer ids instead of moving documents through return values; the member
// behind an id carries the record location, index key data, or the fetched
// document depending on how far down the pipeline it has traveled.

use crate::error::QuartzError;
use crate::index_key::IndexKey;
use crate::record_store::RecordId;
use serde_json::Value;

pub type WorkingSetId = usize;

/// Sentinel for "no member". Used by statuses that carry an optional id.
pub const INVALID_ID: WorkingSetId = usize::MAX;

/// How much of the member is populated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberState {
    /// Record id plus the index key that produced it; no document yet.
    RidAndIdx,
    /// Record id plus the fetched document.
    RidAndObj,
    /// Document only, detached from any record (stashed or computed).
    OwnedObj,
}

/// One index key observed on the way to a member, tagged with the index
/// that produced it. Covered plans read these instead of fetching.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexKeyDatum {
    pub index_name: String,
    pub key: IndexKey,
}

#[derive(Debug, Clone)]
pub struct WorkingSetMember {
    pub state: MemberState,
    pub record_id: Option<RecordId>,
    pub key_data: Vec<IndexKeyDatum>,
    pub obj: Option<Value>,
    /// Storage snapshot the document was read under. A fetch after yielding
    /// compares this against the store's current snapshot to decide whether
    /// the member needs re-validation.
    pub snapshot_id: u64,
    /// Error payload for members flagged by a failing stage.
    pub status: Option<QuartzError>,
}

impl WorkingSetMember {
    fn new() -> Self {
        WorkingSetMember {
            state: MemberState::OwnedObj,
            record_id: None,
            key_data: Vec::new(),
            obj: None,
            snapshot_id: 0,
            status: None,
        }
    }

    pub fn has_obj(&self) -> bool {
        self.obj.is_some()
    }

    /// Drop the record association, keeping the document. Called when the
    /// underlying record is deleted while the member is in flight.
    pub fn make_obj_owned(&mut self) {
        debug_assert!(self.obj.is_some());
        self.state = MemberState::OwnedObj;
        self.record_id = None;
        self.key_data.clear();
    }
}

enum Slot {
    Occupied(WorkingSetMember),
    Free { next_free: Option<usize> },
}

/// Slab of members with an intrusive free list. Ids are reused after
/// `free`, so stages must not touch ids they have released.
pub struct WorkingSet {
    slots: Vec<Slot>,
    free_head: Option<usize>,
}

impl WorkingSet {
    pub fn new() -> Self {
        WorkingSet {
            slots: Vec::new(),
            free_head: None,
        }
    }

    pub fn allocate(&mut self) -> WorkingSetId {
        match self.free_head {
            Some(id) => {
                let next = match &self.slots[id] {
                    Slot::Free { next_free } => *next_free,
                    Slot::Occupied(_) => unreachable!("free list points at occupied slot"),
                };
                self.free_head = next;
                self.slots[id] = Slot::Occupied(WorkingSetMember::new());
                id
            }
            None => {
                self.slots.push(Slot::Occupied(WorkingSetMember::new()));
                self.slots.len() - 1
            }
        }
    }

    pub fn get(&self, id: WorkingSetId) -> &WorkingSetMember {
        match &self.slots[id] {
            Slot::Occupied(member) => member,
            Slot::Free { .. } => panic!("working set id {} used after free", id),
        }
    }

    pub fn get_mut(&mut self, id: WorkingSetId) -> &mut WorkingSetMember {
        match &mut self.slots[id] {
            Slot::Occupied(member) => member,
            Slot::Free { .. } => panic!("working set id {} used after free", id),
        }
    }

    pub fn free(&mut self, id: WorkingSetId) {
        debug_assert!(matches!(self.slots[id], Slot::Occupied(_)));
        self.slots[id] = Slot::Free {
            next_free: self.free_head,
        };
        self.free_head = Some(id);
    }

    /// Allocate a member that carries only an error status. Failing stages
    /// return the id so the executor can surface the payload.
    pub fn make_error(&mut self, error: QuartzError) -> WorkingSetId {
        let id = self.allocate();
        self.get_mut(id).status = Some(error);
        id
    }

    /// Ids of live members that still reference a record, for invalidation
    /// sweeps over in-flight state.
    pub fn occupied_with_record(&self, record_id: RecordId) -> Vec<WorkingSetId> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| match slot {
                Slot::Occupied(m) if m.record_id == Some(record_id) => Some(i),
                _ => None,
            })
            .collect()
    }

    #[cfg(test)]
    fn num_occupied(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| matches!(s, Slot::Occupied(_)))
            .count()
    }
}

impl Default for WorkingSet {
    fn default() -> Self {
        Self::new()
    }
}
