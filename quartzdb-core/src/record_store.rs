// src/record_store.rs
// Storage-engine collaborator: record CRUD by stable id plus ordered scans.
//
// The execution core consumes this interface only; the on-disk engine is out
// of scope and `MemoryRecordStore` is the supplied backend. Snapshot ids are
// a monotonically increasing write counter: any committed mutation bumps the
// id, which is how readers detect that a cached document may be stale.

use crate::document::serialized_len;
use crate::error::{QuartzError, Result};
use serde_json::Value;
use std::collections::BTreeMap;

/// Stable record identifier. Ids are never reused within one store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordId(pub u64);

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RecordId({})", self.0)
    }
}

/// Scan direction for record cursors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanDirection {
    Forward,
    Backward,
}

/// Outcome of an update: in place when the new payload fits the old slot,
/// relocated to a fresh id otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdatedLocation {
    InPlace(RecordId),
    Moved(RecordId),
}

impl UpdatedLocation {
    pub fn record_id(&self) -> RecordId {
        match self {
            UpdatedLocation::InPlace(id) | UpdatedLocation::Moved(id) => *id,
        }
    }
}

/// Record-level storage interface consumed by the execution core.
pub trait RecordStore: Send + Sync {
    fn insert_record(&mut self, doc: &Value) -> Result<RecordId>;

    /// Update a record. Keeps the id when the new payload is no larger than
    /// the existing slot; otherwise appends at a new id and frees the old
    /// slot. Callers own index maintenance for the move case.
    fn update_record(&mut self, id: RecordId, doc: &Value) -> Result<UpdatedLocation>;

    fn delete_record(&mut self, id: RecordId) -> Result<()>;

    fn data_for(&self, id: RecordId) -> Option<Value>;

    /// Slot capacity of a live record (serialized length at last write).
    fn record_len(&self, id: RecordId) -> Option<usize>;

    fn num_records(&self) -> u64;

    /// Materialize the id sequence in storage order. Forward order is
    /// insertion order for this backend.
    fn record_ids(&self, direction: ScanDirection) -> Vec<RecordId>;

    /// Cursor step: the first live record strictly past `after` in the
    /// given direction, or the first record overall when `after` is None.
    /// The position survives concurrent inserts and deletes, which is what
    /// scans resume from after a yield.
    fn next_record(&self, after: Option<RecordId>, direction: ScanDirection) -> Option<RecordId>;

    fn is_capped(&self) -> bool;

    /// Monotonic write counter; bumped by every committed mutation.
    fn snapshot_id(&self) -> u64;

    /// Fail-point hook: make the next `n` mutations fail with a write
    /// conflict, standing in for optimistic-concurrency collisions.
    fn inject_write_conflicts(&mut self, n: u32);
}

struct StoredRecord {
    data: Vec<u8>,
    /// Slot capacity; grows only when the record is rewritten in place.
    slot_len: usize,
}

/// In-memory record store. Forward scan order is insertion order because ids
/// are allocated monotonically and held in a BTreeMap.
pub struct MemoryRecordStore {
    records: BTreeMap<RecordId, StoredRecord>,
    next_id: u64,
    snapshot: u64,
    capped: bool,
    pending_conflicts: u32,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        MemoryRecordStore {
            records: BTreeMap::new(),
            next_id: 1,
            snapshot: 0,
            capped: false,
            pending_conflicts: 0,
        }
    }

    pub fn new_capped() -> Self {
        MemoryRecordStore {
            capped: true,
            ..Self::new()
        }
    }

    fn check_conflict(&mut self, what: &str) -> Result<()> {
        if self.pending_conflicts > 0 {
            self.pending_conflicts -= 1;
            return Err(QuartzError::WriteConflict(format!(
                "injected conflict during {}",
                what
            )));
        }
        Ok(())
    }

    fn encode(doc: &Value) -> Result<Vec<u8>> {
        serde_json::to_vec(doc).map_err(|e| QuartzError::Serialization(e.to_string()))
    }
}

impl Default for MemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordStore for MemoryRecordStore {
    fn insert_record(&mut self, doc: &Value) -> Result<RecordId> {
        self.check_conflict("insert")?;
        let data = Self::encode(doc)?;
        let id = RecordId(self.next_id);
        self.next_id += 1;
        let slot_len = data.len();
        self.records.insert(id, StoredRecord { data, slot_len });
        self.snapshot += 1;
        Ok(id)
    }

    fn update_record(&mut self, id: RecordId, doc: &Value) -> Result<UpdatedLocation> {
        self.check_conflict("update")?;
        let new_len = serialized_len(doc);
        let slot_len = match self.records.get(&id) {
            Some(rec) => rec.slot_len,
            None => {
                return Err(QuartzError::DocumentNotFound(format!(
                    "{} not present in record store",
                    id
                )))
            }
        };

        if new_len <= slot_len {
            let data = Self::encode(doc)?;
            let rec = self.records.get_mut(&id).expect("record checked above");
            rec.data = data;
            self.snapshot += 1;
            Ok(UpdatedLocation::InPlace(id))
        } else {
            // Does not fit: append fresh, then free the old slot.
            let new_id = self.insert_record(doc)?;
            self.records.remove(&id);
            self.snapshot += 1;
            Ok(UpdatedLocation::Moved(new_id))
        }
    }

    fn delete_record(&mut self, id: RecordId) -> Result<()> {
        self.check_conflict("delete")?;
        if self.records.remove(&id).is_none() {
            return Err(QuartzError::DocumentNotFound(format!(
                "{} not present in record store",
                id
            )));
        }
        self.snapshot += 1;
        Ok(())
    }

    fn data_for(&self, id: RecordId) -> Option<Value> {
        self.records
            .get(&id)
            .and_then(|rec| serde_json::from_slice(&rec.data).ok())
    }

    fn record_len(&self, id: RecordId) -> Option<usize> {
        self.records.get(&id).map(|rec| rec.slot_len)
    }

    fn num_records(&self) -> u64 {
        self.records.len() as u64
    }

    fn record_ids(&self, direction: ScanDirection) -> Vec<RecordId> {
        match direction {
            ScanDirection::Forward => self.records.keys().copied().collect(),
            ScanDirection::Backward => self.records.keys().rev().copied().collect(),
        }
    }

    fn next_record(&self, after: Option<RecordId>, direction: ScanDirection) -> Option<RecordId> {
        use std::ops::Bound;
        match direction {
            ScanDirection::Forward => {
                let lower = match after {
                    Some(id) => Bound::Excluded(id),
                    None => Bound::Unbounded,
                };
                self.records
                    .range((lower, Bound::Unbounded))
                    .next()
                    .map(|(id, _)| *id)
            }
            ScanDirection::Backward => {
                let upper = match after {
                    Some(id) => Bound::Excluded(id),
                    None => Bound::Unbounded,
                };
                self.records
                    .range((Bound::Unbounded, upper))
                    .next_back()
                    .map(|(id, _)| *id)
            }
        }
    }

    fn is_capped(&self) -> bool {
        self.capped
    }

    fn snapshot_id(&self) -> u64 {
        self.snapshot
    }

    fn inject_write_conflicts(&mut self, n: u32) {
        self.pending_conflicts = n;
    }
}
