// src/index_access.rs
// Index access methods: sorted key -> record id containers with a two-phase
// update protocol (validate, then commit) so a duplicate-key failure aborts
// an update before anything is physically changed.

use crate::error::{QuartzError, Result};
use crate::index_key::IndexKey;
use crate::record_store::RecordId;
use std::collections::{BTreeMap, BTreeSet};

/// Inclusive/exclusive key range for index scans.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexBounds {
    pub start: IndexKey,
    pub end: IndexKey,
    pub start_inclusive: bool,
    pub end_inclusive: bool,
}

impl IndexBounds {
    pub fn all() -> Self {
        IndexBounds {
            start: IndexKey::MinKey,
            end: IndexKey::MaxKey,
            start_inclusive: true,
            end_inclusive: true,
        }
    }

    pub fn point(key: IndexKey) -> Self {
        IndexBounds {
            start: key.clone(),
            end: key,
            start_inclusive: true,
            end_inclusive: true,
        }
    }

    /// Bounds covering every compound key whose first element equals `prefix`.
    pub fn compound_prefix(prefix: IndexKey) -> Self {
        IndexBounds {
            start: IndexKey::Compound(vec![prefix.clone(), IndexKey::MinKey]),
            end: IndexKey::Compound(vec![prefix, IndexKey::MaxKey]),
            start_inclusive: true,
            end_inclusive: true,
        }
    }

    fn contains(&self, key: &IndexKey) -> bool {
        let after_start = match key.cmp(&self.start) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Equal => self.start_inclusive,
            std::cmp::Ordering::Less => false,
        };
        let before_end = match key.cmp(&self.end) {
            std::cmp::Ordering::Less => true,
            std::cmp::Ordering::Equal => self.end_inclusive,
            std::cmp::Ordering::Greater => false,
        };
        after_start && before_end
    }
}

/// Precomputed key diff for one document update on one index.
///
/// Produced by `validate_update` before any physical mutation; committed by
/// `update`. The duplicate-key pre-check happens at validation time so a
/// failing update leaves storage untouched.
#[derive(Debug, Clone)]
pub struct UpdateTicket {
    pub record_id: RecordId,
    pub removed: Vec<IndexKey>,
    pub added: Vec<IndexKey>,
    pub made_multikey: bool,
}

/// Storage-engine index interface consumed by the catalog.
pub trait IndexAccessMethod: Send + Sync {
    /// Insert the key set of one document. A `(key, record_id)` pair that is
    /// already present is skipped (idempotent, which background build
    /// population relies on). Unique indexes reject a key held by a
    /// different record.
    fn insert(&mut self, keys: &BTreeSet<IndexKey>, record_id: RecordId) -> Result<()>;

    /// Remove the key set of one document. Missing entries are ignored.
    fn remove(&mut self, keys: &BTreeSet<IndexKey>, record_id: RecordId);

    /// Phase one of an update: diff old/new key sets and pre-check unique
    /// constraints. No mutation.
    fn validate_update(
        &self,
        old_keys: &BTreeSet<IndexKey>,
        new_keys: &BTreeSet<IndexKey>,
        record_id: RecordId,
    ) -> Result<UpdateTicket>;

    /// Phase two: apply a previously validated ticket.
    fn apply_update(&mut self, ticket: &UpdateTicket) -> Result<()>;

    /// Materialize the `(key, record_id)` pairs within bounds, in key order.
    fn scan(&self, bounds: &IndexBounds, forward: bool) -> Vec<(IndexKey, RecordId)>;

    /// Record ids holding an exact key.
    fn lookup(&self, key: &IndexKey) -> Vec<RecordId>;

    fn num_entries(&self) -> u64;

    fn is_unique(&self) -> bool;
}

/// In-memory ordered index.
pub struct BTreeAccessMethod {
    unique: bool,
    entries: BTreeMap<IndexKey, Vec<RecordId>>,
    num_entries: u64,
}

impl BTreeAccessMethod {
    pub fn new(unique: bool) -> Self {
        BTreeAccessMethod {
            unique,
            entries: BTreeMap::new(),
            num_entries: 0,
        }
    }

    fn unique_violation(&self, key: &IndexKey, record_id: RecordId) -> Option<QuartzError> {
        if !self.unique {
            return None;
        }
        match self.entries.get(key) {
            Some(rids) if rids.iter().any(|r| *r != record_id) => Some(QuartzError::DuplicateKey(
                format!("key {:?} already indexed", key),
            )),
            _ => None,
        }
    }

    fn insert_one(&mut self, key: &IndexKey, record_id: RecordId) {
        let rids = self.entries.entry(key.clone()).or_default();
        if !rids.contains(&record_id) {
            rids.push(record_id);
            self.num_entries += 1;
        }
    }

    fn remove_one(&mut self, key: &IndexKey, record_id: RecordId) {
        if let Some(rids) = self.entries.get_mut(key) {
            let before = rids.len();
            rids.retain(|r| *r != record_id);
            self.num_entries -= (before - rids.len()) as u64;
            if rids.is_empty() {
                self.entries.remove(key);
            }
        }
    }
}

impl IndexAccessMethod for BTreeAccessMethod {
    fn insert(&mut self, keys: &BTreeSet<IndexKey>, record_id: RecordId) -> Result<()> {
        // Validate the whole key set first so a failure inserts nothing.
        for key in keys {
            if let Some(err) = self.unique_violation(key, record_id) {
                return Err(err);
            }
        }
        for key in keys {
            self.insert_one(key, record_id);
        }
        Ok(())
    }

    fn remove(&mut self, keys: &BTreeSet<IndexKey>, record_id: RecordId) {
        for key in keys {
            self.remove_one(key, record_id);
        }
    }

    fn validate_update(
        &self,
        old_keys: &BTreeSet<IndexKey>,
        new_keys: &BTreeSet<IndexKey>,
        record_id: RecordId,
    ) -> Result<UpdateTicket> {
        let removed: Vec<IndexKey> = old_keys.difference(new_keys).cloned().collect();
        let added: Vec<IndexKey> = new_keys.difference(old_keys).cloned().collect();

        for key in &added {
            if let Some(err) = self.unique_violation(key, record_id) {
                return Err(err);
            }
        }

        Ok(UpdateTicket {
            record_id,
            removed,
            added,
            made_multikey: new_keys.len() > 1,
        })
    }

    fn apply_update(&mut self, ticket: &UpdateTicket) -> Result<()> {
        // Re-check uniqueness: the ticket may have been validated under an
        // earlier snapshot.
        for key in &ticket.added {
            if let Some(err) = self.unique_violation(key, ticket.record_id) {
                return Err(err);
            }
        }
        for key in &ticket.removed {
            self.remove_one(key, ticket.record_id);
        }
        for key in &ticket.added {
            self.insert_one(key, ticket.record_id);
        }
        Ok(())
    }

    fn scan(&self, bounds: &IndexBounds, forward: bool) -> Vec<(IndexKey, RecordId)> {
        let mut out = Vec::new();
        for (key, rids) in &self.entries {
            if bounds.contains(key) {
                for rid in rids {
                    out.push((key.clone(), *rid));
                }
            }
        }
        if !forward {
            out.reverse();
        }
        out
    }

    fn lookup(&self, key: &IndexKey) -> Vec<RecordId> {
        self.entries.get(key).cloned().unwrap_or_default()
    }

    fn num_entries(&self) -> u64 {
        self.num_entries
    }

    fn is_unique(&self) -> bool {
        self.unique
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(items: &[IndexKey]) -> BTreeSet<IndexKey> {
        items.iter().cloned().collect()
    }

    #[test]
    fn test_insert_lookup_remove() {
        let mut idx = BTreeAccessMethod::new(false);
        idx.insert(&keys(&[IndexKey::Int(1)]), RecordId(10)).unwrap();
        idx.insert(&keys(&[IndexKey::Int(1)]), RecordId(11)).unwrap();
        assert_eq!(idx.lookup(&IndexKey::Int(1)), vec![RecordId(10), RecordId(11)]);
        assert_eq!(idx.num_entries(), 2);

        idx.remove(&keys(&[IndexKey::Int(1)]), RecordId(10));
        assert_eq!(idx.lookup(&IndexKey::Int(1)), vec![RecordId(11)]);
        assert_eq!(idx.num_entries(), 1);
    }

    #[test]
    fn test_unique_rejects_second_record() {
        let mut idx = BTreeAccessMethod::new(true);
        idx.insert(&keys(&[IndexKey::Int(1)]), RecordId(10)).unwrap();
        let err = idx.insert(&keys(&[IndexKey::Int(1)]), RecordId(11)).unwrap_err();
        assert!(matches!(err, QuartzError::DuplicateKey(_)));
        // Nothing from the failed set was applied.
        assert_eq!(idx.num_entries(), 1);
    }

    #[test]
    fn test_insert_idempotent_for_same_record() {
        let mut idx = BTreeAccessMethod::new(true);
        idx.insert(&keys(&[IndexKey::Int(1)]), RecordId(10)).unwrap();
        // Background-build population may re-insert keys already applied by
        // a concurrent writer.
        idx.insert(&keys(&[IndexKey::Int(1)]), RecordId(10)).unwrap();
        assert_eq!(idx.num_entries(), 1);
    }

    #[test]
    fn test_validate_update_precheck_leaves_index_untouched() {
        let mut idx = BTreeAccessMethod::new(true);
        idx.insert(&keys(&[IndexKey::Int(1)]), RecordId(10)).unwrap();
        idx.insert(&keys(&[IndexKey::Int(2)]), RecordId(11)).unwrap();

        // Moving record 11 onto key 1 collides with record 10.
        let err = idx
            .validate_update(&keys(&[IndexKey::Int(2)]), &keys(&[IndexKey::Int(1)]), RecordId(11))
            .unwrap_err();
        assert!(matches!(err, QuartzError::DuplicateKey(_)));
        assert_eq!(idx.lookup(&IndexKey::Int(2)), vec![RecordId(11)]);
    }

    #[test]
    fn test_validate_then_apply_update() {
        let mut idx = BTreeAccessMethod::new(false);
        idx.insert(&keys(&[IndexKey::Int(1), IndexKey::Int(2)]), RecordId(10))
            .unwrap();

        let ticket = idx
            .validate_update(
                &keys(&[IndexKey::Int(1), IndexKey::Int(2)]),
                &keys(&[IndexKey::Int(2), IndexKey::Int(3)]),
                RecordId(10),
            )
            .unwrap();
        assert_eq!(ticket.removed, vec![IndexKey::Int(1)]);
        assert_eq!(ticket.added, vec![IndexKey::Int(3)]);

        idx.apply_update(&ticket).unwrap();
        assert!(idx.lookup(&IndexKey::Int(1)).is_empty());
        assert_eq!(idx.lookup(&IndexKey::Int(3)), vec![RecordId(10)]);
        assert_eq!(idx.num_entries(), 2);
    }

    #[test]
    fn test_scan_bounds_and_direction() {
        let mut idx = BTreeAccessMethod::new(false);
        for i in 0..10 {
            idx.insert(&keys(&[IndexKey::Int(i)]), RecordId(100 + i as u64))
                .unwrap();
        }
        let bounds = IndexBounds {
            start: IndexKey::Int(3),
            end: IndexKey::Int(6),
            start_inclusive: true,
            end_inclusive: false,
        };
        let fwd = idx.scan(&bounds, true);
        assert_eq!(
            fwd.iter().map(|(k, _)| k.clone()).collect::<Vec<_>>(),
            vec![IndexKey::Int(3), IndexKey::Int(4), IndexKey::Int(5)]
        );
        let bwd = idx.scan(&bounds, false);
        assert_eq!(bwd[0].0, IndexKey::Int(5));
    }

    #[test]
    fn test_compound_prefix_bounds() {
        let mut idx = BTreeAccessMethod::new(false);
        let mk = |t: &str, s: f64| {
            IndexKey::Compound(vec![
                IndexKey::String(t.into()),
                IndexKey::Float(crate::index_key::OrderedFloat(s)),
            ])
        };
        idx.insert(&keys(&[mk("fox", 1.0)]), RecordId(1)).unwrap();
        idx.insert(&keys(&[mk("fox", 2.0)]), RecordId(2)).unwrap();
        idx.insert(&keys(&[mk("owl", 1.0)]), RecordId(3)).unwrap();

        let bounds = IndexBounds::compound_prefix(IndexKey::String("fox".into()));
        let hits = idx.scan(&bounds, true);
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|(_, r)| *r != RecordId(3)));
    }
}
