// src/plan_cache.rs
// Per-collection cache of winning plans, keyed by query shape. A shape is
// the filter with literals stripped to their paths and operators, so
// `{a: {$gt: 1}}` and `{a: {$gt: 99}}` share an entry. Writes count against
// the cache; enough of them clears it so plans get re-evaluated against the
// changed data.

use ahash::AHasher;
use lru::LruCache;
use parking_lot::Mutex;
use serde_json::Value;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};

const CACHE_CAPACITY: NonZeroUsize = match NonZeroUsize::new(512) {
    Some(n) => n,
    None => unreachable!(),
};
/// Writes tolerated before cached plans are considered stale.
const WRITE_OPS_BEFORE_CLEAR: u64 = 1000;

#[derive(Debug, Clone, PartialEq)]
pub struct CachedSolution {
    /// Winning index, or None when a collection scan won the trial.
    pub index_name: Option<String>,
    /// Advances the winner produced during its trial, kept for diagnostics.
    pub works: u64,
}

pub struct PlanCache {
    entries: Mutex<LruCache<u64, CachedSolution>>,
    writes_since_clear: AtomicU64,
}

impl PlanCache {
    pub fn new() -> Self {
        PlanCache {
            entries: Mutex::new(LruCache::new(CACHE_CAPACITY)),
            writes_since_clear: AtomicU64::new(0),
        }
    }

    /// Stable hash of a filter's shape.
    pub fn shape_key(filter: &Value) -> u64 {
        let mut hasher = AHasher::default();
        hash_shape(filter, &mut hasher);
        hasher.finish()
    }

    pub fn lookup(&self, key: u64) -> Option<CachedSolution> {
        self.entries.lock().get(&key).cloned()
    }

    pub fn set(&self, key: u64, solution: CachedSolution) {
        self.entries.lock().put(key, solution);
    }

    /// Evict one entry after its cached plan underperformed at replay time.
    pub fn remove(&self, key: u64) {
        self.entries.lock().pop(&key);
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Called by the write path on every insert, update and delete.
    pub fn notify_of_write_op(&self) {
        let n = self.writes_since_clear.fetch_add(1, Ordering::Relaxed) + 1;
        if n >= WRITE_OPS_BEFORE_CLEAR {
            self.writes_since_clear.store(0, Ordering::Relaxed);
            self.clear();
        }
    }
}

impl Default for PlanCache {
    fn default() -> Self {
        Self::new()
    }
}

fn hash_shape(filter: &Value, hasher: &mut AHasher) {
    match filter {
        Value::Object(map) => {
            hasher.write_u8(b'{');
            for (key, value) in map {
                key.hash(hasher);
                if key.starts_with('$') && value.is_array() {
                    // Logical branches: recurse, their shape matters.
                    if let Value::Array(branches) = value {
                        for branch in branches {
                            hash_shape(branch, hasher);
                        }
                    }
                } else if let Value::Object(ops) = value {
                    if ops.keys().any(|k| k.starts_with('$')) {
                        // Operator object: hash operator names, drop operands.
                        hasher.write_u8(b'(');
                        for op in ops.keys() {
                            op.hash(hasher);
                        }
                        hasher.write_u8(b')');
                    } else {
                        hasher.write_u8(b'=');
                    }
                } else {
                    // Literal equality: the shape records "eq on this path".
                    hasher.write_u8(b'=');
                }
            }
            hasher.write_u8(b'}');
        }
        _ => {
            hasher.write_u8(b'!');
        }
    }
}
