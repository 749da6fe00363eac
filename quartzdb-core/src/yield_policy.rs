// src/yield_policy.rs
// When and how an executor gives up its locks mid-query. The yield point is
// the only place a running plan can be suspended, so kill checks and
// invalidation draining hang off the same machinery.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum YieldPolicyKind {
    /// Never release anything. Used under an already-held exclusive lock.
    NoYield,
    /// No periodic yields, but transient write conflicts save and restore
    /// the plan before retrying.
    WriteConflictRetryOnly,
    /// Periodic yields after a work budget or elapsed interval.
    YieldAuto,
    /// Test policy: every yield point reports a time limit overrun.
    AlwaysTimeOut,
    /// Test policy: every yield point reports the plan killed.
    AlwaysMarkKilled,
}

const WORKS_BETWEEN_YIELDS: u32 = 128;
const YIELD_INTERVAL: Duration = Duration::from_millis(10);

/// Tracks the work budget between yields for one executor.
pub struct YieldTracker {
    kind: YieldPolicyKind,
    works_since_yield: u32,
    last_yield: Instant,
    force_next: bool,
}

impl YieldTracker {
    pub fn new(kind: YieldPolicyKind) -> Self {
        YieldTracker {
            kind,
            works_since_yield: 0,
            last_yield: Instant::now(),
            force_next: false,
        }
    }

    pub fn kind(&self) -> YieldPolicyKind {
        self.kind
    }

    /// Whether the executor releases locks at yield points. Kill statuses
    /// are only deliverable to executors that do.
    pub fn can_release_locks(&self) -> bool {
        matches!(
            self.kind,
            YieldPolicyKind::YieldAuto
                | YieldPolicyKind::AlwaysTimeOut
                | YieldPolicyKind::AlwaysMarkKilled
        )
    }

    pub fn can_auto_yield(&self) -> bool {
        self.can_release_locks()
    }

    /// Called once per work cycle. True when a yield is due.
    pub fn should_yield(&mut self) -> bool {
        if !self.can_auto_yield() {
            return false;
        }
        if self.force_next {
            return true;
        }
        self.works_since_yield += 1;
        self.works_since_yield >= WORKS_BETWEEN_YIELDS
            || self.last_yield.elapsed() >= YIELD_INTERVAL
    }

    /// Request a yield at the next opportunity regardless of budget, e.g.
    /// after a stage reports NEED_YIELD.
    pub fn force_yield(&mut self) {
        self.force_next = true;
    }

    pub fn reset(&mut self) {
        self.works_since_yield = 0;
        self.last_yield = Instant::now();
        self.force_next = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_yield_never_yields() {
        let mut tracker = YieldTracker::new(YieldPolicyKind::NoYield);
        for _ in 0..WORKS_BETWEEN_YIELDS * 2 {
            assert!(!tracker.should_yield());
        }
        assert!(!tracker.can_release_locks());
    }

    #[test]
    fn test_auto_yields_after_work_budget() {
        let mut tracker = YieldTracker::new(YieldPolicyKind::YieldAuto);
        let mut yielded = false;
        for _ in 0..WORKS_BETWEEN_YIELDS + 1 {
            if tracker.should_yield() {
                yielded = true;
                break;
            }
        }
        assert!(yielded);
    }

    #[test]
    fn test_force_yield() {
        let mut tracker = YieldTracker::new(YieldPolicyKind::YieldAuto);
        tracker.reset();
        tracker.force_yield();
        assert!(tracker.should_yield());
        tracker.reset();
        assert!(!tracker.should_yield());
    }

    #[test]
    fn test_write_conflict_retry_only_holds_locks() {
        let tracker = YieldTracker::new(YieldPolicyKind::WriteConflictRetryOnly);
        assert!(!tracker.can_release_locks());
    }
}
