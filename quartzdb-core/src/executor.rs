// src/executor.rs
// Drives a stage tree to completion. The executor owns the working set and
// the root stage, enforces the lifecycle (usable, saved, detached,
// disposed), delivers kill notices and invalidations at its only safe
// suspension point, and implements the tailable awaitData wait against the
// capped-insert notifier.

use crate::collection::Collection;
use crate::cursor_manager::KillHandle;
use crate::error::{QuartzError, Result};
use crate::exec::{PlanStage, PlanStageStats, WorkStatus};
use crate::log_trace;
use crate::working_set::{WorkingSet, WorkingSetId};
use crate::yield_policy::{YieldPolicyKind, YieldTracker};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LifecycleState {
    Usable,
    Saved,
    Detached,
    Disposed,
}

pub struct PlanExecutor {
    collection: Arc<Collection>,
    root: Box<dyn PlanStage>,
    ws: WorkingSet,
    tracker: YieldTracker,
    state: LifecycleState,
    /// Results pushed back by the caller, returned ahead of the plan.
    stash: VecDeque<Value>,
    /// Present when the yield policy releases locks; that is the only mode
    /// in which external kills can reach a running plan.
    registration: Option<(u64, Arc<KillHandle>)>,
    /// First kill reason observed; terminal once set.
    killed: Option<QuartzError>,
    /// awaitData timeout for tailable plans.
    await_data_timeout: Option<Duration>,
}

impl PlanExecutor {
    pub fn new(
        collection: Arc<Collection>,
        mut root: Box<dyn PlanStage>,
        yield_policy: YieldPolicyKind,
    ) -> Result<Self> {
        let tracker = YieldTracker::new(yield_policy);
        let registration = if tracker.can_release_locks() {
            Some(collection.cursor_manager().register())
        } else {
            None
        };
        let mut ws = WorkingSet::new();
        root.pick_best_plan(&mut ws)?;
        Ok(PlanExecutor {
            collection,
            root,
            ws,
            tracker,
            state: LifecycleState::Usable,
            stash: VecDeque::new(),
            registration,
            killed: None,
            await_data_timeout: None,
        })
    }

    /// Enable the awaitData wait on EOF for tailable plans.
    pub fn await_data(mut self, timeout: Duration) -> Self {
        self.await_data_timeout = Some(timeout);
        self
    }

    pub fn collection(&self) -> &Arc<Collection> {
        &self.collection
    }

    pub fn is_eof(&self) -> bool {
        self.stash.is_empty() && self.root.is_eof()
    }

    pub fn get_stats(&self) -> PlanStageStats {
        self.root.stats()
    }

    // ---- lifecycle ----

    /// Park the executor ahead of releasing locks. get_next is forbidden
    /// until restore_state.
    pub fn save_state(&mut self) {
        if self.state == LifecycleState::Usable {
            self.root.save_state();
            self.state = LifecycleState::Saved;
        }
    }

    pub fn restore_state(&mut self) -> Result<()> {
        self.check_not_disposed()?;
        self.deliver_invalidations();
        self.check_kill()?;
        self.root.restore_state()?;
        self.state = LifecycleState::Usable;
        Ok(())
    }

    /// Release the executor from its collection, for cursors that outlive
    /// one operation. Only reattach_to makes it usable again.
    pub fn detach_from_collection(&mut self) {
        if self.state != LifecycleState::Disposed {
            self.root.save_state();
            self.state = LifecycleState::Detached;
        }
    }

    pub fn reattach_to_collection(&mut self) -> Result<()> {
        if self.state != LifecycleState::Detached {
            return Err(QuartzError::Internal(
                "reattach on an executor that is not detached".into(),
            ));
        }
        self.deliver_invalidations();
        self.check_kill()?;
        self.root.restore_state()?;
        self.state = LifecycleState::Usable;
        Ok(())
    }

    /// Terminal: deregister and refuse all further use. Idempotent.
    pub fn dispose(&mut self) {
        if self.state == LifecycleState::Disposed {
            return;
        }
        if let Some((id, _)) = self.registration.take() {
            self.collection.cursor_manager().deregister(id);
        }
        self.state = LifecycleState::Disposed;
    }

    fn check_not_disposed(&self) -> Result<()> {
        if self.state == LifecycleState::Disposed {
            return Err(QuartzError::Internal(
                "operation on a disposed executor".into(),
            ));
        }
        Ok(())
    }

    // ---- kill and invalidation plumbing ----

    fn deliver_invalidations(&mut self) {
        if let Some((_, handle)) = &self.registration {
            for (record_id, kind) in handle.drain_invalidations() {
                log_trace!("delivering invalidation {:?} for {}", kind, record_id);
                self.root.invalidate(&mut self.ws, record_id, kind);
            }
        }
    }

    fn check_kill(&mut self) -> Result<()> {
        if self.killed.is_none() {
            if let Some((_, handle)) = &self.registration {
                self.killed = handle.kill_status();
            }
        }
        match &self.killed {
            Some(status) => Err(status.clone()),
            None => Ok(()),
        }
    }

    /// Mark this executor killed from the inside. The first reason sticks.
    fn mark_killed(&mut self, reason: QuartzError) -> QuartzError {
        if self.killed.is_none() {
            self.killed = Some(reason);
        }
        self.killed.clone().expect("set above")
    }

    fn yield_now(&mut self) -> Result<()> {
        self.root.save_state();
        self.deliver_invalidations();
        self.check_kill()?;
        self.root.restore_state()?;
        self.tracker.reset();
        Ok(())
    }

    // ---- execution ----

    /// Push a result back; it is returned ahead of anything the plan
    /// produces, in FIFO order.
    pub fn enqueue(&mut self, doc: Value) {
        self.stash.push_back(doc);
    }

    /// The next result, or None at EOF. Errors are terminal: a killed or
    /// failed plan keeps returning its status.
    pub fn get_next(&mut self) -> Result<Option<Value>> {
        self.check_not_disposed()?;
        if self.state != LifecycleState::Usable {
            return Err(QuartzError::Internal(
                "get_next on a saved or detached executor".into(),
            ));
        }

        self.deliver_invalidations();
        self.check_kill()?;

        if let Some(doc) = self.stash.pop_front() {
            return Ok(Some(doc));
        }

        // Version observed before working, so an insert racing the EOF
        // check cannot be missed by the awaitData wait below.
        let notifier = self.collection.notifier();
        let mut pre_wait_version = notifier.version();
        let mut waited_for_inserts = false;

        loop {
            match self.tracker.kind() {
                YieldPolicyKind::AlwaysTimeOut => {
                    return Err(self.mark_killed(QuartzError::ExceededTimeLimit(
                        "operation exceeded time limit".into(),
                    )));
                }
                YieldPolicyKind::AlwaysMarkKilled => {
                    return Err(
                        self.mark_killed(QuartzError::QueryKilled("killed by policy".into()))
                    );
                }
                _ => {}
            }
            if self.tracker.should_yield() {
                self.yield_now()?;
            }

            match self.root.work(&mut self.ws) {
                WorkStatus::Advanced(id) => {
                    let doc = self.take_member_obj(id)?;
                    return Ok(Some(doc));
                }
                WorkStatus::NeedTime => {}
                WorkStatus::NeedYield(_) => {
                    if self.tracker.kind() == YieldPolicyKind::NoYield {
                        return Err(QuartzError::WriteConflict(
                            "write conflict under a non-yielding plan".into(),
                        ));
                    }
                    self.yield_now()?;
                }
                WorkStatus::Eof => {
                    if let Some(timeout) = self.await_data_timeout {
                        if !waited_for_inserts {
                            let seen = notifier.wait_until(pre_wait_version, timeout);
                            waited_for_inserts = true;
                            if notifier.is_dead() {
                                return Err(self.mark_killed(QuartzError::QueryKilled(
                                    format!("collection {} dropped", self.collection.ns()),
                                )));
                            }
                            if seen != pre_wait_version {
                                // New data arrived; go around again.
                                pre_wait_version = seen;
                                waited_for_inserts = false;
                            }
                            continue;
                        }
                    }
                    return Ok(None);
                }
                WorkStatus::Failure(id) | WorkStatus::Dead(id) => {
                    let status = self
                        .ws
                        .get(id)
                        .status
                        .clone()
                        .unwrap_or_else(|| QuartzError::Internal("plan failed".into()));
                    self.ws.free(id);
                    return Err(self.mark_killed(status));
                }
            }
        }
    }

    fn take_member_obj(&mut self, id: WorkingSetId) -> Result<Value> {
        let member = self.ws.get_mut(id);
        let doc = member.obj.take().ok_or_else(|| {
            QuartzError::Internal("root stage advanced a member without a document".into())
        })?;
        self.ws.free(id);
        Ok(doc)
    }

    /// Run the plan to EOF, discarding results. Used by write plans whose
    /// side effects are the point.
    pub fn execute_plan(&mut self) -> Result<()> {
        while self.get_next()?.is_some() {}
        Ok(())
    }
}

impl Drop for PlanExecutor {
    fn drop(&mut self) {
        self.dispose();
    }
}
