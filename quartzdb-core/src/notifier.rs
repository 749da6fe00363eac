// src/notifier.rs
// Wakeup channel for tailable cursors on capped collections. Every insert
// bumps a version counter under the mutex, so a waiter that saw version N
// can never sleep through the insert that produced N+1.

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

struct NotifierState {
    version: u64,
    dead: bool,
}

pub struct CappedInsertNotifier {
    state: Mutex<NotifierState>,
    condvar: Condvar,
}

impl CappedInsertNotifier {
    pub fn new() -> Self {
        CappedInsertNotifier {
            state: Mutex::new(NotifierState {
                version: 0,
                dead: false,
            }),
            condvar: Condvar::new(),
        }
    }

    /// Called by the insert path after a document lands.
    pub fn notify_all(&self) {
        let mut state = self.state.lock();
        state.version += 1;
        drop(state);
        self.condvar.notify_all();
    }

    /// Mark the collection gone. Waiters wake immediately and observe
    /// `is_dead`; the notifier never goes back to life.
    pub fn kill(&self) {
        let mut state = self.state.lock();
        state.dead = true;
        drop(state);
        self.condvar.notify_all();
    }

    pub fn version(&self) -> u64 {
        self.state.lock().version
    }

    pub fn is_dead(&self) -> bool {
        self.state.lock().dead
    }

    /// Block until the version moves past `prev_version`, the notifier is
    /// killed, or `timeout` elapses. Returns the version observed on wake.
    pub fn wait_until(&self, prev_version: u64, timeout: Duration) -> u64 {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.version == prev_version && !state.dead {
            if self.condvar.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        state.version
    }
}

impl Default for CappedInsertNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_notify_bumps_version() {
        let notifier = CappedInsertNotifier::new();
        assert_eq!(notifier.version(), 0);
        notifier.notify_all();
        notifier.notify_all();
        assert_eq!(notifier.version(), 2);
    }

    #[test]
    fn test_wait_returns_immediately_on_stale_version() {
        let notifier = CappedInsertNotifier::new();
        notifier.notify_all();
        // Waiter saw version 0; version is already 1, no sleep.
        let v = notifier.wait_until(0, Duration::from_secs(5));
        assert_eq!(v, 1);
    }

    #[test]
    fn test_wait_times_out() {
        let notifier = CappedInsertNotifier::new();
        let start = Instant::now();
        let v = notifier.wait_until(0, Duration::from_millis(30));
        assert_eq!(v, 0);
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_insert_wakes_concurrent_waiter() {
        let notifier = Arc::new(CappedInsertNotifier::new());
        let waiter = {
            let notifier = Arc::clone(&notifier);
            thread::spawn(move || notifier.wait_until(0, Duration::from_secs(10)))
        };
        thread::sleep(Duration::from_millis(20));
        notifier.notify_all();
        assert_eq!(waiter.join().unwrap(), 1);
    }

    #[test]
    fn test_kill_wakes_waiter() {
        let notifier = Arc::new(CappedInsertNotifier::new());
        let waiter = {
            let notifier = Arc::clone(&notifier);
            thread::spawn(move || notifier.wait_until(0, Duration::from_secs(10)))
        };
        thread::sleep(Duration::from_millis(20));
        notifier.kill();
        assert_eq!(waiter.join().unwrap(), 0);
        assert!(notifier.is_dead());
    }
}
