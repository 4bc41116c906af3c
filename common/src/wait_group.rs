//! ID-tracked wait group.
//!
//! Unlike a counting wait group, every unit of work is registered under a
//! caller-chosen id, so mismatched bookkeeping is caught at the call site
//! instead of silently skewing a counter.

use std::sync::Arc;
use std::time::Duration;

use hashbrown::HashSet;
use parking_lot::Mutex;
use tokio::sync::Notify;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WaitGroupStats {
    pub num_added: usize,
    pub num_active: usize,
    pub num_done: usize,
}

#[derive(Debug, Default)]
struct State {
    active: HashSet<String>,
    num_added: usize,
    num_done: usize,
    decommissioned: bool,
}

impl State {
    fn is_released(&self) -> bool {
        self.decommissioned || self.active.is_empty()
    }
}

#[derive(Debug, Default)]
struct Inner {
    state: Mutex<State>,
    notify: Notify,
}

/// Tracks in-flight work by id.
///
/// `wait` returns once every added id is done, or once the group has been
/// decommissioned. Decommissioning is permanent and only disables blocking;
/// `add`, `done` and `stats` keep working afterwards.
#[derive(Debug, Clone, Default)]
pub struct WaitGroup {
    inner: Arc<Inner>,
}

impl WaitGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `id` as active work.
    ///
    /// # Panics
    /// Panics if `id` is already active.
    pub fn add<S: Into<String>>(&self, id: S) {
        let id = id.into();
        let mut state = self.inner.state.lock();
        if state.active.contains(&id) {
            panic!("WaitGroup::add called twice for active id {id:?}");
        }
        state.active.insert(id);
        state.num_added += 1;
    }

    /// Completes the work registered under `id`.
    ///
    /// # Panics
    /// Panics if `id` is not active.
    pub fn done(&self, id: &str) {
        let released = {
            let mut state = self.inner.state.lock();
            if !state.active.remove(id) {
                panic!("WaitGroup::done called for unknown id {id:?}");
            }
            state.num_done += 1;
            state.active.is_empty()
        };

        if released {
            self.inner.notify.notify_waiters();
        }
    }

    /// Waits until no work is active or the group is decommissioned.
    pub async fn wait(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // registered before the check, so a release between the check
            // and the await is not lost
            notified.as_mut().enable();

            if self.inner.state.lock().is_released() {
                return;
            }

            notified.await;
        }
    }

    /// Like [`WaitGroup::wait`], bounded by `timeout`. Returns `true` when the
    /// group released before the deadline.
    pub async fn wait_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait()).await.is_ok()
    }

    /// Permanently unblocks all current and future waiters.
    pub fn decommission(&self) {
        self.inner.state.lock().decommissioned = true;
        self.inner.notify.notify_waiters();
    }

    pub fn is_decommissioned(&self) -> bool {
        self.inner.state.lock().decommissioned
    }

    pub fn is_active(&self, id: &str) -> bool {
        self.inner.state.lock().active.contains(id)
    }

    /// Active ids, sorted.
    pub fn active_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.state.lock().active.iter().cloned().collect();
        ids.sort();
        ids
    }

    pub fn stats(&self) -> WaitGroupStats {
        let state = self.inner.state.lock();
        WaitGroupStats {
            num_added: state.num_added,
            num_active: state.active.len(),
            num_done: state.num_done,
        }
    }
}
