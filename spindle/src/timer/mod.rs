//! Deadline-ordered queue checked by the progress loop on every iteration.
//!
//! Nothing here blocks: sleeping tasks and per-call deadlines park an entry in
//! the queue, and the progress loop fires whatever expired. Resolution is
//! bounded by how long the loop blocks in the network engine, which is why
//! the loop clamps its poll timeout to [`TimerQueue::next_deadline`].

use crate::registry::OpKey;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Instant;

mod sleep;
pub use self::sleep::Sleep;

mod user;
pub use self::user::Timer;
pub(crate) use self::user::UserTimer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct TimerId(u64);

/// What to do when a deadline passes.
#[derive(Debug, Clone)]
pub(crate) enum TimerAction {
    /// A sleep finished, complete its operation.
    Wake(OpKey),
    /// A call deadline passed, time the operation out.
    Expire(OpKey),
    /// A user timer fired.
    Callback(Arc<UserTimer>),
}

pub(crate) type Expired = SmallVec<[(TimerId, TimerAction); 8]>;

#[derive(Debug, Default)]
struct Inner {
    // Cancelled entries stay in the heap until they reach the top.
    heap: BinaryHeap<Reverse<(Instant, TimerId)>>,
    live: FxHashMap<TimerId, TimerAction>,
    next_id: u64,
}

impl Inner {
    fn prune(&mut self) {
        while let Some(Reverse((_, id))) = self.heap.peek() {
            if self.live.contains_key(id) {
                break;
            }
            self.heap.pop();
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct TimerQueue {
    inner: Mutex<Inner>,
}

impl TimerQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&self, deadline: Instant, action: TimerAction) -> TimerId {
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = TimerId(inner.next_id);

        inner.heap.push(Reverse((deadline, id)));
        inner.live.insert(id, action);
        id
    }

    /// Returns false if the timer already fired or was cancelled.
    pub(crate) fn cancel(&self, id: TimerId) -> bool {
        let mut inner = self.inner.lock();
        let removed = inner.live.remove(&id).is_some();
        inner.prune();
        removed
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        let mut inner = self.inner.lock();
        inner.prune();
        inner.heap.peek().map(|Reverse((deadline, _))| *deadline)
    }

    /// Removes and returns every timer whose deadline is at or before `now`,
    /// earliest first.
    pub(crate) fn expired(&self, now: Instant) -> Expired {
        let mut inner = self.inner.lock();
        let mut fired = Expired::new();

        while let Some(Reverse((deadline, id))) = inner.heap.peek().copied() {
            if deadline > now {
                break;
            }
            inner.heap.pop();
            if let Some(action) = inner.live.remove(&id) {
                fired.push((id, action));
            }
        }

        fired
    }

    /// Drops every pending user timer. Sleeps and deadlines stay, they belong
    /// to operations that still have to drain.
    pub(crate) fn clear_callbacks(&self) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.live.len();
        inner
            .live
            .retain(|_, action| !matches!(action, TimerAction::Callback(_)));
        let cleared = before - inner.live.len();
        inner.prune();
        cleared
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().live.len()
    }
}
