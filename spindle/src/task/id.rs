use std::cell::Cell;
use std::fmt;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};

/// An opaque ID that uniquely identifies a task relative to all other tasks
/// spawned in this process.
///
/// Task IDs are *not* sequential within a pool and do not indicate the order
/// in which tasks run.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub struct Id(NonZeroU64);

thread_local! {
    static CURRENT_TASK: Cell<Option<Id>> = const { Cell::new(None) };
}

/// Returns the [`Id`] of the currently running task, or `None` if called
/// outside of a task (for example from a thread blocked in `block_on`).
pub fn try_id() -> Option<Id> {
    CURRENT_TASK.with(|c| c.get())
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl Id {
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);

        let id = COUNTER.fetch_add(1, Ordering::Relaxed);

        // At a billion spawns per second this wraps after several centuries.
        let Some(id) = NonZeroU64::new(id) else {
            Self::exhausted();
        };

        Self(id)
    }

    #[cold]
    fn exhausted() -> ! {
        panic!("failed to generate unique task ID: bitspace exhausted")
    }

    pub fn as_u64(&self) -> u64 {
        self.0.get()
    }
}

/// Sets the current task id while a task is polled and restores the previous
/// one when dropped.
pub(crate) struct TaskIdGuard {
    parent: Option<Id>,
}

impl TaskIdGuard {
    pub(crate) fn enter(id: Id) -> Self {
        TaskIdGuard {
            parent: CURRENT_TASK.with(|c| c.replace(Some(id))),
        }
    }
}

impl Drop for TaskIdGuard {
    fn drop(&mut self) {
        CURRENT_TASK.with(|c| c.set(self.parent));
    }
}
