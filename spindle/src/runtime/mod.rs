//! Worker pools of cooperatively scheduled tasks.
//!
//! A task suspends by returning `Poll::Pending` after handing its waker to
//! whatever will complete it (the completion registry, the timer queue, a
//! join handle). Waking is the resume primitive: it queues the task on its
//! pool from any thread, so the worker that resumes a task is not necessarily
//! the one that suspended it.

use crate::task::{Id, Task};
use std::sync::Arc;

mod pool;
pub use self::pool::Pool;
pub(crate) use self::pool::{PoolSpec, ThreadPool, current_owner};

mod tasks;

mod ticker;

mod worker;

mod yield_now;
pub use self::yield_now::{YieldNow, yield_now};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ScheduleReason {
    /// First time the task is queued.
    Spawned,
    /// A suspended task was resumed.
    Woken,
    /// The task woke itself while running.
    Yielded,
}

pub(crate) trait Schedule: Send + Sync + 'static {
    fn schedule(&self, task: Arc<Task>, reason: ScheduleReason);

    /// The task completed and can be forgotten.
    fn release(&self, id: &Id);
}
