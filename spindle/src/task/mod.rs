mod id;
pub use self::id::{Id, try_id};
pub(crate) use self::id::TaskIdGuard;

mod join;
pub use self::join::{JoinError, JoinHandle};

#[allow(clippy::module_inception)]
mod task;
pub(crate) use self::task::Task;

use crate::runtime::Schedule;
use futures::FutureExt;
use futures::channel::oneshot;
use std::future::Future;
use std::sync::Arc;

/// Wraps `future` into a task bound to `scheduler`. The task is created
/// SCHEDULED but not queued, the caller decides where it goes.
pub(crate) fn new_task<F>(future: F, scheduler: Arc<dyn Schedule>) -> (Arc<Task>, JoinHandle<F::Output>)
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    let wrapped = async move {
        // The receiver may be gone, the task was detached.
        let _ = tx.send(future.await);
    };

    let task = Task::new(wrapped.boxed(), scheduler);
    let handle = JoinHandle::new(rx, Arc::clone(&task));
    (task, handle)
}
