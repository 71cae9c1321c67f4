use crate::task::{Id, Task};
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

// Every live task of a pool. Wakers hold their own reference, so a task parked
// forever on an operation that never completes would leak without this: at
// shutdown we drain the map and drop every remaining future.
#[derive(Debug, Default)]
pub(crate) struct OwnedTasks {
    tasks: DashMap<Id, Arc<Task>>,

    // DashMap::len iterates over all shards.
    size: AtomicUsize,

    // Closed at shutdown, later inserts are rejected.
    closed: AtomicBool,
}

impl OwnedTasks {
    /// Returns the task back if the registry is closed.
    pub(crate) fn insert(&self, task: Arc<Task>) -> Result<(), Arc<Task>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(task);
        }

        self.size.fetch_add(1, Ordering::Relaxed);
        self.tasks.insert(task.id(), task);
        Ok(())
    }

    pub(crate) fn remove(&self, id: &Id) -> Option<Arc<Task>> {
        self.tasks.remove(id).map(|(_id, task)| {
            self.size.fetch_sub(1, Ordering::Relaxed);
            task
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Closes the registry and drops every remaining task. Idempotent.
    pub(crate) fn shutdown_all(&self) -> usize {
        if self.closed.swap(true, Ordering::AcqRel) {
            return 0;
        }

        let tasks = self
            .tasks
            .iter()
            .map(|entry| entry.key().to_owned())
            .collect::<Vec<_>>()
            .into_iter()
            .filter_map(|id| self.remove(&id))
            .collect::<Vec<_>>();

        for task in &tasks {
            task.shutdown();
        }
        tasks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::RecordingScheduler;
    use futures::FutureExt;

    #[test]
    fn test_insert_remove_and_shutdown() {
        let scheduler = RecordingScheduler::new();
        let tasks = OwnedTasks::default();

        let a = Task::new(futures::future::pending().boxed(), scheduler.clone());
        let b = Task::new(futures::future::pending().boxed(), scheduler.clone());
        assert!(tasks.insert(Arc::clone(&a)).is_ok());
        assert!(tasks.insert(Arc::clone(&b)).is_ok());
        assert_eq!(tasks.len(), 2);

        assert!(tasks.remove(&a.id()).is_some());
        assert_eq!(tasks.len(), 1);

        assert_eq!(tasks.shutdown_all(), 1);
        assert!(b.is_complete());
        assert!(tasks.is_closed());
        assert_eq!(tasks.shutdown_all(), 0);

        let late = Task::new(async {}.boxed(), scheduler);
        assert!(tasks.insert(late).is_err());
    }
}
