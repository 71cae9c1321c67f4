use crate::runtime::tasks::OwnedTasks;
use crate::runtime::worker::{Worker, WorkerPolicy};
use crate::runtime::{Schedule, ScheduleReason};
use crate::task::{self, Id, JoinHandle, Task};
use anyhow::{Result, anyhow};
use crossbeam_deque::{Injector, Stealer, Worker as CbWorker};
use parking_lot::{Condvar, Mutex};
use std::cell::Cell;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, OnceLock};
use std::thread;
use std::time::Duration;

// Workers re-check the queues at least this often even without a signal.
const PARK_TIMEOUT: Duration = Duration::from_millis(100);

thread_local! {
    // (instance id, pool index) of the worker running on this thread.
    static CURRENT_WORKER: Cell<Option<(u64, usize)>> = const { Cell::new(None) };
}

/// Instance id owning the worker running on the current thread, if any.
pub(crate) fn current_owner() -> Option<u64> {
    CURRENT_WORKER.with(|c| c.get()).map(|(owner, _)| owner)
}

/// Everything needed to start a pool.
#[derive(Debug, Clone)]
pub(crate) struct PoolSpec {
    pub(crate) name: String,
    pub(crate) index: usize,
    pub(crate) workers: usize,
    pub(crate) owner: u64,
    pub(crate) global_queue_interval: u32,
    pub(crate) stack_size: Option<usize>,
}

/// State shared by the workers of one pool and every task spawned on it.
pub(crate) struct PoolShared {
    pub(super) name: String,
    pub(super) index: usize,
    pub(super) owner: u64,
    pub(super) num_workers: usize,

    /// Pool-wide queue. Spawned, woken and yielded tasks all land here.
    pub(super) injector: Injector<Arc<Task>>,

    /// Tasks queued anywhere in the pool and not yet picked up by a worker.
    pub(super) queued: AtomicUsize,

    /// Number of parked workers, guards the park/unpark handshake.
    idle: Mutex<usize>,
    unpark: Condvar,

    pub(super) shutdown: AtomicBool,

    pub(super) tasks: OwnedTasks,

    /// Called whenever a suspended task is resumed or a task is spawned, so a
    /// progress loop blocked in the network engine can give its worker back.
    wake_hook: OnceLock<Box<dyn Fn() + Send + Sync>>,
}

impl fmt::Debug for PoolShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolShared")
            .field("name", &self.name)
            .field("index", &self.index)
            .field("num_workers", &self.num_workers)
            .field("num_tasks", &self.tasks.len())
            .finish()
    }
}

impl PoolShared {
    fn notify_one(&self) {
        let idle = self.idle.lock();
        if *idle > 0 {
            self.unpark.notify_one();
        }
    }

    /// Parks the calling worker unless there is work it could pick up.
    pub(super) fn park(&self, stealers: &[Stealer<Arc<Task>>]) {
        let mut idle = self.idle.lock();

        // Checked under the lock: anyone making work visible after this point
        // takes the lock to notify, and by then we are waiting.
        if self.shutdown.load(Ordering::Acquire)
            || !self.injector.is_empty()
            || stealers.iter().any(|s| !s.is_empty())
        {
            return;
        }

        *idle += 1;
        self.unpark.wait_for(&mut idle, PARK_TIMEOUT);
        *idle -= 1;
    }

    /// A worker moved a batch into its local queue, let a sibling steal.
    pub(super) fn notify_stealable(&self) {
        self.notify_one();
    }
}

impl Schedule for PoolShared {
    fn schedule(&self, task: Arc<Task>, reason: ScheduleReason) {
        if self.tasks.is_closed() {
            task.shutdown();
            return;
        }

        self.queued.fetch_add(1, Ordering::AcqRel);
        self.injector.push(task);
        self.notify_one();

        if reason != ScheduleReason::Yielded
            && let Some(hook) = self.wake_hook.get()
        {
            hook();
        }
    }

    fn release(&self, id: &Id) {
        self.tasks.remove(id);
    }
}

/// Handle to a named pool of workers. Cheap to clone.
#[derive(Clone)]
pub struct Pool {
    shared: Arc<PoolShared>,
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.shared.fmt(f)
    }
}

impl Pool {
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn index(&self) -> usize {
        self.shared.index
    }

    pub fn num_workers(&self) -> usize {
        self.shared.num_workers
    }

    /// Number of live tasks, running or suspended.
    pub fn num_tasks(&self) -> usize {
        self.shared.tasks.len()
    }

    /// Spawns `future` as a lightweight task on this pool. Tasks spawned after
    /// the pool shut down resolve to [`JoinError::Cancelled`](crate::task::JoinError).
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let scheduler: Arc<dyn Schedule> = self.shared.clone();
        let (task, handle) = task::new_task(future, scheduler);

        match self.shared.tasks.insert(Arc::clone(&task)) {
            Ok(()) => self.shared.schedule(task, ScheduleReason::Spawned),
            Err(task) => task.shutdown(),
        }

        handle
    }

    /// True if runnable tasks wait in any queue of the pool.
    pub(crate) fn has_pending(&self) -> bool {
        self.shared.queued.load(Ordering::Acquire) > 0
    }

    pub(crate) fn set_wake_hook(&self, hook: Box<dyn Fn() + Send + Sync>) {
        if self.shared.wake_hook.set(hook).is_err() {
            tracing::warn!(pool = %self.shared.name, "wake hook already installed");
        }
    }

    /// True if the current thread is one of this pool's workers.
    pub fn is_current(&self) -> bool {
        CURRENT_WORKER.with(|c| c.get()) == Some((self.shared.owner, self.shared.index))
    }
}

/// Owns the worker threads of a pool.
pub(crate) struct ThreadPool {
    pool: Pool,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl ThreadPool {
    pub(crate) fn start(spec: &PoolSpec) -> Result<Self> {
        let num_workers = spec.workers;

        let shared = Arc::new(PoolShared {
            name: spec.name.clone(),
            index: spec.index,
            owner: spec.owner,
            num_workers,
            injector: Injector::new(),
            queued: AtomicUsize::new(0),
            idle: Mutex::new(0),
            unpark: Condvar::new(),
            shutdown: AtomicBool::new(false),
            tasks: OwnedTasks::default(),
            wake_hook: OnceLock::new(),
        });

        // FIFO local queues keep yielded tasks fair relative to each other.
        let local_queues = (0..num_workers)
            .map(|_| CbWorker::new_fifo())
            .collect::<Vec<_>>();
        let stealers = local_queues.iter().map(|w| w.stealer()).collect::<Vec<_>>();

        let barrier = Arc::new(Barrier::new(num_workers + 1));
        let handles = local_queues
            .into_iter()
            .enumerate()
            .map(|(i, local)| {
                // Each worker steals from every *other* worker.
                let others = stealers
                    .iter()
                    .enumerate()
                    .filter(|(j, _)| *j != i)
                    .map(|(_, s)| s.clone())
                    .collect::<Vec<_>>();

                let worker = Worker::new(
                    Arc::clone(&shared),
                    local,
                    others,
                    WorkerPolicy::new(spec.global_queue_interval),
                );
                spawn_worker_thread(spec, i, worker, Arc::clone(&barrier))
            })
            .collect::<Result<Vec<_>>>()?;

        // Spawning threads is async, wait until every worker is in its loop.
        barrier.wait();
        tracing::debug!(pool = %spec.name, workers = num_workers, "pool started");

        Ok(Self {
            pool: Pool { shared },
            handles: Mutex::new(handles),
        })
    }

    pub(crate) fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Stops the workers, then drops every task still alive on the pool.
    pub(crate) fn shutdown(&self) -> Result<()> {
        let shared = &self.pool.shared;
        shared.shutdown.store(true, Ordering::Release);
        {
            let _idle = shared.idle.lock();
            shared.unpark.notify_all();
        }

        let joined = self.join_all();

        let dropped = shared.tasks.shutdown_all();
        while !shared.injector.steal().is_empty() {}

        tracing::debug!(pool = %shared.name, dropped, "pool stopped");
        joined
    }

    fn join_all(&self) -> Result<()> {
        let panicked = self
            .handles
            .lock()
            .drain(..)
            .filter_map(|handle| handle.join().err())
            .count();

        if panicked == 0 {
            Ok(())
        } else {
            Err(anyhow!("{panicked} worker thread(s) panicked"))
        }
    }
}

fn spawn_worker_thread(
    spec: &PoolSpec,
    index: usize,
    worker: Worker,
    barrier: Arc<Barrier>,
) -> Result<thread::JoinHandle<()>> {
    let mut builder = thread::Builder::new().name(format!("{}-{}", spec.name, index));

    if let Some(stack_size) = spec.stack_size {
        builder = builder.stack_size(stack_size);
    }

    let identity = (spec.owner, spec.index);
    let handle = builder.spawn(move || {
        CURRENT_WORKER.with(|c| c.set(Some(identity)));
        barrier.wait();
        worker.event_loop();
    })?;

    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::yield_now;
    use crate::task::JoinError;
    use static_assertions::assert_impl_all;

    assert_impl_all!(Pool: Send, Sync, Clone);
    assert_impl_all!(JoinHandle<()>: Send, Sync);

    fn spec(workers: usize) -> PoolSpec {
        PoolSpec {
            name: "test-pool".to_string(),
            index: 0,
            workers,
            owner: u64::MAX,
            global_queue_interval: 31,
            stack_size: None,
        }
    }

    #[test]
    fn test_spawn_and_join() -> anyhow::Result<()> {
        let threads = ThreadPool::start(&spec(2))?;
        let pool = threads.pool().clone();

        let handle = pool.spawn(async { 40 + 2 });
        assert_eq!(futures::executor::block_on(handle)?, 42);

        threads.shutdown()
    }

    #[test]
    fn test_many_tasks_across_workers() -> anyhow::Result<()> {
        let threads = ThreadPool::start(&spec(4))?;
        let pool = threads.pool().clone();
        let counter = Arc::new(AtomicUsize::new(0));

        let handles = (0..256)
            .map(|_| {
                let counter = Arc::clone(&counter);
                pool.spawn(async move {
                    yield_now().await;
                    counter.fetch_add(1, Ordering::Relaxed);
                })
            })
            .collect::<Vec<_>>();

        for handle in handles {
            futures::executor::block_on(handle)?;
        }

        assert_eq!(counter.load(Ordering::Relaxed), 256);
        assert_eq!(pool.num_tasks(), 0);
        threads.shutdown()
    }

    #[test]
    fn test_panicking_task_reports_join_error() -> anyhow::Result<()> {
        let threads = ThreadPool::start(&spec(1))?;
        let handle = threads.pool().spawn(async {
            panic!("handler bug");
        });

        let res: Result<(), JoinError> = futures::executor::block_on(handle);
        assert!(matches!(res, Err(JoinError::Panicked(_))));

        // The worker survives.
        let handle = threads.pool().spawn(async { 1 });
        assert_eq!(futures::executor::block_on(handle)?, 1);
        threads.shutdown()
    }

    #[test]
    fn test_shutdown_cancels_suspended_tasks() -> anyhow::Result<()> {
        let threads = ThreadPool::start(&spec(1))?;
        let pool = threads.pool().clone();

        let handle = pool.spawn(futures::future::pending::<()>());
        while pool.has_pending() {
            thread::yield_now();
        }
        threads.shutdown()?;

        assert!(matches!(
            futures::executor::block_on(handle),
            Err(JoinError::Cancelled(_))
        ));

        let late = pool.spawn(async {});
        assert!(matches!(
            futures::executor::block_on(late),
            Err(JoinError::Cancelled(_))
        ));
        Ok(())
    }

    #[test]
    fn test_is_current() -> anyhow::Result<()> {
        let threads = ThreadPool::start(&spec(1))?;
        let pool = threads.pool().clone();
        assert!(!pool.is_current());

        let inner = pool.clone();
        let on_worker = futures::executor::block_on(pool.spawn(async move { inner.is_current() }))?;
        assert!(on_worker);
        threads.shutdown()
    }
}
