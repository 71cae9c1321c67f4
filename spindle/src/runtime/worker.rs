use crate::runtime::pool::PoolShared;
use crate::runtime::ticker::{Ticker, TickerData, TickerEvents};
use crate::task::Task;
use crossbeam_deque::{Stealer, Worker as CbWorker};
use std::iter;
use std::sync::Arc;
use std::sync::atomic::Ordering;

const MAX_STEAL_RETRIES: usize = 4;

/// One OS thread of a pool. Runs tasks until the pool shuts down.
pub(crate) struct Worker {
    shared: Arc<PoolShared>,

    ticker: Ticker,

    policy: WorkerPolicy,

    /// Batches taken from the injector land here, siblings may steal them.
    local: CbWorker<Arc<Task>>,

    /// Every *other* worker's local queue, in a per-worker random order to
    /// spread contention.
    stealers: Vec<Stealer<Arc<Task>>>,
}

impl Worker {
    pub(super) fn new(
        shared: Arc<PoolShared>,
        local: CbWorker<Arc<Task>>,
        mut stealers: Vec<Stealer<Arc<Task>>>,
        policy: WorkerPolicy,
    ) -> Self {
        fastrand::shuffle(&mut stealers);

        Self {
            shared,
            ticker: Ticker::new(),
            policy,
            local,
            stealers,
        }
    }

    pub(super) fn event_loop(mut self) {
        loop {
            let events = self.ticker.tick(&self.shared, &mut self.policy);
            if events.contains(TickerEvents::SHUTDOWN) {
                break;
            }

            match self.find_task(events.contains(TickerEvents::POP_GLOBAL_QUEUE)) {
                Some(task) => {
                    self.shared.queued.fetch_sub(1, Ordering::AcqRel);
                    task.run();
                }
                None => self.shared.park(&self.stealers),
            }
        }

        // Tasks left in our local queue are dropped with the pool registry.
        while self.local.pop().is_some() {}
    }

    fn find_task(&self, pop_global_first: bool) -> Option<Arc<Task>> {
        // Enforce fairness between the local batch and newly queued tasks.
        if pop_global_first && let Some(task) = self.steal_from_injector() {
            return Some(task);
        }

        self.local.pop().or_else(|| {
            iter::repeat_with(|| {
                self.shared
                    .injector
                    .steal_batch_and_pop(&self.local)
                    // First success wins, we don't visit every stealer each time.
                    .or_else(|| self.stealers.iter().map(|s| s.steal()).collect())
            })
            .take(MAX_STEAL_RETRIES)
            .find(|s| !s.is_retry())
            .and_then(|s| s.success())
            .inspect(|_| self.share_surplus())
        })
    }

    fn steal_from_injector(&self) -> Option<Arc<Task>> {
        let task = self
            .shared
            .injector
            .steal_batch_and_pop(&self.local)
            .success()?;
        self.share_surplus();
        Some(task)
    }

    fn share_surplus(&self) {
        if !self.local.is_empty() {
            self.shared.notify_stealable();
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct WorkerPolicy {
    global_queue_interval: u32,
}

impl WorkerPolicy {
    pub(crate) fn new(global_queue_interval: u32) -> Self {
        Self {
            global_queue_interval: global_queue_interval.max(1),
        }
    }
}

impl TickerData for WorkerPolicy {
    type Context = Arc<PoolShared>;

    #[inline(always)]
    fn update_and_check(&mut self, shared: &Self::Context, tick: u32) -> TickerEvents {
        if shared.shutdown.load(Ordering::Acquire) {
            return TickerEvents::SHUTDOWN;
        }

        if tick.is_multiple_of(self.global_queue_interval) {
            TickerEvents::POP_GLOBAL_QUEUE
        } else {
            TickerEvents::empty()
        }
    }
}
