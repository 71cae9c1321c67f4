use crate::runtime::{Schedule, ScheduleReason};
use crate::task::{Id, TaskIdGuard};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::task::{Context, Poll, Wake, Waker};

// Task state machine. A task is in exactly one queue iff it is SCHEDULED.
//
//   IDLE ──wake──▶ SCHEDULED ──run──▶ RUNNING ──pending──▶ IDLE
//                                       │ wake                ▲
//                                       ▼                     │
//                                   NOTIFIED ──pending──▶ SCHEDULED (re-queued)
//
// Any state moves to COMPLETE on Ready, panic or shutdown.
const IDLE: u8 = 0;
const SCHEDULED: u8 = 1;
const RUNNING: u8 = 2;
const NOTIFIED: u8 = 3;
const COMPLETE: u8 = 4;

/// A lightweight task: a boxed future plus the state needed to suspend it on
/// one worker and resume it from any other.
pub(crate) struct Task {
    id: Id,
    state: AtomicU8,
    panicked: AtomicBool,
    future: Mutex<Option<BoxFuture<'static, ()>>>,
    scheduler: Arc<dyn Schedule>,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("state", &self.state.load(Ordering::Relaxed))
            .finish()
    }
}

impl Task {
    /// New tasks start SCHEDULED, the caller must hand them to the scheduler.
    pub(crate) fn new(future: BoxFuture<'static, ()>, scheduler: Arc<dyn Schedule>) -> Arc<Self> {
        Arc::new(Self {
            id: Id::next(),
            state: AtomicU8::new(SCHEDULED),
            panicked: AtomicBool::new(false),
            future: Mutex::new(Some(future)),
            scheduler,
        })
    }

    pub(crate) fn id(&self) -> Id {
        self.id
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.state.load(Ordering::Acquire) == COMPLETE
    }

    pub(crate) fn panicked(&self) -> bool {
        self.panicked.load(Ordering::Acquire)
    }

    /// Polls the task once. A task that is not SCHEDULED is ignored, which
    /// makes stale queue entries harmless.
    pub(crate) fn run(self: Arc<Self>) {
        if self
            .state
            .compare_exchange(SCHEDULED, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let waker = Waker::from(Arc::clone(&self));
        let mut cx = Context::from_waker(&waker);

        let outcome = {
            let mut slot = self.future.lock();
            let Some(future) = slot.as_mut() else {
                drop(slot);
                self.state.store(COMPLETE, Ordering::Release);
                return;
            };

            let _guard = TaskIdGuard::enter(self.id);
            panic::catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx)))
        };

        match outcome {
            Ok(Poll::Pending) => self.suspend(),
            Ok(Poll::Ready(())) => self.complete(),
            Err(_) => {
                self.panicked.store(true, Ordering::Release);
                tracing::error!(task.id = %self.id, "task panicked, dropping it");
                self.complete();
            }
        }
    }

    fn suspend(self: Arc<Self>) {
        match self
            .state
            .compare_exchange(RUNNING, IDLE, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {}
            Err(NOTIFIED) => {
                // Woken while running, typically by `yield_now`. Back of the
                // queue so other tasks get a turn.
                self.state.store(SCHEDULED, Ordering::Release);
                let scheduler = Arc::clone(&self.scheduler);
                scheduler.schedule(self, ScheduleReason::Yielded);
            }
            // Shut down while we were polling.
            Err(_) => {}
        }
    }

    fn complete(&self) {
        let future = self.future.lock().take();
        self.state.store(COMPLETE, Ordering::Release);

        // Dropping the future may run arbitrary destructors, do it unlocked.
        drop(future);
        self.scheduler.release(&self.id);
    }

    /// Drops the future without running it to completion. Only called once
    /// the workers have stopped.
    pub(crate) fn shutdown(&self) {
        let future = self.future.lock().take();
        self.state.store(COMPLETE, Ordering::Release);
        drop(future);
    }

    /// Resumes a suspended task on whichever worker picks it up next.
    fn wake_task(self: &Arc<Self>) {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let next = match current {
                IDLE => SCHEDULED,
                RUNNING => NOTIFIED,
                // Already queued, already notified or complete.
                _ => return,
            };

            match self.state.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    if next == SCHEDULED {
                        self.scheduler
                            .schedule(Arc::clone(self), ScheduleReason::Woken);
                    }
                    return;
                }
                Err(actual) => current = actual,
            }
        }
    }
}

impl Wake for Task {
    fn wake(self: Arc<Self>) {
        self.wake_task();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.wake_task();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::RecordingScheduler;
    use futures::FutureExt;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_ready_task_completes_and_releases() {
        let scheduler = RecordingScheduler::new();
        let task = Task::new(async {}.boxed(), scheduler.clone());

        Arc::clone(&task).run();

        assert!(task.is_complete());
        assert_eq!(scheduler.released(), vec![task.id()]);
        assert!(scheduler.scheduled().is_empty());
    }

    #[test]
    fn test_wake_while_idle_reschedules_once() {
        let scheduler = RecordingScheduler::new();
        let task = Task::new(futures::future::pending::<()>().boxed(), scheduler.clone());

        Arc::clone(&task).run();
        assert!(scheduler.scheduled().is_empty());

        let waker = Waker::from(Arc::clone(&task));
        waker.wake_by_ref();
        waker.wake_by_ref();

        assert_eq!(
            scheduler.scheduled(),
            vec![(task.id(), ScheduleReason::Woken)]
        );
    }

    #[test]
    fn test_self_wake_requeues_as_yield() {
        let scheduler = RecordingScheduler::new();
        let polls = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&polls);
        let task = Task::new(
            futures::future::poll_fn(move |cx| {
                if counter.fetch_add(1, Ordering::Relaxed) == 0 {
                    cx.waker().wake_by_ref();
                    Poll::Pending
                } else {
                    Poll::Ready(())
                }
            })
            .boxed(),
            scheduler.clone(),
        );

        Arc::clone(&task).run();
        assert_eq!(
            scheduler.scheduled(),
            vec![(task.id(), ScheduleReason::Yielded)]
        );

        Arc::clone(&task).run();
        assert!(task.is_complete());
        assert_eq!(polls.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_panic_is_contained() {
        let scheduler = RecordingScheduler::new();
        let task = Task::new(async { panic!("boom"); }.boxed(), scheduler.clone());

        Arc::clone(&task).run();

        assert!(task.is_complete());
        assert!(task.panicked());
        assert_eq!(scheduler.released(), vec![task.id()]);
    }

    #[test]
    fn test_run_ignores_unscheduled_task() {
        let scheduler = RecordingScheduler::new();
        let task = Task::new(futures::future::pending::<()>().boxed(), scheduler.clone());

        Arc::clone(&task).run();
        // Idle now, a stale queue entry must not poll it.
        Arc::clone(&task).run();
        task.shutdown();
        assert!(task.is_complete());

        let waker = Waker::from(Arc::clone(&task));
        waker.wake();
        assert!(scheduler.scheduled().is_empty());
    }
}
