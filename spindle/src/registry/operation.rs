use crate::engine::NetworkEngine;
use crate::error::{LifecycleError, Result};
use crate::registry::{CompletionRegistry, OpKey};
use crate::timer::TimerQueue;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

/// Suspends the awaiting task until the progress loop finishes the entry.
///
/// Dropping an operation before it resolves discards its entry, so a late
/// completion is reported as stale instead of reaching a new owner.
pub(crate) struct Operation {
    key: OpKey,
    registry: Arc<CompletionRegistry>,
    timers: Arc<TimerQueue>,
    engine: Arc<dyn NetworkEngine>,
    done: bool,
}

impl Operation {
    pub(crate) fn new(
        key: OpKey,
        registry: Arc<CompletionRegistry>,
        timers: Arc<TimerQueue>,
        engine: Arc<dyn NetworkEngine>,
    ) -> Self {
        Self {
            key,
            registry,
            timers,
            engine,
            done: false,
        }
    }

    pub(crate) fn key(&self) -> OpKey {
        self.key
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("key", &self.key)
            .field("done", &self.done)
            .finish()
    }
}

impl Future for Operation {
    type Output = Result<Vec<u8>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.done {
            return Poll::Ready(Err(LifecycleError::StaleOperation(self.key).into()));
        }

        let consumed = match self.registry.poll_outcome(self.key, cx.waker()) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(consumed) => consumed,
        };
        self.done = true;

        Poll::Ready(consumed.and_then(|consumed| {
            if let Some(timer) = consumed.timer {
                self.timers.cancel(timer);
            }
            tracing::trace!(op = %self.key, elapsed = ?consumed.elapsed, "operation consumed");
            consumed.result
        }))
    }
}

impl Drop for Operation {
    fn drop(&mut self) {
        if self.done {
            return;
        }

        let Some(discarded) = self.registry.discard(self.key) else {
            return;
        };

        if let Some(timer) = discarded.timer {
            self.timers.cancel(timer);
        }
        if let Some(op) = discarded.engine_op
            && let Err(e) = self.engine.cancel(op)
        {
            tracing::debug!(op = %self.key, error = %e, "engine cancel failed");
        }
    }
}
