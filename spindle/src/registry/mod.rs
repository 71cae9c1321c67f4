//! Completion registry: the join point between the network engine and the
//! tasks waiting on it.
//!
//! Every outstanding unit of work (a forwarded call, a response being flushed,
//! a bulk transfer, a sleep) owns one entry from submission until its owner
//! consumes the result. The registry is the only place an entry's phase
//! changes, and all of it sits behind one lock because completions race with
//! new submissions.

use crate::engine::EngineOp;
use crate::error::{Error, LifecycleError, Result};
use crate::task;
use crate::timer::TimerId;
use crate::utils::IdleSignal;
use parking_lot::Mutex;
use serde::Serialize;
use slab::Slab;
use std::fmt;
use std::sync::Arc;
use std::task::{Poll, Waker};
use std::time::{Duration, Instant};

mod operation;
pub(crate) use self::operation::Operation;

#[cfg(test)]
mod tests;

/// Identifies one operation handle. Embeds a generation so a completion for a
/// recycled slot can never reach the new owner.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct OpKey(u64);

impl OpKey {
    fn new(index: usize, generation: u32) -> Self {
        Self(((generation as u64) << 32) | index as u64)
    }

    fn index(&self) -> usize {
        (self.0 & u32::MAX as u64) as usize
    }

    fn generation(&self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub(crate) fn from_u64(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for OpKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.index(), self.generation())
    }
}

impl fmt::Debug for OpKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OpKey({self})")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    Call,
    Response,
    Bulk,
    Sleep,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Submitted,
    AwaitingResponse,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl OpKind {
    /// Sleeps hold no network resource and are not waited on by finalize.
    fn is_drained(&self) -> bool {
        !matches!(self, OpKind::Sleep)
    }
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Phase::Submitted | Phase::AwaitingResponse)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CancelReason {
    Cancelled,
    TimedOut,
}

#[derive(Debug)]
struct OpEntry {
    generation: u32,
    kind: OpKind,
    phase: Phase,

    /// The suspended owner. Waking it is how the owner resumes.
    waker: Option<Waker>,

    result: Option<Result<Vec<u8>>>,

    engine_op: Option<EngineOp>,

    timer: Option<TimerId>,

    owner: Option<task::Id>,

    submitted_at: Instant,
}

impl OpEntry {
    fn set_waker(&mut self, waker: &Waker) {
        if let Some(current) = self.waker.as_ref()
            && current.will_wake(waker)
        {
            return;
        }
        self.waker = Some(waker.clone());
    }

    fn finish(&mut self, phase: Phase, result: Result<Vec<u8>>) -> Option<Waker> {
        self.phase = phase;
        self.result = Some(result);
        self.waker.take()
    }
}

/// What the owner gets back when it consumes a finished entry.
#[derive(Debug)]
pub(crate) struct Consumed {
    pub(crate) result: Result<Vec<u8>>,
    pub(crate) timer: Option<TimerId>,
    pub(crate) elapsed: Duration,
}

/// Leftovers of an entry dropped before it finished.
#[derive(Debug, Default)]
pub(crate) struct Discarded {
    pub(crate) engine_op: Option<EngineOp>,
    pub(crate) timer: Option<TimerId>,
}

#[derive(Debug)]
struct Inner {
    slab: Slab<OpEntry>,
    next_generation: u32,
    sealed: bool,
    // Live entries finalize has to drain, see `OpKind::is_drained`.
    outstanding: usize,
}

impl Inner {
    fn entry_mut(&mut self, key: OpKey) -> Option<&mut OpEntry> {
        self.slab
            .get_mut(key.index())
            .filter(|e| e.generation == key.generation())
    }

    fn entry(&self, key: OpKey) -> Option<&OpEntry> {
        self.slab
            .get(key.index())
            .filter(|e| e.generation == key.generation())
    }

    fn bump_generation(&mut self) -> u32 {
        let generation = self.next_generation;
        // Skip 0 and u32::MAX so keys never collide with engine sentinels.
        self.next_generation = match generation.wrapping_add(1) {
            0 | u32::MAX => 1,
            next => next,
        };
        generation
    }

    /// Returns true when the last drained entry went away.
    fn remove(&mut self, key: OpKey) -> (OpEntry, bool) {
        let entry = self.slab.remove(key.index());
        if entry.kind.is_drained() {
            self.outstanding -= 1;
            return (entry, self.outstanding == 0);
        }
        (entry, false)
    }
}

#[derive(Debug)]
pub(crate) struct CompletionRegistry {
    inner: Mutex<Inner>,
    idle: Arc<IdleSignal>,
}

impl Default for CompletionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CompletionRegistry {
    pub(crate) fn new() -> Self {
        Self::with_idle(Arc::new(IdleSignal::new()))
    }

    /// `idle` is notified each time the last operation finalize waits on goes
    /// away.
    pub(crate) fn with_idle(idle: Arc<IdleSignal>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                slab: Slab::new(),
                next_generation: 1,
                sealed: false,
                outstanding: 0,
            }),
            idle,
        }
    }

    /// Creates an entry owned by the calling task.
    pub(crate) fn register(&self, kind: OpKind) -> Result<OpKey> {
        let mut inner = self.inner.lock();
        if inner.sealed {
            return Err(Error::Finalized);
        }

        let generation = inner.bump_generation();
        let index = inner.slab.insert(OpEntry {
            generation,
            kind,
            phase: Phase::Submitted,
            waker: None,
            result: None,
            engine_op: None,
            timer: None,
            owner: task::try_id(),
            submitted_at: Instant::now(),
        });
        if kind.is_drained() {
            inner.outstanding += 1;
        }

        Ok(OpKey::new(index, generation))
    }

    pub(crate) fn attach_engine_op(&self, key: OpKey, op: EngineOp) {
        if let Some(entry) = self.inner.lock().entry_mut(key) {
            entry.engine_op = Some(op);
        }
    }

    pub(crate) fn attach_timer(&self, key: OpKey, timer: TimerId) {
        if let Some(entry) = self.inner.lock().entry_mut(key) {
            entry.timer = Some(timer);
        }
    }

    /// The request left the wire, the call now waits for its response.
    /// Returns false if the entry already moved on.
    pub(crate) fn mark_awaiting(&self, key: OpKey) -> bool {
        match self.inner.lock().entry_mut(key) {
            Some(entry) if entry.phase == Phase::Submitted => {
                entry.phase = Phase::AwaitingResponse;
                true
            }
            _ => false,
        }
    }

    /// Stores the result and resumes the owner. Exactly once per entry.
    ///
    /// Completing an entry that already completed is a lifecycle bug and is
    /// reported as [`LifecycleError::DoubleCompletion`]. Completing one that was
    /// cancelled or timed out (a late network reply) is reported as
    /// [`LifecycleError::StaleOperation`] and is expected under races.
    pub(crate) fn complete(&self, key: OpKey, result: Result<Vec<u8>>) -> Result<()> {
        let waker = {
            let mut inner = self.inner.lock();
            if inner.sealed {
                return Err(Error::Finalized);
            }

            let entry = inner
                .entry_mut(key)
                .ok_or(LifecycleError::StaleOperation(key))?;

            match entry.phase {
                Phase::Completed | Phase::Failed => {
                    return Err(LifecycleError::DoubleCompletion(key).into());
                }
                Phase::Cancelled | Phase::TimedOut => {
                    return Err(LifecycleError::StaleOperation(key).into());
                }
                Phase::Submitted | Phase::AwaitingResponse => {}
            }

            let phase = if result.is_ok() {
                Phase::Completed
            } else {
                Phase::Failed
            };
            entry.finish(phase, result)
        };

        // Resume outside the lock, the owner may run right away elsewhere.
        if let Some(waker) = waker {
            waker.wake();
        }
        Ok(())
    }

    /// Moves a pending entry to CANCELLED or TIMED_OUT and resumes its owner
    /// with the matching error. Returns the engine operation to notify, best
    /// effort. Entries already finished are left untouched.
    pub(crate) fn cancel(&self, key: OpKey, reason: CancelReason) -> Result<Option<EngineOp>> {
        let (waker, engine_op) = {
            let mut inner = self.inner.lock();
            let entry = inner
                .entry_mut(key)
                .ok_or(LifecycleError::StaleOperation(key))?;

            if entry.phase.is_terminal() {
                return Ok(None);
            }

            let waker = match reason {
                CancelReason::Cancelled => entry.finish(Phase::Cancelled, Err(Error::Cancelled)),
                CancelReason::TimedOut => entry.finish(Phase::TimedOut, Err(Error::Timeout)),
            };
            (waker, entry.engine_op)
        };

        if let Some(waker) = waker {
            waker.wake();
        }
        Ok(engine_op)
    }

    /// Cancels every pending entry. Used when finalize gives up draining.
    pub(crate) fn cancel_all(&self) -> Vec<EngineOp> {
        let (wakers, ops): (Vec<_>, Vec<_>) = {
            let mut inner = self.inner.lock();
            inner
                .slab
                .iter_mut()
                .filter(|(_, e)| !e.phase.is_terminal())
                .map(|(_, e)| {
                    let waker = e.finish(Phase::Cancelled, Err(Error::Cancelled));
                    (waker, e.engine_op)
                })
                .unzip()
        };

        wakers.into_iter().flatten().for_each(Waker::wake);
        ops.into_iter().flatten().collect()
    }

    /// Cancels every pending entry of `kind`. Returns how many were pending.
    pub(crate) fn cancel_kind(&self, kind: OpKind) -> usize {
        let wakers: Vec<_> = {
            let mut inner = self.inner.lock();
            inner
                .slab
                .iter_mut()
                .filter(|(_, e)| e.kind == kind && !e.phase.is_terminal())
                .map(|(_, e)| e.finish(Phase::Cancelled, Err(Error::Cancelled)))
                .collect()
        };

        let cancelled = wakers.len();
        wakers.into_iter().flatten().for_each(Waker::wake);
        cancelled
    }

    /// Consumes a finished entry, or records the waker of its owner. The entry
    /// is destroyed as soon as its result is handed out.
    pub(crate) fn poll_outcome(&self, key: OpKey, waker: &Waker) -> Poll<Result<Consumed>> {
        let (entry, drained) = {
            let mut inner = self.inner.lock();
            let Some(entry) = inner.entry_mut(key) else {
                return Poll::Ready(Err(LifecycleError::StaleOperation(key).into()));
            };

            if !entry.phase.is_terminal() {
                entry.set_waker(waker);
                return Poll::Pending;
            }

            inner.remove(key)
        };

        if drained {
            self.idle.notify();
        }
        Poll::Ready(Ok(Consumed {
            result: entry.result.unwrap_or(Err(Error::Cancelled)),
            timer: entry.timer,
            elapsed: entry.submitted_at.elapsed(),
        }))
    }

    /// Drops an entry whose owner went away before consuming it.
    pub(crate) fn discard(&self, key: OpKey) -> Option<Discarded> {
        let (entry, drained) = {
            let mut inner = self.inner.lock();
            inner.entry(key)?;
            inner.remove(key)
        };

        if drained {
            self.idle.notify();
        }
        Some(Discarded {
            engine_op: (!entry.phase.is_terminal()).then_some(entry.engine_op).flatten(),
            timer: entry.timer,
        })
    }

    pub(crate) fn kind(&self, key: OpKey) -> Option<OpKind> {
        self.inner.lock().entry(key).map(|e| e.kind)
    }

    pub(crate) fn phase(&self, key: OpKey) -> Option<Phase> {
        self.inner.lock().entry(key).map(|e| e.phase)
    }

    pub(crate) fn owner(&self, key: OpKey) -> Option<task::Id> {
        self.inner.lock().entry(key).and_then(|e| e.owner)
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().slab.len()
    }

    /// Live entries other than sleeps.
    pub(crate) fn outstanding(&self) -> usize {
        self.inner.lock().outstanding
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// After this no entry may be created or completed.
    pub(crate) fn seal(&self) {
        self.inner.lock().sealed = true;
    }
}
