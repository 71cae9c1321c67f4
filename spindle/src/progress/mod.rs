//! The progress loop: one long-lived task per instance that drives the
//! network engine, fires completions and expired timers, then yields.

use crate::engine::{
    EngineCompletion, EngineError, EngineEvent, Envelope, RECEIVE_TOKEN, ResponseStatus,
    UNTRACKED_TOKEN,
};
use crate::error::{Error, LifecycleError, Result};
use crate::instance::Handle;
use crate::monitor::{EventArgs, MonitorSpan};
use crate::registry::{CancelReason, OpKey, OpKind};
use crate::rpc;
use crate::runtime::yield_now;
use crate::timer::{TimerAction, TimerId};
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

mod timeout;
pub(crate) use self::timeout::AdaptiveTimeout;

pub(crate) async fn run(handle: Handle) {
    let shared = &handle.shared;
    let mut timeout = AdaptiveTimeout::new(Duration::from_millis(shared.config.max_timeout_ms));

    for _ in 0..shared.config.receive_depth {
        if let Err(e) = shared.engine.submit_receive_buffer(RECEIVE_TOKEN) {
            tracing::error!(error = %e, "failed to post receive buffers, progress loop exits");
            return;
        }
    }

    while !shared.stop_progress.load(Ordering::Acquire) {
        if shared.take_pending() || handle.progress_pool().has_pending() {
            timeout.reset();
        }

        let mut wait = timeout.current();
        if let Some(deadline) = shared.timers.next_deadline() {
            wait = wait.min(deadline.saturating_duration_since(Instant::now()));
        }

        let polled = {
            let mut span = shared.monitor.begin(EventArgs::Progress {
                timeout_ms: wait.as_millis() as u64,
            });
            let res = shared.engine.poll(wait).map_err(Error::from);
            span.set_outcome(&res);
            res
        };
        shared.num_progress.fetch_add(1, Ordering::Relaxed);

        let completions = match polled {
            Ok(completions) => completions,
            Err(Error::Transport(EngineError::Closed)) => break,
            Err(e) => {
                tracing::warn!(error = %e, "engine poll failed");
                Vec::new()
            }
        };

        let fired = trigger(&handle, completions, wait);
        shared.num_trigger.fetch_add(1, Ordering::Relaxed);
        timeout.observe(fired);

        yield_now().await;
    }

    tracing::debug!(address = %shared.address, "progress loop stopped");
}

/// Fires every completion the engine reported, in order, then every expired
/// timer. Returns how many of them did something.
fn trigger(handle: &Handle, completions: Vec<EngineCompletion>, wait: Duration) -> usize {
    let mut span = handle.shared.monitor.begin(EventArgs::Trigger {
        timeout_ms: wait.as_millis() as u64,
        max_count: completions.len(),
        actual_count: 0,
    });

    let mut fired = 0;
    for completion in completions {
        fired += dispatch(handle, completion) as usize;
    }

    let expired = handle.shared.timers.expired(Instant::now());
    let num_expired = expired.len();
    for (id, action) in expired {
        fire_timer(handle, id, action);
    }
    fired += num_expired;

    if let EventArgs::Trigger {
        max_count,
        actual_count,
        ..
    } = span.args_mut()
    {
        *max_count += num_expired;
        *actual_count = fired;
    }
    span.succeed();
    fired
}

fn dispatch(handle: &Handle, EngineCompletion { token, event, .. }: EngineCompletion) -> bool {
    match (token, event) {
        (RECEIVE_TOKEN, EngineEvent::Received(envelope)) => {
            if let Err(e) = handle.shared.engine.submit_receive_buffer(RECEIVE_TOKEN) {
                tracing::warn!(error = %e, "failed to repost receive buffer");
            }
            on_envelope(handle, envelope);
            true
        }
        (RECEIVE_TOKEN, _) => false,
        (UNTRACKED_TOKEN, EngineEvent::Sent(Err(e))) => {
            tracing::debug!(error = %e, "status reply was not delivered");
            true
        }
        (UNTRACKED_TOKEN, _) => true,
        (token, event) => on_tracked(handle, OpKey::from_u64(token), event),
    }
}

fn on_envelope(handle: &Handle, envelope: Envelope) {
    match envelope {
        Envelope::Request {
            origin,
            rpc_id,
            seq,
            payload,
        } => rpc::dispatch(handle, origin, rpc_id, seq, payload),
        Envelope::Response {
            rpc_id,
            seq,
            status,
            payload,
            ..
        } => {
            let key = OpKey::from_u64(seq);
            let result = match status {
                ResponseStatus::Ok => Ok(payload),
                ResponseStatus::NoMatch => Err(Error::NoMatch(rpc_id)),
                ResponseStatus::Finalizing => Err(Error::Finalizing),
            };

            let span = handle.shared.monitor.begin(EventArgs::ForwardCb { op: key });
            settle(handle, key, result, span);
        }
    }
}

fn on_tracked(handle: &Handle, key: OpKey, event: EngineEvent) -> bool {
    let registry = &handle.shared.registry;
    let Some(kind) = registry.kind(key) else {
        tracing::trace!(op = %key, "completion for an operation nobody tracks");
        return false;
    };

    match (kind, event) {
        (OpKind::Call, EngineEvent::Sent(Ok(()))) => registry.mark_awaiting(key),
        (OpKind::Call, EngineEvent::Sent(Err(e))) => {
            let span = handle.shared.monitor.begin(EventArgs::ForwardCb { op: key });
            settle(handle, key, Err(e.into()), span);
            true
        }
        (OpKind::Response, EngineEvent::Sent(res)) => {
            let span = handle.shared.monitor.begin(EventArgs::RespondCb { op: key });
            let result = res.map(|()| Vec::new()).map_err(Error::from);
            settle(handle, key, result, span);
            true
        }
        (OpKind::Bulk, EngineEvent::Transferred(res)) => {
            let span = handle.shared.monitor.begin(EventArgs::BulkTransferCb { op: key });
            let result = res.map(|_| Vec::new()).map_err(Error::from);
            settle(handle, key, result, span);
            true
        }
        (_, EngineEvent::Cancelled) => registry.cancel(key, CancelReason::Cancelled).is_ok(),
        (kind, event) => {
            tracing::debug!(op = %key, ?kind, ?event, "unexpected completion");
            false
        }
    }
}

/// Completes `key` and records the outcome on its callback span.
fn settle(handle: &Handle, key: OpKey, result: Result<Vec<u8>>, mut span: MonitorSpan) {
    let registry = &handle.shared.registry;
    if tracing::enabled!(tracing::Level::TRACE) {
        tracing::trace!(op = %key, owner = ?registry.owner(key), ok = result.is_ok(), "completing");
    }

    let res = registry.complete(key, result);
    span.set_outcome(&res);
    drop(span);
    check_completion(key, res);
}

fn check_completion(key: OpKey, res: Result<()>) {
    match res {
        Ok(()) => {}
        Err(Error::Lifecycle(LifecycleError::DoubleCompletion(_))) => {
            // The registry can no longer tell which owner a result belongs
            // to. Carrying on risks handing it to the wrong task.
            tracing::error!(op = %key, "FATAL: operation completed twice, aborting");
            std::process::abort();
        }
        Err(Error::Lifecycle(LifecycleError::StaleOperation(_))) | Err(Error::Finalized) => {
            tracing::trace!(op = %key, "late completion dropped");
        }
        Err(e) => tracing::warn!(op = %key, error = %e, "completion rejected"),
    }
}

fn fire_timer(handle: &Handle, id: TimerId, action: TimerAction) {
    let shared = &handle.shared;
    match action {
        TimerAction::Wake(key) => check_completion(key, shared.registry.complete(key, Ok(Vec::new()))),
        TimerAction::Expire(key) => match shared.registry.cancel(key, CancelReason::TimedOut) {
            Ok(Some(op)) => {
                if let Err(e) = shared.engine.cancel(op) {
                    tracing::debug!(op = %key, error = %e, "engine cancel failed");
                }
            }
            Ok(None) => {}
            Err(_) => tracing::trace!(op = %key, "deadline of a consumed operation"),
        },
        TimerAction::Callback(timer) => timer.fire(id, handle),
    }
}

#[cfg(test)]
mod tests {
    use crate::Instance;
    use crate::engine::{Fabric, LoopbackEngine};
    use anyhow::Result;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_loop_counts_iterations() -> Result<()> {
        let fabric = Fabric::new();
        let instance = Instance::builder()
            .max_timeout_ms(1)
            .engine(Arc::new(LoopbackEngine::bind(&fabric, "progress-counts")?))
            .build()?;

        std::thread::sleep(Duration::from_millis(20));
        assert!(instance.num_progress_calls() > 0);
        assert!(instance.num_trigger_calls() > 0);

        instance.finalize()?;
        let progress = instance.num_progress_calls();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(instance.num_progress_calls(), progress);
        Ok(())
    }

    #[test]
    fn test_sleep_resolution_follows_deadline_not_ceiling() -> Result<()> {
        let fabric = Fabric::new();
        let instance = Instance::builder()
            .max_timeout_ms(10_000)
            .engine(Arc::new(LoopbackEngine::bind(&fabric, "progress-sleep")?))
            .build()?;

        let started = std::time::Instant::now();
        instance.block_on(instance.sleep(Duration::from_millis(20)))?;
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(20));
        assert!(elapsed < Duration::from_secs(5), "slept {elapsed:?}");

        instance.finalize()?;
        Ok(())
    }
}
