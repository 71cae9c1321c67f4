use super::*;
use crate::test_utils::FlagWaker;
use anyhow::Result;
use rstest::rstest;
use std::sync::Arc;
use std::task::Poll;

fn ready(registry: &CompletionRegistry, key: OpKey) -> Consumed {
    match registry.poll_outcome(key, Waker::noop()) {
        Poll::Ready(Ok(consumed)) => consumed,
        Poll::Ready(Err(e)) => panic!("entry {key} failed: {e}"),
        Poll::Pending => panic!("entry {key} still pending"),
    }
}

#[test]
fn test_complete_resumes_owner_once() -> Result<()> {
    let registry = CompletionRegistry::new();
    let key = registry.register(OpKind::Call)?;

    let flag = Arc::new(FlagWaker::default());
    let waker = Waker::from(Arc::clone(&flag));
    assert!(registry.poll_outcome(key, &waker).is_pending());
    assert_eq!(flag.wakes(), 0);

    assert!(registry.mark_awaiting(key));
    assert_eq!(registry.phase(key), Some(Phase::AwaitingResponse));

    registry.complete(key, Ok(b"pong".to_vec()))?;
    assert_eq!(flag.wakes(), 1);
    assert_eq!(registry.phase(key), Some(Phase::Completed));

    let consumed = ready(&registry, key);
    assert_eq!(consumed.result?, b"pong");
    assert!(registry.is_empty());
    Ok(())
}

#[test]
fn test_double_completion_is_rejected() -> Result<()> {
    let registry = CompletionRegistry::new();
    let key = registry.register(OpKind::Response)?;

    registry.complete(key, Ok(Vec::new()))?;
    let err = registry.complete(key, Ok(Vec::new()));

    assert!(matches!(
        err,
        Err(Error::Lifecycle(LifecycleError::DoubleCompletion(k))) if k == key
    ));
    Ok(())
}

#[rstest]
#[case::cancelled(CancelReason::Cancelled, Phase::Cancelled)]
#[case::timed_out(CancelReason::TimedOut, Phase::TimedOut)]
fn test_completion_after_cancel_is_stale(
    #[case] reason: CancelReason,
    #[case] phase: Phase,
) -> Result<()> {
    let registry = CompletionRegistry::new();
    let key = registry.register(OpKind::Call)?;

    registry.cancel(key, reason)?;
    assert_eq!(registry.phase(key), Some(phase));

    let late = registry.complete(key, Ok(b"late".to_vec()));
    assert!(matches!(
        late,
        Err(Error::Lifecycle(LifecycleError::StaleOperation(_)))
    ));

    let consumed = ready(&registry, key);
    match reason {
        CancelReason::Cancelled => assert!(matches!(consumed.result, Err(Error::Cancelled))),
        CancelReason::TimedOut => assert!(matches!(consumed.result, Err(Error::Timeout))),
    }
    assert!(registry.is_empty());
    Ok(())
}

#[test]
fn test_cancel_reports_engine_op_and_ignores_finished() -> Result<()> {
    let registry = CompletionRegistry::new();
    let key = registry.register(OpKind::Bulk)?;
    registry.attach_engine_op(key, EngineOp(9));

    assert_eq!(registry.cancel(key, CancelReason::Cancelled)?, Some(EngineOp(9)));
    assert_eq!(registry.cancel(key, CancelReason::TimedOut)?, None);
    assert_eq!(registry.phase(key), Some(Phase::Cancelled));
    Ok(())
}

#[test]
fn test_recycled_slot_rejects_old_key() -> Result<()> {
    let registry = CompletionRegistry::new();
    let old = registry.register(OpKind::Sleep)?;
    registry.complete(old, Ok(Vec::new()))?;
    let _ = ready(&registry, old);

    let new = registry.register(OpKind::Sleep)?;
    assert_eq!(new.index(), old.index());
    assert_ne!(new, old);

    assert!(matches!(
        registry.complete(old, Ok(Vec::new())),
        Err(Error::Lifecycle(LifecycleError::StaleOperation(_)))
    ));
    assert_eq!(registry.phase(new), Some(Phase::Submitted));
    Ok(())
}

#[test]
fn test_discard_returns_leftovers() -> Result<()> {
    let registry = CompletionRegistry::new();
    let timers = crate::timer::TimerQueue::new();

    let key = registry.register(OpKind::Call)?;
    let timer = timers.insert(
        Instant::now() + Duration::from_secs(5),
        crate::timer::TimerAction::Expire(key),
    );
    registry.attach_timer(key, timer);
    registry.attach_engine_op(key, EngineOp(3));

    let discarded = registry.discard(key);
    assert!(matches!(
        discarded,
        Some(Discarded { engine_op: Some(EngineOp(3)), timer: Some(t) }) if t == timer
    ));
    assert!(registry.discard(key).is_none());
    assert!(registry.is_empty());
    Ok(())
}

#[test]
fn test_cancel_all_wakes_every_pending_owner() -> Result<()> {
    let registry = CompletionRegistry::new();
    let flag = Arc::new(FlagWaker::default());
    let waker = Waker::from(Arc::clone(&flag));

    let keys = (0..4)
        .map(|_| registry.register(OpKind::Call))
        .collect::<crate::error::Result<Vec<_>>>()?;
    for key in &keys {
        registry.attach_engine_op(*key, EngineOp(key.as_u64()));
        assert!(registry.poll_outcome(*key, &waker).is_pending());
    }
    registry.complete(keys[0], Ok(Vec::new()))?;

    let ops = registry.cancel_all();
    assert_eq!(ops.len(), 3);
    assert_eq!(flag.wakes(), 4);
    assert!(keys[1..]
        .iter()
        .all(|k| registry.phase(*k) == Some(Phase::Cancelled)));
    Ok(())
}

#[test]
fn test_sealed_registry_rejects_everything() -> Result<()> {
    let registry = CompletionRegistry::new();
    let key = registry.register(OpKind::Call)?;
    registry.seal();

    assert!(matches!(registry.register(OpKind::Call), Err(Error::Finalized)));
    assert!(matches!(registry.complete(key, Ok(Vec::new())), Err(Error::Finalized)));
    Ok(())
}

#[test]
fn test_generation_skips_sentinels() {
    let mut inner = Inner {
        slab: Slab::new(),
        next_generation: u32::MAX - 1,
        sealed: false,
        outstanding: 0,
    };

    assert_eq!(inner.bump_generation(), u32::MAX - 1);
    assert_eq!(inner.bump_generation(), 1);
}

#[test]
fn test_owner_is_recorded_inside_tasks() -> Result<()> {
    let registry = CompletionRegistry::new();
    let outside = registry.register(OpKind::Call)?;
    assert_eq!(registry.owner(outside), None);
    assert_eq!(registry.kind(outside), Some(OpKind::Call));

    let id = crate::task::Id::next();
    let inside = {
        let _guard = crate::task::TaskIdGuard::enter(id);
        registry.register(OpKind::Call)?
    };
    assert_eq!(registry.owner(inside), Some(id));
    Ok(())
}

#[test]
fn test_sleeps_are_not_outstanding() -> Result<()> {
    let registry = CompletionRegistry::new();
    let call = registry.register(OpKind::Call)?;
    let nap = registry.register(OpKind::Sleep)?;

    assert_eq!(registry.len(), 2);
    assert_eq!(registry.outstanding(), 1);

    registry.discard(call);
    assert_eq!(registry.outstanding(), 0);
    assert_eq!(registry.len(), 1);

    assert_eq!(registry.cancel_kind(OpKind::Sleep), 1);
    assert_eq!(registry.phase(nap), Some(Phase::Cancelled));
    assert!(matches!(ready(&registry, nap).result, Err(Error::Cancelled)));
    assert!(registry.is_empty());
    Ok(())
}

#[test]
fn test_last_outstanding_entry_notifies_idle() -> Result<()> {
    let idle = Arc::new(IdleSignal::new());
    let registry = Arc::new(CompletionRegistry::with_idle(Arc::clone(&idle)));
    let key = registry.register(OpKind::Bulk)?;

    let completer = {
        let registry = Arc::clone(&registry);
        std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(10));
            registry.complete(key, Ok(Vec::new()))?;
            ready(&registry, key).result?;
            anyhow::Ok(())
        })
    };

    let deadline = Instant::now() + std::time::Duration::from_secs(5);
    assert!(idle.wait_until(Some(deadline), || registry.outstanding() == 0));
    completer.join().map_err(|_| anyhow::anyhow!("completer panicked"))??;
    Ok(())
}
