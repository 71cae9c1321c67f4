//! Pluggable observation of every lifecycle transition.
//!
//! Exactly one [`Monitor`] is active per instance. Instrumented operations
//! open a span before their logic and close it after, so START and END always
//! pair per invocation, error paths and early returns included. A no-op
//! monitor is installed when nothing else is, so call sites never branch on
//! whether monitoring is enabled.

use crate::engine::Address;
use crate::error::{Error, Result};
use parking_lot::RwLock;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

mod counting;
pub use self::counting::CountingMonitor;

mod event;
pub use self::event::{EventArgs, EventKind, EventPhase, MonitorData, MonitorEvent, Outcome};

mod stats;
pub use self::stats::{KindStats, StatsMonitor};

/// Observer of runtime events. Callbacks are side-effect only: they must not
/// fail and must not call back into the instance. A panicking callback is
/// caught, logged and otherwise ignored.
pub trait Monitor: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Called once when the monitor becomes the active one.
    fn initialize(&self, _address: &Address, _config: Option<&str>) {}

    /// Called once when the monitor is replaced or the instance finalizes.
    fn finalize(&self) {}

    /// `timestamp` is seconds since the instance started.
    fn on_event(&self, timestamp: f64, phase: EventPhase, event: &mut MonitorEvent);

    /// Optional JSON summary exposed through `Handle::monitor_report`.
    fn report(&self) -> Option<serde_json::Value> {
        None
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMonitor;

impl Monitor for NoopMonitor {
    fn name(&self) -> &str {
        "noop"
    }

    #[inline(always)]
    fn on_event(&self, _timestamp: f64, _phase: EventPhase, _event: &mut MonitorEvent) {}
}

/// Builds one of the built-in monitors by name.
pub fn from_name(name: &str) -> Result<Arc<dyn Monitor>> {
    match name {
        "noop" | "default" => Ok(Arc::new(NoopMonitor)),
        "counting" => Ok(Arc::new(CountingMonitor::new())),
        "stats" => Ok(Arc::new(StatsMonitor::new())),
        other => Err(Error::Config(format!("unknown monitor {other:?}"))),
    }
}

fn guarded<F: FnOnce()>(monitor: &dyn Monitor, what: &str, f: F) {
    if panic::catch_unwind(AssertUnwindSafe(f)).is_err() {
        tracing::error!(monitor = monitor.name(), callback = what, "monitor callback panicked");
    }
}

fn dispatch(monitor: &dyn Monitor, epoch: Instant, phase: EventPhase, event: &mut MonitorEvent) {
    let timestamp = epoch.elapsed().as_secs_f64();
    guarded(monitor, event.kind().as_str(), || {
        monitor.on_event(timestamp, phase, event)
    });
}

/// Holds the active monitor of an instance.
pub(crate) struct MonitorSlot {
    current: RwLock<Arc<dyn Monitor>>,
    epoch: Instant,
}

impl MonitorSlot {
    pub(crate) fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(NoopMonitor)),
            epoch: Instant::now(),
        }
    }

    pub(crate) fn current(&self) -> Arc<dyn Monitor> {
        Arc::clone(&self.current.read())
    }

    /// Finalizes the active monitor, then initializes and installs `next`.
    pub(crate) fn replace(&self, next: Arc<dyn Monitor>, address: &Address, config: Option<&str>) {
        let mut current = self.current.write();

        let previous = Arc::clone(&current);
        guarded(previous.as_ref(), "finalize", || previous.finalize());
        guarded(next.as_ref(), "initialize", || next.initialize(address, config));

        tracing::debug!(from = previous.name(), to = next.name(), "monitor replaced");
        *current = next;
    }

    /// Finalizes the active monitor and falls back to the no-op one. Events
    /// emitted afterwards, by handles dropped late, go nowhere.
    pub(crate) fn shutdown(&self) {
        let mut current = self.current.write();
        let previous = std::mem::replace(&mut *current, Arc::new(NoopMonitor));
        guarded(previous.as_ref(), "finalize", || previous.finalize());
    }

    /// Emits START now and END when the span drops. END goes to the monitor
    /// that saw START, even if another was installed in between.
    pub(crate) fn begin(&self, args: EventArgs) -> MonitorSpan {
        let monitor = self.current();
        let mut event = MonitorEvent::new(args);
        dispatch(monitor.as_ref(), self.epoch, EventPhase::Start, &mut event);

        MonitorSpan {
            monitor,
            epoch: self.epoch,
            event,
        }
    }

    pub(crate) fn point(&self, args: EventArgs) {
        let monitor = self.current();
        let mut event = MonitorEvent::new(args);
        dispatch(monitor.as_ref(), self.epoch, EventPhase::Point, &mut event);
    }
}

#[must_use = "dropping the span emits END immediately"]
pub(crate) struct MonitorSpan {
    monitor: Arc<dyn Monitor>,
    epoch: Instant,
    event: MonitorEvent,
}

impl MonitorSpan {
    pub(crate) fn args_mut(&mut self) -> &mut EventArgs {
        &mut self.event.args
    }

    pub(crate) fn set_outcome<T>(&mut self, res: &Result<T>) {
        self.event.outcome = Outcome::of(res);
    }

    pub(crate) fn succeed(&mut self) {
        self.event.outcome = Outcome::Success;
    }
}

impl Drop for MonitorSpan {
    fn drop(&mut self) {
        dispatch(self.monitor.as_ref(), self.epoch, EventPhase::End, &mut self.event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::SpyMonitor;
    use static_assertions::assert_impl_all;

    assert_impl_all!(MonitorSpan: Send);
    assert_impl_all!(CountingMonitor: Send, Sync);

    fn address() -> Address {
        Address::new("loopback", "monitor-tests")
    }

    #[test]
    fn test_span_pairs_start_and_end() {
        let slot = MonitorSlot::new();
        let spy = Arc::new(SpyMonitor::new());
        slot.replace(spy.clone(), &address(), None);

        {
            let mut span = slot.begin(EventArgs::Prefinalize);
            span.succeed();
        }

        assert_eq!(
            spy.events(),
            vec![
                (EventKind::Prefinalize, EventPhase::Start, Outcome::Pending),
                (EventKind::Prefinalize, EventPhase::End, Outcome::Success),
            ]
        );
    }

    #[test]
    fn test_span_ends_on_early_return() {
        fn failing(slot: &MonitorSlot) -> Result<()> {
            let mut span = slot.begin(EventArgs::Finalize);
            let res: Result<()> = Err(Error::Finalized);
            span.set_outcome(&res);
            res?;
            Ok(())
        }

        let slot = MonitorSlot::new();
        let counting = Arc::new(CountingMonitor::new());
        slot.replace(counting.clone(), &address(), None);

        assert!(failing(&slot).is_err());
        assert_eq!(counting.starts(EventKind::Finalize), 1);
        assert_eq!(counting.ends(EventKind::Finalize), 1);
    }

    #[test]
    fn test_replace_finalizes_previous_before_initializing_next() {
        let slot = MonitorSlot::new();
        let a = Arc::new(CountingMonitor::new());
        let b = Arc::new(CountingMonitor::new());

        slot.replace(a.clone(), &address(), Some("a"));
        slot.point(EventArgs::Prefinalize);
        slot.replace(b.clone(), &address(), Some("b"));
        slot.point(EventArgs::Prefinalize);

        assert_eq!(a.initialized(), 1);
        assert_eq!(a.finalized(), 1);
        assert_eq!(b.initialized(), 1);
        assert_eq!(b.finalized(), 0);
        assert_eq!(b.config().as_deref(), Some("b"));
        assert_eq!(a.count(EventKind::Prefinalize, EventPhase::Point), 1);
        assert_eq!(b.count(EventKind::Prefinalize, EventPhase::Point), 1);
    }

    #[test]
    fn test_end_goes_to_monitor_that_saw_start() {
        let slot = MonitorSlot::new();
        let a = Arc::new(CountingMonitor::new());
        let b = Arc::new(CountingMonitor::new());
        slot.replace(a.clone(), &address(), None);

        let span = slot.begin(EventArgs::Prefinalize);
        slot.replace(b.clone(), &address(), None);
        drop(span);

        assert_eq!(a.starts(EventKind::Prefinalize), 1);
        assert_eq!(a.ends(EventKind::Prefinalize), 1);
        assert_eq!(b.ends(EventKind::Prefinalize), 0);
    }

    struct Faulty;

    impl Monitor for Faulty {
        fn name(&self) -> &str {
            "faulty"
        }

        fn on_event(&self, _ts: f64, _phase: EventPhase, _event: &mut MonitorEvent) {
            panic!("monitor bug");
        }
    }

    #[test]
    fn test_panicking_monitor_is_contained() {
        let slot = MonitorSlot::new();
        slot.replace(Arc::new(Faulty), &address(), None);

        let span = slot.begin(EventArgs::Prefinalize);
        drop(span);
        slot.point(EventArgs::Finalize);
    }

    #[test]
    fn test_from_name() {
        let name = |n: &str| from_name(n).map(|m| m.name().to_string()).ok();
        assert_eq!(name("counting").as_deref(), Some("counting"));
        assert_eq!(name("stats").as_deref(), Some("stats"));
        assert_eq!(name("default").as_deref(), Some("noop"));
        assert!(matches!(from_name("nope"), Err(Error::Config(_))));
    }
}
