use crate::engine::{Fabric, LoopbackEngine};
use crate::instance::{Builder, Instance};
use crate::monitor::{EventKind, EventPhase, Monitor, MonitorEvent, Outcome};
use crate::runtime::{Schedule, ScheduleReason};
use crate::task::{Id, Task};
use anyhow::Result;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::Wake;

/// Records what the task layer asks of its scheduler instead of running
/// anything.
#[derive(Debug, Default)]
pub(crate) struct RecordingScheduler {
    scheduled: Mutex<Vec<(Id, ScheduleReason)>>,
    released: Mutex<Vec<Id>>,
}

impl RecordingScheduler {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn scheduled(&self) -> Vec<(Id, ScheduleReason)> {
        self.scheduled.lock().clone()
    }

    pub(crate) fn released(&self) -> Vec<Id> {
        self.released.lock().clone()
    }
}

impl Schedule for RecordingScheduler {
    fn schedule(&self, task: Arc<Task>, reason: ScheduleReason) {
        self.scheduled.lock().push((task.id(), reason));
    }

    fn release(&self, id: &Id) {
        self.released.lock().push(*id);
    }
}

/// Waker that only counts how often it was woken.
#[derive(Debug, Default)]
pub(crate) struct FlagWaker {
    wakes: AtomicUsize,
}

impl FlagWaker {
    pub(crate) fn wakes(&self) -> usize {
        self.wakes.load(Ordering::Acquire)
    }
}

impl Wake for FlagWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.wakes.fetch_add(1, Ordering::AcqRel);
    }
}

/// Keeps every event it sees, in order.
#[derive(Debug, Default)]
pub(crate) struct SpyMonitor {
    events: Mutex<Vec<(EventKind, EventPhase, Outcome)>>,
}

impl SpyMonitor {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn events(&self) -> Vec<(EventKind, EventPhase, Outcome)> {
        self.events.lock().clone()
    }
}

impl Monitor for SpyMonitor {
    fn name(&self) -> &str {
        "spy"
    }

    fn on_event(&self, _timestamp: f64, phase: EventPhase, event: &mut MonitorEvent) {
        self.events.lock().push((event.kind(), phase, event.outcome));
    }
}

/// Builder bound to `name` on `fabric`, with a short poll ceiling so tests
/// never wait on an idle loop.
pub(crate) fn builder_on(fabric: &Arc<Fabric>, name: &str) -> Result<Builder> {
    let mut builder = Instance::builder();
    builder
        .max_timeout_ms(5)
        .engine(Arc::new(LoopbackEngine::bind(fabric, name)?));
    Ok(builder)
}

pub(crate) fn init_instance(fabric: &Arc<Fabric>, name: &str) -> Result<Instance> {
    Ok(builder_on(fabric, name)?.build()?)
}
