use crate::engine::Address;
use crate::monitor::{EventKind, EventPhase, Monitor, MonitorEvent};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counts START, END and POINT calls per event kind.
#[derive(Debug)]
pub struct CountingMonitor {
    counts: [[AtomicU64; EventPhase::COUNT]; EventKind::COUNT],
    initialized: AtomicU64,
    finalized: AtomicU64,
    config: Mutex<Option<String>>,
}

impl Default for CountingMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl CountingMonitor {
    pub fn new() -> Self {
        Self {
            counts: std::array::from_fn(|_| std::array::from_fn(|_| AtomicU64::new(0))),
            initialized: AtomicU64::new(0),
            finalized: AtomicU64::new(0),
            config: Mutex::new(None),
        }
    }

    pub fn count(&self, kind: EventKind, phase: EventPhase) -> u64 {
        self.counts[kind.index()][phase.index()].load(Ordering::Relaxed)
    }

    pub fn starts(&self, kind: EventKind) -> u64 {
        self.count(kind, EventPhase::Start)
    }

    pub fn ends(&self, kind: EventKind) -> u64 {
        self.count(kind, EventPhase::End)
    }

    pub fn initialized(&self) -> u64 {
        self.initialized.load(Ordering::Relaxed)
    }

    pub fn finalized(&self) -> u64 {
        self.finalized.load(Ordering::Relaxed)
    }

    /// Configuration string received at initialization.
    pub fn config(&self) -> Option<String> {
        self.config.lock().clone()
    }

    /// Kinds with an unequal number of STARTs and ENDs.
    pub fn unpaired(&self) -> Vec<EventKind> {
        EventKind::ALL
            .into_iter()
            .filter(|k| self.starts(*k) != self.ends(*k))
            .collect()
    }

    pub fn reset(&self) {
        self.counts
            .iter()
            .flatten()
            .for_each(|c| c.store(0, Ordering::Relaxed));
    }

    /// `{ kind: [start, end, point] }` for every kind seen at least once.
    pub fn snapshot(&self) -> BTreeMap<EventKind, [u64; EventPhase::COUNT]> {
        EventKind::ALL
            .into_iter()
            .map(|k| {
                let row = &self.counts[k.index()];
                (k, std::array::from_fn(|i| row[i].load(Ordering::Relaxed)))
            })
            .filter(|(_, row)| row.iter().any(|n| *n > 0))
            .collect()
    }
}

impl Monitor for CountingMonitor {
    fn name(&self) -> &str {
        "counting"
    }

    fn initialize(&self, _address: &Address, config: Option<&str>) {
        self.initialized.fetch_add(1, Ordering::Relaxed);
        *self.config.lock() = config.map(str::to_string);
    }

    fn finalize(&self) {
        self.finalized.fetch_add(1, Ordering::Relaxed);
    }

    fn on_event(&self, _timestamp: f64, phase: EventPhase, event: &mut MonitorEvent) {
        self.counts[event.kind().index()][phase.index()].fetch_add(1, Ordering::Relaxed);
    }

    fn report(&self) -> Option<serde_json::Value> {
        let snapshot = self
            .snapshot()
            .into_iter()
            .map(|(k, row)| (k.as_str().to_string(), serde_json::json!(row)))
            .collect::<serde_json::Map<_, _>>();
        Some(serde_json::Value::Object(snapshot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::EventArgs;

    #[test]
    fn test_counts_and_snapshot() {
        let monitor = CountingMonitor::new();
        let mut event = MonitorEvent::new(EventArgs::Prefinalize);

        monitor.on_event(0.0, EventPhase::Start, &mut event);
        assert_eq!(monitor.unpaired(), vec![EventKind::Prefinalize]);

        monitor.on_event(0.1, EventPhase::End, &mut event);
        assert!(monitor.unpaired().is_empty());

        let snapshot = monitor.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[&EventKind::Prefinalize], [1, 1, 0]);

        let report = monitor.report().unwrap_or_default();
        assert_eq!(report["prefinalize"], serde_json::json!([1, 1, 0]));

        monitor.reset();
        assert!(monitor.snapshot().is_empty());
    }
}
