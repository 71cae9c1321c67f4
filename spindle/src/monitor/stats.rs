use crate::engine::Address;
use crate::monitor::{EventKind, EventPhase, Monitor, MonitorData, MonitorEvent, Outcome};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Duration statistics of one event kind, in seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct KindStats {
    pub count: u64,
    pub failures: u64,
    pub total: f64,
    pub min: f64,
    pub max: f64,
}

impl KindStats {
    fn record(&mut self, duration: f64, failed: bool) {
        if self.count == 0 || duration < self.min {
            self.min = duration;
        }
        if duration > self.max {
            self.max = duration;
        }
        self.count += 1;
        self.total += duration;
        self.failures += failed as u64;
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total / self.count as f64
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct StatsConfig {
    /// Written on finalize when set.
    filename: Option<PathBuf>,
    pretty: bool,
}

#[derive(Debug, Default)]
struct State {
    config: StatsConfig,
    address: Option<Address>,
    spans: Vec<KindStats>,
    points: Vec<u64>,
}

/// Measures the time between START and END of every event kind.
#[derive(Debug)]
pub struct StatsMonitor {
    state: Mutex<State>,
}

impl Default for StatsMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsMonitor {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                spans: vec![KindStats::default(); EventKind::COUNT],
                points: vec![0; EventKind::COUNT],
                ..State::default()
            }),
        }
    }

    pub fn stats(&self, kind: EventKind) -> KindStats {
        self.state.lock().spans[kind.index()]
    }

    pub fn points(&self, kind: EventKind) -> u64 {
        self.state.lock().points[kind.index()]
    }

    fn to_json(state: &State) -> serde_json::Value {
        let mut spans = serde_json::Map::new();
        for kind in EventKind::ALL {
            let stats = &state.spans[kind.index()];
            if stats.count > 0 {
                let mut entry = serde_json::json!(stats);
                entry["mean"] = serde_json::json!(stats.mean());
                spans.insert(kind.as_str().to_string(), entry);
            }
        }

        let points = EventKind::ALL
            .into_iter()
            .filter(|k| state.points[k.index()] > 0)
            .map(|k| (k.as_str().to_string(), serde_json::json!(state.points[k.index()])))
            .collect::<serde_json::Map<_, _>>();

        serde_json::json!({
            "address": state.address.as_ref().map(Address::as_str),
            "spans": spans,
            "points": points,
        })
    }
}

impl Monitor for StatsMonitor {
    fn name(&self) -> &str {
        "stats"
    }

    fn initialize(&self, address: &Address, config: Option<&str>) {
        let mut state = self.state.lock();
        state.address = Some(address.clone());

        state.config = match config.map(serde_json::from_str::<StatsConfig>) {
            None => StatsConfig::default(),
            Some(Ok(config)) => config,
            Some(Err(e)) => {
                tracing::warn!(error = %e, "ignoring invalid stats monitor config");
                StatsConfig::default()
            }
        };
    }

    fn finalize(&self) {
        let state = self.state.lock();
        let Some(path) = state.config.filename.as_ref() else {
            return;
        };

        let json = Self::to_json(&state);
        let rendered = if state.config.pretty {
            serde_json::to_string_pretty(&json)
        } else {
            serde_json::to_string(&json)
        };

        match rendered.map(|s| std::fs::write(path, s)) {
            Ok(Ok(())) => tracing::debug!(path = %path.display(), "stats written"),
            Ok(Err(e)) => tracing::warn!(path = %path.display(), error = %e, "failed to write stats"),
            Err(e) => tracing::warn!(error = %e, "failed to render stats"),
        }
    }

    fn on_event(&self, timestamp: f64, phase: EventPhase, event: &mut MonitorEvent) {
        let index = event.kind().index();
        match phase {
            EventPhase::Start => event.uctx = MonitorData::Float(timestamp),
            EventPhase::End => {
                let MonitorData::Float(started) = event.uctx else {
                    return;
                };
                let failed = matches!(event.outcome, Outcome::Failure(_));
                self.state.lock().spans[index].record(timestamp - started, failed);
            }
            EventPhase::Point => self.state.lock().points[index] += 1,
        }
    }

    fn report(&self) -> Option<serde_json::Value> {
        Some(Self::to_json(&self.state.lock()))
    }
}
