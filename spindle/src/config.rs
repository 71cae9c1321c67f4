use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Pool shared by progress and handlers when no dedicated progress pool is
/// requested.
pub const PRIMARY_POOL: &str = "__primary__";
pub const PROGRESS_POOL: &str = "__progress__";
pub const HANDLER_POOL: &str = "__rpc__";

/// Instance configuration, usually read from JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// `protocol://name`. An empty name binds an anonymous endpoint.
    pub address: String,

    /// Ceiling of the progress loop's blocking poll when idle. Also bounds
    /// the resolution of sleeps and timeouts when nothing else is happening.
    pub max_timeout_ms: u64,

    pub progress_pool_size: usize,

    pub rpc_handler_pool_size: usize,

    /// Run the progress loop on its own pool instead of sharing one with the
    /// handlers.
    pub use_dedicated_progress_pool: bool,

    /// Extra named pools handlers can be registered on.
    pub pools: Vec<PoolConfig>,

    /// Receive buffers kept posted to the engine.
    pub receive_depth: usize,

    /// Scheduler ticks between two looks at a pool's global queue.
    pub global_queue_interval: u32,

    pub thread_stack_size: Option<usize>,

    /// Registers the `__shutdown__` rpc so peers can finalize this instance.
    pub enable_remote_shutdown: bool,

    /// Bound on how long finalize waits for in-flight work before
    /// cancelling it. Unset waits forever.
    pub finalize_drain_timeout_ms: Option<u64>,

    pub monitor: Option<MonitorConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            address: "loopback://".to_string(),
            max_timeout_ms: 100,
            progress_pool_size: 1,
            rpc_handler_pool_size: 1,
            use_dedicated_progress_pool: false,
            pools: Vec::new(),
            receive_depth: 64,
            global_queue_interval: 31,
            thread_stack_size: None,
            enable_remote_shutdown: false,
            finalize_drain_timeout_ms: None,
            monitor: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PoolConfig {
    pub name: String,
    pub workers: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MonitorConfig {
    /// One of the built-in monitors: `noop`, `counting` or `stats`.
    pub name: String,
    /// Handed verbatim to the monitor's `initialize`.
    #[serde(default)]
    pub config: Option<serde_json::Value>,
}

impl Config {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Config =
            serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.progress_pool_size == 0 || self.rpc_handler_pool_size == 0 {
            return Err(Error::Config("pool sizes must be greater than 0".into()));
        }
        if self.global_queue_interval == 0 {
            return Err(Error::Config("global_queue_interval must be greater than 0".into()));
        }
        if self.receive_depth == 0 {
            return Err(Error::Config("receive_depth must be greater than 0".into()));
        }

        let mut seen = vec![PRIMARY_POOL, PROGRESS_POOL, HANDLER_POOL];
        for pool in &self.pools {
            if pool.workers == 0 {
                return Err(Error::Config(format!("pool {:?} has no workers", pool.name)));
            }
            if pool.name.is_empty() || seen.contains(&pool.name.as_str()) {
                return Err(Error::Config(format!("invalid pool name {:?}", pool.name)));
            }
            seen.push(pool.name.as_str());
        }

        Ok(())
    }

    /// Serialized configuration handed to the monitor, if any.
    pub(crate) fn monitor_config(&self) -> Option<String> {
        self.monitor
            .as_ref()
            .and_then(|m| m.config.as_ref())
            .map(|c| match c {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            })
    }
}
