use crate::config::{Config, MonitorConfig, PoolConfig};
use crate::engine::{self, NetworkEngine};
use crate::error::{Error, Result};
use crate::instance::{Callbacks, Handle, Instance, Lifecycle, LifecycleState, Shared, pool_topology};
use crate::monitor::{self, Monitor, MonitorSlot};
use crate::progress;
use crate::registry::CompletionRegistry;
use crate::rpc::RpcTable;
use crate::runtime::{PoolSpec, ThreadPool};
use crate::timer::TimerQueue;
use crate::utils::IdleSignal;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

/// Configures and starts an [`Instance`].
pub struct Builder {
    config: Config,

    /// Replaces the engine the address would resolve to.
    engine: Option<Arc<dyn NetworkEngine>>,

    /// Replaces the monitor selected by name in the configuration.
    monitor: Option<(Arc<dyn Monitor>, Option<String>)>,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    pub fn new() -> Self {
        Self::from_config(Config::default())
    }

    pub fn from_config(config: Config) -> Self {
        Self {
            config,
            engine: None,
            monitor: None,
        }
    }

    pub fn address(&mut self, val: impl Into<String>) -> &mut Self {
        self.config.address = val.into();
        self
    }

    pub fn max_timeout_ms(&mut self, val: u64) -> &mut Self {
        self.config.max_timeout_ms = val;
        self
    }

    /// # Panics
    ///
    /// This function will panic if 0 is passed as an argument.
    #[track_caller]
    pub fn progress_pool_size(&mut self, val: usize) -> &mut Self {
        assert!(val > 0, "progress_pool_size must be greater than 0");
        self.config.progress_pool_size = val;
        self
    }

    /// # Panics
    ///
    /// This function will panic if 0 is passed as an argument.
    #[track_caller]
    pub fn rpc_handler_pool_size(&mut self, val: usize) -> &mut Self {
        assert!(val > 0, "rpc_handler_pool_size must be greater than 0");
        self.config.rpc_handler_pool_size = val;
        self
    }

    pub fn use_dedicated_progress_pool(&mut self, val: bool) -> &mut Self {
        self.config.use_dedicated_progress_pool = val;
        self
    }

    /// # Panics
    ///
    /// This function will panic if 0 is passed as `workers`.
    #[track_caller]
    pub fn pool(&mut self, name: impl Into<String>, workers: usize) -> &mut Self {
        assert!(workers > 0, "a pool needs at least one worker");
        self.config.pools.push(PoolConfig {
            name: name.into(),
            workers,
        });
        self
    }

    /// # Panics
    ///
    /// This function will panic if 0 is passed as an argument.
    #[track_caller]
    pub fn global_queue_interval(&mut self, val: u32) -> &mut Self {
        assert!(val > 0, "global_queue_interval must be greater than 0");
        self.config.global_queue_interval = val;
        self
    }

    pub fn thread_stack_size(&mut self, val: usize) -> &mut Self {
        self.config.thread_stack_size = Some(val);
        self
    }

    pub fn enable_remote_shutdown(&mut self, val: bool) -> &mut Self {
        self.config.enable_remote_shutdown = val;
        self
    }

    pub fn finalize_drain_timeout_ms(&mut self, val: u64) -> &mut Self {
        self.config.finalize_drain_timeout_ms = Some(val);
        self
    }

    /// Selects one of the built-in monitors by name.
    pub fn monitor_name(&mut self, name: impl Into<String>, config: Option<serde_json::Value>) -> &mut Self {
        self.config.monitor = Some(MonitorConfig {
            name: name.into(),
            config,
        });
        self
    }

    pub fn monitor(&mut self, monitor: Arc<dyn Monitor>, config: Option<&str>) -> &mut Self {
        self.monitor = Some((monitor, config.map(str::to_string)));
        self
    }

    pub fn engine(&mut self, engine: Arc<dyn NetworkEngine>) -> &mut Self {
        self.engine = Some(engine);
        self
    }

    /// Starts the pools and the progress loop.
    pub fn build(&mut self) -> Result<Instance> {
        let config = self.config.clone();
        config.validate()?;

        let monitor = match (&self.monitor, &config.monitor) {
            (Some((monitor, cfg)), _) => Some((Arc::clone(monitor), cfg.clone())),
            (None, Some(selected)) => Some((monitor::from_name(&selected.name)?, config.monitor_config())),
            (None, None) => None,
        };

        let engine = match &self.engine {
            Some(engine) => Arc::clone(engine),
            None => engine::connect(&config.address)?,
        };

        let id = NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed);
        let (topology, progress_pool, handler_pool) = pool_topology(&config);

        let mut threads = Vec::with_capacity(topology.len());
        for (index, (name, workers)) in topology.into_iter().enumerate() {
            let spec = PoolSpec {
                name,
                index,
                workers,
                owner: id,
                global_queue_interval: config.global_queue_interval,
                stack_size: config.thread_stack_size,
            };

            match ThreadPool::start(&spec) {
                Ok(pool) => threads.push(pool),
                Err(e) => {
                    shutdown_all(&threads);
                    return Err(Error::Config(format!("failed to start pool {}: {e:#}", spec.name)));
                }
            }
        }

        // A task resumed on the progress pool must not wait behind a progress
        // loop blocked in the engine.
        let waker_engine = Arc::clone(&engine);
        threads[progress_pool]
            .pool()
            .set_wake_hook(Box::new(move || waker_engine.interrupt()));

        let address = engine.self_address();
        let idle = Arc::new(IdleSignal::new());
        let shared = Arc::new(Shared {
            id,
            pools: threads.iter().map(|t| t.pool().clone()).collect(),
            progress_pool,
            handler_pool,
            address: address.clone(),
            engine,
            registry: Arc::new(CompletionRegistry::with_idle(Arc::clone(&idle))),
            timers: Arc::new(TimerQueue::new()),
            monitor: MonitorSlot::new(),
            rpcs: RpcTable::with_idle(Arc::clone(&idle)),
            idle,
            lifecycle: Mutex::new(Lifecycle {
                state: LifecycleState::Running,
                finalize_requested: false,
            }),
            lifecycle_changed: Condvar::new(),
            callbacks: Mutex::new(Callbacks::default()),
            pending_work: AtomicBool::new(false),
            stop_progress: AtomicBool::new(false),
            num_progress: AtomicU64::new(0),
            num_trigger: AtomicU64::new(0),
            config,
        });

        let handle = Handle { shared };
        if let Some((monitor, cfg)) = monitor {
            handle.set_monitor(Some(monitor), cfg.as_deref());
        }

        let progress = handle.progress_pool().spawn(progress::run(handle.clone()));
        let instance = Instance {
            handle,
            threads,
            progress: Mutex::new(Some(progress)),
        };

        if instance.config().enable_remote_shutdown {
            instance.register_remote_shutdown()?;
        }

        tracing::debug!(
            address = %address,
            pools = instance.num_pools(),
            "instance initialized"
        );
        Ok(instance)
    }
}

fn shutdown_all(threads: &[ThreadPool]) {
    for pool in threads {
        if let Err(e) = pool.shutdown() {
            tracing::warn!(pool = pool.pool().name(), error = %e, "pool shutdown failed");
        }
    }
}
