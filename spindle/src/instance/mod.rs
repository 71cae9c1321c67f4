//! The root object of a runtime context.
//!
//! An [`Instance`] owns the worker threads and tears everything down on
//! finalize. Everything else goes through a [`Handle`], a cheap clone that
//! handlers, callers and timers carry around. Several instances can live in
//! one process, each with its own engine, pools and monitor.

use crate::config::{Config, HANDLER_POOL, PRIMARY_POOL, PROGRESS_POOL};
use crate::engine::{Address, NetworkEngine};
use crate::error::{Error, Result};
use crate::monitor::{EventArgs, Monitor, MonitorSlot, NoopMonitor};
use crate::registry::{CompletionRegistry, OpKey, Operation};
use crate::rpc::RpcTable;
use crate::runtime::{Pool, ThreadPool};
use crate::task::JoinHandle;
use crate::timer::TimerQueue;
use crate::utils::IdleSignal;
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

mod builder;
pub use self::builder::Builder;

mod finalize;


#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Running,
    /// New submissions are refused, in-flight work drains.
    Prefinalizing,
    /// Drained, pools are being torn down.
    Finalizing,
    Finalized,
}

type Callback = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct Callbacks {
    prefinalize: Vec<Callback>,
    finalize: Vec<Callback>,
}

struct Lifecycle {
    state: LifecycleState,
    finalize_requested: bool,
}

/// State reachable from every handle of one instance.
pub(crate) struct Shared {
    /// Distinguishes the workers of this instance from any other's.
    pub(crate) id: u64,
    pub(crate) config: Config,
    pub(crate) engine: Arc<dyn NetworkEngine>,
    pub(crate) address: Address,
    pub(crate) registry: Arc<CompletionRegistry>,
    pub(crate) timers: Arc<TimerQueue>,
    pub(crate) monitor: MonitorSlot,
    pub(crate) rpcs: RpcTable,
    /// Notified when the registry or the running handlers drain.
    pub(crate) idle: Arc<IdleSignal>,
    pub(crate) pools: Vec<Pool>,
    progress_pool: usize,
    handler_pool: usize,

    lifecycle: Mutex<Lifecycle>,
    lifecycle_changed: Condvar,
    callbacks: Mutex<Callbacks>,

    /// Set by every submission so the progress loop polls without blocking
    /// on its next iteration.
    pending_work: AtomicBool,
    pub(crate) stop_progress: AtomicBool,

    pub(crate) num_progress: AtomicU64,
    pub(crate) num_trigger: AtomicU64,
}

impl Shared {
    pub(crate) fn take_pending(&self) -> bool {
        self.pending_work.swap(false, Ordering::AcqRel)
    }
}

/// Cloneable access to a running instance.
#[derive(Clone)]
pub struct Handle {
    pub(crate) shared: Arc<Shared>,
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("address", &self.shared.address)
            .field("state", &self.state())
            .finish()
    }
}

impl Handle {
    pub fn address(&self) -> &Address {
        &self.shared.address
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn state(&self) -> LifecycleState {
        self.shared.lifecycle.lock().state
    }

    pub fn is_running(&self) -> bool {
        self.state() == LifecycleState::Running
    }

    pub fn num_pools(&self) -> usize {
        self.shared.pools.len()
    }

    pub fn pool_by_index(&self, index: usize) -> Option<&Pool> {
        self.shared.pools.get(index)
    }

    pub fn pool_by_name(&self, name: &str) -> Option<&Pool> {
        self.shared.pools.iter().find(|p| p.name() == name)
    }

    pub fn progress_pool(&self) -> &Pool {
        &self.shared.pools[self.shared.progress_pool]
    }

    /// Pool handlers run on unless registered elsewhere.
    pub fn handler_pool(&self) -> &Pool {
        &self.shared.pools[self.shared.handler_pool]
    }

    /// Spawns `future` on the handler pool.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handler_pool().spawn(future)
    }

    /// Drives `future` to completion on the calling thread.
    ///
    /// # Panics
    ///
    /// Panics if called from one of this instance's workers: blocking a
    /// worker on work that needs the same worker never finishes.
    #[track_caller]
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        assert!(
            crate::runtime::current_owner() != Some(self.shared.id),
            "block_on called from a worker of the same instance"
        );
        futures::executor::block_on(future)
    }

    pub fn num_progress_calls(&self) -> u64 {
        self.shared.num_progress.load(Ordering::Relaxed)
    }

    pub fn num_trigger_calls(&self) -> u64 {
        self.shared.num_trigger.load(Ordering::Relaxed)
    }

    /// Effective configuration plus what the runtime derived from it.
    pub fn get_config(&self) -> String {
        let pools = self
            .shared
            .pools
            .iter()
            .map(|p| serde_json::json!({ "name": p.name(), "workers": p.num_workers() }))
            .collect::<Vec<_>>();

        let json = serde_json::json!({
            "config": self.shared.config,
            "address": self.shared.address,
            "pools": pools,
            "progress_pool": self.progress_pool().name(),
            "handler_pool": self.handler_pool().name(),
            "monitor": self.shared.monitor.current().name(),
        });

        serde_json::to_string_pretty(&json).unwrap_or_else(|_| json.to_string())
    }

    /// Finalizes the active monitor and installs `monitor`, or the no-op
    /// monitor when `None`.
    pub fn set_monitor(&self, monitor: Option<Arc<dyn Monitor>>, config: Option<&str>) {
        let monitor = monitor.unwrap_or_else(|| Arc::new(NoopMonitor));
        self.shared.monitor.replace(monitor, &self.shared.address, config);
    }

    /// Emits a user-defined event to the active monitor.
    pub fn monitor_call_user(&self, name: &str, data: Option<serde_json::Value>) {
        self.shared.monitor.point(EventArgs::User {
            name: name.to_string(),
            data,
        });
    }

    pub fn monitor_report(&self) -> Option<serde_json::Value> {
        self.shared.monitor.current().report()
    }

    pub fn lookup(&self, name: &str) -> Result<Address> {
        let mut span = self.shared.monitor.begin(EventArgs::Lookup {
            name: name.to_string(),
            address: None,
        });

        let res = self.shared.engine.lookup(name).map_err(Error::from);
        if let (Ok(resolved), EventArgs::Lookup { address, .. }) = (&res, span.args_mut()) {
            *address = Some(resolved.clone());
        }

        span.set_outcome(&res);
        res
    }

    /// Runs before in-flight work drains. Callbacks run last pushed first.
    pub fn push_prefinalize_callback<F: FnOnce() + Send + 'static>(&self, callback: F) {
        self.shared.callbacks.lock().prefinalize.push(Box::new(callback));
    }

    /// Runs once the progress loop stopped, before pools are torn down.
    pub fn push_finalize_callback<F: FnOnce() + Send + 'static>(&self, callback: F) {
        self.shared.callbacks.lock().finalize.push(Box::new(callback));
    }

    /// Asks the owner of the instance to finalize it. Returns immediately,
    /// safe from handlers. The owner picks the request up in
    /// [`Instance::wait_for_finalize`].
    pub fn request_finalize(&self) {
        let mut lifecycle = self.shared.lifecycle.lock();
        if !lifecycle.finalize_requested {
            lifecycle.finalize_requested = true;
            tracing::debug!(address = %self.shared.address, "finalize requested");
        }
        self.shared.lifecycle_changed.notify_all();
    }

    /// New calls, registrations and timers are only accepted while running.
    pub(crate) fn check_submit(&self) -> Result<()> {
        match self.state() {
            LifecycleState::Running => Ok(()),
            LifecycleState::Prefinalizing | LifecycleState::Finalizing => Err(Error::Finalizing),
            LifecycleState::Finalized => Err(Error::Finalized),
        }
    }

    /// Work belonging to requests already dispatched may finish while the
    /// instance drains.
    pub(crate) fn check_respond(&self) -> Result<()> {
        match self.state() {
            LifecycleState::Running | LifecycleState::Prefinalizing => Ok(()),
            LifecycleState::Finalizing => Err(Error::Finalizing),
            LifecycleState::Finalized => Err(Error::Finalized),
        }
    }

    /// Wakes the progress loop so it picks up a new submission right away.
    pub(crate) fn signal_pending(&self) {
        self.shared.pending_work.store(true, Ordering::Release);
        self.shared.engine.interrupt();
    }

    pub(crate) fn operation(&self, key: OpKey) -> Operation {
        Operation::new(
            key,
            Arc::clone(&self.shared.registry),
            Arc::clone(&self.shared.timers),
            Arc::clone(&self.shared.engine),
        )
    }

    /// Suspends the calling task until `op` is finished.
    pub(crate) async fn wait(&self, op: Operation) -> Result<Vec<u8>> {
        let mut span = self.shared.monitor.begin(EventArgs::Wait { op: op.key() });
        let res = op.await;
        span.set_outcome(&res);
        res
    }
}

/// A running instance. Dereferences to its [`Handle`].
///
/// Dropping an instance that was not finalized finalizes it.
pub struct Instance {
    handle: Handle,
    threads: Vec<ThreadPool>,
    progress: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("handle", &self.handle)
            .field("pools", &self.handle.shared.pools)
            .finish()
    }
}

impl Deref for Instance {
    type Target = Handle;

    fn deref(&self) -> &Handle {
        &self.handle
    }
}

impl Instance {
    pub fn builder() -> Builder {
        Builder::new()
    }

    pub fn init(config: Config) -> Result<Self> {
        Builder::from_config(config).build()
    }

    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }
}

/// Pool layout derived from the configuration: `(name, workers)` in index
/// order, plus the indexes of the progress and handler pools.
pub(crate) fn pool_topology(config: &Config) -> (Vec<(String, usize)>, usize, usize) {
    let mut pools = if config.use_dedicated_progress_pool {
        vec![
            (PROGRESS_POOL.to_string(), config.progress_pool_size),
            (HANDLER_POOL.to_string(), config.rpc_handler_pool_size),
        ]
    } else {
        let workers = config.progress_pool_size.max(config.rpc_handler_pool_size);
        vec![(PRIMARY_POOL.to_string(), workers)]
    };

    let handler = pools.len() - 1;
    pools.extend(config.pools.iter().map(|p| (p.name.clone(), p.workers)));
    (pools, 0, handler)
}
