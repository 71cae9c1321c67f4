//! Registered RPCs and the per-call lifecycle on both ends of the wire.

use crate::error::{Error, Result};
use crate::instance::Handle;
use crate::monitor::EventArgs;
use crate::runtime::Pool;
use crate::task;
use crate::utils::IdleSignal;
use dashmap::{DashMap, DashSet};
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

mod bulk;
pub use self::bulk::BulkRegion;

mod call;
pub use self::call::{CallHandle, CallState, PendingCall};

mod codec;

mod id;
pub use self::id::{DEFAULT_PROVIDER_ID, RpcId};

mod request;
pub(crate) use self::request::dispatch;
pub use self::request::{Request, RequestState};

/// Name of the rpc peers use to finalize an instance remotely.
pub const SHUTDOWN_RPC: &str = "__shutdown__";

pub(crate) type HandlerFn = Arc<dyn Fn(Request) -> BoxFuture<'static, ()> + Send + Sync>;

type UserData = Arc<dyn Any + Send + Sync>;

pub(crate) struct RegisteredRpc {
    pub(crate) id: RpcId,
    pub(crate) name: Option<String>,
    pub(crate) handler: HandlerFn,
    pub(crate) pool: Pool,
    data: Mutex<Option<UserData>>,
    pub(crate) in_flight: AtomicUsize,
}

impl fmt::Debug for RegisteredRpc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredRpc")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("pool", &self.pool.name())
            .field("in_flight", &self.in_flight.load(Ordering::Relaxed))
            .finish()
    }
}

#[derive(Debug, Default)]
pub(crate) struct RpcTable {
    rpcs: DashMap<RpcId, Arc<RegisteredRpc>>,

    // Handlers running across every rpc, notifies `idle` when back to zero.
    handlers: AtomicUsize,
    idle: Arc<IdleSignal>,

    // Tasks currently running a handler. They may keep using the instance
    // while it drains.
    handler_tasks: DashSet<task::Id>,
}

impl RpcTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_idle(idle: Arc<IdleSignal>) -> Self {
        Self {
            idle,
            ..Self::default()
        }
    }

    fn insert(&self, rpc: RegisteredRpc) -> Result<()> {
        match self.rpcs.entry(rpc.id) {
            Entry::Occupied(_) => Err(Error::AlreadyRegistered(rpc.id)),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(rpc));
                Ok(())
            }
        }
    }

    pub(crate) fn get(&self, id: RpcId) -> Option<Arc<RegisteredRpc>> {
        self.rpcs.get(&id).map(|r| Arc::clone(r.value()))
    }

    /// Looks `id` up and counts one more running handler for it. The count is
    /// taken under the shard lock, so a concurrent `remove` either sees it or
    /// runs first and the lookup misses.
    pub(crate) fn acquire(&self, id: RpcId) -> Option<Arc<RegisteredRpc>> {
        self.rpcs.get(&id).map(|rpc| {
            rpc.in_flight.fetch_add(1, Ordering::AcqRel);
            self.handlers.fetch_add(1, Ordering::AcqRel);
            Arc::clone(rpc.value())
        })
    }

    /// Undoes one [`acquire`](RpcTable::acquire).
    pub(crate) fn release(&self, rpc: &RegisteredRpc) {
        rpc.in_flight.fetch_sub(1, Ordering::AcqRel);
        if self.handlers.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify();
        }
    }

    pub(crate) fn enter_handler(&self, task: task::Id) {
        self.handler_tasks.insert(task);
    }

    pub(crate) fn leave_handler(&self, task: task::Id) {
        self.handler_tasks.remove(&task);
    }

    pub(crate) fn is_handler_task(&self, task: task::Id) -> bool {
        self.handler_tasks.contains(&task)
    }

    /// Refuses to remove an rpc whose handlers are still running.
    fn remove(&self, id: RpcId) -> Result<()> {
        let mut busy = 0;
        let removed = self.rpcs.remove_if(&id, |_, rpc| {
            busy = rpc.in_flight.load(Ordering::Acquire);
            busy == 0
        });

        match removed {
            Some(_) => Ok(()),
            None if busy > 0 => Err(Error::RpcBusy { id, in_flight: busy }),
            None => Err(Error::NotRegistered(id)),
        }
    }

    /// Handlers running across every rpc, deregistered ones included.
    pub(crate) fn in_flight(&self) -> usize {
        self.handlers.load(Ordering::Acquire)
    }

    /// Drops every registration and the data attached to it.
    pub(crate) fn clear(&self) {
        self.rpcs.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.rpcs.len()
    }
}

fn boxed<F, Fut>(handler: F) -> HandlerFn
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |request| handler(request).boxed())
}

impl Handle {
    /// Registers `handler` under the identifier derived from `name`, on the
    /// handler pool.
    pub fn register<F, Fut>(&self, name: &str, handler: F) -> Result<RpcId>
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = RpcId::from_name(name);
        let pool = self.handler_pool().clone();
        self.register_with(Some(name), id, pool, boxed(handler))?;
        Ok(id)
    }

    /// Registers `name` for one provider. Calls must target
    /// `RpcId::from_name(name).with_provider(provider_id)`.
    pub fn register_provider<F, Fut>(
        &self,
        name: &str,
        provider_id: u16,
        pool: Option<&Pool>,
        handler: F,
    ) -> Result<RpcId>
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = RpcId::from_name(name).with_provider(provider_id);
        let pool = pool.unwrap_or(self.handler_pool()).clone();
        self.register_with(Some(name), id, pool, boxed(handler))?;
        Ok(id)
    }

    pub fn register_rpc<F, Fut>(&self, id: RpcId, handler: F) -> Result<()>
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let pool = self.handler_pool().clone();
        self.register_with(None, id, pool, boxed(handler))
    }

    /// Registers `handler` so its requests run on `pool`.
    pub fn register_on<F, Fut>(&self, id: RpcId, pool: &Pool, handler: F) -> Result<()>
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.pool_by_index(pool.index()).is_none_or(|p| p.name() != pool.name()) {
            return Err(Error::InvalidArg(format!(
                "pool {} does not belong to this instance",
                pool.name()
            )));
        }
        self.register_with(None, id, pool.clone(), boxed(handler))
    }

    fn register_with(&self, name: Option<&str>, id: RpcId, pool: Pool, handler: HandlerFn) -> Result<()> {
        let mut span = self.shared.monitor.begin(EventArgs::Register {
            name: name.map(str::to_string),
            id,
            pool: pool.name().to_string(),
        });

        let res = self.check_submit().and_then(|()| {
            self.shared.rpcs.insert(RegisteredRpc {
                id,
                name: name.map(str::to_string),
                handler,
                pool,
                data: Mutex::new(None),
                in_flight: AtomicUsize::new(0),
            })
        });

        span.set_outcome(&res);
        if res.is_ok() {
            tracing::trace!(%id, name, "rpc registered");
        }
        res
    }

    /// Removes a registration. Fails with [`Error::RpcBusy`] while requests
    /// for `id` are being handled.
    pub fn deregister_rpc(&self, id: RpcId) -> Result<()> {
        let mut span = self.shared.monitor.begin(EventArgs::Deregister { id });
        let res = self.shared.rpcs.remove(id);
        span.set_outcome(&res);
        res
    }

    pub fn is_registered(&self, id: RpcId) -> bool {
        self.shared.rpcs.get(id).is_some()
    }

    pub fn num_registered(&self) -> usize {
        self.shared.rpcs.len()
    }

    /// Attaches `data` to a registration, replacing previous data. It is
    /// dropped at deregistration or finalize.
    pub fn register_data<T: Any + Send + Sync>(&self, id: RpcId, data: T) -> Result<()> {
        let rpc = self.shared.rpcs.get(id).ok_or(Error::NotRegistered(id))?;
        *rpc.data.lock() = Some(Arc::new(data));
        Ok(())
    }

    pub fn registered_data<T: Any + Send + Sync>(&self, id: RpcId) -> Option<Arc<T>> {
        let data = self.shared.rpcs.get(id)?.data.lock().clone()?;
        data.downcast::<T>().ok()
    }

    /// Asks the instance at `target` to finalize. Requires it to run with
    /// remote shutdown enabled.
    pub async fn shutdown_remote_instance(&self, target: &crate::engine::Address) -> Result<()> {
        self.forward::<(), ()>(target, RpcId::from_name(SHUTDOWN_RPC), &())
            .await
    }

    pub(crate) fn register_remote_shutdown(&self) -> Result<()> {
        self.register(SHUTDOWN_RPC, |mut request: Request| async move {
            if let Err(e) = request.respond(&()).await {
                tracing::warn!(error = %e, "failed to acknowledge remote shutdown");
            }
            tracing::debug!(origin = %request.origin(), "remote shutdown requested");
            request.handle().request_finalize();
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests;
