use crate::engine::{Address, Envelope, ResponseStatus, UNTRACKED_TOKEN};
use crate::error::{Error, LifecycleError, Result};
use crate::instance::Handle;
use crate::monitor::EventArgs;
use crate::registry::OpKind;
use crate::rpc::{RpcId, codec};
use crate::task;
use crate::utils::ScopeGuard;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Received,
    /// A task was spawned for the handler but has not started.
    Dispatched,
    Running,
    Responded,
}

/// Handler side of one inbound call.
///
/// A handler must call [`respond`](Request::respond) before dropping its
/// request. Dropping it without a response leaves the caller waiting until
/// its own timeout, if any: that is a handler bug and is only logged.
pub struct Request {
    handle: Handle,
    origin: Address,
    id: RpcId,
    seq: u64,
    input: Option<Vec<u8>>,
    state: RequestState,
    pool: String,
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("origin", &self.origin)
            .field("id", &self.id)
            .field("state", &self.state)
            .finish()
    }
}

impl Request {
    pub fn origin(&self) -> &Address {
        &self.origin
    }

    pub fn id(&self) -> RpcId {
        self.id
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    /// Name of the pool the handler runs on.
    pub fn pool(&self) -> &str {
        &self.pool
    }

    /// The instance that received the request.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn get_input<T: DeserializeOwned>(&self) -> Result<T> {
        let size = self.input.as_ref().map_or(0, Vec::len);
        let mut span = self
            .handle
            .shared
            .monitor
            .begin(EventArgs::GetInput { id: self.id, size });

        let res = match &self.input {
            Some(bytes) => codec::decode(bytes),
            None => Err(Error::InvalidArg("request input was already freed".into())),
        };
        span.set_outcome(&res);
        res
    }

    /// Releases the encoded input early. Later `get_input` calls fail.
    pub fn free_input(&mut self) {
        let mut span = self
            .handle
            .shared
            .monitor
            .begin(EventArgs::FreeInput { id: self.id });
        self.input = None;
        span.succeed();
    }

    /// Sends `output` back to the caller and suspends until the engine
    /// flushed it. Exactly one successful response per request.
    pub async fn respond<O: Serialize + ?Sized>(&mut self, output: &O) -> Result<()> {
        if self.state == RequestState::Responded {
            return Err(LifecycleError::AlreadyResponded.into());
        }
        self.handle.check_respond()?;

        let payload = {
            let mut span = self.handle.shared.monitor.begin(EventArgs::SetOutput {
                id: self.id,
                size: 0,
            });
            let res = codec::encode(output);
            if let (Ok(bytes), EventArgs::SetOutput { size, .. }) = (&res, span.args_mut()) {
                *size = bytes.len();
            }
            span.set_outcome(&res);
            res?
        };

        let mut span = self.handle.shared.monitor.begin(EventArgs::Respond {
            origin: self.origin.clone(),
            id: self.id,
            op: None,
        });

        let res: Result<()> = async {
            let shared = &self.handle.shared;
            let key = shared.registry.register(OpKind::Response)?;
            let op = self.handle.operation(key);
            if let EventArgs::Respond { op, .. } = span.args_mut() {
                *op = Some(key);
            }

            let envelope = Envelope::Response {
                origin: shared.address.clone(),
                rpc_id: self.id,
                seq: self.seq,
                status: ResponseStatus::Ok,
                payload,
            };
            let engine_op = shared.engine.submit_send(envelope, &self.origin, key.as_u64())?;
            shared.registry.attach_engine_op(key, engine_op);
            self.handle.signal_pending();

            self.handle.wait(op).await.map(|_| ())
        }
        .await;

        span.set_outcome(&res);
        if res.is_ok() {
            self.state = RequestState::Responded;
        }
        res
    }
}

impl Drop for Request {
    fn drop(&mut self) {
        if self.state != RequestState::Responded {
            tracing::warn!(
                id = %self.id,
                origin = %self.origin,
                "request dropped without a response"
            );
        }

        let _span = self
            .handle
            .shared
            .monitor
            .begin(EventArgs::Destroy { id: self.id });
    }
}

/// Replies with a bare status, nobody waits on the send.
fn reply_status(handle: &Handle, origin: &Address, id: RpcId, seq: u64, status: ResponseStatus) {
    let envelope = Envelope::Response {
        origin: handle.shared.address.clone(),
        rpc_id: id,
        seq,
        status,
        payload: Vec::new(),
    };

    if let Err(e) = handle
        .shared
        .engine
        .submit_send(envelope, origin, UNTRACKED_TOKEN)
    {
        tracing::debug!(%origin, ?status, error = %e, "failed to send status reply");
    }
}

/// Routes an inbound request to its handler, run as a new task on the pool
/// the rpc was registered on.
pub(crate) fn dispatch(handle: &Handle, origin: Address, id: RpcId, seq: u64, payload: Vec<u8>) {
    let mut span = handle.shared.monitor.begin(EventArgs::RpcHandler {
        id,
        origin: origin.clone(),
        pool: None,
    });

    // Counted before the lifecycle check: either finalize sees this handler
    // while draining, or the check sees the instance is no longer running.
    let rpcs = &handle.shared.rpcs;
    let rpc = rpcs.acquire(id);

    if !handle.is_running() {
        if let Some(rpc) = &rpc {
            rpcs.release(rpc);
        }
        reply_status(handle, &origin, id, seq, ResponseStatus::Finalizing);
        span.set_outcome(&Err::<(), _>(Error::Finalizing));
        return;
    }

    let Some(rpc) = rpc else {
        tracing::debug!(%id, %origin, "no handler registered");
        reply_status(handle, &origin, id, seq, ResponseStatus::NoMatch);
        span.set_outcome(&Err::<(), _>(Error::NoMatch(id)));
        return;
    };

    if let EventArgs::RpcHandler { pool, .. } = span.args_mut() {
        *pool = Some(rpc.pool.name().to_string());
    }

    let mut request = Request {
        handle: handle.clone(),
        origin,
        id,
        seq,
        input: Some(payload),
        state: RequestState::Received,
        pool: rpc.pool.name().to_string(),
    };

    request.state = RequestState::Dispatched;

    let handler = Arc::clone(&rpc.handler);
    let pool = rpc.pool.clone();

    // Created outside the task so it also runs if the task is dropped
    // before its first poll.
    let owner = handle.clone();
    let in_flight = ScopeGuard::new(move || owner.shared.rpcs.release(&rpc));

    let ult = async move {
        let _in_flight = in_flight;

        let tasks = request.handle.clone();
        let current = task::try_id();
        if let Some(current) = current {
            tasks.shared.rpcs.enter_handler(current);
        }
        let _handler_task = ScopeGuard::new(move || {
            if let Some(current) = current {
                tasks.shared.rpcs.leave_handler(current);
            }
        });

        let mut span = request.handle.shared.monitor.begin(EventArgs::RpcUlt { id });

        request.state = RequestState::Running;
        handler(request).await;
        span.succeed();
    };

    // Detached, the handler owns the request from here on.
    drop(pool.spawn(ult));
    span.succeed();
}
