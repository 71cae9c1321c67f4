use crate::engine::{Address, Envelope};
use crate::error::{Error, Result};
use crate::instance::Handle;
use crate::monitor::EventArgs;
use crate::registry::{OpKind, Operation, Phase};
use crate::rpc::{RpcId, codec};
use crate::timer::TimerAction;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt;
use std::time::{Duration, Instant};

/// Caller-side state of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    Created,
    Submitted,
    AwaitingResponse,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl CallState {
    fn of(res: &Result<Vec<u8>>) -> Self {
        match res {
            Ok(_) => CallState::Completed,
            Err(Error::Timeout) => CallState::TimedOut,
            Err(Error::Cancelled) => CallState::Cancelled,
            Err(_) => CallState::Failed,
        }
    }
}

impl Handle {
    /// Prepares a call to `id` on `target`. The handle can be forwarded
    /// several times, one call at a time.
    pub fn create(&self, target: &Address, id: RpcId) -> Result<CallHandle> {
        let mut span = self.shared.monitor.begin(EventArgs::Create {
            target: target.clone(),
            id,
        });

        let res = self.check_submit().map(|()| CallHandle {
            handle: self.clone(),
            target: target.clone(),
            id,
            state: CallState::Created,
            output: None,
        });
        span.set_outcome(&res);
        res
    }

    /// Full call: create, forward, decode the output, free it, destroy.
    pub async fn forward<I, O>(&self, target: &Address, id: RpcId, input: &I) -> Result<O>
    where
        I: Serialize + ?Sized,
        O: DeserializeOwned,
    {
        let mut call = self.create(target, id)?;
        call.forward(input).await?;
        let output = call.get_output()?;
        call.free_output();
        Ok(output)
    }

    /// Like [`forward`](Handle::forward) with a deadline on the response.
    pub async fn forward_timed<I, O>(
        &self,
        target: &Address,
        id: RpcId,
        input: &I,
        timeout: Duration,
    ) -> Result<O>
    where
        I: Serialize + ?Sized,
        O: DeserializeOwned,
    {
        let mut call = self.create(target, id)?;
        call.forward_timed(input, timeout).await?;
        let output = call.get_output()?;
        call.free_output();
        Ok(output)
    }
}

/// Caller side of a call. Dropping it destroys it.
pub struct CallHandle {
    handle: Handle,
    target: Address,
    id: RpcId,
    state: CallState,
    output: Option<Vec<u8>>,
}

impl fmt::Debug for CallHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallHandle")
            .field("target", &self.target)
            .field("id", &self.id)
            .field("state", &self.state)
            .finish()
    }
}

impl CallHandle {
    pub fn target(&self) -> &Address {
        &self.target
    }

    pub fn id(&self) -> RpcId {
        self.id
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    /// Sends `input` and suspends until the response arrives.
    pub async fn forward<I: Serialize + ?Sized>(&mut self, input: &I) -> Result<()> {
        self.iforward(input, None)?.wait().await
    }

    /// Like [`forward`](CallHandle::forward), failing with
    /// [`Error::Timeout`] if no response arrived within `timeout`.
    pub async fn forward_timed<I: Serialize + ?Sized>(
        &mut self,
        input: &I,
        timeout: Duration,
    ) -> Result<()> {
        self.iforward(input, Some(timeout))?.wait().await
    }

    /// Submits the call without waiting for it.
    pub fn iforward<I: Serialize + ?Sized>(
        &mut self,
        input: &I,
        timeout: Option<Duration>,
    ) -> Result<PendingCall<'_>> {
        self.handle.check_submit()?;

        let payload = {
            let mut span = self.handle.shared.monitor.begin(EventArgs::SetInput {
                id: self.id,
                size: 0,
            });
            let res = codec::encode(input);
            if let (Ok(bytes), EventArgs::SetInput { size, .. }) = (&res, span.args_mut()) {
                *size = bytes.len();
            }
            span.set_outcome(&res);
            res?
        };

        let mut span = self.handle.shared.monitor.begin(EventArgs::Forward {
            target: self.target.clone(),
            id: self.id,
            timeout_ms: timeout.map(|t| t.as_millis() as u64),
            op: None,
        });

        let res = self.submit(payload, timeout);
        if let (Ok(op), EventArgs::Forward { op: key, .. }) = (&res, span.args_mut()) {
            *key = Some(op.key());
        }
        span.set_outcome(&res);

        let op = res?;
        self.state = CallState::Submitted;
        self.output = None;
        Ok(PendingCall { call: self, op })
    }

    fn submit(&self, payload: Vec<u8>, timeout: Option<Duration>) -> Result<Operation> {
        let shared = &self.handle.shared;
        let key = shared.registry.register(OpKind::Call)?;
        // Dropped on any error below, which discards the entry and its timer.
        let op = self.handle.operation(key);

        // A timeout too large to represent as an instant never expires.
        if let Some(at) = timeout.and_then(|t| Instant::now().checked_add(t)) {
            let timer = shared.timers.insert(at, TimerAction::Expire(key));
            shared.registry.attach_timer(key, timer);
        }

        let envelope = Envelope::Request {
            origin: shared.address.clone(),
            rpc_id: self.id,
            seq: key.as_u64(),
            payload,
        };
        let engine_op = shared.engine.submit_send(envelope, &self.target, key.as_u64())?;
        shared.registry.attach_engine_op(key, engine_op);
        self.handle.signal_pending();

        Ok(op)
    }

    /// Decodes the output of the last completed forward.
    pub fn get_output<T: DeserializeOwned>(&self) -> Result<T> {
        let size = self.output.as_ref().map_or(0, Vec::len);
        let mut span = self
            .handle
            .shared
            .monitor
            .begin(EventArgs::GetOutput { id: self.id, size });

        let res = match &self.output {
            Some(bytes) => codec::decode(bytes),
            None => Err(Error::InvalidArg("no output available".into())),
        };
        span.set_outcome(&res);
        res
    }

    pub fn free_output(&mut self) {
        let mut span = self
            .handle
            .shared
            .monitor
            .begin(EventArgs::FreeOutput { id: self.id });
        self.output = None;
        span.succeed();
    }
}

impl Drop for CallHandle {
    fn drop(&mut self) {
        let _span = self
            .handle
            .shared
            .monitor
            .begin(EventArgs::Destroy { id: self.id });
    }
}

/// A submitted call. Dropping it abandons the call: a late response is
/// discarded.
#[must_use = "a pending call is abandoned when dropped"]
pub struct PendingCall<'a> {
    call: &'a mut CallHandle,
    op: Operation,
}

impl fmt::Debug for PendingCall<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingCall")
            .field("call", &self.call)
            .field("op", &self.op)
            .finish()
    }
}

impl PendingCall<'_> {
    /// Where the call is right now, as seen by the completion registry.
    pub fn state(&self) -> CallState {
        match self.call.handle.shared.registry.phase(self.op.key()) {
            Some(Phase::Submitted) | None => CallState::Submitted,
            Some(Phase::AwaitingResponse) => CallState::AwaitingResponse,
            Some(Phase::Completed) => CallState::Completed,
            Some(Phase::Failed) => CallState::Failed,
            Some(Phase::Cancelled) => CallState::Cancelled,
            Some(Phase::TimedOut) => CallState::TimedOut,
        }
    }

    /// Suspends until the response arrives, the deadline passes or the
    /// transport fails.
    pub async fn wait(self) -> Result<()> {
        let PendingCall { call, op } = self;

        let res = call.handle.wait(op).await;
        call.state = CallState::of(&res);
        call.output = Some(res?);
        Ok(())
    }
}
