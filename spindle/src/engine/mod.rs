//! Boundary to the asynchronous network engine.
//!
//! The runtime never blocks on the network: it submits sends, receive buffers
//! and bulk transfers, then collects their completions from [`NetworkEngine::poll`]
//! inside the progress loop. Every submission carries an opaque `u64` token that
//! comes back untouched in the matching [`EngineCompletion`].

use crate::rpc::RpcId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

mod loopback;

pub use loopback::{Fabric, LoopbackEngine};

/// Protocol prefix understood by [`connect`].
pub const LOOPBACK_PROTOCOL: &str = "loopback";

/// Token for receive buffers posted by the progress loop.
pub(crate) const RECEIVE_TOKEN: u64 = u64::MAX;

/// Token for fire-and-forget sends nobody waits on.
pub(crate) const UNTRACKED_TOKEN: u64 = u64::MAX - 1;

/// Resolves the protocol of `address` to an engine. `loopback://name` binds to
/// the process-wide loopback fabric.
pub fn connect(address: &str) -> Result<Arc<dyn NetworkEngine>, EngineError> {
    let (protocol, name) = match address.split_once("://") {
        Some((protocol, name)) => (protocol, name),
        None => (address, ""),
    };

    match protocol {
        LOOPBACK_PROTOCOL => {
            let engine = LoopbackEngine::bind(&Fabric::global(), name)?;
            Ok(Arc::new(engine))
        }
        other => Err(EngineError::UnsupportedProtocol(other.to_string())),
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("unsupported protocol: {0:?}")]
    UnsupportedProtocol(String),

    #[error("address {0} is already bound")]
    AddressInUse(String),

    #[error("unknown address: {0}")]
    UnknownAddress(String),

    #[error("peer {0} is unreachable")]
    Unreachable(String),

    #[error("engine is closed")]
    Closed,

    #[error("unknown bulk region {0}")]
    InvalidRegion(u64),

    #[error("bulk region {0} does not permit this access")]
    AccessDenied(u64),

    #[error("bulk transfer out of bounds: offset {offset} + size {size} exceeds {len}")]
    OutOfBounds { offset: usize, size: usize, len: usize },

    #[error("engine operation cancelled")]
    Cancelled,
}

/// A resolved endpoint address, `protocol://name`.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address(Arc<str>);

impl Address {
    pub fn new(protocol: &str, name: &str) -> Self {
        Self(Arc::from(format!("{protocol}://{name}")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Endpoint name without the protocol prefix.
    pub fn name(&self) -> &str {
        self.0.split_once("://").map_or(&self.0, |(_, name)| name)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.0)
    }
}

/// Identifier of one engine-level operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EngineOp(pub u64);

/// Status carried back to the caller in a response envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseStatus {
    Ok,
    /// The target has no handler for the requested identifier.
    NoMatch,
    /// The target is finalizing and refused to dispatch.
    Finalizing,
}

#[derive(Debug, Clone)]
pub enum Envelope {
    Request {
        origin: Address,
        rpc_id: RpcId,
        /// Caller-side operation key, echoed back in the response.
        seq: u64,
        payload: Vec<u8>,
    },
    Response {
        origin: Address,
        rpc_id: RpcId,
        seq: u64,
        status: ResponseStatus,
        payload: Vec<u8>,
    },
}

impl Envelope {
    pub fn origin(&self) -> &Address {
        match self {
            Envelope::Request { origin, .. } | Envelope::Response { origin, .. } => origin,
        }
    }
}

#[derive(Debug)]
pub enum EngineEvent {
    Sent(Result<(), EngineError>),
    Received(Envelope),
    Transferred(Result<usize, EngineError>),
    Cancelled,
}

#[derive(Debug)]
pub struct EngineCompletion {
    pub op: EngineOp,
    pub token: u64,
    pub event: EngineEvent,
}

/// Memory shared between the application and the engine for bulk transfers.
pub type BulkBuffer = Arc<Mutex<Vec<u8>>>;

/// Who may touch a registered region from the remote side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BulkAccess {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl BulkAccess {
    pub fn readable(&self) -> bool {
        matches!(self, BulkAccess::ReadOnly | BulkAccess::ReadWrite)
    }

    pub fn writable(&self) -> bool {
        matches!(self, BulkAccess::WriteOnly | BulkAccess::ReadWrite)
    }
}

/// Direction of a bulk transfer, seen from the initiator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BulkOp {
    /// Remote region to local region.
    Pull,
    /// Local region to remote region.
    Push,
}

/// Serializable descriptor of a registered region, embedded in RPC inputs so a
/// peer can transfer to or from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRegion {
    pub owner: Address,
    pub id: u64,
    pub len: usize,
    pub access: BulkAccess,
}

pub trait NetworkEngine: Send + Sync + 'static {
    fn self_address(&self) -> Address;

    fn lookup(&self, name: &str) -> Result<Address, EngineError>;

    fn submit_send(
        &self,
        envelope: Envelope,
        target: &Address,
        token: u64,
    ) -> Result<EngineOp, EngineError>;

    fn submit_receive_buffer(&self, token: u64) -> Result<EngineOp, EngineError>;

    /// Blocks up to `timeout` for at least one completion. Returns every
    /// completion available, in the order the engine observed them.
    fn poll(&self, timeout: Duration) -> Result<Vec<EngineCompletion>, EngineError>;

    /// Best effort. The operation may still complete.
    fn cancel(&self, op: EngineOp) -> Result<(), EngineError>;

    /// Makes a blocked or the next [`poll`](NetworkEngine::poll) return early.
    fn interrupt(&self);

    fn register_region(
        &self,
        buffer: BulkBuffer,
        access: BulkAccess,
    ) -> Result<RemoteRegion, EngineError>;

    fn deregister_region(&self, region: &RemoteRegion) -> Result<(), EngineError>;

    #[allow(clippy::too_many_arguments)]
    fn submit_transfer(
        &self,
        op: BulkOp,
        local: &RemoteRegion,
        local_offset: usize,
        remote: &RemoteRegion,
        remote_offset: usize,
        size: usize,
        token: u64,
    ) -> Result<EngineOp, EngineError>;

    fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn test_connect_rejects_unknown_protocol() {
        let res = connect("tcp://127.0.0.1:1234");
        assert!(matches!(res, Err(EngineError::UnsupportedProtocol(p)) if p == "tcp"));
    }

    #[test]
    fn test_connect_loopback() -> Result<()> {
        let engine = connect("loopback://engine-connect-test")?;
        assert_eq!(engine.self_address().name(), "engine-connect-test");
        assert_eq!(
            engine.self_address().as_str(),
            "loopback://engine-connect-test"
        );
        engine.close();
        Ok(())
    }

    #[test]
    fn test_bulk_access() {
        assert!(BulkAccess::ReadOnly.readable() && !BulkAccess::ReadOnly.writable());
        assert!(!BulkAccess::WriteOnly.readable() && BulkAccess::WriteOnly.writable());
        assert!(BulkAccess::ReadWrite.readable() && BulkAccess::ReadWrite.writable());
    }
}
