//! An RPC execution runtime.
//!
//! Callers and handlers are written in a blocking style: `forward` suspends
//! the calling task until the response arrives, a handler suspends while its
//! response is flushed. Underneath, a single progress loop per instance drives
//! an event-driven network engine and resumes whatever task each completion
//! belongs to.

pub mod config;
pub use config::Config;

pub mod engine;
pub use engine::{Address, BulkAccess, BulkOp, RemoteRegion};

mod error;
pub use error::{Error, ErrorCode, LifecycleError, Result};

mod instance;
pub use instance::{Builder, Handle, Instance, LifecycleState};

pub mod monitor;

mod progress;

mod registry;
pub use registry::{OpKey, OpKind, Phase};

pub mod rpc;
pub use rpc::{BulkRegion, CallHandle, CallState, PendingCall, Request, RequestState, RpcId};

pub mod runtime;
pub use runtime::{Pool, yield_now};

pub mod task;
pub use task::{JoinError, JoinHandle};

mod timer;
pub use timer::{Sleep, Timer};

mod utils;

#[cfg(test)]
mod test_utils;
