use crate::engine::EngineError;
use crate::registry::OpKey;
use crate::rpc::RpcId;
use serde::Serialize;

pub type Result<T> = std::result::Result<T, Error>;

/// A centralized error type for every public operation of the runtime.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The network engine reported a send, receive or transfer failure. Never
    /// retried by the runtime.
    #[error("transport error: {0}")]
    Transport(#[from] EngineError),

    /// The caller-specified deadline elapsed before the operation completed.
    #[error("operation timed out")]
    Timeout,

    #[error("operation cancelled")]
    Cancelled,

    /// The instance entered prefinalize, no new operations are accepted.
    #[error("instance is finalizing, new operations are rejected")]
    Finalizing,

    #[error("instance has been finalized")]
    Finalized,

    /// The target has no handler registered for this identifier.
    #[error("no handler registered for rpc {0}")]
    NoMatch(RpcId),

    #[error("rpc {0} is already registered")]
    AlreadyRegistered(RpcId),

    #[error("rpc {0} is not registered")]
    NotRegistered(RpcId),

    #[error("rpc {id} still has {in_flight} call(s) in flight")]
    RpcBusy { id: RpcId, in_flight: usize },

    #[error("invalid argument: {0}")]
    InvalidArg(String),

    #[error("payload codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("lifecycle violation: {0}")]
    Lifecycle(#[from] LifecycleError),
}

/// Contract violations. These are bugs in the caller, not runtime faults.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("FATAL: operation {0} completed twice")]
    DoubleCompletion(OpKey),

    /// The handle was already consumed, cancelled or never existed.
    #[error("operation {0} is no longer tracked")]
    StaleOperation(OpKey),

    #[error("request was already responded to")]
    AlreadyResponded,

    #[error("finalize cannot run on a worker of the instance it tears down, use request_finalize")]
    FinalizeFromWorker,

    #[error("finalize is already in progress")]
    AlreadyFinalizing,
}

impl Error {
    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            Error::Finalizing | Error::Finalized | Error::Lifecycle(_) | Error::RpcBusy { .. }
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout)
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Transport(_) => ErrorCode::Transport,
            Error::Timeout => ErrorCode::Timeout,
            Error::Cancelled => ErrorCode::Cancelled,
            Error::Finalizing | Error::Finalized | Error::Lifecycle(_) => ErrorCode::Lifecycle,
            Error::NoMatch(_) => ErrorCode::NoMatch,
            Error::AlreadyRegistered(_) | Error::NotRegistered(_) | Error::RpcBusy { .. } => {
                ErrorCode::Registration
            }
            Error::InvalidArg(_) | Error::Config(_) => ErrorCode::InvalidArg,
            Error::Codec(_) => ErrorCode::Codec,
        }
    }
}

/// Compact error classification handed to monitors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Transport,
    Timeout,
    Cancelled,
    Lifecycle,
    NoMatch,
    Registration,
    InvalidArg,
    Codec,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::timeout(Error::Timeout, ErrorCode::Timeout, false)]
    #[case::finalizing(Error::Finalizing, ErrorCode::Lifecycle, true)]
    #[case::busy(Error::RpcBusy { id: RpcId::new(7), in_flight: 2 }, ErrorCode::Registration, true)]
    #[case::no_match(Error::NoMatch(RpcId::new(7)), ErrorCode::NoMatch, false)]
    #[case::transport(Error::Transport(EngineError::Closed), ErrorCode::Transport, false)]
    fn test_error_classification(
        #[case] err: Error,
        #[case] code: ErrorCode,
        #[case] lifecycle: bool,
    ) {
        assert_eq!(err.code(), code);
        assert_eq!(err.is_lifecycle(), lifecycle);
    }
}
