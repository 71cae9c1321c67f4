use crate::engine::{Address, BulkAccess, BulkOp};
use crate::error::{ErrorCode, Result};
use crate::registry::OpKey;
use crate::rpc::RpcId;
use serde::Serialize;
use std::fmt;

/// Every instrumented lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Progress,
    Trigger,
    Register,
    Deregister,
    Lookup,
    Create,
    Forward,
    ForwardCb,
    Respond,
    RespondCb,
    Destroy,
    BulkCreate,
    BulkTransfer,
    BulkTransferCb,
    BulkFree,
    RpcHandler,
    RpcUlt,
    Wait,
    Sleep,
    SetInput,
    SetOutput,
    GetInput,
    GetOutput,
    FreeInput,
    FreeOutput,
    Prefinalize,
    Finalize,
    User,
}

impl EventKind {
    pub const COUNT: usize = 28;

    pub const ALL: [EventKind; Self::COUNT] = [
        EventKind::Progress,
        EventKind::Trigger,
        EventKind::Register,
        EventKind::Deregister,
        EventKind::Lookup,
        EventKind::Create,
        EventKind::Forward,
        EventKind::ForwardCb,
        EventKind::Respond,
        EventKind::RespondCb,
        EventKind::Destroy,
        EventKind::BulkCreate,
        EventKind::BulkTransfer,
        EventKind::BulkTransferCb,
        EventKind::BulkFree,
        EventKind::RpcHandler,
        EventKind::RpcUlt,
        EventKind::Wait,
        EventKind::Sleep,
        EventKind::SetInput,
        EventKind::SetOutput,
        EventKind::GetInput,
        EventKind::GetOutput,
        EventKind::FreeInput,
        EventKind::FreeOutput,
        EventKind::Prefinalize,
        EventKind::Finalize,
        EventKind::User,
    ];

    /// Dense index in `0..COUNT`, follows declaration order.
    pub fn index(&self) -> usize {
        *self as usize
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Progress => "progress",
            EventKind::Trigger => "trigger",
            EventKind::Register => "register",
            EventKind::Deregister => "deregister",
            EventKind::Lookup => "lookup",
            EventKind::Create => "create",
            EventKind::Forward => "forward",
            EventKind::ForwardCb => "forward_cb",
            EventKind::Respond => "respond",
            EventKind::RespondCb => "respond_cb",
            EventKind::Destroy => "destroy",
            EventKind::BulkCreate => "bulk_create",
            EventKind::BulkTransfer => "bulk_transfer",
            EventKind::BulkTransferCb => "bulk_transfer_cb",
            EventKind::BulkFree => "bulk_free",
            EventKind::RpcHandler => "rpc_handler",
            EventKind::RpcUlt => "rpc_ult",
            EventKind::Wait => "wait",
            EventKind::Sleep => "sleep",
            EventKind::SetInput => "set_input",
            EventKind::SetOutput => "set_output",
            EventKind::GetInput => "get_input",
            EventKind::GetOutput => "get_output",
            EventKind::FreeInput => "free_input",
            EventKind::FreeOutput => "free_output",
            EventKind::Prefinalize => "prefinalize",
            EventKind::Finalize => "finalize",
            EventKind::User => "user",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventPhase {
    /// Immediately before the operation's logic.
    Start,
    /// Immediately after, on success and error paths alike.
    End,
    /// A standalone event with no duration.
    Point,
}

impl EventPhase {
    pub const COUNT: usize = 3;

    pub fn index(&self) -> usize {
        *self as usize
    }
}

/// Scratch space a monitor may fill at START and read back at END of the same
/// invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub enum MonitorData {
    #[default]
    None,
    Int(i64),
    Uint(u64),
    Float(f64),
}

/// Result of the instrumented operation as seen at END.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Not known yet, always the case at START.
    #[default]
    Pending,
    Success,
    Failure(ErrorCode),
}

impl Outcome {
    pub fn of<T>(res: &Result<T>) -> Self {
        match res {
            Ok(_) => Outcome::Success,
            Err(e) => Outcome::Failure(e.code()),
        }
    }
}

/// Per-kind arguments. Fields that only become known while the operation
/// runs (an operation key, a resolved address) are `None` at START.
#[derive(Debug, Clone)]
pub enum EventArgs {
    Progress {
        timeout_ms: u64,
    },
    Trigger {
        timeout_ms: u64,
        max_count: usize,
        actual_count: usize,
    },
    Register {
        name: Option<String>,
        id: RpcId,
        pool: String,
    },
    Deregister {
        id: RpcId,
    },
    Lookup {
        name: String,
        address: Option<Address>,
    },
    Create {
        target: Address,
        id: RpcId,
    },
    Forward {
        target: Address,
        id: RpcId,
        timeout_ms: Option<u64>,
        op: Option<OpKey>,
    },
    ForwardCb {
        op: OpKey,
    },
    Respond {
        origin: Address,
        id: RpcId,
        op: Option<OpKey>,
    },
    RespondCb {
        op: OpKey,
    },
    Destroy {
        id: RpcId,
    },
    BulkCreate {
        size: usize,
        access: BulkAccess,
        region: Option<u64>,
    },
    BulkTransfer {
        op: BulkOp,
        origin: Address,
        remote_region: u64,
        remote_offset: usize,
        local_region: u64,
        local_offset: usize,
        size: usize,
        request: Option<OpKey>,
    },
    BulkTransferCb {
        op: OpKey,
    },
    BulkFree {
        region: u64,
    },
    RpcHandler {
        id: RpcId,
        origin: Address,
        pool: Option<String>,
    },
    RpcUlt {
        id: RpcId,
    },
    Wait {
        op: OpKey,
    },
    Sleep {
        timeout_ms: f64,
    },
    SetInput {
        id: RpcId,
        size: usize,
    },
    SetOutput {
        id: RpcId,
        size: usize,
    },
    GetInput {
        id: RpcId,
        size: usize,
    },
    GetOutput {
        id: RpcId,
        size: usize,
    },
    FreeInput {
        id: RpcId,
    },
    FreeOutput {
        id: RpcId,
    },
    Prefinalize,
    Finalize,
    User {
        name: String,
        data: Option<serde_json::Value>,
    },
}

impl EventArgs {
    pub fn kind(&self) -> EventKind {
        match self {
            EventArgs::Progress { .. } => EventKind::Progress,
            EventArgs::Trigger { .. } => EventKind::Trigger,
            EventArgs::Register { .. } => EventKind::Register,
            EventArgs::Deregister { .. } => EventKind::Deregister,
            EventArgs::Lookup { .. } => EventKind::Lookup,
            EventArgs::Create { .. } => EventKind::Create,
            EventArgs::Forward { .. } => EventKind::Forward,
            EventArgs::ForwardCb { .. } => EventKind::ForwardCb,
            EventArgs::Respond { .. } => EventKind::Respond,
            EventArgs::RespondCb { .. } => EventKind::RespondCb,
            EventArgs::Destroy { .. } => EventKind::Destroy,
            EventArgs::BulkCreate { .. } => EventKind::BulkCreate,
            EventArgs::BulkTransfer { .. } => EventKind::BulkTransfer,
            EventArgs::BulkTransferCb { .. } => EventKind::BulkTransferCb,
            EventArgs::BulkFree { .. } => EventKind::BulkFree,
            EventArgs::RpcHandler { .. } => EventKind::RpcHandler,
            EventArgs::RpcUlt { .. } => EventKind::RpcUlt,
            EventArgs::Wait { .. } => EventKind::Wait,
            EventArgs::Sleep { .. } => EventKind::Sleep,
            EventArgs::SetInput { .. } => EventKind::SetInput,
            EventArgs::SetOutput { .. } => EventKind::SetOutput,
            EventArgs::GetInput { .. } => EventKind::GetInput,
            EventArgs::GetOutput { .. } => EventKind::GetOutput,
            EventArgs::FreeInput { .. } => EventKind::FreeInput,
            EventArgs::FreeOutput { .. } => EventKind::FreeOutput,
            EventArgs::Prefinalize => EventKind::Prefinalize,
            EventArgs::Finalize => EventKind::Finalize,
            EventArgs::User { .. } => EventKind::User,
        }
    }
}

/// What a monitor receives. The same value is handed out at START and END of
/// one invocation.
#[derive(Debug, Clone)]
pub struct MonitorEvent {
    pub uctx: MonitorData,
    pub outcome: Outcome,
    pub args: EventArgs,
}

impl MonitorEvent {
    pub fn new(args: EventArgs) -> Self {
        Self {
            uctx: MonitorData::None,
            outcome: Outcome::Pending,
            args,
        }
    }

    pub fn kind(&self) -> EventKind {
        self.args.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::collections::HashSet;

    #[test]
    fn test_all_kinds_are_dense_and_distinct() {
        for (i, kind) in EventKind::ALL.iter().enumerate() {
            assert_eq!(kind.index(), i);
        }

        let names = EventKind::ALL
            .iter()
            .map(|k| k.as_str())
            .collect::<HashSet<_>>();
        assert_eq!(names.len(), EventKind::COUNT);
    }

    #[test]
    fn test_args_map_to_kind() {
        let event = MonitorEvent::new(EventArgs::Trigger {
            timeout_ms: 0,
            max_count: 8,
            actual_count: 0,
        });
        assert_eq!(event.kind(), EventKind::Trigger);
        assert_eq!(EventArgs::Prefinalize.kind(), EventKind::Prefinalize);
    }

    #[test]
    fn test_outcome_of_result() {
        assert_eq!(Outcome::of(&Ok::<_, Error>(())), Outcome::Success);
        assert_eq!(
            Outcome::of(&Err::<(), _>(Error::Timeout)),
            Outcome::Failure(ErrorCode::Timeout)
        );
    }
}
