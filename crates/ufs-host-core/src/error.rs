use crate::state::HostState;
use std::time::Duration;
use thiserror::Error;
use ufs_proto::{
    Ocs, ProtoError, PwrStatus, QueryOpcode, QueryResponseCode, TaskServiceResponse, TmFunction,
    UicOpcode, UicResult,
};

/// Errors surfaced by the host core.
#[derive(Debug, Error)]
pub enum UfsError {
    /// Host is not accepting new commands right now; retry later.
    #[error("host busy ({0})")]
    Busy(HostState),
    /// Host is suspended; resume before issuing commands.
    #[error("host suspended")]
    Suspended,
    /// Recovery failed; admission is refused until a host reset succeeds.
    #[error("host in error state")]
    HostFailed,
    /// A blocking call was interrupted by shutdown.
    #[error("interrupted")]
    Interrupted,
    #[error("{what} timed out after {timeout:?}")]
    Timeout {
        what: &'static str,
        timeout: Duration,
    },
    #[error("uic command {opcode:?} failed: {result}")]
    Uic { opcode: UicOpcode, result: UicResult },
    #[error("uic command ready bit not set")]
    UicNotReady,
    #[error("link power change failed with status {0:?}")]
    PowerChange(PwrStatus),
    #[error("controller enable failed")]
    ControllerEnable,
    #[error("link startup failed after {attempts} attempts")]
    LinkStartup { attempts: u32 },
    #[error("transfer/task request lists not ready")]
    ListsNotReady,
    #[error("device command failed with ocs {0}")]
    Ocs(Ocs),
    #[error("query {opcode:?} idn {idn:#x} failed: {response:?}")]
    Query {
        opcode: QueryOpcode,
        idn: u8,
        response: QueryResponseCode,
    },
    #[error("task management {function:?} failed: {response:?}")]
    TaskManagement {
        function: TmFunction,
        response: TaskServiceResponse,
    },
    #[error("unexpected device response: {0}")]
    UnexpectedResponse(&'static str),
    #[error("command cleared by recovery")]
    Requeued,
    #[error("host reset failed after {attempts} attempts")]
    ResetFailed { attempts: u32 },
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("variant hook failed: {0}")]
    Variant(String),
    #[error("failed to spawn {name} worker")]
    Spawn {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Protocol(#[from] ProtoError),
}

impl UfsError {
    /// Whether the caller may simply retry the same operation later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            UfsError::Busy(_) | UfsError::Requeued | UfsError::Timeout { .. }
        )
    }
}

pub type UfsResult<T> = Result<T, UfsError>;
