#![no_std]

//! Fixed protocol contracts shared by the UFS host core and its backends.
//!
//! Nothing in here owns policy: these are the UFSHCI register offsets and bit
//! layouts, the UTP transfer/task descriptor words, the UPIU wire layout and
//! the UIC command encoding.

use core::fmt;

pub mod ahit;
pub mod regs;
pub mod uic;
pub mod upiu;
pub mod utp;

pub use ahit::{ahit_from_micros, ahit_to_micros};
pub use regs::Capabilities;
pub use uic::{
    HsRate, PowerMode, PwrStatus, UicOpcode, UicResult, mib, mib_sel, pa_pwrmode_value,
};
pub use upiu::{
    CommandUpiu, NopOutUpiu, QueryFunction, QueryOpcode, QueryRequestUpiu, QueryResponse,
    QueryResponseCode, ResponseUpiu, TaskRequestUpiu, TaskResponse, TaskServiceResponse,
    TmFunction, TransactionType, UPIU_HEADER_LEN, UpiuHeader,
};
pub use utp::{DataDirection, Ocs, UtpCommandType, UtpTaskDescriptor, UtpTransferDescriptor};

/// Errors surfaced while decoding protocol structures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProtoError {
    /// Buffer was shorter than the structure requires.
    Truncated { expected: usize, actual: usize },
    /// Transaction type did not match the structure being decoded.
    UnexpectedTransaction { expected: u8, actual: u8 },
    /// Opcode or code point not defined by the protocol.
    InvalidCode { field: &'static str, value: u8 },
    /// Field value failed validation.
    InvalidValue(&'static str),
}

impl fmt::Display for ProtoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtoError::Truncated { expected, actual } => {
                write!(f, "truncated structure: {actual} bytes, expected {expected}")
            }
            ProtoError::UnexpectedTransaction { expected, actual } => write!(
                f,
                "unexpected transaction type {actual:#04x}, expected {expected:#04x}"
            ),
            ProtoError::InvalidCode { field, value } => {
                write!(f, "invalid {field} code {value:#04x}")
            }
            ProtoError::InvalidValue(field) => write!(f, "invalid field value: {field}"),
        }
    }
}

impl core::error::Error for ProtoError {}

/// Result alias for protocol decoding.
pub type Result<T> = core::result::Result<T, ProtoError>;

pub(crate) fn ensure_len(buf: &[u8], expected: usize) -> Result<()> {
    if buf.len() < expected {
        return Err(ProtoError::Truncated {
            expected,
            actual: buf.len(),
        });
    }
    Ok(())
}
