//! UPIU (UFS protocol information unit) layouts.
//!
//! Every UPIU starts with a 12 byte header. Multi-byte fields are big-endian on the wire.
//! Request UPIUs built here are 32 bytes; responses may carry a data segment after that.

use crate::{ProtoError, ensure_len};
use byteorder::{BigEndian, ByteOrder};

/// Bytes in the common UPIU header.
pub const UPIU_HEADER_LEN: usize = 12;
/// Bytes in a request/response UPIU before any data segment.
pub const UPIU_BASE_LEN: usize = 32;
/// Offset of sense data length within a response UPIU.
pub const RESPONSE_SENSE_LEN_OFFSET: usize = 32;
/// Maximum sense bytes kept from a response UPIU.
pub const SENSE_BUFFER_LEN: usize = 18;
/// Space reserved per slot for a response UPIU, including a descriptor-sized data segment.
pub const RESPONSE_UPIU_MAX_LEN: usize = UPIU_BASE_LEN + 256;

pub const UPIU_CMD_FLAGS_NONE: u8 = 0x00;
pub const UPIU_CMD_FLAGS_WRITE: u8 = 0x20;
pub const UPIU_CMD_FLAGS_READ: u8 = 0x40;
pub const UPIU_COMMAND_SET_TYPE_SCSI: u8 = 0x0;
pub const UPIU_COMMAND_SET_TYPE_QUERY: u8 = 0x2;

pub const UPIU_RESPONSE_TARGET_SUCCESS: u8 = 0x00;
pub const UPIU_RESPONSE_TARGET_FAILURE: u8 = 0x01;

/// Well-known logical unit numbers.
pub mod wlun {
    pub const WLUN_ID: u8 = 1 << 7;
    pub const REPORT_LUNS: u8 = 0x81;
    pub const BOOT: u8 = 0xB0;
    pub const RPMB: u8 = 0xC4;
    pub const UFS_DEVICE: u8 = 0xD0;
}

/// Query flag identifiers.
pub mod flag {
    pub const DEVICE_INIT: u8 = 0x01;
    pub const PERMANENT_WPE: u8 = 0x02;
    pub const POWER_ON_WPE: u8 = 0x03;
    pub const BKOPS_EN: u8 = 0x04;
}

/// Query attribute identifiers.
pub mod attr {
    pub const BOOT_LU_EN: u8 = 0x00;
    pub const POWER_MODE: u8 = 0x02;
    pub const ACTIVE_ICC_LVL: u8 = 0x03;
    pub const BKOPS_STATUS: u8 = 0x05;
    pub const REF_CLK_FREQ: u8 = 0x0A;
    pub const EE_CONTROL: u8 = 0x0D;
    pub const EE_STATUS: u8 = 0x0E;
}

/// Descriptor identifiers and device descriptor field offsets.
pub mod desc {
    pub const DEVICE: u8 = 0x00;
    pub const CONFIGURATION: u8 = 0x01;
    pub const UNIT: u8 = 0x02;
    pub const INTERCONNECT: u8 = 0x04;
    pub const STRING: u8 = 0x05;
    pub const GEOMETRY: u8 = 0x07;
    pub const POWER: u8 = 0x08;
    pub const HEALTH: u8 = 0x09;

    pub const DEVICE_DESC_LEN: usize = 0x40;
    pub const DEVICE_PARAM_LEN: usize = 0x00;
    pub const DEVICE_PARAM_TYPE: usize = 0x01;
    pub const DEVICE_PARAM_NUM_LU: usize = 0x06;
    pub const DEVICE_PARAM_NUM_WLU: usize = 0x07;
    pub const DEVICE_PARAM_SPEC_VER: usize = 0x10;
    pub const DEVICE_PARAM_MANF_ID: usize = 0x18;
    pub const DEVICE_PARAM_Q_DPTH: usize = 0x21;
}

/// SCSI code points the host core itself needs.
pub mod scsi {
    pub const TEST_UNIT_READY: u8 = 0x00;
    pub const REQUEST_SENSE: u8 = 0x03;
    pub const START_STOP_UNIT: u8 = 0x1B;
    pub const READ_10: u8 = 0x28;
    pub const WRITE_10: u8 = 0x2A;

    pub const STATUS_GOOD: u8 = 0x00;
    pub const STATUS_CHECK_CONDITION: u8 = 0x02;
    pub const STATUS_BUSY: u8 = 0x08;
    pub const STATUS_TASK_SET_FULL: u8 = 0x28;

    /// START STOP UNIT power conditions (byte 4, bits 7:4).
    pub const POWER_CONDITION_ACTIVE: u8 = 0x1;
    pub const POWER_CONDITION_SLEEP: u8 = 0x2;
    pub const POWER_CONDITION_POWERDOWN: u8 = 0x3;
}

/// UPIU transaction codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum TransactionType {
    NopOut = 0x00,
    Command = 0x01,
    DataOut = 0x02,
    TaskReq = 0x04,
    QueryReq = 0x16,
    NopIn = 0x20,
    Response = 0x21,
    DataIn = 0x22,
    TaskRsp = 0x24,
    ReadyToTransfer = 0x31,
    QueryRsp = 0x36,
    Reject = 0x3F,
}

impl TryFrom<u8> for TransactionType {
    type Error = ProtoError;

    fn try_from(value: u8) -> crate::Result<Self> {
        match value {
            0x00 => Ok(Self::NopOut),
            0x01 => Ok(Self::Command),
            0x02 => Ok(Self::DataOut),
            0x04 => Ok(Self::TaskReq),
            0x16 => Ok(Self::QueryReq),
            0x20 => Ok(Self::NopIn),
            0x21 => Ok(Self::Response),
            0x22 => Ok(Self::DataIn),
            0x24 => Ok(Self::TaskRsp),
            0x31 => Ok(Self::ReadyToTransfer),
            0x36 => Ok(Self::QueryRsp),
            0x3F => Ok(Self::Reject),
            other => Err(ProtoError::InvalidCode {
                field: "transaction type",
                value: other,
            }),
        }
    }
}

/// Common 12 byte UPIU header.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UpiuHeader {
    pub transaction_type: u8,
    pub flags: u8,
    pub lun: u8,
    pub task_tag: u8,
    pub command_set: u8,
    pub function: u8,
    pub response: u8,
    pub status: u8,
    pub ehs_len: u8,
    pub device_info: u8,
    pub data_segment_len: u16,
}

impl UpiuHeader {
    pub fn new(transaction: TransactionType, task_tag: u8) -> Self {
        Self {
            transaction_type: transaction as u8,
            task_tag,
            ..Default::default()
        }
    }

    pub fn encode_into(&self, buf: &mut [u8]) {
        buf[0] = self.transaction_type;
        buf[1] = self.flags;
        buf[2] = self.lun;
        buf[3] = self.task_tag;
        buf[4] = self.command_set;
        buf[5] = self.function;
        buf[6] = self.response;
        buf[7] = self.status;
        buf[8] = self.ehs_len;
        buf[9] = self.device_info;
        BigEndian::write_u16(&mut buf[10..12], self.data_segment_len);
    }

    pub fn decode(buf: &[u8]) -> crate::Result<Self> {
        ensure_len(buf, UPIU_HEADER_LEN)?;
        Ok(Self {
            transaction_type: buf[0],
            flags: buf[1],
            lun: buf[2],
            task_tag: buf[3],
            command_set: buf[4],
            function: buf[5],
            response: buf[6],
            status: buf[7],
            ehs_len: buf[8],
            device_info: buf[9],
            data_segment_len: BigEndian::read_u16(&buf[10..12]),
        })
    }

    pub fn transaction(&self) -> crate::Result<TransactionType> {
        TransactionType::try_from(self.transaction_type)
    }

    fn expect(&self, expected: TransactionType) -> crate::Result<()> {
        if self.transaction_type != expected as u8 {
            return Err(ProtoError::UnexpectedTransaction {
                expected: expected as u8,
                actual: self.transaction_type,
            });
        }
        Ok(())
    }
}

/// SCSI command UPIU.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CommandUpiu {
    pub lun: u8,
    pub task_tag: u8,
    pub flags: u8,
    pub expected_len: u32,
    pub cdb: [u8; 16],
}

impl CommandUpiu {
    pub fn encode(&self) -> [u8; UPIU_BASE_LEN] {
        let mut buf = [0u8; UPIU_BASE_LEN];
        let header = UpiuHeader {
            flags: self.flags,
            lun: self.lun,
            command_set: UPIU_COMMAND_SET_TYPE_SCSI,
            ..UpiuHeader::new(TransactionType::Command, self.task_tag)
        };
        header.encode_into(&mut buf);
        BigEndian::write_u32(&mut buf[12..16], self.expected_len);
        buf[16..32].copy_from_slice(&self.cdb);
        buf
    }

    pub fn decode(buf: &[u8]) -> crate::Result<Self> {
        ensure_len(buf, UPIU_BASE_LEN)?;
        let header = UpiuHeader::decode(buf)?;
        header.expect(TransactionType::Command)?;
        let mut cdb = [0u8; 16];
        cdb.copy_from_slice(&buf[16..32]);
        Ok(Self {
            lun: header.lun,
            task_tag: header.task_tag,
            flags: header.flags,
            expected_len: BigEndian::read_u32(&buf[12..16]),
            cdb,
        })
    }
}

/// NOP OUT UPIU, used to probe link and device liveness.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NopOutUpiu {
    pub task_tag: u8,
}

impl NopOutUpiu {
    pub fn encode(&self) -> [u8; UPIU_BASE_LEN] {
        let mut buf = [0u8; UPIU_BASE_LEN];
        UpiuHeader::new(TransactionType::NopOut, self.task_tag).encode_into(&mut buf);
        buf
    }
}

/// Query request function field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum QueryFunction {
    StandardRead = 0x01,
    StandardWrite = 0x81,
}

/// Query request opcodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum QueryOpcode {
    Nop = 0x0,
    ReadDesc = 0x1,
    WriteDesc = 0x2,
    ReadAttr = 0x3,
    WriteAttr = 0x4,
    ReadFlag = 0x5,
    SetFlag = 0x6,
    ClearFlag = 0x7,
    ToggleFlag = 0x8,
}

impl QueryOpcode {
    pub fn function(self) -> QueryFunction {
        match self {
            QueryOpcode::Nop
            | QueryOpcode::ReadDesc
            | QueryOpcode::ReadAttr
            | QueryOpcode::ReadFlag => QueryFunction::StandardRead,
            _ => QueryFunction::StandardWrite,
        }
    }
}

impl TryFrom<u8> for QueryOpcode {
    type Error = ProtoError;

    fn try_from(value: u8) -> crate::Result<Self> {
        match value {
            0x0 => Ok(Self::Nop),
            0x1 => Ok(Self::ReadDesc),
            0x2 => Ok(Self::WriteDesc),
            0x3 => Ok(Self::ReadAttr),
            0x4 => Ok(Self::WriteAttr),
            0x5 => Ok(Self::ReadFlag),
            0x6 => Ok(Self::SetFlag),
            0x7 => Ok(Self::ClearFlag),
            0x8 => Ok(Self::ToggleFlag),
            other => Err(ProtoError::InvalidCode {
                field: "query opcode",
                value: other,
            }),
        }
    }
}

/// Query response codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryResponseCode {
    Success,
    NotReadable,
    NotWriteable,
    AlreadyWritten,
    InvalidLength,
    InvalidValue,
    InvalidSelector,
    InvalidIndex,
    InvalidIdn,
    InvalidOpcode,
    GeneralFailure,
    Unknown(u8),
}

impl From<u8> for QueryResponseCode {
    fn from(value: u8) -> Self {
        match value {
            0x00 => Self::Success,
            0xF6 => Self::NotReadable,
            0xF7 => Self::NotWriteable,
            0xF8 => Self::AlreadyWritten,
            0xF9 => Self::InvalidLength,
            0xFA => Self::InvalidValue,
            0xFB => Self::InvalidSelector,
            0xFC => Self::InvalidIndex,
            0xFD => Self::InvalidIdn,
            0xFE => Self::InvalidOpcode,
            0xFF => Self::GeneralFailure,
            other => Self::Unknown(other),
        }
    }
}

impl From<QueryResponseCode> for u8 {
    fn from(code: QueryResponseCode) -> Self {
        match code {
            QueryResponseCode::Success => 0x00,
            QueryResponseCode::NotReadable => 0xF6,
            QueryResponseCode::NotWriteable => 0xF7,
            QueryResponseCode::AlreadyWritten => 0xF8,
            QueryResponseCode::InvalidLength => 0xF9,
            QueryResponseCode::InvalidValue => 0xFA,
            QueryResponseCode::InvalidSelector => 0xFB,
            QueryResponseCode::InvalidIndex => 0xFC,
            QueryResponseCode::InvalidIdn => 0xFD,
            QueryResponseCode::InvalidOpcode => 0xFE,
            QueryResponseCode::GeneralFailure => 0xFF,
            QueryResponseCode::Unknown(other) => other,
        }
    }
}

/// Query request UPIU. Descriptor writes append `length` bytes of data after the base UPIU.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueryRequestUpiu {
    pub task_tag: u8,
    pub opcode: QueryOpcode,
    pub idn: u8,
    pub index: u8,
    pub selector: u8,
    pub length: u16,
    pub value: u32,
}

impl QueryRequestUpiu {
    pub fn new(task_tag: u8, opcode: QueryOpcode, idn: u8, index: u8, selector: u8) -> Self {
        Self {
            task_tag,
            opcode,
            idn,
            index,
            selector,
            length: 0,
            value: 0,
        }
    }

    pub fn encode(&self) -> [u8; UPIU_BASE_LEN] {
        let mut buf = [0u8; UPIU_BASE_LEN];
        let data_segment_len = if self.opcode == QueryOpcode::WriteDesc {
            self.length
        } else {
            0
        };
        let header = UpiuHeader {
            command_set: UPIU_COMMAND_SET_TYPE_QUERY,
            function: self.opcode.function() as u8,
            data_segment_len,
            ..UpiuHeader::new(TransactionType::QueryReq, self.task_tag)
        };
        header.encode_into(&mut buf);
        buf[12] = self.opcode as u8;
        buf[13] = self.idn;
        buf[14] = self.index;
        buf[15] = self.selector;
        BigEndian::write_u16(&mut buf[18..20], self.length);
        BigEndian::write_u32(&mut buf[20..24], self.value);
        buf
    }

    pub fn decode(buf: &[u8]) -> crate::Result<Self> {
        ensure_len(buf, UPIU_BASE_LEN)?;
        let header = UpiuHeader::decode(buf)?;
        header.expect(TransactionType::QueryReq)?;
        Ok(Self {
            task_tag: header.task_tag,
            opcode: QueryOpcode::try_from(buf[12])?,
            idn: buf[13],
            index: buf[14],
            selector: buf[15],
            length: BigEndian::read_u16(&buf[18..20]),
            value: BigEndian::read_u32(&buf[20..24]),
        })
    }
}

/// Decoded query response UPIU. Descriptor data (if any) follows at offset 32.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueryResponse {
    pub task_tag: u8,
    pub response: QueryResponseCode,
    pub opcode: u8,
    pub idn: u8,
    pub index: u8,
    pub selector: u8,
    pub length: u16,
    pub value: u32,
    pub data_segment_len: u16,
}

impl QueryResponse {
    pub fn decode(buf: &[u8]) -> crate::Result<Self> {
        ensure_len(buf, UPIU_BASE_LEN)?;
        let header = UpiuHeader::decode(buf)?;
        header.expect(TransactionType::QueryRsp)?;
        Ok(Self {
            task_tag: header.task_tag,
            response: QueryResponseCode::from(header.response),
            opcode: buf[12],
            idn: buf[13],
            index: buf[14],
            selector: buf[15],
            length: BigEndian::read_u16(&buf[18..20]),
            value: BigEndian::read_u32(&buf[20..24]),
            data_segment_len: header.data_segment_len,
        })
    }

    /// Encode into `buf`, followed by `data` as the data segment. Returns bytes written.
    pub fn encode_into(&self, buf: &mut [u8], data: &[u8]) -> usize {
        let header = UpiuHeader {
            command_set: UPIU_COMMAND_SET_TYPE_QUERY,
            response: self.response.into(),
            data_segment_len: data.len() as u16,
            ..UpiuHeader::new(TransactionType::QueryRsp, self.task_tag)
        };
        buf[..UPIU_BASE_LEN].fill(0);
        header.encode_into(buf);
        buf[12] = self.opcode;
        buf[13] = self.idn;
        buf[14] = self.index;
        buf[15] = self.selector;
        BigEndian::write_u16(&mut buf[18..20], self.length);
        BigEndian::write_u32(&mut buf[20..24], self.value);
        buf[UPIU_BASE_LEN..UPIU_BASE_LEN + data.len()].copy_from_slice(data);
        UPIU_BASE_LEN + data.len()
    }

    /// Flags are returned in the least significant bit of the value field.
    pub fn flag(&self) -> bool {
        self.value & 0x1 != 0
    }
}

/// Decoded response UPIU for SCSI commands (and NOP IN headers).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResponseUpiu {
    pub transaction_type: u8,
    pub task_tag: u8,
    pub response: u8,
    pub status: u8,
    pub residual: u32,
    pub sense_len: u16,
    pub sense: [u8; SENSE_BUFFER_LEN],
}

impl ResponseUpiu {
    pub fn success(task_tag: u8) -> Self {
        Self {
            transaction_type: TransactionType::Response as u8,
            task_tag,
            response: UPIU_RESPONSE_TARGET_SUCCESS,
            status: scsi::STATUS_GOOD,
            residual: 0,
            sense_len: 0,
            sense: [0; SENSE_BUFFER_LEN],
        }
    }

    pub fn decode(buf: &[u8]) -> crate::Result<Self> {
        ensure_len(buf, UPIU_BASE_LEN)?;
        let header = UpiuHeader::decode(buf)?;
        let mut sense = [0u8; SENSE_BUFFER_LEN];
        let mut sense_len = 0u16;
        if header.data_segment_len > 0 {
            ensure_len(buf, RESPONSE_SENSE_LEN_OFFSET + 2)?;
            let len = BigEndian::read_u16(
                &buf[RESPONSE_SENSE_LEN_OFFSET..RESPONSE_SENSE_LEN_OFFSET + 2],
            );
            let copy = (len as usize).min(SENSE_BUFFER_LEN);
            let start = RESPONSE_SENSE_LEN_OFFSET + 2;
            ensure_len(buf, start + copy)?;
            sense[..copy].copy_from_slice(&buf[start..start + copy]);
            sense_len = copy as u16;
        }
        Ok(Self {
            transaction_type: header.transaction_type,
            task_tag: header.task_tag,
            response: header.response,
            status: header.status,
            residual: BigEndian::read_u32(&buf[12..16]),
            sense_len,
            sense,
        })
    }

    /// Encode into `buf`. Returns bytes written.
    pub fn encode_into(&self, buf: &mut [u8]) -> usize {
        let data_segment_len = if self.sense_len > 0 {
            self.sense_len + 2
        } else {
            0
        };
        let header = UpiuHeader {
            transaction_type: self.transaction_type,
            task_tag: self.task_tag,
            response: self.response,
            status: self.status,
            data_segment_len,
            ..Default::default()
        };
        buf[..UPIU_BASE_LEN].fill(0);
        header.encode_into(buf);
        BigEndian::write_u32(&mut buf[12..16], self.residual);
        if self.sense_len == 0 {
            return UPIU_BASE_LEN;
        }
        let len = self.sense_len as usize;
        BigEndian::write_u16(
            &mut buf[RESPONSE_SENSE_LEN_OFFSET..RESPONSE_SENSE_LEN_OFFSET + 2],
            self.sense_len,
        );
        let start = RESPONSE_SENSE_LEN_OFFSET + 2;
        buf[start..start + len].copy_from_slice(&self.sense[..len]);
        start + len
    }

    pub fn sense(&self) -> &[u8] {
        &self.sense[..self.sense_len as usize]
    }
}

/// Task management functions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum TmFunction {
    AbortTask = 0x01,
    AbortTaskSet = 0x02,
    ClearTaskSet = 0x04,
    LogicalUnitReset = 0x08,
    QueryTask = 0x80,
    QueryTaskSet = 0x81,
}

impl TryFrom<u8> for TmFunction {
    type Error = ProtoError;

    fn try_from(value: u8) -> crate::Result<Self> {
        match value {
            0x01 => Ok(Self::AbortTask),
            0x02 => Ok(Self::AbortTaskSet),
            0x04 => Ok(Self::ClearTaskSet),
            0x08 => Ok(Self::LogicalUnitReset),
            0x80 => Ok(Self::QueryTask),
            0x81 => Ok(Self::QueryTaskSet),
            other => Err(ProtoError::InvalidCode {
                field: "task management function",
                value: other,
            }),
        }
    }
}

/// Task management service responses (output parameter 1).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskServiceResponse {
    Complete,
    NotSupported,
    Failed,
    Succeeded,
    IncorrectLun,
    Unknown(u8),
}

impl From<u8> for TaskServiceResponse {
    fn from(value: u8) -> Self {
        match value {
            0x00 => Self::Complete,
            0x04 => Self::NotSupported,
            0x05 => Self::Failed,
            0x08 => Self::Succeeded,
            0x09 => Self::IncorrectLun,
            other => Self::Unknown(other),
        }
    }
}

impl From<TaskServiceResponse> for u8 {
    fn from(value: TaskServiceResponse) -> Self {
        match value {
            TaskServiceResponse::Complete => 0x00,
            TaskServiceResponse::NotSupported => 0x04,
            TaskServiceResponse::Failed => 0x05,
            TaskServiceResponse::Succeeded => 0x08,
            TaskServiceResponse::IncorrectLun => 0x09,
            TaskServiceResponse::Unknown(other) => other,
        }
    }
}

/// Task management request UPIU.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TaskRequestUpiu {
    pub lun: u8,
    pub task_tag: u8,
    pub function: TmFunction,
    /// Target LUN of the function.
    pub input_param1: u32,
    /// Task tag of the command the function targets.
    pub input_param2: u32,
}

impl TaskRequestUpiu {
    pub fn new(lun: u8, task_tag: u8, function: TmFunction, target_tag: u8) -> Self {
        Self {
            lun,
            task_tag,
            function,
            input_param1: lun as u32,
            input_param2: target_tag as u32,
        }
    }

    pub fn encode(&self) -> [u8; UPIU_BASE_LEN] {
        let mut buf = [0u8; UPIU_BASE_LEN];
        let header = UpiuHeader {
            lun: self.lun,
            function: self.function as u8,
            ..UpiuHeader::new(TransactionType::TaskReq, self.task_tag)
        };
        header.encode_into(&mut buf);
        BigEndian::write_u32(&mut buf[12..16], self.input_param1);
        BigEndian::write_u32(&mut buf[16..20], self.input_param2);
        buf
    }

    pub fn decode(buf: &[u8]) -> crate::Result<Self> {
        ensure_len(buf, UPIU_BASE_LEN)?;
        let header = UpiuHeader::decode(buf)?;
        header.expect(TransactionType::TaskReq)?;
        Ok(Self {
            lun: header.lun,
            task_tag: header.task_tag,
            function: TmFunction::try_from(header.function)?,
            input_param1: BigEndian::read_u32(&buf[12..16]),
            input_param2: BigEndian::read_u32(&buf[16..20]),
        })
    }
}

/// Task management response UPIU.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TaskResponse {
    pub task_tag: u8,
    pub response: u8,
    pub service_response: TaskServiceResponse,
    pub output_param2: u32,
}

impl TaskResponse {
    pub fn encode(&self) -> [u8; UPIU_BASE_LEN] {
        let mut buf = [0u8; UPIU_BASE_LEN];
        let header = UpiuHeader {
            response: self.response,
            ..UpiuHeader::new(TransactionType::TaskRsp, self.task_tag)
        };
        header.encode_into(&mut buf);
        BigEndian::write_u32(&mut buf[12..16], u8::from(self.service_response) as u32);
        BigEndian::write_u32(&mut buf[16..20], self.output_param2);
        buf
    }

    pub fn decode(buf: &[u8]) -> crate::Result<Self> {
        ensure_len(buf, UPIU_BASE_LEN)?;
        let header = UpiuHeader::decode(buf)?;
        header.expect(TransactionType::TaskRsp)?;
        let param1 = BigEndian::read_u32(&buf[12..16]);
        Ok(Self {
            task_tag: header.task_tag,
            response: header.response,
            service_response: TaskServiceResponse::from((param1 & 0xFF) as u8),
            output_param2: BigEndian::read_u32(&buf[16..20]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_upiu_layout() {
        let mut cdb = [0u8; 16];
        cdb[0] = scsi::READ_10;
        let upiu = CommandUpiu {
            lun: 2,
            task_tag: 7,
            flags: UPIU_CMD_FLAGS_READ,
            expected_len: 4096,
            cdb,
        };
        let bytes = upiu.encode();
        assert_eq!(bytes[0], TransactionType::Command as u8);
        assert_eq!(bytes[1], UPIU_CMD_FLAGS_READ);
        assert_eq!(bytes[2], 2);
        assert_eq!(bytes[3], 7);
        assert_eq!(&bytes[12..16], &[0, 0, 0x10, 0]);
        assert_eq!(bytes[16], scsi::READ_10);
        assert_eq!(CommandUpiu::decode(&bytes).unwrap(), upiu);
    }

    #[test]
    fn query_request_write_descriptor_sets_data_segment() {
        let mut req = QueryRequestUpiu::new(3, QueryOpcode::WriteDesc, desc::CONFIGURATION, 0, 0);
        req.length = 0x90;
        let bytes = req.encode();
        assert_eq!(bytes[5], QueryFunction::StandardWrite as u8);
        assert_eq!(&bytes[10..12], &[0, 0x90]);
        assert_eq!(QueryRequestUpiu::decode(&bytes).unwrap(), req);
    }

    #[test]
    fn query_response_flag_value() {
        let rsp = QueryResponse {
            task_tag: 1,
            response: QueryResponseCode::Success,
            opcode: QueryOpcode::ReadFlag as u8,
            idn: flag::DEVICE_INIT,
            index: 0,
            selector: 0,
            length: 0,
            value: 1,
            data_segment_len: 0,
        };
        let mut buf = [0u8; RESPONSE_UPIU_MAX_LEN];
        let len = rsp.encode_into(&mut buf, &[]);
        assert_eq!(len, UPIU_BASE_LEN);
        let decoded = QueryResponse::decode(&buf).unwrap();
        assert!(decoded.flag());
        assert_eq!(decoded.idn, flag::DEVICE_INIT);
    }

    #[test]
    fn response_upiu_carries_sense() {
        let mut rsp = ResponseUpiu::success(4);
        rsp.status = scsi::STATUS_CHECK_CONDITION;
        rsp.sense_len = 3;
        rsp.sense[..3].copy_from_slice(&[0x70, 0x00, 0x06]);
        let mut buf = [0u8; RESPONSE_UPIU_MAX_LEN];
        rsp.encode_into(&mut buf);
        let decoded = ResponseUpiu::decode(&buf).unwrap();
        assert_eq!(decoded.status, scsi::STATUS_CHECK_CONDITION);
        assert_eq!(decoded.sense(), &[0x70, 0x00, 0x06]);
    }

    #[test]
    fn task_request_targets_tag() {
        let req = TaskRequestUpiu::new(1, 9, TmFunction::AbortTask, 5);
        let bytes = req.encode();
        assert_eq!(bytes[5], TmFunction::AbortTask as u8);
        assert_eq!(&bytes[16..20], &[0, 0, 0, 5]);
        assert_eq!(TaskRequestUpiu::decode(&bytes).unwrap(), req);
    }

    #[test]
    fn decode_rejects_wrong_transaction() {
        let bytes = NopOutUpiu { task_tag: 1 }.encode();
        assert!(matches!(
            CommandUpiu::decode(&bytes),
            Err(ProtoError::UnexpectedTransaction { .. })
        ));
    }

    #[test]
    fn decode_rejects_short_buffer() {
        assert!(matches!(
            QueryResponse::decode(&[0u8; 20]),
            Err(ProtoError::Truncated {
                expected: 32,
                actual: 20
            })
        ));
    }
}
