//! UTP transfer request and task management request descriptor words.

use core::fmt;

pub const UTP_REQ_DESC_INT_CMD: u32 = 1 << 24;
const COMMAND_TYPE_SHIFT: u32 = 28;
const DATA_DIRECTION_SHIFT: u32 = 25;
const DATA_DIRECTION_MASK: u32 = 0x3 << DATA_DIRECTION_SHIFT;
const OCS_MASK: u32 = 0xFF;

/// Command type carried in descriptor dword 0.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum UtpCommandType {
    Scsi = 0x0,
    UfsStorage = 0x1,
    DevManage = 0x2,
}

/// Data transfer direction for a transfer request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum DataDirection {
    #[default]
    None = 0,
    HostToDevice = 1,
    DeviceToHost = 2,
}

impl DataDirection {
    fn from_bits(bits: u32) -> Self {
        match (bits & DATA_DIRECTION_MASK) >> DATA_DIRECTION_SHIFT {
            1 => DataDirection::HostToDevice,
            2 => DataDirection::DeviceToHost,
            _ => DataDirection::None,
        }
    }
}

/// Overall command status written back by the controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ocs {
    Success,
    InvalidCmdTableAttr,
    InvalidPrdtAttr,
    MismatchDataBufSize,
    MismatchRespUpiuSize,
    PeerCommFailure,
    Aborted,
    FatalError,
    DeviceFatalError,
    InvalidCryptoConfig,
    GeneralCryptoError,
    /// Written by software before issue; still present means the controller never touched it.
    InvalidCommandStatus,
    Unknown(u8),
}

impl From<u8> for Ocs {
    fn from(value: u8) -> Self {
        match value {
            0x0 => Ocs::Success,
            0x1 => Ocs::InvalidCmdTableAttr,
            0x2 => Ocs::InvalidPrdtAttr,
            0x3 => Ocs::MismatchDataBufSize,
            0x4 => Ocs::MismatchRespUpiuSize,
            0x5 => Ocs::PeerCommFailure,
            0x6 => Ocs::Aborted,
            0x7 => Ocs::FatalError,
            0x8 => Ocs::DeviceFatalError,
            0x9 => Ocs::InvalidCryptoConfig,
            0xA => Ocs::GeneralCryptoError,
            0xF => Ocs::InvalidCommandStatus,
            other => Ocs::Unknown(other),
        }
    }
}

impl From<Ocs> for u8 {
    fn from(ocs: Ocs) -> Self {
        match ocs {
            Ocs::Success => 0x0,
            Ocs::InvalidCmdTableAttr => 0x1,
            Ocs::InvalidPrdtAttr => 0x2,
            Ocs::MismatchDataBufSize => 0x3,
            Ocs::MismatchRespUpiuSize => 0x4,
            Ocs::PeerCommFailure => 0x5,
            Ocs::Aborted => 0x6,
            Ocs::FatalError => 0x7,
            Ocs::DeviceFatalError => 0x8,
            Ocs::InvalidCryptoConfig => 0x9,
            Ocs::GeneralCryptoError => 0xA,
            Ocs::InvalidCommandStatus => 0xF,
            Ocs::Unknown(other) => other,
        }
    }
}

impl fmt::Display for Ocs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ocs::Unknown(code) => write!(f, "unknown({code:#x})"),
            other => write!(f, "{other:?}"),
        }
    }
}

/// UTP transfer request descriptor header (the four control dwords).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UtpTransferDescriptor {
    pub dword0: u32,
    pub dword1: u32,
    pub dword2: u32,
    pub dword3: u32,
}

impl UtpTransferDescriptor {
    /// Prepare a descriptor for issue. OCS starts as `InvalidCommandStatus`.
    pub fn new(command_type: UtpCommandType, direction: DataDirection) -> Self {
        let dword0 = ((command_type as u32) << COMMAND_TYPE_SHIFT)
            | ((direction as u32) << DATA_DIRECTION_SHIFT)
            | UTP_REQ_DESC_INT_CMD;
        Self {
            dword0,
            dword1: 0,
            dword2: u8::from(Ocs::InvalidCommandStatus) as u32,
            dword3: 0,
        }
    }

    pub fn direction(&self) -> DataDirection {
        DataDirection::from_bits(self.dword0)
    }

    pub fn command_type(&self) -> u8 {
        (self.dword0 >> COMMAND_TYPE_SHIFT) as u8 & 0xF
    }

    pub fn interrupt(&self) -> bool {
        self.dword0 & UTP_REQ_DESC_INT_CMD != 0
    }

    pub fn ocs(&self) -> Ocs {
        Ocs::from((self.dword2 & OCS_MASK) as u8)
    }

    pub fn set_ocs(&mut self, ocs: Ocs) {
        self.dword2 = (self.dword2 & !OCS_MASK) | u8::from(ocs) as u32;
    }
}

/// UTP task management request descriptor header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UtpTaskDescriptor {
    pub dword0: u32,
    pub dword2: u32,
}

impl UtpTaskDescriptor {
    pub fn new() -> Self {
        Self {
            dword0: UTP_REQ_DESC_INT_CMD,
            dword2: u8::from(Ocs::InvalidCommandStatus) as u32,
        }
    }

    pub fn ocs(&self) -> Ocs {
        Ocs::from((self.dword2 & OCS_MASK) as u8)
    }

    pub fn set_ocs(&mut self, ocs: Ocs) {
        self.dword2 = (self.dword2 & !OCS_MASK) | u8::from(ocs) as u32;
    }
}

impl Default for UtpTaskDescriptor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_descriptor_reports_invalid_status() {
        let desc = UtpTransferDescriptor::new(UtpCommandType::UfsStorage, DataDirection::DeviceToHost);
        assert_eq!(desc.ocs(), Ocs::InvalidCommandStatus);
        assert_eq!(desc.direction(), DataDirection::DeviceToHost);
        assert_eq!(desc.command_type(), 1);
        assert!(desc.interrupt());
    }

    #[test]
    fn ocs_update_preserves_other_bits() {
        let mut desc = UtpTransferDescriptor::new(UtpCommandType::DevManage, DataDirection::None);
        desc.dword2 |= 0xAB00;
        desc.set_ocs(Ocs::Aborted);
        assert_eq!(desc.ocs(), Ocs::Aborted);
        assert_eq!(desc.dword2 & 0xFF00, 0xAB00);
    }

    #[test]
    fn unknown_ocs_is_preserved() {
        assert_eq!(Ocs::from(0x0C), Ocs::Unknown(0x0C));
        assert_eq!(u8::from(Ocs::Unknown(0x0C)), 0x0C);
    }
}
