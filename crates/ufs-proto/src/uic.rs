//! UIC (UniPro interconnect) command encoding, DME attributes and power modes.

use crate::ProtoError;
use core::fmt;

/// Result code lives in the low byte of argument 2 after completion.
pub const MASK_UIC_COMMAND_RESULT: u32 = 0xFF;

pub const ATTR_SET_NOR: u8 = 0;
pub const ATTR_SET_ST: u8 = 1;

/// Encode a MIB attribute with a GenSelector index.
pub const fn mib_sel(attr: u16, sel: u16) -> u32 {
    ((attr as u32) << 16) | sel as u32
}

/// Encode a MIB attribute with selector 0.
pub const fn mib(attr: u16) -> u32 {
    mib_sel(attr, 0)
}

/// Place the attribute set type into argument 2.
pub const fn attr_set_type(set_type: u8) -> u32 {
    (set_type as u32) << 16
}

// PHY adapter (PA) layer attributes.
pub const PA_PHY_TYPE: u16 = 0x1500;
pub const PA_AVAILTXDATALANES: u16 = 0x1520;
pub const PA_AVAILRXDATALANES: u16 = 0x1540;
pub const PA_LOCAL_TX_LCC_ENABLE: u16 = 0x155E;
pub const PA_ACTIVETXDATALANES: u16 = 0x1560;
pub const PA_CONNECTEDTXDATALANES: u16 = 0x1561;
pub const PA_TXTRAILINGCLOCKS: u16 = 0x1564;
pub const PA_TXGEAR: u16 = 0x1568;
pub const PA_TXTERMINATION: u16 = 0x1569;
pub const PA_HSSERIES: u16 = 0x156A;
pub const PA_PWRMODE: u16 = 0x1571;
pub const PA_ACTIVERXDATALANES: u16 = 0x1580;
pub const PA_CONNECTEDRXDATALANES: u16 = 0x1581;
pub const PA_RXGEAR: u16 = 0x1583;
pub const PA_RXTERMINATION: u16 = 0x1584;
pub const PA_MAXRXPWMGEAR: u16 = 0x1586;
pub const PA_MAXRXHSGEAR: u16 = 0x1587;
pub const PA_HIBERN8TIME: u16 = 0x15A7;
pub const PA_TACTIVATE: u16 = 0x15A8;
pub const PA_GRANULARITY: u16 = 0x15AA;
pub const PA_PWRMODEUSERDATA0: u16 = 0x15B0;
pub const PA_PWRMODEUSERDATA1: u16 = 0x15B1;
pub const PA_PWRMODEUSERDATA2: u16 = 0x15B2;
pub const PA_PWRMODEUSERDATA3: u16 = 0x15B3;
pub const PA_PWRMODEUSERDATA4: u16 = 0x15B4;
pub const PA_PWRMODEUSERDATA5: u16 = 0x15B5;

// DME local timeouts applied alongside a power mode change.
pub const DME_LOCAL_FC0_PROTECTION_TIMEOUT_VAL: u16 = 0xD041;
pub const DME_LOCAL_TC0_REPLAY_TIMEOUT_VAL: u16 = 0xD042;
pub const DME_LOCAL_AFC0_REQ_TIMEOUT_VAL: u16 = 0xD043;

pub const DL_FC0_PROTECTION_TIMEOUT_DEFAULT: u32 = 8191;
pub const DL_TC0_REPLAY_TIMEOUT_DEFAULT: u32 = 65535;
pub const DL_AFC0_REQ_TIMEOUT_DEFAULT: u32 = 32767;
pub const DL_FC1_PROTECTION_TIMEOUT_DEFAULT: u32 = 8191;
pub const DL_TC1_REPLAY_TIMEOUT_DEFAULT: u32 = 65535;
pub const DL_AFC1_REQ_TIMEOUT_DEFAULT: u32 = 32767;

/// UIC command opcodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum UicOpcode {
    DmeGet = 0x01,
    DmeSet = 0x02,
    DmePeerGet = 0x03,
    DmePeerSet = 0x04,
    DmePowerOn = 0x10,
    DmePowerOff = 0x11,
    DmeEnable = 0x12,
    DmeReset = 0x14,
    DmeEndPtReset = 0x15,
    DmeLinkStartup = 0x16,
    DmeHibernEnter = 0x17,
    DmeHibernExit = 0x18,
    DmeTestMode = 0x1A,
}

impl TryFrom<u8> for UicOpcode {
    type Error = ProtoError;

    fn try_from(value: u8) -> crate::Result<Self> {
        match value {
            0x01 => Ok(Self::DmeGet),
            0x02 => Ok(Self::DmeSet),
            0x03 => Ok(Self::DmePeerGet),
            0x04 => Ok(Self::DmePeerSet),
            0x10 => Ok(Self::DmePowerOn),
            0x11 => Ok(Self::DmePowerOff),
            0x12 => Ok(Self::DmeEnable),
            0x14 => Ok(Self::DmeReset),
            0x15 => Ok(Self::DmeEndPtReset),
            0x16 => Ok(Self::DmeLinkStartup),
            0x17 => Ok(Self::DmeHibernEnter),
            0x18 => Ok(Self::DmeHibernExit),
            0x1A => Ok(Self::DmeTestMode),
            other => Err(ProtoError::InvalidCode {
                field: "uic opcode",
                value: other,
            }),
        }
    }
}

impl UicOpcode {
    pub fn is_get(self) -> bool {
        matches!(self, UicOpcode::DmeGet | UicOpcode::DmePeerGet)
    }
}

/// Result codes reported in argument 2.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UicResult {
    Success,
    InvalidMibAttribute,
    InvalidMibAttributeValue,
    ReadOnlyMibAttribute,
    WriteOnlyMibAttribute,
    BadIndex,
    Locked,
    BadTestFeature,
    PeerCommunicationFailure,
    Busy,
    DmeFailure,
    Unknown(u8),
}

impl From<u8> for UicResult {
    fn from(value: u8) -> Self {
        match value {
            0x00 => UicResult::Success,
            0x01 => UicResult::InvalidMibAttribute,
            0x02 => UicResult::InvalidMibAttributeValue,
            0x03 => UicResult::ReadOnlyMibAttribute,
            0x04 => UicResult::WriteOnlyMibAttribute,
            0x05 => UicResult::BadIndex,
            0x06 => UicResult::Locked,
            0x07 => UicResult::BadTestFeature,
            0x08 => UicResult::PeerCommunicationFailure,
            0x09 => UicResult::Busy,
            0x0A => UicResult::DmeFailure,
            other => UicResult::Unknown(other),
        }
    }
}

impl From<UicResult> for u8 {
    fn from(result: UicResult) -> Self {
        match result {
            UicResult::Success => 0x00,
            UicResult::InvalidMibAttribute => 0x01,
            UicResult::InvalidMibAttributeValue => 0x02,
            UicResult::ReadOnlyMibAttribute => 0x03,
            UicResult::WriteOnlyMibAttribute => 0x04,
            UicResult::BadIndex => 0x05,
            UicResult::Locked => 0x06,
            UicResult::BadTestFeature => 0x07,
            UicResult::PeerCommunicationFailure => 0x08,
            UicResult::Busy => 0x09,
            UicResult::DmeFailure => 0x0A,
            UicResult::Unknown(other) => other,
        }
    }
}

impl UicResult {
    pub fn from_arg2(arg2: u32) -> Self {
        UicResult::from((arg2 & MASK_UIC_COMMAND_RESULT) as u8)
    }
}

impl fmt::Display for UicResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UicResult::Unknown(code) => write!(f, "unknown({code:#x})"),
            other => write!(f, "{other:?}"),
        }
    }
}

/// Power mode change request status (UPMCRS field of the controller status register).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PwrStatus {
    Ok,
    Local,
    Remote,
    Busy,
    ErrorCap,
    FatalError,
    Unknown(u8),
}

impl From<u8> for PwrStatus {
    fn from(value: u8) -> Self {
        match value {
            0 => PwrStatus::Ok,
            1 => PwrStatus::Local,
            2 => PwrStatus::Remote,
            3 => PwrStatus::Busy,
            4 => PwrStatus::ErrorCap,
            5 => PwrStatus::FatalError,
            other => PwrStatus::Unknown(other),
        }
    }
}

impl From<PwrStatus> for u8 {
    fn from(status: PwrStatus) -> Self {
        match status {
            PwrStatus::Ok => 0,
            PwrStatus::Local => 1,
            PwrStatus::Remote => 2,
            PwrStatus::Busy => 3,
            PwrStatus::ErrorCap => 4,
            PwrStatus::FatalError => 5,
            PwrStatus::Unknown(other) => other,
        }
    }
}

/// UniPro power modes written to PA_PWRMODE.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PowerMode {
    Fast = 1,
    Slow = 2,
    FastAuto = 4,
    SlowAuto = 5,
    Unchanged = 7,
}

impl PowerMode {
    /// High-speed modes terminate the lanes.
    pub fn is_fast(self) -> bool {
        matches!(self, PowerMode::Fast | PowerMode::FastAuto)
    }
}

impl TryFrom<u8> for PowerMode {
    type Error = ProtoError;

    fn try_from(value: u8) -> crate::Result<Self> {
        match value {
            1 => Ok(Self::Fast),
            2 => Ok(Self::Slow),
            4 => Ok(Self::FastAuto),
            5 => Ok(Self::SlowAuto),
            7 => Ok(Self::Unchanged),
            other => Err(ProtoError::InvalidCode {
                field: "power mode",
                value: other,
            }),
        }
    }
}

/// High-speed rate series.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum HsRate {
    A = 1,
    B = 2,
}

/// Value written to PA_PWRMODE: RX mode in the high nibble, TX in the low.
pub const fn pa_pwrmode_value(rx: PowerMode, tx: PowerMode) -> u32 {
    ((rx as u32) << 4) | tx as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mib_selector_packing() {
        assert_eq!(mib(PA_PWRMODE), 0x1571_0000);
        assert_eq!(mib_sel(PA_TXGEAR, 3), 0x1568_0003);
    }

    #[test]
    fn result_from_arg2_masks_high_bits() {
        assert_eq!(UicResult::from_arg2(0xFFFF_FF00), UicResult::Success);
        assert_eq!(UicResult::from_arg2(0x0001_0009), UicResult::Busy);
    }

    #[test]
    fn pwrmode_value_layout() {
        assert_eq!(pa_pwrmode_value(PowerMode::Fast, PowerMode::Fast), 0x11);
        assert_eq!(pa_pwrmode_value(PowerMode::SlowAuto, PowerMode::Fast), 0x51);
    }

    #[test]
    fn opcode_rejects_undefined() {
        assert!(UicOpcode::try_from(0x13).is_err());
        assert_eq!(UicOpcode::try_from(0x17).unwrap(), UicOpcode::DmeHibernEnter);
    }
}
