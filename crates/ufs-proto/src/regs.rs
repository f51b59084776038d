//! UFSHCI register offsets and bit layouts.

/// Controller capabilities.
pub const REG_CONTROLLER_CAPABILITIES: u32 = 0x00;
/// UFSHCI version.
pub const REG_UFS_VERSION: u32 = 0x08;
/// Auto-hibernate idle timer.
pub const REG_AUTO_HIBERNATE_IDLE_TIMER: u32 = 0x18;
/// Interrupt status (write-one-to-clear).
pub const REG_INTERRUPT_STATUS: u32 = 0x20;
/// Interrupt enable.
pub const REG_INTERRUPT_ENABLE: u32 = 0x24;
/// Host controller status.
pub const REG_CONTROLLER_STATUS: u32 = 0x30;
/// Host controller enable.
pub const REG_CONTROLLER_ENABLE: u32 = 0x34;
pub const REG_UIC_ERROR_CODE_PHY_ADAPTER_LAYER: u32 = 0x38;
pub const REG_UIC_ERROR_CODE_DATA_LINK_LAYER: u32 = 0x3C;
pub const REG_UIC_ERROR_CODE_NETWORK_LAYER: u32 = 0x40;
pub const REG_UIC_ERROR_CODE_TRANSPORT_LAYER: u32 = 0x44;
pub const REG_UIC_ERROR_CODE_DME: u32 = 0x48;
pub const REG_UTP_TRANSFER_REQ_LIST_BASE_L: u32 = 0x50;
pub const REG_UTP_TRANSFER_REQ_LIST_BASE_H: u32 = 0x54;
pub const REG_UTP_TRANSFER_REQ_DOOR_BELL: u32 = 0x58;
pub const REG_UTP_TRANSFER_REQ_LIST_CLEAR: u32 = 0x5C;
pub const REG_UTP_TRANSFER_REQ_LIST_RUN_STOP: u32 = 0x60;
pub const REG_UTP_TASK_REQ_LIST_BASE_L: u32 = 0x70;
pub const REG_UTP_TASK_REQ_LIST_BASE_H: u32 = 0x74;
pub const REG_UTP_TASK_REQ_DOOR_BELL: u32 = 0x78;
pub const REG_UTP_TASK_REQ_LIST_CLEAR: u32 = 0x7C;
pub const REG_UTP_TASK_REQ_LIST_RUN_STOP: u32 = 0x80;
pub const REG_UIC_COMMAND: u32 = 0x90;
pub const REG_UIC_COMMAND_ARG_1: u32 = 0x94;
pub const REG_UIC_COMMAND_ARG_2: u32 = 0x98;
pub const REG_UIC_COMMAND_ARG_3: u32 = 0x9C;

// Capability bits.
pub const MASK_TRANSFER_REQUESTS_SLOTS: u32 = 0x0000_001F;
pub const MASK_TASK_MANAGEMENT_REQUEST_SLOTS: u32 = 0x0007_0000;
pub const MASK_AUTO_HIBERN8_SUPPORT: u32 = 1 << 23;
pub const MASK_64_ADDRESSING_SUPPORT: u32 = 1 << 24;

// Interrupt status / enable bits.
pub const UTP_TRANSFER_REQ_COMPL: u32 = 1 << 0;
pub const UIC_DME_END_PT_RESET: u32 = 1 << 1;
pub const UIC_ERROR: u32 = 1 << 2;
pub const UIC_TEST_MODE: u32 = 1 << 3;
pub const UIC_POWER_MODE: u32 = 1 << 4;
pub const UIC_HIBERNATE_EXIT: u32 = 1 << 5;
pub const UIC_HIBERNATE_ENTER: u32 = 1 << 6;
pub const UIC_LINK_LOST: u32 = 1 << 7;
pub const UIC_LINK_STARTUP: u32 = 1 << 8;
pub const UTP_TASK_REQ_COMPL: u32 = 1 << 9;
pub const UIC_COMMAND_COMPL: u32 = 1 << 10;
pub const DEVICE_FATAL_ERROR: u32 = 1 << 11;
pub const CONTROLLER_FATAL_ERROR: u32 = 1 << 16;
pub const SYSTEM_BUS_FATAL_ERROR: u32 = 1 << 17;
pub const CRYPTO_ENGINE_FATAL_ERROR: u32 = 1 << 18;

/// Interrupts that complete a power-affecting UIC command.
pub const UIC_POWER_MASK: u32 = UIC_HIBERNATE_ENTER | UIC_HIBERNATE_EXIT | UIC_POWER_MODE;
/// Hibernate enter/exit completions, also raised by auto-hibernate.
pub const UIC_HIBERN8_MASK: u32 = UIC_HIBERNATE_ENTER | UIC_HIBERNATE_EXIT;
/// Interrupts that always demand a full reset.
pub const INT_FATAL_ERRORS: u32 = DEVICE_FATAL_ERROR
    | CONTROLLER_FATAL_ERROR
    | SYSTEM_BUS_FATAL_ERROR
    | CRYPTO_ENGINE_FATAL_ERROR
    | UIC_LINK_LOST;
/// Every interrupt routed to error classification.
pub const ERROR_MASK: u32 = UIC_ERROR | INT_FATAL_ERRORS;
/// Interrupts enabled while the controller is operational.
pub const ENABLE_INTRS: u32 =
    UTP_TRANSFER_REQ_COMPL | UTP_TASK_REQ_COMPL | UIC_COMMAND_COMPL | UIC_POWER_MASK | ERROR_MASK;

// Controller status bits.
pub const DEVICE_PRESENT: u32 = 1 << 0;
pub const UTP_TRANSFER_REQ_LIST_READY: u32 = 1 << 1;
pub const UTP_TASK_REQ_LIST_READY: u32 = 1 << 2;
pub const UIC_COMMAND_READY: u32 = 1 << 3;
pub const HOST_ERROR_INDICATOR: u32 = 1 << 4;
pub const DEVICE_ERROR_INDICATOR: u32 = 1 << 5;
pub const UIC_POWER_MODE_CHANGE_REQ_STATUS_MASK: u32 = 0x7 << 8;
pub const UIC_POWER_MODE_CHANGE_REQ_STATUS_SHIFT: u32 = 8;
/// All three list/command ready bits.
pub const LISTS_READY: u32 =
    UTP_TRANSFER_REQ_LIST_READY | UTP_TASK_REQ_LIST_READY | UIC_COMMAND_READY;

// Controller enable.
pub const CONTROLLER_ENABLE: u32 = 1 << 0;
pub const CONTROLLER_DISABLE: u32 = 0;

// Run/stop registers.
pub const UTP_LIST_RUN: u32 = 1;
pub const UTP_LIST_STOP: u32 = 0;

// UIC error code registers.
pub const UIC_PHY_ADAPTER_LAYER_ERROR: u32 = 1 << 31;
pub const UIC_PHY_ADAPTER_LAYER_LANE_ERR_MASK: u32 = 0xF;
pub const UIC_PHY_ADAPTER_LAYER_GENERIC_ERROR: u32 = 1 << 4;

pub const UIC_DATA_LINK_LAYER_ERROR: u32 = 1 << 31;
pub const UIC_DATA_LINK_LAYER_ERROR_CODE_MASK: u32 = 0xFFFF;
pub const UIC_DATA_LINK_LAYER_ERROR_PA_INIT: u32 = 1 << 0;
pub const UIC_DATA_LINK_LAYER_ERROR_NAC_RECEIVED: u32 = 1 << 13;
pub const UIC_DATA_LINK_LAYER_ERROR_TCX_REPLAY_TIMEOUT: u32 = 1 << 14;

pub const UIC_NETWORK_LAYER_ERROR: u32 = 1 << 31;
pub const UIC_NETWORK_LAYER_ERROR_CODE_MASK: u32 = 0x7;
pub const UIC_TRANSPORT_LAYER_ERROR: u32 = 1 << 31;
pub const UIC_TRANSPORT_LAYER_ERROR_CODE_MASK: u32 = 0x7F;
pub const UIC_DME_ERROR: u32 = 1 << 31;
pub const UIC_DME_ERROR_CODE_MASK: u32 = 0x1;

/// Decoded controller capabilities register.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Capabilities {
    raw: u32,
}

impl Capabilities {
    pub const fn from_raw(raw: u32) -> Self {
        Self { raw }
    }

    pub const fn raw(self) -> u32 {
        self.raw
    }

    /// Number of transfer request slots (1..=32).
    pub const fn transfer_slots(self) -> usize {
        ((self.raw & MASK_TRANSFER_REQUESTS_SLOTS) + 1) as usize
    }

    /// Number of task management request slots (1..=8).
    pub const fn task_slots(self) -> usize {
        (((self.raw & MASK_TASK_MANAGEMENT_REQUEST_SLOTS) >> 16) + 1) as usize
    }

    pub const fn auto_hibern8(self) -> bool {
        self.raw & MASK_AUTO_HIBERN8_SUPPORT != 0
    }

    pub const fn addressing_64bit(self) -> bool {
        self.raw & MASK_64_ADDRESSING_SUPPORT != 0
    }

    /// Build a capabilities word, used by controller models.
    pub const fn encode(transfer_slots: usize, task_slots: usize, auto_hibern8: bool) -> Self {
        let mut raw = ((transfer_slots as u32 - 1) & MASK_TRANSFER_REQUESTS_SLOTS)
            | (((task_slots as u32 - 1) << 16) & MASK_TASK_MANAGEMENT_REQUEST_SLOTS)
            | MASK_64_ADDRESSING_SUPPORT;
        if auto_hibern8 {
            raw |= MASK_AUTO_HIBERN8_SUPPORT;
        }
        Self { raw }
    }
}

/// Extract the power mode change request status from the controller status register.
pub const fn upmcrs(status: u32) -> u8 {
    ((status & UIC_POWER_MODE_CHANGE_REQ_STATUS_MASK) >> UIC_POWER_MODE_CHANGE_REQ_STATUS_SHIFT)
        as u8
}
