//! Faults the simulated controller can be told to produce.

use ufs_proto::{PwrStatus, TaskServiceResponse};

/// Pending UIC error codes, one per layer. Zero means the layer reports nothing. The
/// layer's valid bit is added when the error is injected.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UicErrorInjection {
    pub pa: u32,
    pub dl: u32,
    pub nl: u32,
    pub tl: u32,
    pub dme: u32,
}

impl UicErrorInjection {
    /// A data link layer NAC, the classic transient error.
    pub fn nac() -> Self {
        Self {
            dl: ufs_proto::regs::UIC_DATA_LINK_LAYER_ERROR_NAC_RECEIVED,
            ..Self::default()
        }
    }

    pub fn pa_generic() -> Self {
        Self {
            pa: ufs_proto::regs::UIC_PHY_ADAPTER_LAYER_GENERIC_ERROR,
            ..Self::default()
        }
    }
}

/// Standing fault configuration, consulted by the register file and the engine.
#[derive(Clone, Debug, Default)]
pub(crate) struct Faults {
    /// SCSI commands are accepted but never completed.
    pub(crate) stall: bool,
    /// Writes to the list clear registers are ignored.
    pub(crate) stuck_clear: bool,
    /// Remaining link startups that fail.
    pub(crate) link_startup_failures: u32,
    /// Remaining NOP OUTs that go unanswered.
    pub(crate) dropped_nops: u32,
    pub(crate) tm_response: Option<TaskServiceResponse>,
    pub(crate) hibern8_enter_status: Option<PwrStatus>,
    pub(crate) hibern8_exit_status: Option<PwrStatus>,
    pub(crate) power_mode_status: Option<PwrStatus>,
}
