//! Host-side engine for UFS host controllers.
//!
//! [`UfsHost`] owns slot allocation, doorbell dispatch, interrupt-driven completion,
//! UIC command serialization, error recovery, clock gating and link power management.
//! The controller itself is reached only through [`HostRegisters`] and the variant hooks
//! in [`UfsVariant`], so the same engine drives real hardware or a software model.

pub mod command;
pub mod completion;
mod compose;
pub mod config;
mod dispatch;
mod eh;
pub mod error;
pub mod events;
pub mod gating;
pub mod host;
pub mod init;
pub mod link;
pub mod lists;
pub mod metrics;
pub mod pm;
mod query;
pub mod regs;
pub mod slots;
pub mod state;
mod tm;
pub mod uic;
pub mod variant;

pub use command::{CancelOutcome, CommandHandle, CommandResult, ScsiCommand, ScsiResponse};
pub use completion::IrqHandle;
pub use config::{
    ClockGatingConfig, HostConfig, HsSeries, LinkMode, PowerModeConfig, TransientLinkErrorPolicy,
};
pub use error::{UfsError, UfsResult};
pub use events::{EventHistory, EventKind, EventRecord};
pub use gating::{ClockHold, GatingState};
pub use host::UfsHost;
pub use init::DeviceInfo;
pub use link::{DevicePowerMode, LinkState, LinkStatus, PowerModeInfo};
pub use lists::{RequestLists, TaskSlot, TransferSlot};
pub use metrics::{LatencySnapshot, StatsSnapshot};
pub use pm::{pm_level_target, MAX_PM_LEVEL};
pub use regs::HostRegisters;
pub use slots::{SlotGuard, SlotKind, SlotPool};
pub use state::{transition, ErrorAccumulator, HostEvent, HostState, UicErrors};
pub use uic::UicCommand;
pub use variant::{ChangeStage, GenericVariant, HostQuirks, UfsVariant};
