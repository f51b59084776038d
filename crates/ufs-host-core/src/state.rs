//! Host operational state and the sticky error accumulator.

use std::fmt;
use ufs_proto::regs::{
    INT_FATAL_ERRORS, UIC_DATA_LINK_LAYER_ERROR_NAC_RECEIVED, UIC_DATA_LINK_LAYER_ERROR_PA_INIT,
    UIC_DATA_LINK_LAYER_ERROR_TCX_REPLAY_TIMEOUT, UIC_PHY_ADAPTER_LAYER_GENERIC_ERROR,
};

/// Admission state of the host, owned by the error handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HostState {
    /// Controller not brought up yet.
    Reset,
    Operational,
    /// A fault was seen; recovery is queued and admission is blocked.
    EhScheduled,
    /// Recovery worker is quiescing and resetting.
    Resetting,
    /// Recovery gave up; only a host reset request can leave this state.
    Error,
}

impl HostState {
    fn as_str(self) -> &'static str {
        match self {
            HostState::Reset => "reset",
            HostState::Operational => "operational",
            HostState::EhScheduled => "eh_scheduled",
            HostState::Resetting => "resetting",
            HostState::Error => "error",
        }
    }
}

impl fmt::Display for HostState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HostEvent {
    InitSucceeded,
    InitFailed,
    /// A fault that needs the error handler.
    Fault,
    /// Explicit host reset request.
    ForceReset,
    RecoveryStarted,
    RecoverySucceeded,
    RecoveryFailed,
}

/// Next state for `event`, or `None` when the event does not move the state.
pub fn transition(state: HostState, event: HostEvent) -> Option<HostState> {
    use HostEvent::*;
    use HostState::*;
    match (state, event) {
        (Reset, InitSucceeded) => Some(Operational),
        (Reset, InitFailed) => Some(Error),
        (Operational, Fault) | (Operational, ForceReset) | (Error, ForceReset) => {
            Some(EhScheduled)
        }
        (EhScheduled, RecoveryStarted) => Some(Resetting),
        (Resetting, RecoverySucceeded) => Some(Operational),
        (Resetting, RecoveryFailed) => Some(Error),
        _ => None,
    }
}

/// Protocol layer error codes latched from the UIC error code registers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UicErrors {
    pub pa: u32,
    pub dl: u32,
    pub nl: u32,
    pub tl: u32,
    pub dme: u32,
}

impl UicErrors {
    pub fn is_empty(&self) -> bool {
        self.pa == 0 && self.dl == 0 && self.nl == 0 && self.tl == 0 && self.dme == 0
    }

    fn merge(&mut self, other: &UicErrors) {
        self.pa |= other.pa;
        self.dl |= other.dl;
        self.nl |= other.nl;
        self.tl |= other.tl;
        self.dme |= other.dme;
    }

    fn subtract(&mut self, other: &UicErrors) {
        self.pa &= !other.pa;
        self.dl &= !other.dl;
        self.nl &= !other.nl;
        self.tl &= !other.tl;
        self.dme &= !other.dme;
    }

    fn needs_reset(&self) -> bool {
        self.pa & UIC_PHY_ADAPTER_LAYER_GENERIC_ERROR != 0
            || self.dl
                & (UIC_DATA_LINK_LAYER_ERROR_PA_INIT
                    | UIC_DATA_LINK_LAYER_ERROR_NAC_RECEIVED
                    | UIC_DATA_LINK_LAYER_ERROR_TCX_REPLAY_TIMEOUT)
                != 0
    }
}

/// Sticky record of faults seen since the last successful recovery.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ErrorAccumulator {
    /// Fatal interrupt status bits.
    pub fatal: u32,
    pub uic: UicErrors,
    /// Auto-hibernate enter/exit reported a failed power status.
    pub auto_hibern8: bool,
    /// Slots set in the doorbell that software never issued.
    pub desync: u32,
    /// Too many consecutive command timeouts.
    pub timeouts: bool,
    /// A doorbell or task clear did not take, or a hibernate transition failed.
    pub link_broken: bool,
    /// A task management function to withdraw a command failed.
    pub task_failed: bool,
    /// Requested through `host_reset`.
    pub forced: bool,
}

impl ErrorAccumulator {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn merge(&mut self, other: &ErrorAccumulator) {
        self.fatal |= other.fatal;
        self.uic.merge(&other.uic);
        self.auto_hibern8 |= other.auto_hibern8;
        self.desync |= other.desync;
        self.timeouts |= other.timeouts;
        self.link_broken |= other.link_broken;
        self.task_failed |= other.task_failed;
        self.forced |= other.forced;
    }

    /// Drop the faults in `handled`, keeping anything that arrived after it was taken.
    pub fn subtract(&mut self, handled: &ErrorAccumulator) {
        self.fatal &= !handled.fatal;
        self.uic.subtract(&handled.uic);
        self.auto_hibern8 &= !handled.auto_hibern8;
        self.desync &= !handled.desync;
        self.timeouts &= !handled.timeouts;
        self.link_broken &= !handled.link_broken;
        self.task_failed &= !handled.task_failed;
        self.forced &= !handled.forced;
    }

    /// Whether recovery must reset the controller and link.
    pub fn needs_full_reset(&self) -> bool {
        self.fatal & INT_FATAL_ERRORS != 0
            || self.uic.needs_reset()
            || self.auto_hibern8
            || self.desync != 0
            || self.timeouts
            || self.link_broken
            || self.task_failed
            || self.forced
    }

    /// The only reset-worthy fault is a NAC received on the data link layer.
    pub fn is_transient_nac_only(&self) -> bool {
        let mut rest = *self;
        rest.uic.dl &= !UIC_DATA_LINK_LAYER_ERROR_NAC_RECEIVED;
        self.uic.dl & UIC_DATA_LINK_LAYER_ERROR_NAC_RECEIVED != 0 && !rest.needs_full_reset()
    }

    pub fn clear_nac(&mut self) {
        self.uic.dl &= !UIC_DATA_LINK_LAYER_ERROR_NAC_RECEIVED;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ufs_proto::regs::{CONTROLLER_FATAL_ERROR, UIC_PHY_ADAPTER_LAYER_LANE_ERR_MASK};

    #[test]
    fn faults_only_schedule_from_operational() {
        assert_eq!(
            transition(HostState::Operational, HostEvent::Fault),
            Some(HostState::EhScheduled)
        );
        assert_eq!(transition(HostState::EhScheduled, HostEvent::Fault), None);
        assert_eq!(transition(HostState::Resetting, HostEvent::Fault), None);
        assert_eq!(transition(HostState::Error, HostEvent::Fault), None);
        assert_eq!(transition(HostState::Reset, HostEvent::Fault), None);
    }

    #[test]
    fn recovery_cycle() {
        let mut state = HostState::Operational;
        for event in [
            HostEvent::Fault,
            HostEvent::RecoveryStarted,
            HostEvent::RecoverySucceeded,
        ] {
            state = transition(state, event).unwrap();
        }
        assert_eq!(state, HostState::Operational);
        assert_eq!(
            transition(HostState::Resetting, HostEvent::RecoveryFailed),
            Some(HostState::Error)
        );
    }

    #[test]
    fn error_state_leaves_only_on_forced_reset() {
        assert_eq!(
            transition(HostState::Error, HostEvent::ForceReset),
            Some(HostState::EhScheduled)
        );
        assert_eq!(transition(HostState::Error, HostEvent::RecoveryStarted), None);
    }

    #[test]
    fn classification() {
        let mut acc = ErrorAccumulator::default();
        acc.uic.tl = 1;
        acc.uic.pa = UIC_PHY_ADAPTER_LAYER_LANE_ERR_MASK;
        assert!(!acc.needs_full_reset());

        acc.uic.dl = UIC_DATA_LINK_LAYER_ERROR_NAC_RECEIVED;
        assert!(acc.needs_full_reset());
        assert!(acc.is_transient_nac_only());

        acc.fatal = CONTROLLER_FATAL_ERROR;
        assert!(!acc.is_transient_nac_only());
    }

    #[test]
    fn subtract_keeps_late_faults() {
        let mut sticky = ErrorAccumulator {
            fatal: CONTROLLER_FATAL_ERROR,
            ..Default::default()
        };
        let handled = sticky;
        sticky.desync = 1 << 3;
        sticky.subtract(&handled);
        assert_eq!(sticky.fatal, 0);
        assert_eq!(sticky.desync, 1 << 3);
        assert!(sticky.needs_full_reset());
    }
}
