//! UIC command engine.
//!
//! Only one UIC command may be outstanding. Callers queue on an in-flight flag rather than a
//! lock held across the hardware wait; the interrupt path only flips completion flags.

use crate::{
    error::{UfsError, UfsResult},
    host::Inner,
    variant::HostQuirks,
};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::{
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, trace, warn};
use ufs_proto::{
    regs::{
        upmcrs, REG_CONTROLLER_STATUS, REG_UIC_COMMAND, REG_UIC_COMMAND_ARG_1,
        REG_UIC_COMMAND_ARG_2, REG_UIC_COMMAND_ARG_3, UIC_COMMAND_READY,
    },
    uic::{attr_set_type, ATTR_SET_NOR},
    PwrStatus, UicOpcode, UicResult,
};

const DME_CMD_DELAY: Duration = Duration::from_millis(1);

/// A UIC command with its three arguments.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UicCommand {
    pub opcode: UicOpcode,
    pub arg1: u32,
    pub arg2: u32,
    pub arg3: u32,
}

impl UicCommand {
    pub fn new(opcode: UicOpcode) -> Self {
        Self {
            opcode,
            arg1: 0,
            arg2: 0,
            arg3: 0,
        }
    }

    pub fn dme_get(attr_sel: u32) -> Self {
        Self {
            arg1: attr_sel,
            ..Self::new(UicOpcode::DmeGet)
        }
    }

    pub fn dme_peer_get(attr_sel: u32) -> Self {
        Self {
            arg1: attr_sel,
            ..Self::new(UicOpcode::DmePeerGet)
        }
    }

    pub fn dme_set(attr_sel: u32, value: u32) -> Self {
        Self {
            arg1: attr_sel,
            arg2: attr_set_type(ATTR_SET_NOR),
            arg3: value,
            ..Self::new(UicOpcode::DmeSet)
        }
    }

    pub fn dme_peer_set(attr_sel: u32, value: u32) -> Self {
        Self {
            opcode: UicOpcode::DmePeerSet,
            ..Self::dme_set(attr_sel, value)
        }
    }
}

struct UicState {
    in_flight: bool,
    command_done: bool,
    power_pending: bool,
    power_done: Option<u32>,
}

pub(crate) struct UicEngine {
    state: Mutex<UicState>,
    cv: Condvar,
}

impl UicEngine {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(UicState {
                in_flight: false,
                command_done: false,
                power_pending: false,
                power_done: None,
            }),
            cv: Condvar::new(),
        }
    }

    pub(crate) fn busy(&self) -> bool {
        self.state.lock().in_flight
    }

    /// Wait for the singleton to be free and claim it.
    fn begin(&self, power: bool) -> UicClaim<'_> {
        let mut st = self.state.lock();
        while st.in_flight {
            self.cv.wait(&mut st);
        }
        st.in_flight = true;
        st.command_done = false;
        st.power_pending = power;
        st.power_done = None;
        UicClaim { engine: self }
    }

    /// UIC command completion interrupt.
    pub(crate) fn command_completed(&self) {
        let mut st = self.state.lock();
        if st.in_flight {
            st.command_done = true;
            self.cv.notify_all();
        } else {
            debug!("uic completion with no command in flight");
        }
    }

    /// Link power status interrupt. Returns `false` when no power command was waiting for it.
    pub(crate) fn power_status_changed(&self, bits: u32) -> bool {
        let mut st = self.state.lock();
        if st.in_flight && st.power_pending {
            st.power_done = Some(bits);
            self.cv.notify_all();
            true
        } else {
            false
        }
    }

    fn wait_until<F>(&self, deadline: Instant, mut ready: F) -> bool
    where
        F: FnMut(&mut MutexGuard<'_, UicState>) -> bool,
    {
        let mut st = self.state.lock();
        loop {
            if ready(&mut st) {
                return true;
            }
            if self.cv.wait_until(&mut st, deadline).timed_out() {
                return ready(&mut st);
            }
        }
    }
}

/// Claim on the UIC singleton, released on drop.
struct UicClaim<'a> {
    engine: &'a UicEngine,
}

impl UicClaim<'_> {
    fn wait_command(&self, timeout: Duration) -> bool {
        self.engine
            .wait_until(Instant::now() + timeout, |st| st.command_done)
    }

    fn wait_power(&self, timeout: Duration) -> Option<u32> {
        let mut bits = None;
        self.engine.wait_until(Instant::now() + timeout, |st| {
            bits = st.power_done;
            bits.is_some()
        });
        bits
    }
}

impl Drop for UicClaim<'_> {
    fn drop(&mut self) {
        let mut st = self.engine.state.lock();
        st.in_flight = false;
        st.power_pending = false;
        self.engine.cv.notify_all();
    }
}

impl Inner {
    fn write_uic(&self, cmd: &UicCommand) -> UfsResult<()> {
        if self.variant.quirks().contains(HostQuirks::DELAY_BEFORE_DME_CMDS) {
            thread::sleep(DME_CMD_DELAY);
        }
        if self.regs.read(REG_CONTROLLER_STATUS) & UIC_COMMAND_READY == 0 {
            warn!(opcode = ?cmd.opcode, "controller not ready for uic command");
            return Err(UfsError::UicNotReady);
        }
        trace!(opcode = ?cmd.opcode, arg1 = cmd.arg1, arg3 = cmd.arg3, "uic send");
        self.regs.write(REG_UIC_COMMAND_ARG_1, cmd.arg1);
        self.regs.write(REG_UIC_COMMAND_ARG_2, cmd.arg2);
        self.regs.write(REG_UIC_COMMAND_ARG_3, cmd.arg3);
        self.regs.write(REG_UIC_COMMAND, cmd.opcode as u32);
        Ok(())
    }

    fn uic_result(&self, cmd: &UicCommand) -> UfsResult<u32> {
        let result = UicResult::from_arg2(self.regs.read(REG_UIC_COMMAND_ARG_2));
        if result != UicResult::Success {
            self.stats.uic_error();
            debug!(opcode = ?cmd.opcode, %result, "uic command failed");
            return Err(UfsError::Uic {
                opcode: cmd.opcode,
                result,
            });
        }
        Ok(if cmd.opcode.is_get() {
            self.regs.read(REG_UIC_COMMAND_ARG_3)
        } else {
            0
        })
    }

    /// Issue one UIC command and wait for its completion. Returns argument 3 for get commands.
    pub(crate) fn send_uic(&self, cmd: UicCommand) -> UfsResult<u32> {
        let claim = self.uic.begin(false);
        self.write_uic(&cmd)?;
        let timeout = self.config.uic_timeout();
        if !claim.wait_command(timeout) {
            warn!(opcode = ?cmd.opcode, "uic command timed out");
            self.stats.uic_error();
            return Err(UfsError::Timeout {
                what: "uic command",
                timeout,
            });
        }
        self.uic_result(&cmd)
    }

    /// Issue a UIC command that changes link power (hibernate enter/exit, power mode change)
    /// and wait for the link to report the outcome of the transition.
    pub(crate) fn send_uic_power(&self, cmd: UicCommand) -> UfsResult<PwrStatus> {
        let claim = self.uic.begin(true);
        self.write_uic(&cmd)?;
        let timeout = self.config.uic_timeout();
        if !claim.wait_command(timeout) {
            warn!(opcode = ?cmd.opcode, "uic power command timed out");
            self.stats.uic_error();
            return Err(UfsError::Timeout {
                what: "uic command",
                timeout,
            });
        }
        self.uic_result(&cmd)?;
        if claim.wait_power(timeout).is_none() {
            warn!(opcode = ?cmd.opcode, "link power status never reported");
            return Err(UfsError::Timeout {
                what: "link power status",
                timeout,
            });
        }
        let status = PwrStatus::from(upmcrs(self.regs.read(REG_CONTROLLER_STATUS)));
        debug!(opcode = ?cmd.opcode, ?status, "uic power command done");
        Ok(status)
    }
}
