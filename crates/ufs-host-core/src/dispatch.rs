//! Admission, doorbell issue and the clear primitive for transfer requests.

use crate::{
    command::{CommandHandle, CommandResult, ScsiCommand},
    completion::CallbackJob,
    compose::Request,
    error::{UfsError, UfsResult},
    events::EventKind,
    host::{Completion, Core, Inner, Lrb, Retirement},
    slots::{SlotGuard, SlotKind},
    state::HostState,
};
use crossbeam_channel::{bounded, RecvTimeoutError, SendError};
use std::{sync::atomic::Ordering, time::Duration, time::Instant};
use tracing::{debug, trace, warn};
use ufs_proto::{
    regs::{REG_UTP_TRANSFER_REQ_DOOR_BELL, REG_UTP_TRANSFER_REQ_LIST_CLEAR},
    DataDirection, Ocs,
};

/// Which host states may accept a new request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Admission {
    /// Upper layer traffic: operational and not suspended.
    Normal,
    /// Bring-up, recovery and power management paths.
    Recovery,
}

/// What `clear_transfer` found.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ClearOutcome {
    /// The command had already retired.
    AlreadyRetired,
    Cleared,
    /// The doorbell bit never dropped; the slot stays reserved until the next reset.
    Stuck,
}

impl Inner {
    pub(crate) fn admit(&self, core: &Core, admission: Admission) -> UfsResult<()> {
        if self.is_shutdown() {
            return Err(UfsError::Interrupted);
        }
        match (admission, core.state) {
            (Admission::Normal, _) if core.suspended.is_some() => Err(UfsError::Suspended),
            (Admission::Normal, HostState::Operational) => Ok(()),
            (
                Admission::Recovery,
                HostState::Operational | HostState::Resetting | HostState::Reset,
            ) => Ok(()),
            (_, HostState::Error) => Err(UfsError::HostFailed),
            (_, state) => Err(UfsError::Busy(state)),
        }
    }

    pub(crate) fn admit_now(&self, admission: Admission) -> UfsResult<()> {
        self.admit(&self.core.lock(), admission)
    }

    /// Compose `request` into the slot and ring its doorbell.
    ///
    /// Admission is checked again under the core lock right before the doorbell write; if the
    /// host left the admitted state meanwhile, the slot goes back to its pool untouched by
    /// the controller.
    pub(crate) fn issue(
        &self,
        slot: SlotGuard,
        request: Request<'_>,
        lun: u8,
        on_complete: Completion,
        admission: Admission,
    ) -> UfsResult<CommandHandle> {
        self.admit_now(admission)?;
        let hold = self.hold_clocks();
        let tag = slot.index();
        self.compose(tag, &request);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let kind = slot.kind();
        let outstanding = {
            let mut core = self.core.lock();
            if let Err(err) = self.admit(&core, admission) {
                debug!(tag, %err, "host left the admitted state before the doorbell");
                return Err(err);
            }
            let tag = slot.disarm();
            core.lrbs[tag] = Some(Lrb {
                id,
                lun,
                kind,
                direction: request.direction(),
                issued_at: Instant::now(),
                on_complete,
                hold,
            });
            core.outstanding |= 1 << tag;
            self.regs.write(REG_UTP_TRANSFER_REQ_DOOR_BELL, 1 << tag);
            core.outstanding
        };
        if kind == SlotKind::DeviceManagement {
            self.stats.dev_cmd_issued();
        } else {
            self.stats.command_issued(outstanding);
        }
        trace!(tag, lun, id, "request issued");
        Ok(CommandHandle { tag, id, lun })
    }

    pub(crate) fn submit_scsi(
        &self,
        cmd: &ScsiCommand,
        on_complete: Completion,
    ) -> UfsResult<CommandHandle> {
        if cmd.direction == DataDirection::HostToDevice && cmd.data.len() != cmd.transfer_len as usize
        {
            return Err(UfsError::InvalidArgument("write payload does not match transfer length"));
        }
        self.admit_now(Admission::Normal)?;
        let slot = self.io_slots.acquire()?;
        self.issue(slot, Request::Scsi(cmd), cmd.lun, on_complete, Admission::Normal)
    }

    /// Issue a SCSI command and wait for it. A command that outlives `timeout` is cleared
    /// and reported as [`CommandResult::Timeout`].
    pub(crate) fn execute_scsi(
        &self,
        cmd: &ScsiCommand,
        timeout: Duration,
        admission: Admission,
    ) -> UfsResult<CommandResult> {
        self.admit_now(admission)?;
        let slot = self.io_slots.acquire()?;
        let (tx, rx) = bounded(1);
        let handle = self.issue(
            slot,
            Request::Scsi(cmd),
            cmd.lun,
            Completion::Waiter(tx),
            admission,
        )?;
        let retirement = match rx.recv_timeout(timeout) {
            Ok(retirement) => retirement,
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    tag = handle.tag,
                    lun = cmd.lun,
                    opcode = cmd.opcode(),
                    ?timeout,
                    "command timed out"
                );
                self.events
                    .record(EventKind::CommandTimeout, handle.tag as u32);
                self.clear_transfer(handle.tag, handle.id, Retirement::Timeout);
                rx.recv_timeout(self.config.clear_timeout())
                    .map_err(|_| UfsError::Interrupted)?
            }
            Err(RecvTimeoutError::Disconnected) => return Err(UfsError::Interrupted),
        };
        self.note_timeout(matches!(retirement, Retirement::Timeout));
        Ok(retirement.into_result())
    }

    /// Track consecutive command timeouts; past the threshold the link is suspect.
    fn note_timeout(&self, timed_out: bool) {
        let escalate = {
            let mut core = self.core.lock();
            if !timed_out {
                core.consecutive_timeouts = 0;
                false
            } else {
                core.consecutive_timeouts += 1;
                if core.consecutive_timeouts >= self.config.timeout_escalation_threshold.max(1) {
                    core.consecutive_timeouts = 0;
                    true
                } else {
                    false
                }
            }
        };
        if escalate {
            warn!("repeated command timeouts, escalating to error handler");
            self.report_fault(|errors| errors.timeouts = true);
        }
    }

    /// Withdraw transfer `tag` if it still carries command `id`.
    ///
    /// The software outstanding bit is dropped in the same critical section as the hardware
    /// clear is requested. If the controller completed the command before the clear landed,
    /// the real completion is delivered instead of `outcome`.
    pub(crate) fn clear_transfer(&self, tag: usize, id: u64, outcome: Retirement) -> ClearOutcome {
        let bit = 1u32 << tag;
        let lrb = {
            let mut core = self.core.lock();
            let Some(lrb) = core.lrbs[tag].take_if(|lrb| lrb.id == id) else {
                return ClearOutcome::AlreadyRetired;
            };
            core.outstanding &= !bit;
            core.clearing |= bit;
            self.regs.write(REG_UTP_TRANSFER_REQ_LIST_CLEAR, !bit);
            lrb
        };

        let cleared = self.regs.wait(
            REG_UTP_TRANSFER_REQ_DOOR_BELL,
            bit,
            0,
            self.config.clear_timeout(),
        );
        {
            let mut core = self.core.lock();
            core.clearing &= !bit;
            if !cleared {
                core.stuck |= bit;
            }
            if core.outstanding == 0 {
                self.core_cv.notify_all();
            }
        }

        if !cleared {
            warn!(tag, "doorbell clear did not take");
            self.finish(lrb, outcome);
            self.report_fault(|errors| errors.link_broken = true);
            return ClearOutcome::Stuck;
        }
        debug!(tag, id, "transfer cleared");
        let retirement = if self.lists.transfer_ocs(tag) != Ocs::InvalidCommandStatus {
            self.collect(tag, lrb.direction)
        } else {
            outcome
        };
        self.retire(tag, lrb, retirement);
        ClearOutcome::Cleared
    }

    /// Read back what the controller left in slot `tag`.
    pub(crate) fn collect(&self, tag: usize, direction: DataDirection) -> Retirement {
        let mut slot = self.lists.transfer(tag);
        let data = if direction == DataDirection::DeviceToHost {
            std::mem::take(&mut slot.data)
        } else {
            Vec::new()
        };
        Retirement::Completed {
            ocs: slot.descriptor.ocs(),
            response: slot.response.to_vec(),
            data,
        }
    }

    /// Return the slot, then report. Must be called without the core lock held.
    pub(crate) fn retire(&self, tag: usize, lrb: Lrb, retirement: Retirement) {
        match lrb.kind {
            SlotKind::DeviceManagement => self.dev_slots.release(tag),
            _ => self.io_slots.release(tag),
        }
        self.finish(lrb, retirement);
    }

    fn finish(&self, lrb: Lrb, retirement: Retirement) {
        let Lrb {
            kind,
            issued_at,
            on_complete,
            hold,
            ..
        } = lrb;
        drop(hold);
        // Command statistics cover SCSI transfers; device management is counted at issue.
        if kind != SlotKind::DeviceManagement {
            match &retirement {
                Retirement::Completed { ocs: Ocs::Success, .. } => {
                    self.stats.command_completed(issued_at.elapsed())
                }
                Retirement::Completed { .. } => self.stats.command_failed(),
                Retirement::Timeout => self.stats.command_timeout(),
                Retirement::Aborted => self.stats.command_aborted(),
                Retirement::Requeue => self.stats.command_requeued(),
            }
        }
        match on_complete {
            Completion::Waiter(tx) => {
                let _ = tx.send(retirement);
            }
            Completion::Callback(callback) => {
                let job = CallbackJob::Run(callback, retirement);
                if let Err(SendError(CallbackJob::Run(callback, retirement))) =
                    self.callbacks.send(job)
                {
                    warn!("callback worker gone, running callback inline");
                    callback(retirement);
                }
            }
        }
    }
}
