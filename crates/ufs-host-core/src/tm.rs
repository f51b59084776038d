//! Task management: issue, completion, clear, and the abort and LU reset flows built on it.

use crate::{
    command::{CancelOutcome, CommandHandle},
    completion::bits,
    dispatch::{Admission, ClearOutcome},
    error::{UfsError, UfsResult},
    events::EventKind,
    gating::ClockHold,
    host::{Inner, Retirement},
};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, info, warn};
use ufs_proto::{
    regs::{REG_UTP_TASK_REQ_DOOR_BELL, REG_UTP_TASK_REQ_LIST_CLEAR, REG_UTP_TRANSFER_REQ_DOOR_BELL},
    upiu::UPIU_BASE_LEN,
    Ocs, TaskRequestUpiu, TaskResponse, TaskServiceResponse, TmFunction,
};

pub(crate) enum TmDone {
    Completed(Ocs, [u8; UPIU_BASE_LEN]),
    /// Dropped by a controller reset.
    Requeue,
}

/// Software record of one outstanding task management request.
pub(crate) struct TmRecord {
    pub(crate) function: TmFunction,
    pub(crate) done: Sender<TmDone>,
    pub(crate) hold: ClockHold,
}

impl TmRecord {
    pub(crate) fn finish(self, done: TmDone) {
        let TmRecord { done: tx, hold, .. } = self;
        drop(hold);
        let _ = tx.send(done);
    }
}

fn decode_tm(done: TmDone) -> UfsResult<TaskServiceResponse> {
    match done {
        TmDone::Completed(Ocs::Success, response) => {
            Ok(TaskResponse::decode(&response)?.service_response)
        }
        TmDone::Completed(ocs, _) => Err(UfsError::Ocs(ocs)),
        TmDone::Requeue => Err(UfsError::Requeued),
    }
}

/// Whether a task management failure says something about the link rather than admission.
fn escalates(err: &UfsError) -> bool {
    !matches!(
        err,
        UfsError::Busy(_) | UfsError::HostFailed | UfsError::Suspended | UfsError::Interrupted
    )
}

impl Inner {
    /// Issue a task management function and wait for the service response.
    pub(crate) fn issue_tm(
        &self,
        lun: u8,
        function: TmFunction,
        target_tag: u8,
        admission: Admission,
    ) -> UfsResult<TaskServiceResponse> {
        self.admit_now(admission)?;
        let slot = self.task_slots.acquire()?;
        let hold = self.hold_clocks();
        let tag = slot.index();
        {
            let mut task = self.lists.task(tag);
            task.prepare();
            task.request = TaskRequestUpiu::new(lun, tag as u8, function, target_tag).encode();
        }

        let (tx, rx) = bounded(1);
        {
            let mut core = self.core.lock();
            self.admit(&core, admission)?;
            let tag = slot.disarm();
            core.tms[tag] = Some(TmRecord {
                function,
                done: tx,
                hold,
            });
            core.tm_outstanding |= 1 << tag;
            self.regs.write(REG_UTP_TASK_REQ_DOOR_BELL, 1 << tag);
        }
        debug!(tag, lun, ?function, target_tag, "task management issued");
        self.wait_tm(tag, function, &rx)
    }

    fn wait_tm(
        &self,
        tag: usize,
        function: TmFunction,
        rx: &Receiver<TmDone>,
    ) -> UfsResult<TaskServiceResponse> {
        let timeout = self.config.task_timeout();
        match rx.recv_timeout(timeout) {
            Ok(done) => decode_tm(done),
            Err(RecvTimeoutError::Timeout) => {
                warn!(tag, ?function, "task management timed out");
                self.clear_task(tag);
                match rx.try_recv() {
                    Ok(done) => decode_tm(done),
                    Err(_) => Err(UfsError::Timeout {
                        what: "task management",
                        timeout,
                    }),
                }
            }
            Err(RecvTimeoutError::Disconnected) => Err(UfsError::Interrupted),
        }
    }

    /// Retire every task request whose doorbell bit dropped.
    pub(crate) fn reap_tasks(&self) {
        let mut done = Vec::new();
        {
            let mut core = self.core.lock();
            let doorbell = self.regs.read(REG_UTP_TASK_REQ_DOOR_BELL);
            let completed = core.tm_outstanding & !doorbell;
            core.tm_outstanding &= !completed;
            for tag in bits(completed) {
                if let Some(record) = core.tms[tag].take() {
                    done.push((tag, record));
                }
            }
            if completed != 0 {
                self.core_cv.notify_all();
            }
        }
        for (tag, record) in done {
            let (ocs, response) = {
                let task = self.lists.task(tag);
                (task.descriptor.ocs(), task.response)
            };
            self.task_slots.release(tag);
            debug!(tag, function = ?record.function, %ocs, "task management completed");
            record.finish(TmDone::Completed(ocs, response));
        }
    }

    /// Withdraw task request `tag` from the controller.
    fn clear_task(&self, tag: usize) {
        let bit = 1u32 << tag;
        let record = {
            let mut core = self.core.lock();
            let Some(record) = core.tms[tag].take() else {
                return;
            };
            core.tm_outstanding &= !bit;
            self.regs.write(REG_UTP_TASK_REQ_LIST_CLEAR, !bit);
            self.core_cv.notify_all();
            record
        };
        let cleared = self
            .regs
            .wait(REG_UTP_TASK_REQ_DOOR_BELL, bit, 0, self.config.clear_timeout());
        if cleared {
            self.task_slots.release(tag);
        } else {
            warn!(tag, "task doorbell clear did not take");
            self.core.lock().tm_stuck |= bit;
            self.report_fault(|errors| errors.link_broken = true);
        }
        drop(record);
    }

    fn is_outstanding(&self, handle: &CommandHandle) -> bool {
        matches!(&self.core.lock().lrbs[handle.tag], Some(lrb) if lrb.id == handle.id)
    }

    fn task_failed(&self, function: TmFunction, err: UfsError) -> UfsError {
        if escalates(&err) {
            warn!(?function, %err, "task management failed, escalating");
            self.report_fault(|errors| errors.task_failed = true);
        }
        err
    }

    /// Abort one command: ask the device whether it holds the task, abort it there if so,
    /// then clear it from the controller.
    pub(crate) fn cancel(&self, handle: CommandHandle) -> UfsResult<CancelOutcome> {
        if !self.is_outstanding(&handle) {
            return Ok(CancelOutcome::AlreadyCompleted);
        }
        let target = handle.tag as u8;
        let query = self
            .issue_tm(handle.lun, TmFunction::QueryTask, target, Admission::Normal)
            .map_err(|err| self.task_failed(TmFunction::QueryTask, err))?;
        match query {
            TaskServiceResponse::Succeeded => {
                match self
                    .issue_tm(handle.lun, TmFunction::AbortTask, target, Admission::Normal)
                    .map_err(|err| self.task_failed(TmFunction::AbortTask, err))?
                {
                    TaskServiceResponse::Complete | TaskServiceResponse::Succeeded => {}
                    response => {
                        return Err(self.task_failed(
                            TmFunction::AbortTask,
                            UfsError::TaskManagement {
                                function: TmFunction::AbortTask,
                                response,
                            },
                        ))
                    }
                }
            }
            TaskServiceResponse::Complete => {
                // The device does not hold it: either it already finished or it never left
                // the controller.
                let bit = 1u32 << handle.tag;
                if self.regs.read(REG_UTP_TRANSFER_REQ_DOOR_BELL) & bit == 0 {
                    self.reap_transfers();
                    if !self.is_outstanding(&handle) {
                        return Ok(CancelOutcome::AlreadyCompleted);
                    }
                }
            }
            response => {
                return Err(self.task_failed(
                    TmFunction::QueryTask,
                    UfsError::TaskManagement {
                        function: TmFunction::QueryTask,
                        response,
                    },
                ))
            }
        }

        match self.clear_transfer(handle.tag, handle.id, Retirement::Aborted) {
            ClearOutcome::AlreadyRetired => Ok(CancelOutcome::AlreadyCompleted),
            ClearOutcome::Cleared | ClearOutcome::Stuck => {
                info!(tag = handle.tag, lun = handle.lun, "command aborted");
                self.events.record(EventKind::TaskAbort, handle.tag as u32);
                Ok(CancelOutcome::Aborted)
            }
        }
    }

    /// Logical unit reset. Commands the controller still holds for `lun` are withdrawn and
    /// reported as requeued.
    pub(crate) fn device_reset(&self, lun: u8) -> UfsResult<()> {
        let function = TmFunction::LogicalUnitReset;
        match self
            .issue_tm(lun, function, 0, Admission::Normal)
            .map_err(|err| self.task_failed(function, err))?
        {
            TaskServiceResponse::Complete | TaskServiceResponse::Succeeded => {}
            response => {
                return Err(
                    self.task_failed(function, UfsError::TaskManagement { function, response })
                )
            }
        }

        self.reap_transfers();
        let victims: Vec<(usize, u64)> = {
            let core = self.core.lock();
            core.lrbs
                .iter()
                .enumerate()
                .filter_map(|(tag, lrb)| {
                    lrb.as_ref()
                        .filter(|lrb| lrb.lun == lun)
                        .map(|lrb| (tag, lrb.id))
                })
                .collect()
        };
        for &(tag, id) in &victims {
            self.clear_transfer(tag, id, Retirement::Requeue);
        }
        info!(lun, requeued = victims.len(), "logical unit reset");
        self.events.record(EventKind::DeviceReset, lun as u32);
        Ok(())
    }
}
