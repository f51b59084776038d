//! Interrupt handling and transfer completion.
//!
//! Upper layer callbacks never run on the interrupt path: retired transfers are handed to a
//! dedicated worker so a callback that submits again and waits for a slot cannot stall reaping.

use crate::{
    events::EventKind,
    host::{Callback, Inner, Retirement},
    state::{ErrorAccumulator, UicErrors},
};
use crossbeam_channel::Receiver;
use std::{
    io,
    sync::{atomic::Ordering, Arc, Weak},
    thread,
};
use tracing::{debug, error, trace, warn, Level};
use ufs_proto::{
    regs::{
        upmcrs, ERROR_MASK, INT_FATAL_ERRORS, REG_CONTROLLER_STATUS,
        REG_UIC_ERROR_CODE_DATA_LINK_LAYER, REG_UIC_ERROR_CODE_DME,
        REG_UIC_ERROR_CODE_NETWORK_LAYER, REG_UIC_ERROR_CODE_PHY_ADAPTER_LAYER,
        REG_UIC_ERROR_CODE_TRANSPORT_LAYER, REG_UTP_TRANSFER_REQ_DOOR_BELL, UIC_COMMAND_COMPL,
        UIC_DATA_LINK_LAYER_ERROR, UIC_DATA_LINK_LAYER_ERROR_CODE_MASK, UIC_DME_ERROR,
        UIC_DME_ERROR_CODE_MASK, UIC_ERROR, UIC_HIBERN8_MASK, UIC_NETWORK_LAYER_ERROR,
        UIC_NETWORK_LAYER_ERROR_CODE_MASK, UIC_PHY_ADAPTER_LAYER_ERROR,
        UIC_PHY_ADAPTER_LAYER_GENERIC_ERROR, UIC_POWER_MASK, UIC_TRANSPORT_LAYER_ERROR,
        UIC_TRANSPORT_LAYER_ERROR_CODE_MASK, UTP_TASK_REQ_COMPL, UTP_TRANSFER_REQ_COMPL,
    },
    PwrStatus,
};

/// Iterate the set bits of `mask`, lowest first.
pub(crate) fn bits(mut mask: u32) -> impl Iterator<Item = usize> {
    std::iter::from_fn(move || {
        if mask == 0 {
            return None;
        }
        let bit = mask.trailing_zeros() as usize;
        mask &= mask - 1;
        Some(bit)
    })
}

pub(crate) enum CallbackJob {
    Run(Callback, Retirement),
    Stop,
}

pub(crate) fn spawn_callback_worker(
    jobs: Receiver<CallbackJob>,
) -> io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("ufs-cb".to_string())
        .spawn(move || {
            let span = tracing::span!(Level::INFO, "ufs-cb");
            let _enter = span.enter();
            for job in jobs {
                match job {
                    CallbackJob::Run(callback, retirement) => callback(retirement),
                    CallbackJob::Stop => break,
                }
            }
            debug!("callback worker stopped");
        })
}

/// Entry point for the controller interrupt line.
///
/// Holds only a weak reference: an interrupt racing host teardown is dropped.
#[derive(Clone)]
pub struct IrqHandle {
    inner: Weak<Inner>,
}

impl IrqHandle {
    pub(crate) fn new(inner: &Arc<Inner>) -> Self {
        Self {
            inner: Arc::downgrade(inner),
        }
    }

    /// Service pending interrupts. Returns whether any enabled interrupt was pending.
    pub fn handle(&self) -> bool {
        match self.inner.upgrade() {
            Some(inner) => inner.handle_interrupt(),
            None => false,
        }
    }
}

impl Inner {
    pub(crate) fn handle_interrupt(&self) -> bool {
        let status = self.regs.take_interrupts();
        if status == 0 {
            return false;
        }
        trace!(status = format_args!("{status:#x}"), "interrupt");
        if status & ERROR_MASK != 0 {
            self.handle_error_interrupt(status);
        }
        if status & UIC_COMMAND_COMPL != 0 {
            self.uic.command_completed();
        }
        if status & UIC_POWER_MASK != 0 {
            self.handle_power_interrupt(status & UIC_POWER_MASK);
        }
        if status & UTP_TASK_REQ_COMPL != 0 {
            self.reap_tasks();
        }
        if status & UTP_TRANSFER_REQ_COMPL != 0 {
            self.reap_transfers();
        }
        true
    }

    /// Retire every transfer whose doorbell bit the controller dropped.
    pub(crate) fn reap_transfers(&self) {
        let mut done = Vec::new();
        let desync = {
            let mut core = self.core.lock();
            let doorbell = self.regs.read(REG_UTP_TRANSFER_REQ_DOOR_BELL);
            let diff = doorbell ^ core.outstanding;
            let completed = diff & core.outstanding;
            for tag in bits(completed) {
                core.outstanding &= !(1 << tag);
                if let Some(lrb) = core.lrbs[tag].take() {
                    done.push((tag, lrb));
                }
            }
            if !done.is_empty() {
                self.core_cv.notify_all();
            }
            // A stray bit is reported once; recovery clears it from the accumulator.
            let stray = diff & doorbell & !(core.clearing | core.stuck | core.errors.desync);
            if stray != 0 {
                core.errors.desync |= stray;
                self.schedule_eh(&mut core);
            }
            stray
        };

        for (tag, lrb) in done {
            let retirement = self.collect(tag, lrb.direction);
            trace!(tag, id = lrb.id, "request completed");
            self.retire(tag, lrb, retirement);
        }

        if desync != 0 {
            error!(
                slots = format_args!("{desync:#x}"),
                "doorbell set for slots never issued"
            );
            self.events.record(EventKind::Desync, desync);
        }
    }

    fn handle_error_interrupt(&self, status: u32) {
        let mut found = ErrorAccumulator::default();
        let fatal = status & INT_FATAL_ERRORS;
        if fatal != 0 {
            error!(status = format_args!("{fatal:#x}"), "fatal controller error");
            self.events.record(EventKind::FatalError, fatal);
            found.fatal = fatal;
        }
        if status & UIC_ERROR != 0 {
            found.uic = self.read_uic_errors();
        }
        if !found.is_empty() {
            self.report_fault(|errors| errors.merge(&found));
        }
    }

    /// Read (and so clear) the per-layer UIC error code registers.
    fn read_uic_errors(&self) -> UicErrors {
        let mut uic = UicErrors::default();

        let pa = self.regs.read(REG_UIC_ERROR_CODE_PHY_ADAPTER_LAYER);
        if pa & UIC_PHY_ADAPTER_LAYER_ERROR != 0 {
            // Lane errors are noise unless the generic bit says the link is suspect.
            self.events.record(EventKind::PaError, pa);
            uic.pa = pa & UIC_PHY_ADAPTER_LAYER_GENERIC_ERROR;
        }

        let layers = [
            (
                REG_UIC_ERROR_CODE_DATA_LINK_LAYER,
                UIC_DATA_LINK_LAYER_ERROR,
                UIC_DATA_LINK_LAYER_ERROR_CODE_MASK,
                EventKind::DlError,
            ),
            (
                REG_UIC_ERROR_CODE_NETWORK_LAYER,
                UIC_NETWORK_LAYER_ERROR,
                UIC_NETWORK_LAYER_ERROR_CODE_MASK,
                EventKind::NlError,
            ),
            (
                REG_UIC_ERROR_CODE_TRANSPORT_LAYER,
                UIC_TRANSPORT_LAYER_ERROR,
                UIC_TRANSPORT_LAYER_ERROR_CODE_MASK,
                EventKind::TlError,
            ),
            (
                REG_UIC_ERROR_CODE_DME,
                UIC_DME_ERROR,
                UIC_DME_ERROR_CODE_MASK,
                EventKind::DmeError,
            ),
        ];
        let mut codes = [0u32; 4];
        for (code, (reg, valid, mask, kind)) in codes.iter_mut().zip(layers) {
            let value = self.regs.read(reg);
            if value & valid != 0 {
                self.events.record(kind, value);
                *code = value & mask;
            }
        }
        [uic.dl, uic.nl, uic.tl, uic.dme] = codes;

        if !uic.is_empty() {
            warn!(
                pa = uic.pa,
                dl = uic.dl,
                nl = uic.nl,
                tl = uic.tl,
                dme = uic.dme,
                "uic error"
            );
        }
        uic
    }

    fn handle_power_interrupt(&self, bits: u32) {
        if self.uic.power_status_changed(bits) {
            return;
        }
        if bits & UIC_HIBERN8_MASK == 0 || !self.auto_hibern8_enabled.load(Ordering::Acquire) {
            return;
        }
        // Raised by the auto-hibernate timer rather than a command of ours.
        let status = PwrStatus::from(upmcrs(self.regs.read(REG_CONTROLLER_STATUS)));
        if status != PwrStatus::Local {
            error!(?status, "auto-hibernate transition failed");
            self.events.record(EventKind::AutoHibern8Error, u8::from(status) as u32);
            self.report_fault(|errors| errors.auto_hibern8 = true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bits_iterates_lowest_first() {
        assert_eq!(bits(0).count(), 0);
        assert_eq!(bits(0b1010_0001).collect::<Vec<_>>(), vec![0, 5, 7]);
        assert_eq!(bits(1 << 31).collect::<Vec<_>>(), vec![31]);
    }
}
