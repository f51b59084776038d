//! Error handler: fault intake, the recovery worker and forced resets.
//!
//! Faults only update the sticky accumulator and, from `Operational`, schedule the worker.
//! The worker is the single authority for clears and resets; a fault arriving while it runs
//! is picked up by its next round.

use crate::{
    completion::bits,
    dispatch::{Admission, ClearOutcome},
    error::{UfsError, UfsResult},
    events::EventKind,
    host::{Core, Inner, Retirement},
    state::{transition, ErrorAccumulator, HostEvent, HostState},
    tm::TmDone,
};
use parking_lot::MutexGuard;
use std::{io, sync::Arc, thread};
use tracing::{debug, error, info, warn, Level};
use ufs_proto::Ocs;

/// Recovery rounds for faults that keep arriving while the worker runs.
const MAX_EH_ROUNDS: u32 = 4;

pub(crate) fn spawn_eh_worker(inner: Arc<Inner>) -> io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("ufs-eh".to_string())
        .spawn(move || inner.run_eh())
}

impl Inner {
    /// Record a fault and schedule recovery if the host was operational.
    pub(crate) fn report_fault<F>(&self, update: F)
    where
        F: FnOnce(&mut ErrorAccumulator),
    {
        let mut core = self.core.lock();
        update(&mut core.errors);
        self.schedule_eh(&mut core);
    }

    pub(crate) fn schedule_eh(&self, core: &mut Core) {
        if let Some(next) = transition(core.state, HostEvent::Fault) {
            info!(errors = ?core.errors, "error handling scheduled");
            core.state = next;
            self.core_cv.notify_all();
        }
    }

    fn run_eh(&self) {
        let span = tracing::span!(Level::INFO, "ufs-eh");
        let _enter = span.enter();
        loop {
            {
                let mut core = self.core.lock();
                while core.state != HostState::EhScheduled && !self.is_shutdown() {
                    self.core_cv.wait(&mut core);
                }
                if self.is_shutdown() {
                    break;
                }
            }
            self.recover();
        }
        debug!("error handler stopped");
    }

    fn recover(&self) {
        let _hold = self.hold_clocks();
        let mut handled = {
            let mut core = self.core.lock();
            match transition(core.state, HostEvent::RecoveryStarted) {
                Some(next) => core.state = next,
                None => return,
            }
            core.errors
        };
        info!(errors = ?handled, "error recovery started");

        let mut round = 1;
        loop {
            let result = self.handle_errors(&handled);
            let mut core = self.core.lock();
            if result.is_ok() {
                core.errors.subtract(&handled);
            }
            let done = result.is_err() || core.errors.is_empty() || round >= MAX_EH_ROUNDS;
            if !done {
                handled = core.errors;
                debug!(round, errors = ?handled, "new faults during recovery");
                round += 1;
                continue;
            }

            let ok = result.is_ok() && core.errors.is_empty();
            let event = if ok {
                HostEvent::RecoverySucceeded
            } else {
                HostEvent::RecoveryFailed
            };
            if let Some(next) = transition(core.state, event) {
                core.state = next;
            }
            core.eh_generation += 1;
            core.consecutive_timeouts = 0;
            self.core_cv.notify_all();
            match result {
                Ok(()) if ok => info!(rounds = round, "error recovery succeeded"),
                Ok(()) => error!(errors = ?core.errors, "faults persist, host failed"),
                Err(err) => error!(%err, "error recovery failed, host failed"),
            }
            break;
        }
    }

    /// One recovery round for the faults in `handled`.
    fn handle_errors(&self, handled: &ErrorAccumulator) -> UfsResult<()> {
        let mut needs_reset = handled.needs_full_reset();
        let mut nac_recovered = false;
        if needs_reset
            && handled.is_transient_nac_only()
            && self.config.transient_link_error.enabled
        {
            nac_recovered = self.recover_transient_nac();
            needs_reset = !nac_recovered;
        }

        // Commands the controller already finished are delivered normally.
        self.reap_tasks();
        self.reap_transfers();

        if !needs_reset && !nac_recovered && !handled.is_empty() {
            // Protocol errors the link survives: withdraw what is in flight and let the
            // upper layer resubmit.
            if !self.clear_all_pending() {
                needs_reset = true;
            }
        }
        if needs_reset {
            self.reset_with_retries()?;
        }
        Ok(())
    }

    /// Wait out a NAC that some devices report transiently and check the link still answers.
    fn recover_transient_nac(&self) -> bool {
        let policy = &self.config.transient_link_error;
        thread::sleep(policy.settle());
        if !self.core.lock().errors.is_transient_nac_only() {
            debug!("further faults arrived, transient nac path abandoned");
            return false;
        }
        match self.nop_out_with_retries(Admission::Recovery, policy.probe_retries) {
            Ok(()) => {
                info!("link answered after nac, no reset needed");
                self.core.lock().errors.clear_nac();
                true
            }
            Err(err) => {
                warn!(%err, "link probe after nac failed");
                false
            }
        }
    }

    /// Clear every outstanding transfer with a requeue result. Returns false if a clear stuck.
    fn clear_all_pending(&self) -> bool {
        let pending: Vec<(usize, u64)> = {
            let core = self.core.lock();
            core.lrbs
                .iter()
                .enumerate()
                .filter_map(|(tag, lrb)| lrb.as_ref().map(|lrb| (tag, lrb.id)))
                .collect()
        };
        let mut ok = true;
        for (tag, id) in pending {
            if self.clear_transfer(tag, id, Retirement::Requeue) == ClearOutcome::Stuck {
                ok = false;
            }
        }
        ok
    }

    fn reset_with_retries(&self) -> UfsResult<()> {
        let attempts = self.config.host_reset_retries.max(1);
        for attempt in 1..=attempts {
            self.stats.host_reset();
            self.events.record(EventKind::HostReset, attempt);
            match self.reset_and_restore() {
                Ok(()) => {
                    info!(attempt, "host reset complete");
                    return Ok(());
                }
                Err(err) => warn!(attempt, %err, "host reset failed"),
            }
        }
        Err(UfsError::ResetFailed { attempts })
    }

    fn reset_and_restore(&self) -> UfsResult<()> {
        match self.variant.device_reset() {
            Ok(true) => debug!("device hardware reset pulsed"),
            Ok(false) => {}
            Err(err) => warn!(%err, "device hardware reset failed"),
        }
        self.hba_stop();
        self.drain_after_stop();
        self.probe_hba()
    }

    /// With the controller stopped, retire everything software still tracks.
    pub(crate) fn drain_after_stop(&self) {
        let (lrbs, stuck, tms, tm_stuck) = {
            let mut core = self.core.lock();
            let lrbs: Vec<_> = core
                .lrbs
                .iter_mut()
                .enumerate()
                .filter_map(|(tag, lrb)| lrb.take().map(|lrb| (tag, lrb)))
                .collect();
            let tms: Vec<_> = core
                .tms
                .iter_mut()
                .enumerate()
                .filter_map(|(tag, record)| record.take().map(|record| (tag, record)))
                .collect();
            core.outstanding = 0;
            core.tm_outstanding = 0;
            let stuck = std::mem::take(&mut core.stuck);
            let tm_stuck = std::mem::take(&mut core.tm_stuck);
            self.core_cv.notify_all();
            (lrbs, stuck, tms, tm_stuck)
        };

        if !lrbs.is_empty() {
            info!(count = lrbs.len(), "requeueing commands dropped by reset");
        }
        for (tag, lrb) in lrbs {
            let retirement = if self.lists.transfer_ocs(tag) != Ocs::InvalidCommandStatus {
                self.collect(tag, lrb.direction)
            } else {
                Retirement::Requeue
            };
            self.retire(tag, lrb, retirement);
        }
        for tag in bits(stuck) {
            self.release_transfer_slot(tag);
        }
        for (tag, record) in tms {
            self.task_slots.release(tag);
            record.finish(TmDone::Requeue);
        }
        for tag in bits(tm_stuck) {
            self.task_slots.release(tag);
        }
    }

    /// Block until a recovery run that started after `generation` settles the host.
    pub(crate) fn wait_for_recovery(
        &self,
        mut core: MutexGuard<'_, Core>,
        generation: u64,
    ) -> UfsResult<()> {
        loop {
            if self.is_shutdown() {
                return Err(UfsError::Interrupted);
            }
            if core.eh_generation != generation {
                match core.state {
                    HostState::Operational => return Ok(()),
                    HostState::Error => {
                        return Err(UfsError::ResetFailed {
                            attempts: self.config.host_reset_retries.max(1),
                        })
                    }
                    _ => {}
                }
            }
            self.core_cv.wait(&mut core);
        }
    }

    /// Request a full reset through the error handler and wait for it.
    pub(crate) fn force_recovery(&self) -> UfsResult<()> {
        let mut core = self.core.lock();
        self.request_reset(&mut core)?;
        let generation = core.eh_generation;
        self.wait_for_recovery(core, generation)
    }

    pub(crate) fn request_reset(&self, core: &mut Core) -> UfsResult<()> {
        if core.state == HostState::Reset {
            return Err(UfsError::Busy(HostState::Reset));
        }
        core.errors.forced = true;
        if let Some(next) = transition(core.state, HostEvent::ForceReset) {
            info!(from = %core.state, "host reset requested");
            core.state = next;
            self.core_cv.notify_all();
        }
        Ok(())
    }
}
