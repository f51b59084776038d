//! The host context: shared state behind every operation and the public handle.

use crate::{
    command::{CancelOutcome, CommandHandle, CommandResult, ScsiCommand},
    completion::{spawn_callback_worker, CallbackJob, IrqHandle},
    config::HostConfig,
    dispatch::Admission,
    eh::spawn_eh_worker,
    error::{UfsError, UfsResult},
    events::EventHistory,
    gating::{spawn_gate_worker, ClockGating, ClockHold, GateOps, GatingState},
    init::DeviceInfo,
    link::{LinkState, LinkStatus, PowerModeInfo},
    lists::RequestLists,
    metrics::{HostStats, StatsSnapshot},
    regs::HostRegisters,
    slots::{SlotKind, SlotPool},
    state::{transition, ErrorAccumulator, HostEvent, HostState},
    tm::TmRecord,
    uic::UicEngine,
    variant::{HostQuirks, UfsVariant},
};
use crossbeam_channel::{unbounded, Sender};
use parking_lot::{Condvar, Mutex};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, info, warn};
use ufs_proto::{
    regs::REG_CONTROLLER_CAPABILITIES, Capabilities, DataDirection, Ocs, QueryOpcode,
};

pub(crate) type Callback = Box<dyn FnOnce(Retirement) + Send>;

/// Where a retired transfer reports.
pub(crate) enum Completion {
    /// A thread blocked on the result; woken straight from the completion path.
    Waiter(Sender<Retirement>),
    /// Upper layer callback. Runs on the callback worker, which may block in `submit`.
    Callback(Callback),
}

/// How a transfer left the controller.
pub(crate) enum Retirement {
    /// Doorbell dropped; slot memory holds the controller's answer.
    Completed {
        ocs: Ocs,
        response: Vec<u8>,
        data: Vec<u8>,
    },
    Timeout,
    Aborted,
    Requeue,
}

impl Retirement {
    pub(crate) fn into_result(self) -> CommandResult {
        match self {
            Retirement::Completed {
                ocs,
                response,
                data,
            } => CommandResult::decode(ocs, &response, data),
            Retirement::Timeout => CommandResult::Timeout,
            Retirement::Aborted => CommandResult::Aborted,
            Retirement::Requeue => CommandResult::Requeue,
        }
    }
}

/// Local reference block: software record of one outstanding transfer.
pub(crate) struct Lrb {
    pub(crate) id: u64,
    pub(crate) lun: u8,
    pub(crate) kind: SlotKind,
    pub(crate) direction: DataDirection,
    pub(crate) issued_at: Instant,
    pub(crate) on_complete: Completion,
    pub(crate) hold: ClockHold,
}

/// State guarded by the core lock. Never held across a hardware wait.
pub(crate) struct Core {
    pub(crate) state: HostState,
    /// PM level the host was suspended at.
    pub(crate) suspended: Option<u8>,
    pub(crate) outstanding: u32,
    /// Slots whose doorbell clear is in progress.
    pub(crate) clearing: u32,
    /// Slots whose doorbell clear never took. Held until the next controller reset.
    pub(crate) stuck: u32,
    pub(crate) lrbs: Vec<Option<Lrb>>,
    pub(crate) tm_outstanding: u32,
    pub(crate) tm_stuck: u32,
    pub(crate) tms: Vec<Option<TmRecord>>,
    pub(crate) errors: ErrorAccumulator,
    pub(crate) consecutive_timeouts: u32,
    /// Bumped each time a recovery run finishes.
    pub(crate) eh_generation: u64,
}

pub(crate) struct Inner {
    pub(crate) regs: Arc<dyn HostRegisters>,
    pub(crate) variant: Arc<dyn UfsVariant>,
    pub(crate) config: HostConfig,
    pub(crate) caps: Capabilities,
    pub(crate) lists: Arc<RequestLists>,
    pub(crate) io_slots: Arc<SlotPool>,
    pub(crate) dev_slots: Arc<SlotPool>,
    pub(crate) task_slots: Arc<SlotPool>,
    pub(crate) core: Mutex<Core>,
    pub(crate) core_cv: Condvar,
    pub(crate) uic: UicEngine,
    pub(crate) gating: Arc<ClockGating>,
    pub(crate) link: Mutex<LinkStatus>,
    pub(crate) stats: HostStats,
    pub(crate) events: EventHistory,
    pub(crate) callbacks: Sender<CallbackJob>,
    pub(crate) next_id: AtomicU64,
    pub(crate) shutdown: AtomicBool,
    pub(crate) auto_hibern8_enabled: AtomicBool,
    pub(crate) device_info: Mutex<Option<DeviceInfo>>,
}

impl Inner {
    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub(crate) fn hold_clocks(&self) -> ClockHold {
        self.gating.hold(self)
    }

    pub(crate) fn release_transfer_slot(&self, tag: usize) {
        if self.dev_slots.contains(tag) {
            self.dev_slots.release(tag);
        } else {
            self.io_slots.release(tag);
        }
    }
}

impl GateOps for Inner {
    fn gate_blocked(&self) -> bool {
        if self.uic.busy() {
            return true;
        }
        let core = self.core.lock();
        core.outstanding != 0
            || core.tm_outstanding != 0
            || !matches!(core.state, HostState::Operational | HostState::Error)
    }

    fn gate_clocks(&self) -> UfsResult<bool> {
        let hibern8 = self.config.clock_gating.hibern8_on_gate
            && !self
                .variant
                .quirks()
                .contains(HostQuirks::NO_HIBERN8_ON_GATE)
            && !self.auto_hibern8_enabled.load(Ordering::Acquire)
            && self.link.lock().link == LinkState::Active;
        if hibern8 {
            self.hibern8_enter()?;
        }
        if let Err(err) = self.variant.setup_clocks(false) {
            if hibern8 {
                if let Err(exit_err) = self.hibern8_exit() {
                    warn!(err = %exit_err, "hibern8 exit after failed clock gate");
                }
            }
            return Err(err);
        }
        self.stats.clocks_gated();
        Ok(hibern8)
    }

    fn ungate_clocks(&self, exit_hibern8: bool) -> UfsResult<()> {
        self.variant.setup_clocks(true)?;
        self.stats.clocks_ungated();
        if exit_hibern8 {
            self.hibern8_exit()?;
        }
        Ok(())
    }
}

/// One UFS host controller.
///
/// Owns the recovery and clock gating workers; dropping the host stops both, stops the
/// controller and reports every command still outstanding as requeued.
pub struct UfsHost {
    inner: Arc<Inner>,
    workers: Vec<thread::JoinHandle<()>>,
    callback_worker: Option<thread::JoinHandle<()>>,
}

impl UfsHost {
    /// Read the controller capabilities, size the slot pools and start the workers. The
    /// controller is left untouched until [`UfsHost::init`].
    pub fn new(
        regs: Arc<dyn HostRegisters>,
        variant: Arc<dyn UfsVariant>,
        config: HostConfig,
    ) -> UfsResult<Self> {
        let caps = Capabilities::from_raw(regs.read(REG_CONTROLLER_CAPABILITIES));
        let nutrs = caps.transfer_slots();
        let nutmrs = caps.task_slots();
        if nutrs < 2 {
            return Err(UfsError::InvalidArgument(
                "controller needs at least two transfer slots",
            ));
        }
        info!(
            variant = variant.name(),
            nutrs,
            nutmrs,
            auto_hibern8 = caps.auto_hibern8(),
            "ufs host created"
        );

        let gating = ClockGating::new(config.clock_gating.enabled, config.clock_gating.delay());
        let (callbacks, callback_rx) = unbounded();
        let callback_worker =
            spawn_callback_worker(callback_rx).map_err(|source| UfsError::Spawn {
                name: "ufs-cb",
                source,
            })?;
        let inner = Arc::new(Inner {
            regs,
            variant,
            caps,
            lists: Arc::new(RequestLists::new(nutrs, nutmrs)),
            // The last transfer slot is reserved for device management commands.
            io_slots: SlotPool::new(SlotKind::Transfer, 0, nutrs - 1),
            dev_slots: SlotPool::new(SlotKind::DeviceManagement, nutrs - 1, 1),
            task_slots: SlotPool::new(SlotKind::Task, 0, nutmrs),
            core: Mutex::new(Core {
                state: HostState::Reset,
                suspended: None,
                outstanding: 0,
                clearing: 0,
                stuck: 0,
                lrbs: (0..nutrs).map(|_| None).collect(),
                tm_outstanding: 0,
                tm_stuck: 0,
                tms: (0..nutmrs).map(|_| None).collect(),
                errors: ErrorAccumulator::default(),
                consecutive_timeouts: 0,
                eh_generation: 0,
            }),
            core_cv: Condvar::new(),
            uic: UicEngine::new(),
            gating: Arc::clone(&gating),
            link: Mutex::new(LinkStatus::default()),
            stats: HostStats::default(),
            events: EventHistory::default(),
            callbacks,
            next_id: AtomicU64::new(1),
            shutdown: AtomicBool::new(false),
            auto_hibern8_enabled: AtomicBool::new(false),
            device_info: Mutex::new(None),
            config,
        });

        let mut host = UfsHost {
            inner: Arc::clone(&inner),
            workers: Vec::with_capacity(2),
            callback_worker: Some(callback_worker),
        };
        let eh = spawn_eh_worker(Arc::clone(&inner)).map_err(|source| UfsError::Spawn {
            name: "ufs-eh",
            source,
        })?;
        host.workers.push(eh);
        let ops: Arc<dyn GateOps> = inner;
        let gate = spawn_gate_worker(gating, ops).map_err(|source| UfsError::Spawn {
            name: "ufs-clkgate",
            source,
        })?;
        host.workers.push(gate);
        Ok(host)
    }

    /// Handle for the platform interrupt line. It does not keep the host alive.
    pub fn irq_handle(&self) -> IrqHandle {
        IrqHandle::new(&self.inner)
    }

    /// Bring up controller, link and device, then open admission.
    pub fn init(&self) -> UfsResult<()> {
        let state = self.inner.core.lock().state;
        if state != HostState::Reset {
            return Err(UfsError::Busy(state));
        }
        let _hold = self.inner.hold_clocks();
        let result = self.inner.probe_hba();
        let mut core = self.inner.core.lock();
        let event = match &result {
            Ok(()) => HostEvent::InitSucceeded,
            Err(err) => {
                warn!(%err, "host init failed");
                HostEvent::InitFailed
            }
        };
        if let Some(next) = transition(core.state, event) {
            core.state = next;
        }
        if result.is_ok() {
            info!("host operational");
            if !core.errors.is_empty() {
                self.inner.schedule_eh(&mut core);
            }
        }
        result
    }

    /// Issue a SCSI command asynchronously. Blocks only while waiting for a free slot.
    /// `on_complete` runs exactly once, on the host's callback thread, and may submit again.
    pub fn submit<F>(&self, cmd: &ScsiCommand, on_complete: F) -> UfsResult<CommandHandle>
    where
        F: FnOnce(CommandResult) + Send + 'static,
    {
        self.inner.submit_scsi(
            cmd,
            Completion::Callback(Box::new(move |r| on_complete(r.into_result()))),
        )
    }

    /// Issue a SCSI command and wait for its result, withdrawing it after the configured
    /// command timeout.
    pub fn execute(&self, cmd: &ScsiCommand) -> UfsResult<CommandResult> {
        self.execute_timeout(cmd, self.inner.config.command_timeout())
    }

    pub fn execute_timeout(&self, cmd: &ScsiCommand, timeout: Duration) -> UfsResult<CommandResult> {
        self.inner.execute_scsi(cmd, timeout, Admission::Normal)
    }

    /// Withdraw a submitted command.
    pub fn cancel(&self, handle: CommandHandle) -> UfsResult<CancelOutcome> {
        self.inner.cancel(handle)
    }

    /// Reset one logical unit. Its outstanding commands are reported as requeued.
    pub fn device_reset(&self, lun: u8) -> UfsResult<()> {
        self.inner.device_reset(lun)
    }

    /// Reset controller, link and device through the error handler and wait for the outcome.
    /// This is the only way out of [`HostState::Error`].
    pub fn host_reset(&self) -> UfsResult<()> {
        self.inner.force_recovery()
    }

    pub fn nop(&self) -> UfsResult<()> {
        self.inner.nop_out(Admission::Normal)
    }

    pub fn read_flag(&self, idn: u8) -> UfsResult<bool> {
        self.inner
            .query_flag(QueryOpcode::ReadFlag, idn, Admission::Normal)
    }

    pub fn set_flag(&self, idn: u8) -> UfsResult<bool> {
        self.inner
            .query_flag(QueryOpcode::SetFlag, idn, Admission::Normal)
    }

    pub fn clear_flag(&self, idn: u8) -> UfsResult<bool> {
        self.inner
            .query_flag(QueryOpcode::ClearFlag, idn, Admission::Normal)
    }

    pub fn toggle_flag(&self, idn: u8) -> UfsResult<bool> {
        self.inner
            .query_flag(QueryOpcode::ToggleFlag, idn, Admission::Normal)
    }

    pub fn read_attribute(&self, idn: u8, index: u8, selector: u8) -> UfsResult<u32> {
        self.inner
            .read_attribute(idn, index, selector, Admission::Normal)
    }

    pub fn write_attribute(&self, idn: u8, index: u8, selector: u8, value: u32) -> UfsResult<()> {
        self.inner
            .write_attribute(idn, index, selector, value, Admission::Normal)
    }

    pub fn read_descriptor(
        &self,
        idn: u8,
        index: u8,
        selector: u8,
        len: u16,
    ) -> UfsResult<Vec<u8>> {
        self.inner
            .read_descriptor(idn, index, selector, len, Admission::Normal)
    }

    pub fn write_descriptor(&self, idn: u8, index: u8, selector: u8, data: &[u8]) -> UfsResult<()> {
        self.inner
            .write_descriptor(idn, index, selector, data, Admission::Normal)
    }

    /// Change link gear and power mode. Asking for the mode already in effect does nothing.
    pub fn change_power_mode(&self, desired: PowerModeInfo) -> UfsResult<()> {
        self.inner.admit_now(Admission::Normal)?;
        let _hold = self.inner.hold_clocks();
        self.inner.change_power_mode(desired)
    }

    pub fn dme_get(&self, attr_sel: u32) -> UfsResult<u32> {
        let _hold = self.inner.hold_clocks();
        self.inner.dme_get(attr_sel)
    }

    pub fn dme_set(&self, attr_sel: u32, value: u32) -> UfsResult<()> {
        let _hold = self.inner.hold_clocks();
        self.inner.dme_set(attr_sel, value)
    }

    pub fn dme_peer_get(&self, attr_sel: u32) -> UfsResult<u32> {
        let _hold = self.inner.hold_clocks();
        self.inner.dme_peer_get(attr_sel)
    }

    pub fn dme_peer_set(&self, attr_sel: u32, value: u32) -> UfsResult<()> {
        let _hold = self.inner.hold_clocks();
        self.inner.dme_peer_set(attr_sel, value)
    }

    /// Suspend at power management level `level` (0..=5), or the configured default.
    pub fn suspend(&self, level: Option<u8>) -> UfsResult<()> {
        self.inner
            .suspend(level.unwrap_or(self.inner.config.suspend_level))
    }

    pub fn resume(&self) -> UfsResult<()> {
        self.inner.resume()
    }

    /// Keep controller clocks on until the hold is dropped.
    pub fn hold_clocks(&self) -> ClockHold {
        self.inner.hold_clocks()
    }

    pub fn set_clock_gating(&self, enabled: bool) {
        info!(enabled, "clock gating toggled");
        self.inner.gating.set_enabled(enabled, self.inner.as_ref());
    }

    pub fn set_gating_delay(&self, delay: Duration) {
        self.inner.gating.set_delay(delay);
    }

    pub fn state(&self) -> HostState {
        self.inner.core.lock().state
    }

    pub fn is_suspended(&self) -> bool {
        self.inner.core.lock().suspended.is_some()
    }

    pub fn gating_state(&self) -> GatingState {
        self.inner.gating.state()
    }

    pub fn link_status(&self) -> LinkStatus {
        *self.inner.link.lock()
    }

    /// Bitmap of transfer slots currently outstanding.
    pub fn outstanding(&self) -> u32 {
        self.inner.core.lock().outstanding
    }

    /// Bitmap of transfer slots handed out by the allocator, issued or not.
    pub fn slots_in_use(&self) -> u32 {
        self.inner.io_slots.in_use() | self.inner.dev_slots.in_use()
    }

    /// Faults recorded and not yet handled by recovery.
    pub fn pending_errors(&self) -> ErrorAccumulator {
        self.inner.core.lock().errors
    }

    pub fn capabilities(&self) -> Capabilities {
        self.inner.caps
    }

    pub fn device_info(&self) -> Option<DeviceInfo> {
        self.inner.device_info.lock().clone()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    pub fn events(&self) -> &EventHistory {
        &self.inner.events
    }

    pub fn config(&self) -> &HostConfig {
        &self.inner.config
    }
}

impl Drop for UfsHost {
    fn drop(&mut self) {
        {
            let _core = self.inner.core.lock();
            self.inner.shutdown.store(true, Ordering::Release);
            self.inner.core_cv.notify_all();
        }
        self.inner.gating.shutdown();
        self.inner.io_slots.close();
        self.inner.dev_slots.close();
        self.inner.task_slots.close();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                warn!("host worker panicked");
            }
        }
        self.inner.hba_stop();
        self.inner.drain_after_stop();
        if let Some(worker) = self.callback_worker.take() {
            // Queued callbacks run before the stop marker.
            let _ = self.inner.callbacks.send(CallbackJob::Stop);
            if worker.thread().id() == thread::current().id() {
                warn!("host dropped from its own completion callback");
            } else if worker.join().is_err() {
                warn!("callback worker panicked");
            }
        }
        debug!("ufs host shut down");
    }
}
