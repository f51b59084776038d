use crate::controller::SimController;
use parking_lot::Mutex;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use tracing::trace;
use ufs_host_core::{ChangeStage, HostQuirks, PowerModeInfo, UfsError, UfsResult, UfsVariant};

/// Platform glue for [`SimController`]: clock control and the device reset line.
pub struct SimVariant {
    sim: Arc<SimController>,
    quirks: HostQuirks,
    clocks_on: AtomicU64,
    clocks_off: AtomicU64,
    device_resets: AtomicU64,
    clock_on_hook: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    refuse_clock_off: AtomicBool,
}

impl SimVariant {
    pub fn new(sim: Arc<SimController>, quirks: HostQuirks) -> Self {
        Self {
            sim,
            quirks,
            clocks_on: AtomicU64::new(0),
            clocks_off: AtomicU64::new(0),
            device_resets: AtomicU64::new(0),
            clock_on_hook: Mutex::new(None),
            refuse_clock_off: AtomicBool::new(false),
        }
    }

    /// Times the clocks were switched on.
    pub fn clock_ons(&self) -> u64 {
        self.clocks_on.load(Ordering::Relaxed)
    }

    pub fn clock_offs(&self) -> u64 {
        self.clocks_off.load(Ordering::Relaxed)
    }

    pub fn device_resets(&self) -> u64 {
        self.device_resets.load(Ordering::Relaxed)
    }

    /// Make requests to switch the clocks off fail, leaving them on.
    pub fn refuse_clock_off(&self, refuse: bool) {
        self.refuse_clock_off.store(refuse, Ordering::Relaxed);
    }

    /// Run `hook` on the thread that next switches the clocks on, right after they come up.
    pub fn on_next_clock_on(&self, hook: impl FnOnce() + Send + 'static) {
        *self.clock_on_hook.lock() = Some(Box::new(hook));
    }
}

impl UfsVariant for SimVariant {
    fn name(&self) -> &str {
        "sim"
    }

    fn quirks(&self) -> HostQuirks {
        self.quirks
    }

    fn pwr_change_notify(&self, stage: ChangeStage, desired: &PowerModeInfo) -> UfsResult<()> {
        trace!(?stage, %desired, "power mode change");
        Ok(())
    }

    fn setup_clocks(&self, on: bool) -> UfsResult<()> {
        if !on && self.refuse_clock_off.load(Ordering::Relaxed) {
            return Err(UfsError::Variant("clock gate refused".to_string()));
        }
        let counter = if on { &self.clocks_on } else { &self.clocks_off };
        counter.fetch_add(1, Ordering::Relaxed);
        self.sim.set_clocks(on);
        if on {
            let hook = self.clock_on_hook.lock().take();
            if let Some(hook) = hook {
                hook();
            }
        }
        Ok(())
    }

    fn device_reset(&self) -> UfsResult<bool> {
        self.device_resets.fetch_add(1, Ordering::Relaxed);
        self.sim.reset_device();
        Ok(true)
    }
}
