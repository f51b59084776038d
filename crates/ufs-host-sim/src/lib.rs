//! In-process UFS host controller and device model.
//!
//! [`SimController`] implements [`ufs_host_core::HostRegisters`] on top of a register file,
//! a request engine and a small SCSI/query device, with hooks for injecting the faults the
//! host core has to recover from. [`SimHost`] wires one to a [`UfsHost`].

mod controller;
mod device;
mod faults;
mod variant;

pub use controller::SimController;
pub use faults::UicErrorInjection;
pub use variant::SimVariant;

use std::{sync::Arc, time::Duration};
use ufs_host_core::{HostConfig, HostQuirks, HostRegisters, UfsHost, UfsResult, UfsVariant};

/// Shape of the simulated controller and device.
#[derive(Clone, Debug)]
pub struct SimConfig {
    pub transfer_slots: usize,
    pub task_slots: usize,
    pub auto_hibern8: bool,
    pub lanes: u32,
    pub max_hs_gear: u32,
    pub num_lu: u8,
    pub blocks_per_lu: u32,
    pub block_size: u32,
    /// Time the device spends on each batch of requests.
    pub latency: Duration,
    /// `fDeviceInit` reads that still return set after the host sets it.
    pub device_init_reads: u32,
    pub quirks: HostQuirks,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            transfer_slots: 32,
            task_slots: 8,
            auto_hibern8: true,
            lanes: 2,
            max_hs_gear: 4,
            num_lu: 2,
            blocks_per_lu: 256,
            block_size: 4096,
            latency: Duration::ZERO,
            device_init_reads: 2,
            quirks: HostQuirks::empty(),
        }
    }
}

/// A host wired to a simulated controller.
///
/// Field order matters: the host is dropped first so its teardown still reaches a live
/// controller.
pub struct SimHost {
    pub host: UfsHost,
    pub variant: Arc<SimVariant>,
    pub sim: Arc<SimController>,
}

impl SimHost {
    /// Build controller and host and connect the interrupt line, without initializing.
    pub fn assemble(config: HostConfig, sim_config: SimConfig) -> UfsResult<Self> {
        let quirks = sim_config.quirks;
        let sim = SimController::new(sim_config)?;
        let variant = Arc::new(SimVariant::new(Arc::clone(&sim), quirks));
        let regs: Arc<dyn HostRegisters> = Arc::clone(&sim) as Arc<dyn HostRegisters>;
        let platform: Arc<dyn UfsVariant> = Arc::clone(&variant) as Arc<dyn UfsVariant>;
        let host = UfsHost::new(regs, platform, config)?;
        sim.attach(host.irq_handle());
        Ok(Self { host, variant, sim })
    }
}

/// Assemble and initialize.
pub fn boot(config: HostConfig, sim_config: SimConfig) -> UfsResult<SimHost> {
    let sim_host = SimHost::assemble(config, sim_config)?;
    sim_host.host.init()?;
    Ok(sim_host)
}
