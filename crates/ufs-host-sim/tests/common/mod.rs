#![allow(dead_code)]

use std::{
    thread,
    time::{Duration, Instant},
};
use tracing_subscriber::EnvFilter;
use ufs_host_core::{HostConfig, HostState, ScsiCommand, UfsHost};
use ufs_host_sim::{boot, SimConfig, SimHost};

pub const BLOCK: u32 = 4096;
pub const WAIT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Short timeouts and no clock gating, so scenarios only see the faults they inject.
pub fn config() -> HostConfig {
    let mut config = HostConfig::default();
    config.command_timeout_ms = 2_000;
    config.uic_timeout_ms = 200;
    config.query_timeout_ms = 500;
    config.task_timeout_ms = 500;
    config.clear_timeout_ms = 200;
    config.clock_gating.enabled = false;
    config
}

pub fn start(config: HostConfig, sim_config: SimConfig) -> SimHost {
    init_tracing();
    boot(config, sim_config).expect("boot simulated host")
}

pub fn start_default() -> SimHost {
    start(config(), SimConfig::default())
}

/// Poll `cond` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(2));
    }
}

/// Wait for the error handler to finish at least `resets` reset attempts and reopen the host.
pub fn wait_recovered(host: &UfsHost, resets: u64) -> bool {
    wait_until(WAIT, || {
        host.stats().resets >= resets
            && host.state() == HostState::Operational
            && host.pending_errors().is_empty()
    })
}

pub fn pattern(seed: u8, len: usize) -> Vec<u8> {
    (0..len).map(|i| seed.wrapping_add(i as u8)).collect()
}

pub fn read_cmd(lun: u8, lba: u32) -> ScsiCommand {
    ScsiCommand::read10(lun, lba, 1, BLOCK)
}
