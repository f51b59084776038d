use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::{
    fs,
    path::PathBuf,
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, info, warn};
use ufs_host_core::{
    CommandResult, HostConfig, HostState, ScsiCommand, StatsSnapshot, UfsError, UfsHost,
};
use ufs_host_sim::{boot, SimConfig, UicErrorInjection};
use ufs_proto::regs::DEVICE_FATAL_ERROR;

#[derive(Debug, Parser)]
#[command(name = "ufs-host-cli")]
#[command(about = "Drive a simulated UFS host controller with I/O and injected faults", long_about = None)]
struct Args {
    /// JSON file with host tunables; missing fields keep their defaults
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Commands issued per worker thread
    #[arg(long, default_value_t = 1000)]
    commands: u32,
    /// Concurrent submitting threads
    #[arg(long, default_value_t = 4)]
    threads: u32,
    /// Transfer request slots exposed by the controller
    #[arg(long, default_value_t = 32)]
    transfer_slots: usize,
    /// Logical units on the simulated device
    #[arg(long, default_value_t = 2)]
    luns: u8,
    /// Device service time per batch, in microseconds
    #[arg(long, default_value_t = 0)]
    latency_us: u64,
    /// Fault to inject while the workload runs
    #[arg(long, value_enum)]
    fault: Vec<Fault>,
    /// Milliseconds between injected faults
    #[arg(long, default_value_t = 50)]
    fault_interval_ms: u64,
    /// Suspend to this power management level and resume once the workload is done
    #[arg(long, value_name = "LEVEL")]
    suspend: Option<u8>,
    /// Times a requeued command is resubmitted before it counts as lost
    #[arg(long, default_value_t = 5)]
    resubmits: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Fault {
    Fatal,
    Nac,
    PaError,
    TlError,
    Desync,
    AutoHibern8,
}

#[derive(Default)]
struct Tally {
    good: AtomicU64,
    errors: AtomicU64,
    resubmitted: AtomicU64,
    lost: AtomicU64,
}

#[derive(Serialize)]
struct Report {
    state: String,
    good: u64,
    errors: u64,
    resubmitted: u64,
    lost: u64,
    elapsed_ms: u128,
    stats: StatsSnapshot,
    events: Vec<EventCount>,
}

#[derive(Serialize)]
struct EventCount {
    kind: String,
    count: u64,
}

const BLOCK_SIZE: u32 = 4096;
const BLOCKS_PER_LU: u32 = 256;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    if args.luns == 0 {
        bail!("at least one logical unit is required");
    }
    let config = load_config(args.config.as_ref())?;
    let sim_config = SimConfig {
        transfer_slots: args.transfer_slots,
        num_lu: args.luns,
        blocks_per_lu: BLOCKS_PER_LU,
        block_size: BLOCK_SIZE,
        latency: Duration::from_micros(args.latency_us),
        auto_hibern8: true,
        ..SimConfig::default()
    };

    let sim_host = boot(config, sim_config).context("bring up simulated host")?;
    let host = &sim_host.host;
    let sim = &sim_host.sim;
    if let Some(info) = host.device_info() {
        info!(
            manufacturer = format_args!("{:#06x}", info.manufacturer_id),
            spec = format_args!("{:#06x}", info.spec_version),
            luns = info.num_lu,
            "device ready"
        );
    }

    let tally = Tally::default();
    let done = AtomicBool::new(false);
    let started = Instant::now();
    thread::scope(|s| {
        if !args.fault.is_empty() {
            s.spawn(|| {
                let interval = Duration::from_millis(args.fault_interval_ms.max(1));
                let mut round = 0usize;
                while !done.load(Ordering::Acquire) {
                    thread::sleep(interval);
                    let fault = args.fault[round % args.fault.len()];
                    round += 1;
                    debug!(?fault, "injecting fault");
                    match fault {
                        Fault::Fatal => sim.inject_fatal(DEVICE_FATAL_ERROR),
                        Fault::Nac => sim.inject_uic_error(UicErrorInjection::nac()),
                        Fault::PaError => sim.inject_uic_error(UicErrorInjection::pa_generic()),
                        Fault::TlError => sim.inject_uic_error(UicErrorInjection {
                            tl: 1,
                            ..UicErrorInjection::default()
                        }),
                        Fault::Desync => sim.inject_desync(args.transfer_slots.saturating_sub(2)),
                        Fault::AutoHibern8 => {
                            sim.raise_auto_hibern8(true, ufs_proto::PwrStatus::Busy)
                        }
                    }
                }
            });
        }

        let workers: Vec<_> = (0..args.threads)
            .map(|worker| {
                let tally = &tally;
                let args = &args;
                s.spawn(move || run_worker(host, args, worker, tally))
            })
            .collect();
        for worker in workers {
            if worker.join().is_err() {
                warn!("worker panicked");
            }
        }
        done.store(true, Ordering::Release);
    });

    if !wait_settled(host, Duration::from_secs(10)) {
        warn!(state = %host.state(), "host did not settle after the workload");
    }

    if let Some(level) = args.suspend {
        host.suspend(Some(level))
            .with_context(|| format!("suspend to level {level}"))?;
        info!(level, "suspended");
        host.resume().context("resume")?;
        info!("resumed");
    }

    let report = Report {
        state: host.state().to_string(),
        good: tally.good.load(Ordering::Relaxed),
        errors: tally.errors.load(Ordering::Relaxed),
        resubmitted: tally.resubmitted.load(Ordering::Relaxed),
        lost: tally.lost.load(Ordering::Relaxed),
        elapsed_ms: started.elapsed().as_millis(),
        stats: host.stats(),
        events: host
            .events()
            .summary()
            .into_iter()
            .map(|(kind, count)| EventCount {
                kind: format!("{kind:?}"),
                count,
            })
            .collect(),
    };
    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("serialize report")?
    );
    Ok(())
}

fn load_config(path: Option<&PathBuf>) -> Result<HostConfig> {
    let Some(path) = path else {
        return Ok(HostConfig::default());
    };
    let text = fs::read_to_string(path)
        .with_context(|| format!("read config {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parse config {}", path.display()))
}

fn run_worker(host: &UfsHost, args: &Args, worker: u32, tally: &Tally) {
    for i in 0..args.commands {
        let lun = ((worker + i) % args.luns as u32) as u8;
        let lba = (worker * args.commands + i) % BLOCKS_PER_LU;
        let cmd = if i % 2 == 0 {
            let data = vec![(worker as u8) ^ (i as u8); BLOCK_SIZE as usize];
            ScsiCommand::write10(lun, lba, data, BLOCK_SIZE)
        } else {
            ScsiCommand::read10(lun, lba, 1, BLOCK_SIZE)
        };
        run_command(host, &cmd, args.resubmits, tally);
    }
}

/// Execute `cmd`, resubmitting after recovery withdrew it or while the host is busy.
fn run_command(host: &UfsHost, cmd: &ScsiCommand, resubmits: u32, tally: &Tally) {
    let mut attempts = 0;
    loop {
        let outcome = host.execute(cmd);
        let retry = match &outcome {
            Ok(CommandResult::Good(_)) => {
                tally.good.fetch_add(1, Ordering::Relaxed);
                return;
            }
            Ok(CommandResult::Requeue | CommandResult::Timeout) => true,
            Ok(other) => {
                debug!(result = %other, "command failed");
                tally.errors.fetch_add(1, Ordering::Relaxed);
                return;
            }
            Err(UfsError::Busy(state)) => {
                // Recovery is running; wait for admission to reopen.
                debug!(%state, "host busy");
                thread::sleep(Duration::from_millis(1));
                continue;
            }
            Err(err) if err.is_retryable() => true,
            Err(err) => {
                warn!(%err, "command refused");
                tally.errors.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        if retry && attempts < resubmits {
            attempts += 1;
            tally.resubmitted.fetch_add(1, Ordering::Relaxed);
            continue;
        }
        tally.lost.fetch_add(1, Ordering::Relaxed);
        return;
    }
}

fn wait_settled(host: &UfsHost, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if host.state() == HostState::Operational && host.pending_errors().is_empty() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}
