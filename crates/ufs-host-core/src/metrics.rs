use metrics::{counter, gauge, histogram};
use serde::Serialize;
use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

#[derive(Default)]
struct Stat {
    count: AtomicU64,
    total_ns: AtomicU64,
    max_ns: AtomicU64,
}

impl Stat {
    fn observe(&self, dur: Duration) {
        let ns = dur.as_nanos().min(u64::MAX as u128) as u64;
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_ns.fetch_add(ns, Ordering::Relaxed);
        self.max_ns.fetch_max(ns, Ordering::Relaxed);
    }

    fn snapshot(&self) -> LatencySnapshot {
        let count = self.count.load(Ordering::Relaxed);
        let total_ns = self.total_ns.load(Ordering::Relaxed);
        let avg_ns = if count == 0 {
            0.0
        } else {
            total_ns as f64 / count as f64
        };
        LatencySnapshot {
            count,
            avg_ns,
            max_ns: self.max_ns.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct LatencySnapshot {
    pub count: u64,
    pub avg_ns: f64,
    pub max_ns: u64,
}

/// Per-host counters. Every update is also forwarded to the `metrics` facade.
#[derive(Default)]
pub struct HostStats {
    issued: AtomicU64,
    dev_cmds: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    timeouts: AtomicU64,
    aborts: AtomicU64,
    requeued: AtomicU64,
    uic_errors: AtomicU64,
    resets: AtomicU64,
    gates: AtomicU64,
    ungates: AtomicU64,
    hibern8_enters: AtomicU64,
    hibern8_exits: AtomicU64,
    max_queue_depth: AtomicU64,
    latency: Stat,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct StatsSnapshot {
    /// SCSI transfers issued. The lifecycle counters below cover these only.
    pub issued: u64,
    /// NOP and query requests on the device management slot.
    pub dev_cmds: u64,
    pub completed: u64,
    pub failed: u64,
    pub timeouts: u64,
    pub aborts: u64,
    pub requeued: u64,
    pub uic_errors: u64,
    pub resets: u64,
    pub gates: u64,
    pub ungates: u64,
    pub hibern8_enters: u64,
    pub hibern8_exits: u64,
    pub max_queue_depth: u64,
    pub latency: LatencySnapshot,
}

impl HostStats {
    pub(crate) fn command_issued(&self, outstanding: u32) {
        counter!("ufs_commands_issued").increment(1);
        let depth = outstanding.count_ones() as u64;
        gauge!("ufs_outstanding").set(depth as f64);
        self.issued.fetch_add(1, Ordering::Relaxed);
        self.max_queue_depth.fetch_max(depth, Ordering::Relaxed);
    }

    pub(crate) fn dev_cmd_issued(&self) {
        counter!("ufs_dev_cmds_issued").increment(1);
        self.dev_cmds.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn command_completed(&self, latency: Duration) {
        counter!("ufs_commands_completed").increment(1);
        histogram!("ufs_command_latency_ns").record(latency.as_nanos() as f64);
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.latency.observe(latency);
    }

    pub(crate) fn command_failed(&self) {
        counter!("ufs_commands_failed").increment(1);
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn command_timeout(&self) {
        counter!("ufs_command_timeouts").increment(1);
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn command_aborted(&self) {
        counter!("ufs_command_aborts").increment(1);
        self.aborts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn command_requeued(&self) {
        counter!("ufs_command_requeues").increment(1);
        self.requeued.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn uic_error(&self) {
        counter!("ufs_uic_errors").increment(1);
        self.uic_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn host_reset(&self) {
        counter!("ufs_host_resets").increment(1);
        self.resets.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn clocks_gated(&self) {
        counter!("ufs_clock_gates").increment(1);
        self.gates.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn clocks_ungated(&self) {
        counter!("ufs_clock_ungates").increment(1);
        self.ungates.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn hibern8_entered(&self) {
        counter!("ufs_hibern8_enter").increment(1);
        self.hibern8_enters.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn hibern8_exited(&self) {
        counter!("ufs_hibern8_exit").increment(1);
        self.hibern8_exits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            issued: self.issued.load(Ordering::Relaxed),
            dev_cmds: self.dev_cmds.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            aborts: self.aborts.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            uic_errors: self.uic_errors.load(Ordering::Relaxed),
            resets: self.resets.load(Ordering::Relaxed),
            gates: self.gates.load(Ordering::Relaxed),
            ungates: self.ungates.load(Ordering::Relaxed),
            hibern8_enters: self.hibern8_enters.load(Ordering::Relaxed),
            hibern8_exits: self.hibern8_exits.load(Ordering::Relaxed),
            max_queue_depth: self.max_queue_depth.load(Ordering::Relaxed),
            latency: self.latency.snapshot(),
        }
    }
}
