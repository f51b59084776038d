use serde::Deserialize;
use std::time::Duration;
use ufs_proto::{HsRate, PowerMode};

/// Tunables for one host instance. Every field has a default, so a config file only needs
/// the values it wants to override.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HostConfig {
    /// Timeout for each NOP OUT liveness probe.
    pub nop_out_timeout_ms: u64,
    pub nop_out_retries: u32,
    /// Timeout for each query request attempt.
    pub query_timeout_ms: u64,
    pub query_retries: u32,
    /// Timeout applied by synchronous SCSI command execution.
    pub command_timeout_ms: u64,
    /// Consecutive command timeouts that escalate to the error handler.
    pub timeout_escalation_threshold: u32,
    pub uic_timeout_ms: u64,
    pub task_timeout_ms: u64,
    /// How long to wait for a cleared doorbell bit to drop.
    pub clear_timeout_ms: u64,
    pub hce_timeout_ms: u64,
    pub hce_retries: u32,
    pub link_startup_retries: u32,
    pub power_change_retries: u32,
    pub hibern8_enter_retries: u32,
    pub host_reset_retries: u32,
    /// Upper bound for `fDeviceInit` to clear after it was set.
    pub device_init_timeout_ms: u64,
    /// Idle time before the controller enters hibernate by itself. Zero leaves it disabled.
    pub auto_hibern8_idle_us: u32,
    /// Power management level used by `suspend` when the caller does not pick one.
    pub suspend_level: u8,
    pub clock_gating: ClockGatingConfig,
    pub transient_link_error: TransientLinkErrorPolicy,
    pub power_mode: PowerModeConfig,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            nop_out_timeout_ms: 50,
            nop_out_retries: 5,
            query_timeout_ms: 1500,
            query_retries: 3,
            command_timeout_ms: 10_000,
            timeout_escalation_threshold: 3,
            uic_timeout_ms: 500,
            task_timeout_ms: 100,
            clear_timeout_ms: 1000,
            hce_timeout_ms: 10,
            hce_retries: 3,
            link_startup_retries: 3,
            power_change_retries: 3,
            hibern8_enter_retries: 3,
            host_reset_retries: 5,
            device_init_timeout_ms: 1500,
            auto_hibern8_idle_us: 0,
            suspend_level: 3,
            clock_gating: ClockGatingConfig::default(),
            transient_link_error: TransientLinkErrorPolicy::default(),
            power_mode: PowerModeConfig::default(),
        }
    }
}

impl HostConfig {
    pub fn nop_out_timeout(&self) -> Duration {
        Duration::from_millis(self.nop_out_timeout_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn uic_timeout(&self) -> Duration {
        Duration::from_millis(self.uic_timeout_ms)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    pub fn clear_timeout(&self) -> Duration {
        Duration::from_millis(self.clear_timeout_ms)
    }

    pub fn hce_timeout(&self) -> Duration {
        Duration::from_millis(self.hce_timeout_ms)
    }

    pub fn device_init_timeout(&self) -> Duration {
        Duration::from_millis(self.device_init_timeout_ms)
    }
}

/// Clock gating policy.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClockGatingConfig {
    pub enabled: bool,
    /// Debounce window between the last release and gating.
    pub delay_ms: u64,
    /// Put the link into hibernate before turning clocks off.
    pub hibern8_on_gate: bool,
}

impl Default for ClockGatingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            delay_ms: 150,
            hibern8_on_gate: true,
        }
    }
}

impl ClockGatingConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

/// Handling of NAC-received data link errors that some devices report transiently.
///
/// When enabled, the error handler waits `settle_ms`, probes the device with a NOP OUT and,
/// if the probe answers and nothing else went wrong meanwhile, drops the error without a reset.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TransientLinkErrorPolicy {
    pub enabled: bool,
    pub settle_ms: u64,
    pub probe_retries: u32,
}

impl Default for TransientLinkErrorPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            settle_ms: 50,
            probe_retries: 1,
        }
    }
}

impl TransientLinkErrorPolicy {
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LinkMode {
    Fast,
    Slow,
    FastAuto,
    SlowAuto,
}

impl From<LinkMode> for PowerMode {
    fn from(mode: LinkMode) -> Self {
        match mode {
            LinkMode::Fast => PowerMode::Fast,
            LinkMode::Slow => PowerMode::Slow,
            LinkMode::FastAuto => PowerMode::FastAuto,
            LinkMode::SlowAuto => PowerMode::SlowAuto,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HsSeries {
    A,
    B,
}

impl From<HsSeries> for HsRate {
    fn from(series: HsSeries) -> Self {
        match series {
            HsSeries::A => HsRate::A,
            HsSeries::B => HsRate::B,
        }
    }
}

/// Target link power mode negotiated after bring-up and restored after every reset.
/// Gear and lane counts are upper bounds; the link settles on what both ends support.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PowerModeConfig {
    pub gear: u8,
    pub lanes: u8,
    pub mode: LinkMode,
    pub hs_series: HsSeries,
}

impl Default for PowerModeConfig {
    fn default() -> Self {
        Self {
            gear: 4,
            lanes: 2,
            mode: LinkMode::Fast,
            hs_series: HsSeries::B,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg: HostConfig = serde_json::from_str(
            r#"{ "uic_timeout_ms": 20, "clock_gating": { "delay_ms": 5 },
                 "power_mode": { "mode": "slow_auto", "gear": 1 } }"#,
        )
        .unwrap();
        assert_eq!(cfg.uic_timeout(), Duration::from_millis(20));
        assert_eq!(cfg.clock_gating.delay(), Duration::from_millis(5));
        assert!(cfg.clock_gating.enabled);
        assert_eq!(cfg.power_mode.mode, LinkMode::SlowAuto);
        assert_eq!(cfg.power_mode.lanes, 2);
        assert_eq!(cfg.host_reset_retries, 5);
    }

    #[test]
    fn link_mode_maps_to_power_mode() {
        assert_eq!(PowerMode::from(LinkMode::FastAuto), PowerMode::FastAuto);
        assert_eq!(HsRate::from(HsSeries::A), HsRate::A);
    }
}
