//! Link power: gear and power mode negotiation, hibernate enter/exit, DME attribute access.

use crate::{
    config::PowerModeConfig,
    error::{UfsError, UfsResult},
    events::EventKind,
    host::Inner,
    uic::UicCommand,
    variant::ChangeStage,
};
use std::fmt;
use tracing::{debug, info, warn};
use ufs_proto::{
    mib,
    uic::{
        DL_AFC0_REQ_TIMEOUT_DEFAULT, DL_AFC1_REQ_TIMEOUT_DEFAULT, DL_FC0_PROTECTION_TIMEOUT_DEFAULT,
        DL_FC1_PROTECTION_TIMEOUT_DEFAULT, DL_TC0_REPLAY_TIMEOUT_DEFAULT,
        DL_TC1_REPLAY_TIMEOUT_DEFAULT, DME_LOCAL_AFC0_REQ_TIMEOUT_VAL,
        DME_LOCAL_FC0_PROTECTION_TIMEOUT_VAL, DME_LOCAL_TC0_REPLAY_TIMEOUT_VAL,
        PA_ACTIVERXDATALANES, PA_ACTIVETXDATALANES, PA_CONNECTEDRXDATALANES,
        PA_CONNECTEDTXDATALANES, PA_HSSERIES, PA_MAXRXHSGEAR, PA_MAXRXPWMGEAR, PA_PWRMODE,
        PA_PWRMODEUSERDATA0, PA_PWRMODEUSERDATA1, PA_PWRMODEUSERDATA2, PA_PWRMODEUSERDATA3,
        PA_PWRMODEUSERDATA4, PA_PWRMODEUSERDATA5, PA_RXGEAR, PA_RXTERMINATION, PA_TXGEAR,
        PA_TXTERMINATION,
    },
    pa_pwrmode_value, HsRate, PowerMode, PwrStatus, UicOpcode,
};

/// Peer DME accesses cross the link and may transiently fail.
const DME_PEER_RETRIES: u32 = 3;

/// UniPro link state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkState {
    Active,
    Hibern8,
    Off,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LinkState::Active => "active",
            LinkState::Hibern8 => "hibern8",
            LinkState::Off => "off",
        })
    }
}

/// Device power mode, set through START STOP UNIT.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DevicePowerMode {
    Active,
    Sleep,
    PowerDown,
}

impl fmt::Display for DevicePowerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DevicePowerMode::Active => "active",
            DevicePowerMode::Sleep => "sleep",
            DevicePowerMode::PowerDown => "power_down",
        })
    }
}

/// Gear, lanes and power mode for each direction of the link.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PowerModeInfo {
    pub gear_rx: u8,
    pub gear_tx: u8,
    pub lane_rx: u8,
    pub lane_tx: u8,
    pub pwr_rx: PowerMode,
    pub pwr_tx: PowerMode,
    pub hs_rate: HsRate,
}

impl PowerModeInfo {
    pub fn from_config(cfg: &PowerModeConfig) -> Self {
        let mode = PowerMode::from(cfg.mode);
        Self {
            gear_rx: cfg.gear,
            gear_tx: cfg.gear,
            lane_rx: cfg.lanes,
            lane_tx: cfg.lanes,
            pwr_rx: mode,
            pwr_tx: mode,
            hs_rate: cfg.hs_series.into(),
        }
    }

    fn is_fast(&self) -> bool {
        self.pwr_rx.is_fast() || self.pwr_tx.is_fast()
    }
}

impl fmt::Display for PowerModeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rx {:?} g{} x{}, tx {:?} g{} x{}, rate {:?}",
            self.pwr_rx,
            self.gear_rx,
            self.lane_rx,
            self.pwr_tx,
            self.gear_tx,
            self.lane_tx,
            self.hs_rate
        )
    }
}

/// Snapshot of link and device power.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LinkStatus {
    pub link: LinkState,
    pub device: DevicePowerMode,
    /// Power mode the link is running at, once one was applied.
    pub power: Option<PowerModeInfo>,
    /// Last power mode asked for. Restored after every reset.
    pub requested: Option<PowerModeInfo>,
}

impl Default for LinkStatus {
    fn default() -> Self {
        Self {
            link: LinkState::Off,
            device: DevicePowerMode::Active,
            power: None,
            requested: None,
        }
    }
}

fn clamp(want: u8, cap: u32) -> u8 {
    (want as u32).min(cap) as u8
}

impl Inner {
    pub(crate) fn dme_get(&self, attr_sel: u32) -> UfsResult<u32> {
        self.send_uic(UicCommand::dme_get(attr_sel))
    }

    pub(crate) fn dme_set(&self, attr_sel: u32, value: u32) -> UfsResult<()> {
        self.send_uic(UicCommand::dme_set(attr_sel, value)).map(|_| ())
    }

    pub(crate) fn dme_peer_get(&self, attr_sel: u32) -> UfsResult<u32> {
        self.dme_peer(UicCommand::dme_peer_get(attr_sel))
    }

    pub(crate) fn dme_peer_set(&self, attr_sel: u32, value: u32) -> UfsResult<()> {
        self.dme_peer(UicCommand::dme_peer_set(attr_sel, value))
            .map(|_| ())
    }

    fn dme_peer(&self, cmd: UicCommand) -> UfsResult<u32> {
        let mut attempt = 1;
        loop {
            match self.send_uic(cmd) {
                Ok(value) => return Ok(value),
                Err(err) if attempt < DME_PEER_RETRIES => {
                    debug!(attempt, %err, attr = cmd.arg1 >> 16, "peer dme access failed, retrying");
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Move the link to `desired`, or to the closest mode both ends support. A request for
    /// the mode already in effect issues no UIC traffic.
    pub(crate) fn change_power_mode(&self, desired: PowerModeInfo) -> UfsResult<()> {
        {
            let link = self.link.lock();
            if link.requested == Some(desired) && link.power.is_some() {
                debug!(%desired, "power mode already in effect");
                return Ok(());
            }
        }
        let negotiated = self.negotiate_power_mode(&desired)?;
        let attempts = self.config.power_change_retries.max(1);
        let mut attempt = 1;
        loop {
            match self.apply_power_mode(&negotiated) {
                Ok(()) => break,
                Err(err) if attempt < attempts => {
                    warn!(attempt, %err, "power mode change failed, retrying");
                    attempt += 1;
                }
                Err(err) => {
                    warn!(attempts, %err, "power mode change failed");
                    self.events.record(EventKind::PowerChangeFail, attempts);
                    return Err(err);
                }
            }
        }
        let mut link = self.link.lock();
        link.requested = Some(desired);
        link.power = Some(negotiated);
        info!(power = %negotiated, "power mode changed");
        Ok(())
    }

    fn negotiate_power_mode(&self, desired: &PowerModeInfo) -> UfsResult<PowerModeInfo> {
        let lanes_rx = self.dme_get(mib(PA_CONNECTEDRXDATALANES))?;
        let lanes_tx = self.dme_get(mib(PA_CONNECTEDTXDATALANES))?;
        if lanes_rx == 0 || lanes_tx == 0 {
            return Err(UfsError::UnexpectedResponse("no connected data lanes"));
        }
        let max_gear_attr = if desired.is_fast() {
            PA_MAXRXHSGEAR
        } else {
            PA_MAXRXPWMGEAR
        };
        let local_rx_gear = self.dme_get(mib(max_gear_attr))?;
        // The peer's receive capability bounds what we transmit.
        let peer_rx_gear = self.dme_peer_get(mib(max_gear_attr))?;
        let negotiated = PowerModeInfo {
            gear_rx: clamp(desired.gear_rx, local_rx_gear),
            gear_tx: clamp(desired.gear_tx, peer_rx_gear),
            lane_rx: clamp(desired.lane_rx, lanes_rx),
            lane_tx: clamp(desired.lane_tx, lanes_tx),
            ..*desired
        };
        if negotiated.gear_rx == 0 || negotiated.gear_tx == 0 {
            return Err(UfsError::UnexpectedResponse("no usable gear"));
        }
        debug!(%desired, %negotiated, "power mode negotiated");
        Ok(negotiated)
    }

    fn apply_power_mode(&self, info: &PowerModeInfo) -> UfsResult<()> {
        self.dme_set(mib(PA_RXGEAR), info.gear_rx as u32)?;
        self.dme_set(mib(PA_ACTIVERXDATALANES), info.lane_rx as u32)?;
        self.dme_set(mib(PA_RXTERMINATION), info.pwr_rx.is_fast() as u32)?;
        self.dme_set(mib(PA_TXGEAR), info.gear_tx as u32)?;
        self.dme_set(mib(PA_ACTIVETXDATALANES), info.lane_tx as u32)?;
        self.dme_set(mib(PA_TXTERMINATION), info.pwr_tx.is_fast() as u32)?;
        if info.is_fast() {
            self.dme_set(mib(PA_HSSERIES), info.hs_rate as u32)?;
        }

        for (attr, value) in [
            (PA_PWRMODEUSERDATA0, DL_FC0_PROTECTION_TIMEOUT_DEFAULT),
            (PA_PWRMODEUSERDATA1, DL_TC0_REPLAY_TIMEOUT_DEFAULT),
            (PA_PWRMODEUSERDATA2, DL_AFC0_REQ_TIMEOUT_DEFAULT),
            (PA_PWRMODEUSERDATA3, DL_FC1_PROTECTION_TIMEOUT_DEFAULT),
            (PA_PWRMODEUSERDATA4, DL_TC1_REPLAY_TIMEOUT_DEFAULT),
            (PA_PWRMODEUSERDATA5, DL_AFC1_REQ_TIMEOUT_DEFAULT),
            (DME_LOCAL_FC0_PROTECTION_TIMEOUT_VAL, DL_FC0_PROTECTION_TIMEOUT_DEFAULT),
            (DME_LOCAL_TC0_REPLAY_TIMEOUT_VAL, DL_TC0_REPLAY_TIMEOUT_DEFAULT),
            (DME_LOCAL_AFC0_REQ_TIMEOUT_VAL, DL_AFC0_REQ_TIMEOUT_DEFAULT),
        ] {
            self.dme_set(mib(attr), value)?;
        }

        self.variant.pwr_change_notify(ChangeStage::Pre, info)?;
        let status = self.send_uic_power(UicCommand::dme_set(
            mib(PA_PWRMODE),
            pa_pwrmode_value(info.pwr_rx, info.pwr_tx),
        ))?;
        if status != PwrStatus::Local {
            return Err(UfsError::PowerChange(status));
        }
        self.variant.pwr_change_notify(ChangeStage::Post, info)
    }

    pub(crate) fn hibern8_enter(&self) -> UfsResult<()> {
        let attempts = self.config.hibern8_enter_retries.max(1);
        let mut attempt = 1;
        loop {
            self.variant.hibern8_notify(true, ChangeStage::Pre);
            let err = match self.send_uic_power(UicCommand::new(UicOpcode::DmeHibernEnter)) {
                Ok(PwrStatus::Local) => {
                    self.variant.hibern8_notify(true, ChangeStage::Post);
                    self.link.lock().link = LinkState::Hibern8;
                    self.stats.hibern8_entered();
                    debug!("link entered hibern8");
                    return Ok(());
                }
                Ok(status) => UfsError::PowerChange(status),
                Err(err) => err,
            };
            if attempt >= attempts {
                warn!(attempts, %err, "hibern8 enter failed");
                self.events.record(EventKind::Hibern8EnterFail, attempts);
                self.report_fault(|errors| errors.link_broken = true);
                return Err(err);
            }
            debug!(attempt, %err, "hibern8 enter failed, retrying");
            attempt += 1;
        }
    }

    pub(crate) fn hibern8_exit(&self) -> UfsResult<()> {
        self.variant.hibern8_notify(false, ChangeStage::Pre);
        let err = match self.send_uic_power(UicCommand::new(UicOpcode::DmeHibernExit)) {
            Ok(PwrStatus::Local) => {
                self.variant.hibern8_notify(false, ChangeStage::Post);
                self.link.lock().link = LinkState::Active;
                self.stats.hibern8_exited();
                debug!("link left hibern8");
                return Ok(());
            }
            Ok(status) => UfsError::PowerChange(status),
            Err(err) => err,
        };
        warn!(%err, "hibern8 exit failed");
        self.events.record(EventKind::Hibern8ExitFail, 1);
        self.report_fault(|errors| errors.link_broken = true);
        Err(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HsSeries, LinkMode};

    #[test]
    fn config_applies_to_both_directions() {
        let cfg = PowerModeConfig {
            gear: 3,
            lanes: 1,
            mode: LinkMode::SlowAuto,
            hs_series: HsSeries::A,
        };
        let info = PowerModeInfo::from_config(&cfg);
        assert_eq!((info.gear_rx, info.gear_tx), (3, 3));
        assert_eq!((info.lane_rx, info.lane_tx), (1, 1));
        assert_eq!(info.pwr_rx, PowerMode::SlowAuto);
        assert!(!info.is_fast());
        assert_eq!(info.hs_rate, HsRate::A);
    }

    #[test]
    fn clamp_saturates_to_capability() {
        assert_eq!(clamp(4, 3), 3);
        assert_eq!(clamp(2, 300), 2);
        assert_eq!(clamp(4, 0), 0);
    }
}
