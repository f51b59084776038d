//! Suspend and resume across power management levels.

use crate::{
    command::{CommandResult, ScsiCommand},
    dispatch::Admission,
    error::{UfsError, UfsResult},
    events::EventKind,
    host::Inner,
    link::{DevicePowerMode, LinkState},
};
use std::time::Instant;
use tracing::{debug, info, warn};
use ufs_proto::upiu::scsi;

/// Deepest power management level.
pub const MAX_PM_LEVEL: u8 = 5;

/// Device power mode and link state for a power management level.
pub fn pm_level_target(level: u8) -> Option<(DevicePowerMode, LinkState)> {
    use DevicePowerMode::*;
    Some(match level {
        0 => (Active, LinkState::Active),
        1 => (Active, LinkState::Hibern8),
        2 => (Sleep, LinkState::Active),
        3 => (Sleep, LinkState::Hibern8),
        4 => (PowerDown, LinkState::Hibern8),
        5 => (PowerDown, LinkState::Off),
        _ => return None,
    })
}

fn power_condition(mode: DevicePowerMode) -> u8 {
    match mode {
        DevicePowerMode::Active => scsi::POWER_CONDITION_ACTIVE,
        DevicePowerMode::Sleep => scsi::POWER_CONDITION_SLEEP,
        DevicePowerMode::PowerDown => scsi::POWER_CONDITION_POWERDOWN,
    }
}

impl Inner {
    fn set_device_power_mode(&self, mode: DevicePowerMode) -> UfsResult<()> {
        let cmd = ScsiCommand::start_stop_unit(power_condition(mode));
        match self.execute_scsi(&cmd, self.config.command_timeout(), Admission::Recovery)? {
            CommandResult::Good(_) => {
                self.link.lock().device = mode;
                debug!(%mode, "device power mode set");
                Ok(())
            }
            other => {
                warn!(%mode, result = %other, "start stop unit failed");
                Err(UfsError::UnexpectedResponse("start stop unit"))
            }
        }
    }

    /// Close admission, wait for in-flight work and put device and link into the level's
    /// low power states. On failure the host is left operational and unsuspended.
    pub(crate) fn suspend(&self, level: u8) -> UfsResult<()> {
        let (device, link) =
            pm_level_target(level).ok_or(UfsError::InvalidArgument("power management level"))?;
        {
            let mut core = self.core.lock();
            self.admit(&core, Admission::Normal)?;
            core.suspended = Some(level);
            let drain = self.config.command_timeout();
            let deadline = Instant::now() + drain;
            while core.outstanding != 0 || core.tm_outstanding != 0 {
                if self.core_cv.wait_until(&mut core, deadline).timed_out() {
                    break;
                }
            }
            if core.outstanding != 0 || core.tm_outstanding != 0 {
                core.suspended = None;
                warn!(level, "in-flight commands did not drain, suspend abandoned");
                self.events.record(EventKind::SuspendFail, level as u32);
                return Err(UfsError::Timeout {
                    what: "suspend drain",
                    timeout: drain,
                });
            }
        }

        let _hold = self.hold_clocks();
        match self.enter_low_power(device, link) {
            Ok(()) => {
                info!(level, %device, %link, "suspended");
                Ok(())
            }
            Err(err) => {
                warn!(level, %err, "suspend failed");
                self.events.record(EventKind::SuspendFail, level as u32);
                self.core.lock().suspended = None;
                Err(err)
            }
        }
    }

    fn enter_low_power(&self, device: DevicePowerMode, link: LinkState) -> UfsResult<()> {
        if device != DevicePowerMode::Active {
            self.set_device_power_mode(device)?;
        }
        let result = match link {
            LinkState::Active => Ok(()),
            LinkState::Hibern8 => self.hibern8_enter(),
            LinkState::Off => {
                self.hba_stop();
                Ok(())
            }
        };
        if result.is_err() && device != DevicePowerMode::Active {
            if let Err(err) = self.set_device_power_mode(DevicePowerMode::Active) {
                warn!(%err, "could not restore device power mode");
            }
        }
        result
    }

    /// Leave the suspended level. A link that was turned off, or that will not leave
    /// hibernate, is brought back by a full reset.
    pub(crate) fn resume(&self) -> UfsResult<()> {
        let Some(level) = self.core.lock().suspended else {
            return Ok(());
        };
        let Some((_, link)) = pm_level_target(level) else {
            return Err(UfsError::InvalidArgument("power management level"));
        };
        let _hold = self.hold_clocks();
        let result = match link {
            LinkState::Active => Ok(()),
            LinkState::Hibern8 => match self.hibern8_exit() {
                Ok(()) => Ok(()),
                Err(err) => {
                    warn!(%err, "hibern8 exit on resume failed, resetting");
                    self.resume_by_reset()
                }
            },
            LinkState::Off => self.resume_by_reset(),
        };
        let result = result.and_then(|()| {
            if self.link.lock().device != DevicePowerMode::Active {
                self.set_device_power_mode(DevicePowerMode::Active)
            } else {
                Ok(())
            }
        });
        match &result {
            Ok(()) => {
                self.core.lock().suspended = None;
                info!(level, "resumed");
            }
            Err(err) => {
                warn!(level, %err, "resume failed");
                self.events.record(EventKind::ResumeFail, level as u32);
            }
        }
        result
    }

    fn resume_by_reset(&self) -> UfsResult<()> {
        let mut core = self.core.lock();
        core.suspended = None;
        self.request_reset(&mut core)?;
        let generation = core.eh_generation;
        self.wait_for_recovery(core, generation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_map_to_targets() {
        assert_eq!(
            pm_level_target(0),
            Some((DevicePowerMode::Active, LinkState::Active))
        );
        assert_eq!(
            pm_level_target(3),
            Some((DevicePowerMode::Sleep, LinkState::Hibern8))
        );
        assert_eq!(
            pm_level_target(MAX_PM_LEVEL),
            Some((DevicePowerMode::PowerDown, LinkState::Off))
        );
        assert_eq!(pm_level_target(6), None);
    }

    #[test]
    fn start_stop_power_conditions() {
        assert_eq!(power_condition(DevicePowerMode::Sleep), 2);
        assert_eq!(power_condition(DevicePowerMode::PowerDown), 3);
    }
}
