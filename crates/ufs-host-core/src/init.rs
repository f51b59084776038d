//! Controller, link and device bring-up.

use crate::{
    dispatch::Admission,
    error::{UfsError, UfsResult},
    events::EventKind,
    host::Inner,
    link::{DevicePowerMode, LinkState, PowerModeInfo},
    uic::UicCommand,
    variant::{ChangeStage, HostQuirks},
};
use byteorder::{BigEndian, ByteOrder};
use serde::Serialize;
use std::{
    sync::{atomic::Ordering, Arc},
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, info, warn};
use ufs_proto::{
    ahit_from_micros,
    regs::{
        CONTROLLER_DISABLE, CONTROLLER_ENABLE, DEVICE_PRESENT, ENABLE_INTRS, LISTS_READY,
        REG_AUTO_HIBERNATE_IDLE_TIMER, REG_CONTROLLER_ENABLE, REG_CONTROLLER_STATUS,
        REG_UTP_TASK_REQ_LIST_RUN_STOP, REG_UTP_TRANSFER_REQ_LIST_RUN_STOP, UIC_COMMAND_COMPL,
        UTP_LIST_RUN,
    },
    upiu::{desc, flag},
    QueryOpcode, UicOpcode,
};

const DEVICE_INIT_POLL: Duration = Duration::from_millis(1);

/// Identity read from the device descriptor at bring-up.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub spec_version: u16,
    pub manufacturer_id: u16,
    pub num_lu: u8,
    pub queue_depth: u8,
}

impl DeviceInfo {
    pub fn parse(descriptor: &[u8]) -> UfsResult<Self> {
        if descriptor.len() <= desc::DEVICE_PARAM_Q_DPTH {
            return Err(UfsError::UnexpectedResponse("short device descriptor"));
        }
        let at = |offset: usize| BigEndian::read_u16(&descriptor[offset..offset + 2]);
        Ok(Self {
            spec_version: at(desc::DEVICE_PARAM_SPEC_VER),
            manufacturer_id: at(desc::DEVICE_PARAM_MANF_ID),
            num_lu: descriptor[desc::DEVICE_PARAM_NUM_LU],
            queue_depth: descriptor[desc::DEVICE_PARAM_Q_DPTH],
        })
    }
}

impl Inner {
    /// Enable the controller, stopping it first if it was running.
    pub(crate) fn hba_enable(&self) -> UfsResult<()> {
        if self.regs.read(REG_CONTROLLER_ENABLE) & CONTROLLER_ENABLE != 0 {
            self.hba_stop();
        }
        self.variant.hce_enable_notify(ChangeStage::Pre)?;
        let attempts = self.config.hce_retries.max(1);
        let mut enabled = false;
        for attempt in 1..=attempts {
            self.regs.write(REG_CONTROLLER_ENABLE, CONTROLLER_ENABLE);
            if self.regs.wait(
                REG_CONTROLLER_ENABLE,
                CONTROLLER_ENABLE,
                CONTROLLER_ENABLE,
                self.config.hce_timeout(),
            ) {
                enabled = true;
                break;
            }
            warn!(attempt, "controller enable did not latch");
        }
        if !enabled {
            return Err(UfsError::ControllerEnable);
        }
        self.variant.hce_enable_notify(ChangeStage::Post)?;
        self.regs.enable_interrupts(UIC_COMMAND_COMPL);
        debug!("controller enabled");
        Ok(())
    }

    /// Disable the controller. Pending doorbells are dropped by the hardware.
    pub(crate) fn hba_stop(&self) {
        self.regs.write(REG_CONTROLLER_ENABLE, CONTROLLER_DISABLE);
        if !self.regs.wait(
            REG_CONTROLLER_ENABLE,
            CONTROLLER_ENABLE,
            0,
            self.config.hce_timeout(),
        ) {
            warn!("controller did not report disabled");
        }
        let mut link = self.link.lock();
        link.link = LinkState::Off;
        link.power = None;
    }

    pub(crate) fn link_startup(&self) -> UfsResult<()> {
        let attempts = self.config.link_startup_retries.max(1);
        for attempt in 1..=attempts {
            self.variant.link_startup_notify(ChangeStage::Pre)?;
            let result = self.send_uic(UicCommand::new(UicOpcode::DmeLinkStartup));
            let present = self.regs.read(REG_CONTROLLER_STATUS) & DEVICE_PRESENT != 0;
            match result {
                Ok(_) if present => {
                    self.variant.link_startup_notify(ChangeStage::Post)?;
                    self.link.lock().link = LinkState::Active;
                    info!(attempt, "link started");
                    return Ok(());
                }
                Ok(_) => warn!(attempt, "link up but no device present"),
                Err(err) => warn!(attempt, %err, "link startup failed"),
            }
            self.events.record(EventKind::LinkStartupFail, attempt);
            if attempt < attempts {
                // A failed startup leaves the controller in an unknown state.
                self.hba_enable()?;
            }
        }
        Err(UfsError::LinkStartup { attempts })
    }

    /// Unmask interrupts, hand over the request lists and start them.
    pub(crate) fn make_operational(&self) -> UfsResult<()> {
        self.regs.enable_interrupts(ENABLE_INTRS);
        self.regs.bind_request_lists(Arc::clone(&self.lists));
        if self.regs.read(REG_CONTROLLER_STATUS) & LISTS_READY != LISTS_READY {
            warn!("request lists not ready");
            return Err(UfsError::ListsNotReady);
        }
        self.regs.write(REG_UTP_TRANSFER_REQ_LIST_RUN_STOP, UTP_LIST_RUN);
        self.regs.write(REG_UTP_TASK_REQ_LIST_RUN_STOP, UTP_LIST_RUN);
        Ok(())
    }

    /// Set `fDeviceInit` and wait for the device to clear it.
    fn complete_dev_init(&self) -> UfsResult<()> {
        self.query_flag(QueryOpcode::SetFlag, flag::DEVICE_INIT, Admission::Recovery)?;
        let timeout = self.config.device_init_timeout();
        let deadline = Instant::now() + timeout;
        loop {
            if !self.query_flag(QueryOpcode::ReadFlag, flag::DEVICE_INIT, Admission::Recovery)? {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(UfsError::Timeout {
                    what: "device init",
                    timeout,
                });
            }
            thread::sleep(DEVICE_INIT_POLL);
        }
    }

    fn read_device_info(&self) -> UfsResult<DeviceInfo> {
        let descriptor = self.read_descriptor(
            desc::DEVICE,
            0,
            0,
            desc::DEVICE_DESC_LEN as u16,
            Admission::Recovery,
        )?;
        DeviceInfo::parse(&descriptor)
    }

    /// Program the auto-hibernate idle timer when the controller supports it.
    fn config_auto_hibern8(&self) {
        let idle_us = self.config.auto_hibern8_idle_us;
        let usable = self.caps.auto_hibern8()
            && !self
                .variant
                .quirks()
                .contains(HostQuirks::BROKEN_AUTO_HIBERN8);
        if !usable || idle_us == 0 {
            self.auto_hibern8_enabled.store(false, Ordering::Release);
            return;
        }
        self.regs
            .write(REG_AUTO_HIBERNATE_IDLE_TIMER, ahit_from_micros(idle_us));
        self.auto_hibern8_enabled.store(true, Ordering::Release);
        debug!(idle_us, "auto-hibernate enabled");
    }

    /// Full bring-up: controller, link, device, then the last requested power mode.
    pub(crate) fn probe_hba(&self) -> UfsResult<()> {
        self.auto_hibern8_enabled.store(false, Ordering::Release);
        self.hba_enable()?;
        self.link_startup()?;
        self.make_operational()?;
        self.nop_out(Admission::Recovery)?;
        self.complete_dev_init()?;

        let info = self.read_device_info()?;
        info!(
            spec_version = format_args!("{:#06x}", info.spec_version),
            manufacturer = format_args!("{:#06x}", info.manufacturer_id),
            num_lu = info.num_lu,
            queue_depth = info.queue_depth,
            "device ready"
        );
        *self.device_info.lock() = Some(info);

        let desired = {
            let mut link = self.link.lock();
            link.device = DevicePowerMode::Active;
            link.power = None;
            link.requested
                .unwrap_or_else(|| PowerModeInfo::from_config(&self.config.power_mode))
        };
        self.change_power_mode(desired)?;
        self.config_auto_hibern8();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_descriptor_fields() {
        let mut descriptor = vec![0u8; desc::DEVICE_DESC_LEN];
        descriptor[desc::DEVICE_PARAM_NUM_LU] = 4;
        descriptor[desc::DEVICE_PARAM_SPEC_VER..desc::DEVICE_PARAM_SPEC_VER + 2]
            .copy_from_slice(&[0x03, 0x10]);
        descriptor[desc::DEVICE_PARAM_MANF_ID..desc::DEVICE_PARAM_MANF_ID + 2]
            .copy_from_slice(&[0x01, 0xCE]);
        descriptor[desc::DEVICE_PARAM_Q_DPTH] = 32;
        let info = DeviceInfo::parse(&descriptor).unwrap();
        assert_eq!(info.spec_version, 0x0310);
        assert_eq!(info.manufacturer_id, 0x01CE);
        assert_eq!(info.num_lu, 4);
        assert_eq!(info.queue_depth, 32);
    }

    #[test]
    fn short_descriptor_rejected() {
        assert!(DeviceInfo::parse(&[0u8; 16]).is_err());
    }
}
