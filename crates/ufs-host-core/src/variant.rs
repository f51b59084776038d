//! Platform variant hooks injected at host construction.

use crate::{error::UfsResult, link::PowerModeInfo};
use bitflags::bitflags;

/// Which side of a transition a notification is for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeStage {
    Pre,
    Post,
}

bitflags! {
    /// Controller deviations from UFSHCI that the core works around.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct HostQuirks: u32 {
        /// The auto-hibernate timer must not be programmed.
        const BROKEN_AUTO_HIBERN8 = 1 << 0;
        /// Controller needs a short pause before each UIC command.
        const DELAY_BEFORE_DME_CMDS = 1 << 1;
        /// Clock gating must not put the link into hibernate.
        const NO_HIBERN8_ON_GATE = 1 << 2;
    }
}

/// Platform specific behaviour around the generic UFSHCI sequences.
///
/// Every hook has a no-op default so a variant only overrides what its platform needs.
pub trait UfsVariant: Send + Sync {
    fn name(&self) -> &str {
        "generic"
    }

    fn quirks(&self) -> HostQuirks {
        HostQuirks::empty()
    }

    fn hce_enable_notify(&self, _stage: ChangeStage) -> UfsResult<()> {
        Ok(())
    }

    fn link_startup_notify(&self, _stage: ChangeStage) -> UfsResult<()> {
        Ok(())
    }

    /// Called around a power mode change. `desired` is what the core is about to request.
    fn pwr_change_notify(&self, _stage: ChangeStage, _desired: &PowerModeInfo) -> UfsResult<()> {
        Ok(())
    }

    fn hibern8_notify(&self, _enter: bool, _stage: ChangeStage) {}

    /// Turn the controller's clocks on or off.
    fn setup_clocks(&self, _on: bool) -> UfsResult<()> {
        Ok(())
    }

    /// Pulse the device hardware reset line. Returns `false` when the platform has none.
    fn device_reset(&self) -> UfsResult<bool> {
        Ok(false)
    }
}

/// Variant for controllers that need nothing beyond the standard sequences.
#[derive(Clone, Copy, Debug, Default)]
pub struct GenericVariant;

impl UfsVariant for GenericVariant {}
