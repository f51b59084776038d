//! Register access seam between the host core and a controller backend.

use crate::lists::RequestLists;
use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};
use ufs_proto::regs::{REG_INTERRUPT_ENABLE, REG_INTERRUPT_STATUS};

const POLL_INTERVAL: Duration = Duration::from_micros(100);

/// Memory-mapped UFSHCI register block of one controller.
///
/// Implementations must tolerate concurrent access from caller threads, the interrupt
/// context and the core's worker threads.
pub trait HostRegisters: Send + Sync {
    fn read(&self, offset: u32) -> u32;

    fn write(&self, offset: u32, value: u32);

    /// Hand the transfer and task request lists to the controller. Takes the place of
    /// programming the list base address registers.
    fn bind_request_lists(&self, lists: Arc<RequestLists>);

    /// Wait until `read(offset) & mask == value`, or `timeout` elapses. Returns whether the
    /// condition was met.
    ///
    /// The default implementation polls; backends that can signal register changes should
    /// override it.
    fn wait(&self, offset: u32, mask: u32, value: u32, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.read(offset) & mask == value {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            thread::sleep(POLL_INTERVAL.min(deadline - now));
        }
    }

    fn enable_interrupts(&self, mask: u32) {
        let enabled = self.read(REG_INTERRUPT_ENABLE);
        self.write(REG_INTERRUPT_ENABLE, enabled | mask);
    }

    fn disable_interrupts(&self, mask: u32) {
        let enabled = self.read(REG_INTERRUPT_ENABLE);
        self.write(REG_INTERRUPT_ENABLE, enabled & !mask);
    }

    /// Read and acknowledge pending interrupt status bits that are enabled.
    fn take_interrupts(&self) -> u32 {
        let status = self.read(REG_INTERRUPT_STATUS);
        let enabled = self.read(REG_INTERRUPT_ENABLE);
        if status != 0 {
            self.write(REG_INTERRUPT_STATUS, status);
        }
        status & enabled
    }
}
