//! One-shot timer service
//!
//! The core never measures time itself. Drivers start one-shot timers
//! through [`Timer`]; the platform calls
//! [`UsbHost::timer_expired`](crate::UsbHost::timer_expired) with the same
//! id when one fires.

use crate::driver::DriverId;

/// Identifies one timer: the driver that owns it and a driver-chosen tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TimerId {
    /// Driver whose `timer_event` receives the expiry
    pub driver: DriverId,
    /// Driver-private discriminator
    pub tag: u8,
}

impl TimerId {
    /// Timer `tag` of `driver`
    pub const fn new(driver: DriverId, tag: u8) -> Self {
        Self { driver, tag }
    }
}

/// Platform timer capability
pub trait Timer {
    /// Start (or restart) a one-shot timer
    fn start(&mut self, id: TimerId, microseconds: u32);

    /// Cancel a timer; stopping an idle timer is a no-op
    fn stop(&mut self, id: TimerId);
}
