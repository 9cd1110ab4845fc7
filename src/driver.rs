//! Device driver capability interface
//!
//! A driver is registered with [`UsbHost::driver_ready_for_device`] and
//! waits until a device finishes enumeration. Waiting drivers are offered
//! each new device in registration order:
//!
//! 1. the whole device, with [`ClaimLevel::Device`] and every descriptor
//!    after the configuration header. The first driver to accept owns the
//!    device exclusively;
//! 2. failing that, each interface in turn with [`ClaimLevel::Interface`]
//!    and that interface's descriptors. Interfaces may end up with
//!    different drivers, and one driver may take several.
//!
//! A claiming driver stops waiting. When the device goes away its
//! [`Driver::disconnect`] runs and it waits again, keeping its original
//! place in the offer order.
//!
//! [`UsbHost::driver_ready_for_device`]: crate::UsbHost::driver_ready_for_device

use crate::device::{Device, DeviceId};
use crate::ehci::HostController;
use crate::host::HostCore;
use crate::timer::Timer;
use crate::transfer::Completion;

/// Registration slot of a driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DriverId(pub(crate) u8);

impl DriverId {
    /// Registration order, starting at 0
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// What a driver is being offered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ClaimLevel {
    /// The whole device
    Device,
    /// One interface, by bInterfaceNumber
    Interface(u8),
}

/// Driver callbacks.
///
/// Every callback except `claim` receives the host core so the driver can
/// open pipes, queue transfers and arm timers. None of them may block.
pub trait Driver<C: HostController, T: Timer> {
    /// Accept or refuse `device` at `level`. `descriptors` holds the
    /// configuration bytes offered at that level.
    fn claim(&mut self, device: &Device, level: ClaimLevel, descriptors: &[u8]) -> bool;

    /// Runs right after a successful claim, once enumeration is finished.
    /// `me` is the id to use for timers and driver-routed transfers.
    fn configured(&mut self, _core: &mut HostCore<C, T>, _me: DriverId, _device: DeviceId, _level: ClaimLevel) {}

    /// A control transfer queued with this driver as owner completed
    fn control(&mut self, _core: &mut HostCore<C, T>, _completion: &Completion) {}

    /// A transfer on a pipe this driver opened completed
    fn on_complete(&mut self, _core: &mut HostCore<C, T>, _completion: &Completion) {}

    /// A timer started with this driver's id expired
    fn timer_event(&mut self, _core: &mut HostCore<C, T>, _tag: u8, _elapsed_us: u32) {}

    /// `device` was removed. Pipes the driver opened on it are released by
    /// the core afterwards.
    fn disconnect(&mut self, core: &mut HostCore<C, T>, device: DeviceId);
}
