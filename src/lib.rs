#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

//! Callback-driven USB 2.0 host core for i.MX RT EHCI controllers
//!
//! The crate sits between a host-controller scheduling layer (register
//! access, schedule linking, interrupts) and class drivers. It owns the
//! records and hardware descriptors, enumerates devices, hands them to
//! drivers and runs external hubs. Nothing in it blocks: every step is
//! resumed from a transfer completion or a timer expiry.
//!
//! # Core Components
//!
//! - [`UsbHost`] - entry points for the platform: attach, detach,
//!   completions, timers; driver registry and claim protocol
//! - [`HostCore`] - pools, pipes, transfers and the followup lists, as
//!   seen by drivers
//! - [`enumeration`] - the enumeration state machine
//! - [`hub`] - hub class driver (feature `hub`)
//! - [`ehci`] - queue head and transfer descriptor layouts, and the
//!   [`HostController`] seam
//! - [`dma`] - descriptor arena, data buffers, cache maintenance
//! - [`error`] - error type
//!
//! # Flow
//!
//! ```text
//! device_attached ─► new_device ─► enumeration ─► claim ─► Driver::configured
//! on_interrupt / followup_transfer ─► retire ─► enumeration | Driver::control | Driver::on_complete
//! timer_expired ─► Driver::timer_event
//! device_detached ─► Driver::disconnect ─► pipes and records freed
//! ```

#[cfg(feature = "defmt")]
use defmt as _;

pub mod config;
pub mod descriptor;
pub mod device;
pub mod dma;
pub mod driver;
pub mod ehci;
pub mod enumeration;
pub mod error;
pub mod host;
pub mod pipe;
pub mod pool;
pub mod timer;
pub mod transfer;

#[cfg(feature = "hub")]
pub mod hub;

pub use config::HostConfig;
pub use device::{Device, DeviceId};
pub use driver::{ClaimLevel, Driver, DriverId};
pub use ehci::{HostController, Speed, UsbSts};
pub use error::{Result, UsbError};
pub use host::HostCore;
pub use pipe::{Pipe, PipeId, PipeOwner};
pub use pool::{Handle, PoolStats};
pub use timer::{Timer, TimerId};
pub use transfer::{Completion, Direction, SetupPacket, TransferId, TransferType};

#[cfg(feature = "hub")]
pub use hub::Hub;

use config::{MAX_CLAIMS_PER_DEVICE, MAX_DRIVERS};
use descriptor::{Interfaces, CONFIG_HEADER_LEN};
use device::Claim;
use transfer::{ListKind, Route};

struct Registration<'d, C: HostController, T: Timer> {
    driver: &'d mut (dyn Driver<C, T> + 'd),
    waiting: bool,
}

/// USB host instance
///
/// Owns the [`HostCore`] and the registered drivers. The platform calls
/// into it from its USB interrupt and timer handlers; it never blocks.
pub struct UsbHost<'d, C: HostController, T: Timer> {
    core: HostCore<C, T>,
    drivers: heapless::Vec<Registration<'d, C, T>, MAX_DRIVERS>,
}

impl<'d, C: HostController, T: Timer> UsbHost<'d, C, T> {
    /// Host with no devices and no drivers
    pub fn new(controller: C, timer: T, config: HostConfig) -> Self {
        Self {
            core: HostCore::new(controller, timer, config),
            drivers: heapless::Vec::new(),
        }
    }

    /// Host core
    pub fn core(&self) -> &HostCore<C, T> {
        &self.core
    }

    /// Mutable host core
    pub fn core_mut(&mut self) -> &mut HostCore<C, T> {
        &mut self.core
    }

    /// Register a driver. It is offered every device that finishes
    /// enumeration from now on, after the drivers registered before it.
    pub fn driver_ready_for_device(&mut self, driver: &'d mut (dyn Driver<C, T> + 'd)) -> Result<DriverId> {
        let id = DriverId(self.drivers.len() as u8);
        self.drivers
            .push(Registration { driver, waiting: true })
            .map_err(|_| UsbError::NoResources)?;

        #[cfg(feature = "defmt")]
        defmt::debug!("Driver {} registered", id);

        Ok(id)
    }

    /// True while driver `id` waits for a device
    pub fn is_waiting(&self, id: DriverId) -> bool {
        self.drivers.get(id.index()).map(|r| r.waiting).unwrap_or(false)
    }

    /// A device was connected to the root port and reset
    pub fn device_attached(&mut self, speed: Speed) -> Result<DeviceId> {
        self.core.new_device(speed, 0, 0)
    }

    /// A device went away. Its drivers are told, then everything it held is
    /// released. Devices behind it (on hub ports) follow.
    pub fn device_detached(&mut self, device: DeviceId) {
        self.disconnect_device(device);
        self.drain_removals();
    }

    /// Retire the transfer behind `id` if the controller is done with it
    /// and dispatch its completion. Any stage of a control transfer may be
    /// named. Returns false while it is still active.
    pub fn followup_transfer(&mut self, id: TransferId) -> bool {
        let Some(id) = self.followup_record(id) else {
            return false;
        };
        match self.core.retire_transfer(id) {
            Some((route, completion)) => {
                self.dispatch(route, completion);
                true
            }
            None => false,
        }
    }

    /// [`followup_transfer`](Self::followup_transfer) for a qTD bus address
    pub fn followup_descriptor(&mut self, bus_address: u32) -> bool {
        match self.core.transfer_for_descriptor(bus_address) {
            Some(id) => self.followup_transfer(id),
            None => false,
        }
    }

    /// Walk both followup lists and dispatch every finished transfer.
    /// Returns how many completed.
    pub fn poll(&mut self) -> usize {
        let mut completed = 0;
        for kind in [ListKind::Async, ListKind::Periodic] {
            let mut next = self.core.followup(kind).next();
            while let Some(id) = next {
                next = self.core.transfers.get(id).and_then(|t| t.followup_next);
                if let Some((route, completion)) = self.core.retire_transfer(id) {
                    self.dispatch(route, completion);
                    completed += 1;
                    // the callback may have freed records further down
                    next = self.core.followup(kind).next();
                }
            }
        }
        completed
    }

    /// USB interrupt: retire finished transfers when the status says so
    pub fn on_interrupt(&mut self, status: UsbSts) -> usize {
        if status.intersects(UsbSts::TRANSFER_EVENTS) {
            self.poll()
        } else {
            0
        }
    }

    /// A timer started through [`Timer::start`] fired
    pub fn timer_expired(&mut self, id: TimerId, elapsed_us: u32) {
        if let Some(registration) = self.drivers.get_mut(id.driver.index()) {
            registration.driver.timer_event(&mut self.core, id.tag, elapsed_us);
        }
        self.drain_removals();
    }

    fn followup_record(&self, id: TransferId) -> Option<TransferId> {
        let transfer = self.core.transfers.get(id)?;
        if transfer.list.is_some() {
            return Some(id);
        }
        self.core
            .transfers
            .iter()
            .find(|(_, t)| t.list.is_some() && t.stages.contains(&Some(id)))
            .map(|(status, _)| status)
    }

    fn dispatch(&mut self, route: Route, completion: Completion) {
        match route {
            Route::Enumeration => {
                if let Some(device) = self.core.advance_enumeration(&completion) {
                    self.claim_device(device);
                }
            }
            Route::Control(driver) => {
                if let Some(registration) = self.drivers.get_mut(driver.index()) {
                    registration.driver.control(&mut self.core, &completion);
                }
            }
            Route::Pipe(driver) => {
                if let Some(registration) = self.drivers.get_mut(driver.index()) {
                    registration.driver.on_complete(&mut self.core, &completion);
                }
            }
        }
        self.drain_removals();
    }

    /// Offer a freshly configured device to the waiting drivers
    fn claim_device(&mut self, id: DeviceId) {
        let mut claims: heapless::Vec<Claim, MAX_CLAIMS_PER_DEVICE> = heapless::Vec::new();
        {
            let Some(device) = self.core.devices.get(id) else {
                return;
            };
            let config = match device.enum_buffer {
                Some(buffer) => self
                    .core
                    .buffers
                    .get(buffer)
                    .get(CONFIG_HEADER_LEN..device.config_len as usize)
                    .unwrap_or(&[]),
                None => &[],
            };

            for (index, registration) in self.drivers.iter_mut().enumerate() {
                if registration.waiting && registration.driver.claim(device, ClaimLevel::Device, config) {
                    // first claim, cannot overflow
                    let _ = claims.push(Claim {
                        driver: DriverId(index as u8),
                        level: ClaimLevel::Device,
                    });
                    break;
                }
            }

            if claims.is_empty() {
                for (number, descriptors) in Interfaces::new(config) {
                    if claims.is_full() {
                        #[cfg(feature = "defmt")]
                        defmt::warn!("Device {}: claim limit reached, interface {} and later not offered", id, number);
                        break;
                    }
                    let level = ClaimLevel::Interface(number);
                    for (index, registration) in self.drivers.iter_mut().enumerate() {
                        let driver = DriverId(index as u8);
                        let offered = registration.waiting || claims.iter().any(|c| c.driver == driver);
                        if offered && registration.driver.claim(device, level, descriptors) {
                            // checked not full above
                            let _ = claims.push(Claim { driver, level });
                            break;
                        }
                    }
                }
            }
        }

        for claim in &claims {
            if let Some(registration) = self.drivers.get_mut(claim.driver.index()) {
                registration.waiting = false;
            }
            #[cfg(feature = "defmt")]
            defmt::info!("Device {} claimed by driver {} at {}", id, claim.driver, claim.level);
        }
        #[cfg(feature = "defmt")]
        if claims.is_empty() {
            defmt::info!("Device {} not claimed", id);
        }

        if let Some(device) = self.core.devices.get_mut(id) {
            device.claims = claims.clone();
        }
        self.core.finish_enumeration(id);

        for claim in claims {
            if let Some(registration) = self.drivers.get_mut(claim.driver.index()) {
                registration.driver.configured(&mut self.core, claim.driver, id, claim.level);
            }
        }
    }

    fn disconnect_device(&mut self, id: DeviceId) {
        let Some(device) = self.core.devices.get(id) else {
            return;
        };
        let claims = device.claims.clone();
        for (position, claim) in claims.iter().enumerate() {
            if claims[..position].iter().any(|c| c.driver == claim.driver) {
                continue;
            }
            if let Some(registration) = self.drivers.get_mut(claim.driver.index()) {
                registration.driver.disconnect(&mut self.core, id);
                registration.waiting = true;
            }
        }
        self.core.remove_device(id);
    }

    fn drain_removals(&mut self) {
        while let Some(device) = self.core.take_removal() {
            self.disconnect_device(device);
        }
    }
}
