//! Host core: every pool, list and collaborator of one host instance
//!
//! [`HostCore`] is what drivers see. It owns the record pools, the DMA
//! arena and buffers, both followup lists, the device list and the
//! enumeration lock. Driver dispatch sits one level up in
//! [`UsbHost`](crate::UsbHost), which keeps the drivers apart from the core
//! so a driver callback can borrow the core mutably.
//!
//! Record lifetimes: a device owns its control pipe; a pipe owns the
//! transfers attached to it; buffers belong to whoever allocated them.

use crate::config::{HostConfig, LARGE_BUFFER_SIZE, MAX_DEVICES, MAX_PENDING_REMOVALS, MAX_PIPES, MAX_TRANSFERS};
use crate::device::{AddressMap, Device, DeviceId};
use crate::dma::{BufferHandle, BufferPool, DescriptorArena};
use crate::ehci::{HostController, QueueHead, Speed};
use crate::error::{Result, UsbError};
use crate::pipe::{Pipe, PipeId, PipeOwner};
use crate::pool::{Pool, PoolStats};
use crate::timer::Timer;
use crate::transfer::control::{descriptor_type, SetupPacket};
use crate::transfer::{Direction, FollowupList, Transfer, TransferType};
use heapless::Deque;

/// One USB host instance.
///
/// Queue heads and transfer descriptors live inside this value. Put it in
/// its final (static, DMA-reachable) location before the first device is
/// attached, and do not move it afterwards.
pub struct HostCore<C, T> {
    pub(crate) controller: C,
    pub(crate) timer: T,
    pub(crate) config: HostConfig,
    pub(crate) devices: Pool<Device, MAX_DEVICES>,
    pub(crate) pipes: Pool<Pipe, MAX_PIPES>,
    pub(crate) transfers: Pool<Transfer, MAX_TRANSFERS>,
    pub(crate) arena: DescriptorArena,
    pub(crate) buffers: BufferPool,
    pub(crate) async_followup: FollowupList,
    pub(crate) periodic_followup: FollowupList,
    pub(crate) device_list: Option<DeviceId>,
    pub(crate) addresses: AddressMap,
    pub(crate) enumerating: Option<DeviceId>,
    pub(crate) removals: Deque<DeviceId, MAX_PENDING_REMOVALS>,
}

impl<C: HostController, T: Timer> HostCore<C, T> {
    /// Core with empty pools
    pub fn new(controller: C, timer: T, config: HostConfig) -> Self {
        Self {
            controller,
            timer,
            config,
            devices: Pool::new(),
            pipes: Pool::new(),
            transfers: Pool::new(),
            arena: DescriptorArena::new(),
            buffers: BufferPool::new(),
            async_followup: FollowupList::new(),
            periodic_followup: FollowupList::new(),
            device_list: None,
            addresses: AddressMap::new(),
            enumerating: None,
            removals: Deque::new(),
        }
    }

    /// Scheduling layer
    pub fn controller(&self) -> &C {
        &self.controller
    }

    /// Mutable scheduling layer
    pub fn controller_mut(&mut self) -> &mut C {
        &mut self.controller
    }

    /// Timer service
    pub fn timer(&self) -> &T {
        &self.timer
    }

    /// Mutable timer service
    pub fn timer_mut(&mut self) -> &mut T {
        &mut self.timer
    }

    /// Timing configuration
    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// Device record
    pub fn device(&self, id: DeviceId) -> Option<&Device> {
        self.devices.get(id)
    }

    /// Attached devices in attachment order
    pub fn devices(&self) -> impl Iterator<Item = DeviceId> + '_ {
        core::iter::successors(self.device_list, move |id| self.devices.get(*id).and_then(|d| d.next))
    }

    /// Queue head of a live pipe
    pub fn qh(&self, pipe: PipeId) -> Option<&QueueHead> {
        if !self.pipes.contains(pipe) {
            return None;
        }
        self.arena.qh(pipe.index())
    }

    /// Device currently holding the enumeration lock
    pub fn enumerating_device(&self) -> Option<DeviceId> {
        self.enumerating
    }

    /// True while a device is being enumerated
    pub fn is_enumerating(&self) -> bool {
        self.enumerating.is_some()
    }

    /// Allocate a DMA data buffer of at least `len` bytes
    pub fn alloc_buffer(&mut self, len: usize) -> Result<BufferHandle> {
        let result = self.buffers.alloc(len);
        #[cfg(feature = "defmt")]
        if result == Err(UsbError::NoResources) {
            defmt::warn!("Buffer pool exhausted ({} bytes)", len);
        }
        result
    }

    /// Return a data buffer to the pool
    pub fn free_buffer(&mut self, buffer: BufferHandle) {
        self.buffers.free(buffer);
    }

    /// Buffer contents
    pub fn buffer(&self, buffer: BufferHandle) -> &[u8] {
        self.buffers.get(buffer)
    }

    /// Mutable buffer contents
    pub fn buffer_mut(&mut self, buffer: BufferHandle) -> &mut [u8] {
        self.buffers.get_mut(buffer)
    }

    /// Pool utilization
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            devices: (self.devices.len(), self.devices.capacity()),
            pipes: (self.pipes.len(), self.pipes.capacity()),
            transfers: (self.transfers.len(), self.transfers.capacity()),
            small_buffers: self.buffers.small_stats(),
            large_buffers: self.buffers.large_stats(),
        }
    }

    /// Start enumerating a freshly reset device.
    ///
    /// Takes the enumeration lock, a device record, its control pipe, an
    /// enumeration buffer and an address, then asks for the first 8 bytes
    /// of the device descriptor. Everything taken is given back on failure.
    pub fn new_device(&mut self, speed: Speed, hub_address: u8, hub_port: u8) -> Result<DeviceId> {
        if self.enumerating.is_some() {
            return Err(UsbError::EnumerationBusy);
        }

        let address = self.addresses.reserve()?;
        let mut device = Device::new(speed, hub_address, hub_port);
        device.reserved_address = address;
        device.tt = self.transaction_translator(hub_address, hub_port);
        let Some(id) = self.devices.allocate(device) else {
            #[cfg(feature = "defmt")]
            defmt::warn!("Device pool exhausted");
            self.addresses.release(address);
            return Err(UsbError::NoResources);
        };

        if let Err(e) = self.setup_default_pipe(id) {
            self.discard_device(id);
            return Err(e);
        }
        self.link_device(id);
        self.enumerating = Some(id);

        #[cfg(feature = "defmt")]
        defmt::info!(
            "New {} speed device {} (hub {} port {}), address {} reserved",
            speed,
            id,
            hub_address,
            hub_port,
            address
        );

        Ok(id)
    }

    /// Split target for a device on `hub_port` of the hub at `hub_address`.
    /// Full/low-speed hubs pass on the translator they sit behind.
    fn transaction_translator(&self, hub_address: u8, hub_port: u8) -> (u8, u8) {
        if hub_address == 0 {
            return (0, 0);
        }
        let hub = self
            .devices()
            .filter_map(|id| self.devices.get(id))
            .find(|d| d.address == hub_address);
        match hub {
            Some(hub) if hub.speed != Speed::High => hub.tt,
            _ => (hub_address, hub_port),
        }
    }

    fn setup_default_pipe(&mut self, id: DeviceId) -> Result<()> {
        let buffer = self.alloc_buffer(LARGE_BUFFER_SIZE)?;
        if let Some(device) = self.devices.get_mut(id) {
            device.enum_buffer = Some(buffer);
        }
        let pipe = self.new_pipe(id, TransferType::Control, 0, Direction::In, 8, 0, PipeOwner::Enumeration)?;
        if let Some(device) = self.devices.get_mut(id) {
            device.control_pipe = pipe;
        }
        let setup = SetupPacket::get_descriptor(descriptor_type::DEVICE, 0, 0, 8);
        self.queue_control_transfer(id, setup, Some(buffer), None)?;
        Ok(())
    }

    /// Ask for `device` to be disconnected once the current callback
    /// returns. Used by drivers that learn of a removal themselves (hubs).
    pub fn request_disconnect(&mut self, device: DeviceId) -> Result<()> {
        if !self.devices.contains(device) {
            return Err(UsbError::DeviceDisconnected);
        }
        if self.removals.iter().any(|d| *d == device) {
            return Ok(());
        }
        self.removals.push_back(device).map_err(|_| {
            #[cfg(feature = "defmt")]
            defmt::warn!("Removal queue full, device {} kept", device);
            UsbError::NoResources
        })
    }

    pub(crate) fn take_removal(&mut self) -> Option<DeviceId> {
        self.removals.pop_front()
    }

    /// Release the enumeration lock and the enumeration buffer
    pub(crate) fn finish_enumeration(&mut self, id: DeviceId) {
        if self.enumerating == Some(id) {
            self.enumerating = None;
        }
        if let Some(buffer) = self.devices.get_mut(id).and_then(|d| d.enum_buffer.take()) {
            self.buffers.free(buffer);
        }
    }

    /// Free every resource of a device and forget it. Drivers must already
    /// have been told.
    pub(crate) fn remove_device(&mut self, id: DeviceId) {
        if !self.devices.contains(id) {
            return;
        }
        self.finish_enumeration(id);

        let mut pipes: heapless::Vec<PipeId, MAX_PIPES> = heapless::Vec::new();
        for pipe in self.pipes_of(id) {
            // capacities match, cannot overflow
            let _ = pipes.push(pipe);
        }
        for pipe in pipes {
            // listed as live just above
            let _ = self.delete_pipe(pipe);
        }

        self.unlink_device(id);
        self.discard_device(id);

        #[cfg(feature = "defmt")]
        defmt::info!("Device {} removed", id);
    }

    fn discard_device(&mut self, id: DeviceId) {
        if let Some(device) = self.devices.get(id) {
            let pipe = device.control_pipe;
            if self.pipes.contains(pipe) {
                // checked live, cannot fail
                let _ = self.delete_pipe(pipe);
            }
        }
        if self.enumerating == Some(id) {
            self.enumerating = None;
        }
        if let Some(device) = self.devices.free(id) {
            self.addresses.release(device.reserved_address);
            if let Some(buffer) = device.enum_buffer {
                self.buffers.free(buffer);
            }
        }
    }

    fn link_device(&mut self, id: DeviceId) {
        let tail = self.devices().last();
        match tail.and_then(|t| self.devices.get_mut(t)) {
            Some(last) => last.next = Some(id),
            None => self.device_list = Some(id),
        }
    }

    fn unlink_device(&mut self, id: DeviceId) {
        let next = self.devices.get(id).and_then(|d| d.next);
        if self.device_list == Some(id) {
            self.device_list = next;
            return;
        }
        let previous = self.devices().find(|d| self.devices.get(*d).and_then(|r| r.next) == Some(id));
        if let Some(previous) = previous.and_then(|p| self.devices.get_mut(p)) {
            previous.next = next;
        }
    }
}
