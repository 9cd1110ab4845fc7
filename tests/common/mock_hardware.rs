//! Mock hardware for running the host core without a controller
//!
//! `MockController` and `MockTimer` record what the core asks of them.
//! The `complete_*` helpers play the controller's part: they copy a
//! response into the transfer buffer, retire the qTDs the way hardware
//! does (active bit cleared, residual byte count written back) and hand
//! the transfer to `UsbHost::followup_transfer`.

use core::sync::atomic::Ordering;
use std::cell::RefCell;
use std::vec::Vec;

use imxrt_usbhost::device::DeviceId;
use imxrt_usbhost::ehci::{token, QueueHead};
use imxrt_usbhost::transfer::control::{descriptor_type, request};
use imxrt_usbhost::transfer::{ListKind, Stage};
use imxrt_usbhost::{
    ClaimLevel, Completion, Device, Driver, DriverId, HostController, HostCore, PipeId, SetupPacket, Timer, TimerId,
    TransferId, TransferType, UsbHost,
};

/// Recording scheduling layer
#[derive(Debug, Default)]
pub struct MockController {
    pub async_links: Vec<PipeId>,
    pub periodic_links: Vec<(PipeId, u8)>,
    pub unlinks: Vec<(PipeId, TransferType)>,
    pub submits: usize,
}

impl HostController for MockController {
    fn dma_address(&self, ptr: *const u8) -> u32 {
        ptr as usize as u32
    }

    fn link_async(&mut self, pipe: PipeId, _qh: &QueueHead) {
        self.async_links.push(pipe);
    }

    fn link_periodic(&mut self, pipe: PipeId, _qh: &QueueHead, interval: u8) {
        self.periodic_links.push((pipe, interval));
    }

    fn unlink(&mut self, pipe: PipeId, _qh: &QueueHead, kind: TransferType) {
        self.unlinks.push((pipe, kind));
    }

    fn submit(&mut self, _pipe: PipeId, _qh: &QueueHead) {
        self.submits += 1;
    }
}

/// Recording timer service
#[derive(Debug, Default)]
pub struct MockTimer {
    pub started: Vec<(TimerId, u32)>,
    pub stopped: Vec<TimerId>,
    pub running: Vec<TimerId>,
}

impl MockTimer {
    pub fn is_running(&self, id: TimerId) -> bool {
        self.running.contains(&id)
    }
}

impl Timer for MockTimer {
    fn start(&mut self, id: TimerId, microseconds: u32) {
        self.started.push((id, microseconds));
        if !self.running.contains(&id) {
            self.running.push(id);
        }
    }

    fn stop(&mut self, id: TimerId) {
        self.stopped.push(id);
        self.running.retain(|t| *t != id);
    }
}

pub type TestHost<'d> = UsbHost<'d, MockController, MockTimer>;

/// What a [`MockDriver`] saw
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverEvent {
    Offered(ClaimLevel, usize),
    Configured(DriverId, DeviceId, ClaimLevel),
    Control(Completion),
    Complete(Completion),
    Timer(u8),
    Disconnected(DeviceId),
}

/// Which offers a [`MockDriver`] accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accept {
    Nothing,
    Device,
    Interfaces,
}

/// Driver that logs every callback
pub struct MockDriver<'a> {
    pub log: &'a RefCell<Vec<DriverEvent>>,
    pub accept: Accept,
}

impl<'a> MockDriver<'a> {
    pub fn new(log: &'a RefCell<Vec<DriverEvent>>, accept: Accept) -> Self {
        Self { log, accept }
    }
}

impl<C: HostController, T: Timer> Driver<C, T> for MockDriver<'_> {
    fn claim(&mut self, _device: &Device, level: ClaimLevel, descriptors: &[u8]) -> bool {
        self.log.borrow_mut().push(DriverEvent::Offered(level, descriptors.len()));
        matches!(
            (self.accept, level),
            (Accept::Device, ClaimLevel::Device) | (Accept::Interfaces, ClaimLevel::Interface(_))
        )
    }

    fn configured(&mut self, _core: &mut HostCore<C, T>, me: DriverId, device: DeviceId, level: ClaimLevel) {
        self.log.borrow_mut().push(DriverEvent::Configured(me, device, level));
    }

    fn control(&mut self, _core: &mut HostCore<C, T>, completion: &Completion) {
        self.log.borrow_mut().push(DriverEvent::Control(*completion));
    }

    fn on_complete(&mut self, _core: &mut HostCore<C, T>, completion: &Completion) {
        self.log.borrow_mut().push(DriverEvent::Complete(*completion));
    }

    fn timer_event(&mut self, _core: &mut HostCore<C, T>, tag: u8, _elapsed_us: u32) {
        self.log.borrow_mut().push(DriverEvent::Timer(tag));
    }

    fn disconnect(&mut self, _core: &mut HostCore<C, T>, device: DeviceId) {
        self.log.borrow_mut().push(DriverEvent::Disconnected(device));
    }
}

pub fn new_host<'d>() -> TestHost<'d> {
    UsbHost::new(MockController::default(), MockTimer::default(), Default::default())
}

/// Oldest control transfer waiting on the async list
pub fn pending_control(host: &TestHost<'_>) -> Option<TransferId> {
    let core = host.core();
    core.followup(ListKind::Async)
        .find(|id| core.transfer(*id).map(|t| t.stage() == Stage::Status).unwrap_or(false))
}

/// Oldest transfer waiting on the periodic list
pub fn pending_periodic(host: &TestHost<'_>) -> Option<TransferId> {
    host.core().followup(ListKind::Periodic).next()
}

/// Setup packet of a queued control transfer
pub fn setup_of(host: &TestHost<'_>, id: TransferId) -> SetupPacket {
    *host.core().transfer(id).and_then(|t| t.setup()).expect("not a control transfer")
}

/// Retire `id` as the controller would, with `response` as received data
/// and `error_bits` OR-ed into every stage token
pub fn retire(host: &mut TestHost<'_>, id: TransferId, response: &[u8], error_bits: u32) -> bool {
    let transfer = host.core().transfer(id).expect("stale transfer");
    let stages = [transfer.stages()[0], transfer.stages()[1], Some(id)];
    let buffer = transfer.buffer();
    let length = transfer.length();
    let moved = response.len().min(length);

    if let Some(buffer) = buffer {
        host.core_mut().buffer_mut(buffer)[..moved].copy_from_slice(&response[..moved]);
    }
    for stage in stages.into_iter().flatten() {
        let kind = host.core().transfer(stage).expect("stale stage").stage();
        let remaining = match kind {
            Stage::Data | Stage::Single => length - moved,
            _ => 0,
        };
        let qtd = host.core().qtd(stage).expect("no qTD");
        let bits = qtd.token.load(Ordering::SeqCst)
            & !(token::STATUS_ACTIVE | token::TOTAL_BYTES_MASK << token::TOTAL_BYTES_SHIFT);
        qtd.token
            .store(bits | (remaining as u32) << token::TOTAL_BYTES_SHIFT | error_bits, Ordering::SeqCst);
    }
    host.followup_transfer(id)
}

/// Complete the oldest control transfer with `response`; returns its request
pub fn complete_control(host: &mut TestHost<'_>, response: &[u8]) -> SetupPacket {
    let id = pending_control(host).expect("no control transfer pending");
    let setup = setup_of(host, id);
    assert!(retire(host, id, response, 0));
    setup
}

/// Fail the oldest control transfer with a STALL
pub fn stall_control(host: &mut TestHost<'_>) -> SetupPacket {
    let id = pending_control(host).expect("no control transfer pending");
    let setup = setup_of(host, id);
    assert!(retire(host, id, &[], token::STATUS_HALTED));
    setup
}

/// Complete the oldest interrupt transfer with `response`
pub fn complete_periodic(host: &mut TestHost<'_>, response: &[u8]) {
    let id = pending_periodic(host).expect("no interrupt transfer pending");
    assert!(retire(host, id, response, 0));
}

/// Answer standard requests the way a simple device would
pub fn standard_response(setup: &SetupPacket, device: &[u8], config: &[u8]) -> Vec<u8> {
    let len = setup.length as usize;
    let mut data = match (setup.request, (setup.value >> 8) as u8) {
        (request::GET_DESCRIPTOR, descriptor_type::DEVICE) => device.to_vec(),
        (request::GET_DESCRIPTOR, descriptor_type::CONFIGURATION) => config.to_vec(),
        (request::GET_DESCRIPTOR, descriptor_type::STRING) if setup.value & 0xFF == 0 => vec![4, 3, 0x09, 0x04],
        (request::GET_DESCRIPTOR, descriptor_type::STRING) => string_descriptor("Test"),
        _ => Vec::new(),
    };
    data.truncate(len);
    data
}

/// Drive the enumeration of `device_id` to the end, answering every
/// request from the given descriptors. Returns the requests seen.
pub fn enumerate(host: &mut TestHost<'_>, device_id: DeviceId, device: &[u8], config: &[u8]) -> Vec<SetupPacket> {
    let mut seen = Vec::new();
    for _ in 0..32 {
        if host.core().enumerating_device() != Some(device_id) {
            break;
        }
        let Some(id) = pending_control(host) else {
            break;
        };
        let setup = setup_of(host, id);
        let response = standard_response(&setup, device, config);
        assert!(retire(host, id, &response, 0));
        seen.push(setup);
    }
    seen
}

pub fn string_descriptor(text: &str) -> Vec<u8> {
    let mut bytes = vec![0, descriptor_type::STRING];
    for unit in text.encode_utf16() {
        bytes.extend_from_slice(&unit.to_le_bytes());
    }
    bytes[0] = bytes.len() as u8;
    bytes
}

/// Device descriptor with the given class, EP0 size and string indices
pub fn device_descriptor(class: u8, max_packet0: u8, strings: [u8; 3]) -> [u8; 18] {
    [
        0x12,        // bLength
        0x01,        // bDescriptorType (DEVICE)
        0x00, 0x02,  // bcdUSB (2.0)
        class,       // bDeviceClass
        0x00,        // bDeviceSubClass
        0x00,        // bDeviceProtocol
        max_packet0, // bMaxPacketSize0
        0xC0, 0x16,  // idVendor (0x16C0)
        0x78, 0x04,  // idProduct (0x0478)
        0x00, 0x01,  // bcdDevice (1.0)
        strings[0],  // iManufacturer
        strings[1],  // iProduct
        strings[2],  // iSerialNumber
        0x01,        // bNumConfigurations
    ]
}

/// One vendor interface with a bulk IN endpoint
pub fn vendor_config() -> [u8; 25] {
    [
        0x09,       // bLength
        0x02,       // bDescriptorType (CONFIGURATION)
        0x19, 0x00, // wTotalLength (25)
        0x01,       // bNumInterfaces
        0x01,       // bConfigurationValue
        0x00,       // iConfiguration
        0x80,       // bmAttributes (bus powered)
        0x32,       // bMaxPower (100 mA)
        0x09, 0x04, 0x00, 0x00, 0x01, 0xFF, 0x00, 0x00, 0x00, // interface 0, vendor class
        0x07, 0x05, 0x81, 0x02, 0x40, 0x00, 0x00,             // EP1 IN bulk, 64 bytes
    ]
}

/// Two vendor interfaces, no endpoints
pub fn two_interface_config() -> [u8; 27] {
    [
        0x09, 0x02, 0x1B, 0x00, 0x02, 0x01, 0x00, 0xC0, 0x00,
        0x09, 0x04, 0x00, 0x00, 0x00, 0xFF, 0x00, 0x00, 0x00,
        0x09, 0x04, 0x01, 0x00, 0x00, 0xFF, 0x00, 0x00, 0x00,
    ]
}

/// Hub configuration: hub interface with its status-change endpoint
pub fn hub_config() -> [u8; 25] {
    [
        0x09, 0x02, 0x19, 0x00, 0x01, 0x01, 0x00, 0xE0, 0x00,
        0x09, 0x04, 0x00, 0x00, 0x01, 0x09, 0x00, 0x00, 0x00, // interface 0, hub class
        0x07, 0x05, 0x81, 0x03, 0x01, 0x00, 0x0C,             // EP1 IN interrupt, 1 byte, 12
    ]
}

/// Hub descriptor for `ports` downstream ports
pub fn hub_descriptor(ports: u8) -> [u8; 9] {
    [
        0x09,       // bDescLength
        0x29,       // bDescriptorType (HUB)
        ports,      // bNbrPorts
        0x09, 0x00, // wHubCharacteristics (individual power and over-current)
        0x32,       // bPwrOn2PwrGood (100 ms)
        0x64,       // bHubContrCurrent
        0x00,       // DeviceRemovable
        0xFF,       // PortPwrCtrlMask
    ]
}

/// GET_PORT_STATUS response
pub fn port_status(bits: u32) -> [u8; 4] {
    bits.to_le_bytes()
}
