//! USB hub class driver
//!
//! A [`Hub`] is an ordinary [`Driver`]: it claims a whole hub device, reads
//! the hub descriptor, powers every port and then listens on the hub's
//! status-change interrupt endpoint. Each port runs its own small state
//! machine:
//!
//! ```text
//! Off/Disconnect ─connect─► Debounce1 ─► … ─► Debounce5 ─► Reset
//!        ▲                      │ poll every 20 ms    PORT_RESET
//!        │                      │                        │ enabled
//!        └────── disconnect ────┴──── Active ◄── Recovery ◄┘
//!                                           new device
//! ```
//!
//! Status reads start bPwrOn2PwrGood after the last port was powered. A
//! port that is not enabled within [`HostConfig::reset_timeout_us`] of its
//! reset drops back to `Disconnect`, which frees the other ports to reset.
//!
//! [`HostConfig::reset_timeout_us`]: crate::HostConfig::reset_timeout_us
//!
//! The hub has one control transfer in flight at a time. Requests made while
//! it is busy are latched in the [`ControlGate`] and replayed, by operation
//! priority and lowest port first, when the in-flight request completes.
//!
//! Register one `Hub` per hub you want to support; each instance drives one
//! hub at a time.

use crate::config::MAX_HUB_PORTS;
use crate::descriptor::{Descriptors, EndpointDescriptor, InterfaceDescriptor, HUB_CLASS};
use crate::device::{Device, DeviceId};
use crate::dma::BufferHandle;
use crate::driver::{ClaimLevel, Driver, DriverId};
use crate::ehci::{HostController, Speed};
use crate::error::UsbError;
use crate::host::HostCore;
use crate::pipe::{PipeId, PipeOwner};
use crate::timer::{Timer, TimerId};
use crate::transfer::control::{descriptor_type, request, SetupPacket};
use crate::transfer::{Completion, Direction, TransferType};
use bitflags::bitflags;

/// Hub class request type: class, recipient other (a port)
const PORT_REQUEST: u8 = 0x23;
/// Hub class request type: device to host, class, recipient device
const HUB_DESCRIPTOR_REQUEST: u8 = 0xA0;
/// Bytes requested for the hub descriptor
const HUB_DESCRIPTOR_LEN: u16 = 16;

/// Timer tag of the shared debounce poll. Port numbers tag the per-port
/// reset timeout and recovery timers.
pub const DEBOUNCE_TAG: u8 = 0;

/// Timer tag of the wait between powering the ports and reading their status
pub const POWER_GOOD_TAG: u8 = 0x80;

/// Debounce polls required by [`PortState::on_status`]
pub const DEBOUNCE_POLLS: u8 = 5;

/// Port feature selectors (USB 2.0 Table 11-17)
#[allow(missing_docs)]
pub mod port_feature {
    pub const PORT_RESET: u16 = 4;
    pub const PORT_POWER: u16 = 8;
    pub const C_PORT_CONNECTION: u16 = 16;
    pub const C_PORT_ENABLE: u16 = 17;
    pub const C_PORT_SUSPEND: u16 = 18;
    pub const C_PORT_OVER_CURRENT: u16 = 19;
    pub const C_PORT_RESET: u16 = 20;
}

bitflags! {
    /// GET_PORT_STATUS response: wPortStatus in the low half, wPortChange
    /// in the high half
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PortStatus: u32 {
        const CONNECTION = 1 << 0;
        const ENABLE = 1 << 1;
        const SUSPEND = 1 << 2;
        const OVER_CURRENT = 1 << 3;
        const RESET = 1 << 4;
        const POWER = 1 << 8;
        const LOW_SPEED = 1 << 9;
        const HIGH_SPEED = 1 << 10;
        const C_CONNECTION = 1 << 16;
        const C_ENABLE = 1 << 17;
        const C_SUSPEND = 1 << 18;
        const C_OVER_CURRENT = 1 << 19;
        const C_RESET = 1 << 20;
    }
}

impl PortStatus {
    /// Parse the 4-byte little-endian response
    pub fn from_le_bytes(bytes: [u8; 4]) -> Self {
        Self::from_bits_truncate(u32::from_le_bytes(bytes))
    }

    /// Speed of the attached device
    pub fn speed(self) -> Speed {
        if self.contains(Self::HIGH_SPEED) {
            Speed::High
        } else if self.contains(Self::LOW_SPEED) {
            Speed::Low
        } else {
            Speed::Full
        }
    }

    /// Clear requests for every set change bit
    pub fn clear_ops(self) -> impl Iterator<Item = HubOp> {
        [
            (Self::C_CONNECTION, HubOp::ClearConnect),
            (Self::C_ENABLE, HubOp::ClearEnable),
            (Self::C_SUSPEND, HubOp::ClearSuspend),
            (Self::C_OVER_CURRENT, HubOp::ClearOverCurrent),
            (Self::C_RESET, HubOp::ClearReset),
        ]
        .into_iter()
        .filter(move |(bit, _)| self.contains(*bit))
        .map(|(_, op)| op)
    }
}

/// Port requests the hub issues, in replay priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum HubOp {
    PowerOn = 0,
    ClearConnect = 1,
    ClearEnable = 2,
    ClearSuspend = 3,
    ClearOverCurrent = 4,
    ClearReset = 5,
    GetStatus = 6,
    SetReset = 7,
}

impl HubOp {
    /// Every operation, highest priority first
    pub const ALL: [HubOp; 8] = [
        HubOp::PowerOn,
        HubOp::ClearConnect,
        HubOp::ClearEnable,
        HubOp::ClearSuspend,
        HubOp::ClearOverCurrent,
        HubOp::ClearReset,
        HubOp::GetStatus,
        HubOp::SetReset,
    ];

    /// Setup packet for this operation on `port`
    pub const fn setup(self, port: u8) -> SetupPacket {
        let port = port as u16;
        match self {
            Self::PowerOn => SetupPacket::new(PORT_REQUEST, request::SET_FEATURE, port_feature::PORT_POWER, port, 0),
            Self::SetReset => SetupPacket::new(PORT_REQUEST, request::SET_FEATURE, port_feature::PORT_RESET, port, 0),
            Self::GetStatus => SetupPacket::new(PORT_REQUEST | 0x80, request::GET_STATUS, 0, port, 4),
            Self::ClearConnect => Self::clear(port_feature::C_PORT_CONNECTION, port),
            Self::ClearEnable => Self::clear(port_feature::C_PORT_ENABLE, port),
            Self::ClearSuspend => Self::clear(port_feature::C_PORT_SUSPEND, port),
            Self::ClearOverCurrent => Self::clear(port_feature::C_PORT_OVER_CURRENT, port),
            Self::ClearReset => Self::clear(port_feature::C_PORT_RESET, port),
        }
    }

    const fn clear(feature: u16, port: u16) -> SetupPacket {
        SetupPacket::new(PORT_REQUEST, request::CLEAR_FEATURE, feature, port, 0)
    }

    /// Recognise a completed port request by its first setup word
    pub fn from_setup(setup: &SetupPacket) -> Option<(HubOp, u8)> {
        let port = u8::try_from(setup.index).ok()?;
        Self::ALL
            .into_iter()
            .find(|op| op.setup(port).words()[0] == setup.words()[0])
            .map(|op| (op, port))
    }
}

/// Single-flight gate for hub control transfers
#[derive(Debug, Default, Clone)]
pub struct ControlGate {
    busy: bool,
    pending: [u8; 8],
}

impl ControlGate {
    /// Idle gate
    pub const fn new() -> Self {
        Self {
            busy: false,
            pending: [0; 8],
        }
    }

    /// Take the gate if it is free
    pub fn try_acquire(&mut self) -> bool {
        !core::mem::replace(&mut self.busy, true)
    }

    /// Ask to send `op` on `port`. Returns true when the caller should send
    /// it now; otherwise it is latched until [`release`](Self::release).
    pub fn request(&mut self, op: HubOp, port: u8) -> bool {
        if self.try_acquire() {
            return true;
        }
        self.pending[op as usize] |= 1 << (port & 7);
        false
    }

    /// The in-flight request completed. Returns the next latched request,
    /// which the caller must send, keeping the gate held; or frees the gate.
    pub fn release(&mut self) -> Option<(HubOp, u8)> {
        for op in HubOp::ALL {
            let mask = &mut self.pending[op as usize];
            if *mask != 0 {
                let port = mask.trailing_zeros() as u8;
                *mask &= !(1 << port);
                return Some((op, port));
            }
        }
        self.busy = false;
        None
    }

    /// True while a request is in flight
    pub fn is_busy(&self) -> bool {
        self.busy
    }

    /// True if `op` on `port` is latched
    pub fn is_pending(&self, op: HubOp, port: u8) -> bool {
        self.pending[op as usize] & (1 << (port & 7)) != 0
    }

    /// Forget everything
    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

/// Downstream port state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PortState {
    #[default]
    Off,
    Disconnect,
    /// Consecutive connected polls seen, 1..=5
    Debounce(u8),
    Reset,
    Recovery,
    Active,
}

/// Side effect of a port transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PortAction {
    None,
    /// Make sure the debounce poll is running
    StartDebounce,
    /// Send SET_FEATURE(PORT_RESET)
    Reset,
    /// Start the recovery timer; the device runs at this speed
    StartRecovery(Speed),
    /// Disconnect whatever is attached to the port
    Detach,
}

impl PortState {
    /// Next state for a port status with the default five debounce polls
    pub fn on_status(self, status: PortStatus) -> (PortState, PortAction) {
        self.advance(status, DEBOUNCE_POLLS)
    }

    /// Next state for a port status, resetting after `polls` connected polls
    pub fn advance(self, status: PortStatus, polls: u8) -> (PortState, PortAction) {
        let connected = status.contains(PortStatus::CONNECTION);
        match self {
            Self::Off | Self::Disconnect if connected => (Self::Debounce(1), PortAction::StartDebounce),
            Self::Off | Self::Disconnect => (self, PortAction::None),
            Self::Debounce(_) if !connected => (Self::Disconnect, PortAction::None),
            Self::Debounce(n) if n >= polls => (Self::Reset, PortAction::Reset),
            Self::Debounce(n) => (Self::Debounce(n + 1), PortAction::None),
            Self::Reset if !connected => (Self::Disconnect, PortAction::None),
            Self::Reset if status.contains(PortStatus::ENABLE) => {
                (Self::Recovery, PortAction::StartRecovery(status.speed()))
            }
            Self::Reset => (self, PortAction::None),
            Self::Recovery | Self::Active if !connected => (Self::Disconnect, PortAction::Detach),
            Self::Recovery | Self::Active => (self, PortAction::None),
        }
    }

    /// True while the port is being debounced
    pub fn is_debouncing(self) -> bool {
        matches!(self, Self::Debounce(_))
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Port {
    state: PortState,
    speed: Speed,
    child: Option<DeviceId>,
}

/// Hub class driver
#[derive(Debug, Default)]
pub struct Hub {
    me: Option<DriverId>,
    device: Option<DeviceId>,
    endpoint: u8,
    max_packet: u16,
    interval: u8,
    port_count: u8,
    characteristics: u16,
    power_on_ms: u16,
    control_buffer: Option<BufferHandle>,
    change_buffer: Option<BufferHandle>,
    status_pipe: Option<PipeId>,
    debounce_running: bool,
    gate: ControlGate,
    ports: [Port; MAX_HUB_PORTS as usize],
}

impl Hub {
    /// Hub driver waiting for a device
    pub fn new() -> Self {
        Self::default()
    }

    /// Hub device currently driven
    pub fn device(&self) -> Option<DeviceId> {
        self.device
    }

    /// Downstream ports reported by the hub descriptor
    pub fn port_count(&self) -> u8 {
        self.port_count
    }

    /// wHubCharacteristics
    pub fn characteristics(&self) -> u16 {
        self.characteristics
    }

    /// Power-on to power-good time in milliseconds
    pub fn power_on_ms(&self) -> u16 {
        self.power_on_ms
    }

    /// State of port `port` (1-based)
    pub fn port_state(&self, port: u8) -> Option<PortState> {
        self.port(port).map(|p| p.state)
    }

    /// Device attached to port `port`
    pub fn port_device(&self, port: u8) -> Option<DeviceId> {
        self.port(port).and_then(|p| p.child)
    }

    /// Control request gate
    pub fn gate(&self) -> &ControlGate {
        &self.gate
    }

    fn port(&self, port: u8) -> Option<&Port> {
        self.ports.get(usize::from(port).checked_sub(1)?).filter(|_| port <= self.port_count)
    }

    fn port_mut(&mut self, port: u8) -> Option<&mut Port> {
        if port > self.port_count {
            return None;
        }
        self.ports.get_mut(usize::from(port).checked_sub(1)?)
    }

    fn ports(&self) -> core::ops::RangeInclusive<u8> {
        1..=self.port_count
    }

    /// Send `op` on `port` now, or latch it behind the in-flight request
    fn send<C: HostController, T: Timer>(&mut self, core: &mut HostCore<C, T>, op: HubOp, port: u8) {
        if self.gate.request(op, port) && !self.issue(core, op, port) {
            self.advance_gate(core);
        }
    }

    /// Replay latched requests until one is accepted or none are left
    fn advance_gate<C: HostController, T: Timer>(&mut self, core: &mut HostCore<C, T>) {
        while let Some((op, port)) = self.gate.release() {
            if self.issue(core, op, port) {
                break;
            }
        }
    }

    fn issue<C: HostController, T: Timer>(&mut self, core: &mut HostCore<C, T>, op: HubOp, port: u8) -> bool {
        let (Some(device), Some(me)) = (self.device, self.me) else {
            return false;
        };
        let setup = op.setup(port);
        let buffer = if setup.length > 0 { self.control_buffer } else { None };
        match core.queue_control_transfer(device, setup, buffer, Some(me)) {
            Ok(_) => true,
            Err(e) => {
                #[cfg(feature = "defmt")]
                defmt::warn!("Hub {}: {} on port {} not sent: {}", device, op, port, e);
                // only logged
                let _ = e;
                false
            }
        }
    }

    fn on_hub_descriptor<C: HostController, T: Timer>(&mut self, core: &mut HostCore<C, T>, data: &[u8]) {
        if data.len() < 7 || data[1] != descriptor_type::HUB || data[2] == 0 {
            #[cfg(feature = "defmt")]
            defmt::warn!("Hub {}: unusable hub descriptor", self.device);
            return;
        }
        self.port_count = data[2].min(MAX_HUB_PORTS);
        self.characteristics = u16::from_le_bytes([data[3], data[4]]);
        self.power_on_ms = u16::from(data[5]) * 2;

        #[cfg(feature = "defmt")]
        defmt::info!(
            "Hub {}: {} ports (reports {}), characteristics {=u16:#x}",
            self.device,
            self.port_count,
            data[2],
            self.characteristics
        );

        for port in self.ports() {
            self.send(core, HubOp::PowerOn, port);
        }
    }

    /// Every port is powered; give them bPwrOn2PwrGood before reading status
    fn wait_power_good<C: HostController, T: Timer>(&mut self, core: &mut HostCore<C, T>) {
        match self.me {
            Some(me) if self.power_on_ms > 0 => {
                let delay = u32::from(self.power_on_ms) * 1000;
                core.timer_mut().start(TimerId::new(me, POWER_GOOD_TAG), delay);
            }
            _ => self.start_status_pipe(core),
        }
    }

    fn start_status_pipe<C: HostController, T: Timer>(&mut self, core: &mut HostCore<C, T>) {
        let (Some(device), Some(me), Some(buffer)) = (self.device, self.me, self.change_buffer) else {
            return;
        };
        let opened = core.new_pipe(
            device,
            TransferType::Interrupt,
            self.endpoint,
            Direction::In,
            self.max_packet,
            self.interval,
            PipeOwner::Driver(me),
        );
        match opened {
            Ok(pipe) => {
                self.status_pipe = Some(pipe);
                self.queue_status_read(core, pipe, buffer);
            }
            Err(e) => {
                #[cfg(feature = "defmt")]
                defmt::warn!("Hub {}: status pipe not opened: {}", device, e);
                // only logged
                let _ = e;
            }
        }
    }

    fn queue_status_read<C: HostController, T: Timer>(
        &mut self,
        core: &mut HostCore<C, T>,
        pipe: PipeId,
        buffer: BufferHandle,
    ) {
        if let Err(e) = core.queue_data_transfer(pipe, buffer, 1) {
            #[cfg(feature = "defmt")]
            defmt::warn!("Hub {}: status read not queued: {}", self.device, e);
            // only logged; the hub stops reporting changes
            let _ = e;
        }
    }

    fn on_port_status<C: HostController, T: Timer>(&mut self, core: &mut HostCore<C, T>, port: u8, status: PortStatus) {
        for op in status.clear_ops() {
            self.send(core, op, port);
        }

        let polls = core.config().debounce_polls;
        let hold = core.is_enumerating() || self.ports().any(|p| p != port && self.port_resetting(p));
        let Some(record) = self.port_mut(port) else {
            return;
        };
        let previous = record.state;
        let (next, action) = previous.advance(status, polls);

        match action {
            PortAction::None => record.state = next,
            PortAction::StartDebounce => {
                record.state = next;
                self.start_debounce(core);
            }
            PortAction::Reset if hold => {
                // another device is between reset and addressing; poll again
                self.start_debounce(core);
            }
            PortAction::Reset => {
                record.state = next;
                self.send(core, HubOp::SetReset, port);
                if let Some(me) = self.me {
                    let timeout = core.config().reset_timeout_us;
                    core.timer_mut().start(TimerId::new(me, port), timeout);
                }
            }
            PortAction::StartRecovery(speed) => {
                record.state = next;
                record.speed = speed;
                if let Some(me) = self.me {
                    // replaces the reset timeout
                    let delay = core.config().reset_recovery_us;
                    core.timer_mut().start(TimerId::new(me, port), delay);
                }
            }
            PortAction::Detach => {
                record.state = next;
                let child = record.child.take();
                if let Some(me) = self.me {
                    core.timer_mut().stop(TimerId::new(me, port));
                }
                if let Some(child) = child {
                    // fails only when the child is already gone
                    let _ = core.request_disconnect(child);
                }
            }
        }

        #[cfg(feature = "defmt")]
        if let Some(record) = self.port(port) {
            if record.state != previous {
                defmt::info!("Hub {} port {}: {} -> {}", self.device, port, previous, record.state);
            }
        }
    }

    fn port_resetting(&self, port: u8) -> bool {
        self.port(port)
            .map(|p| matches!(p.state, PortState::Reset | PortState::Recovery))
            .unwrap_or(false)
    }

    fn start_debounce<C: HostController, T: Timer>(&mut self, core: &mut HostCore<C, T>) {
        if self.debounce_running {
            return;
        }
        if let Some(me) = self.me {
            let interval = core.config().debounce_interval_us;
            core.timer_mut().start(TimerId::new(me, DEBOUNCE_TAG), interval);
            self.debounce_running = true;
        }
    }

    fn debounce_tick<C: HostController, T: Timer>(&mut self, core: &mut HostCore<C, T>) {
        self.debounce_running = false;
        let mut polled = false;
        for port in self.ports() {
            if self.port(port).map(|p| p.state.is_debouncing()).unwrap_or(false) {
                self.send(core, HubOp::GetStatus, port);
                polled = true;
            }
        }
        if polled {
            self.start_debounce(core);
        }
    }

    /// Port timer: a reset that never finished, or the end of recovery
    fn port_timer<C: HostController, T: Timer>(&mut self, core: &mut HostCore<C, T>, port: u8) {
        let Some(hub) = self.device.and_then(|d| core.device(d)).map(|d| d.address()) else {
            return;
        };
        let me = self.me;
        let Some(record) = self.port_mut(port) else {
            return;
        };
        match record.state {
            PortState::Reset => {
                record.state = PortState::Disconnect;
                #[cfg(feature = "defmt")]
                defmt::warn!("Hub {} port {}: reset timed out", hub, port);
                return;
            }
            PortState::Recovery => {}
            _ => return,
        }
        match core.new_device(record.speed, hub, port) {
            Ok(child) => {
                record.child = Some(child);
                record.state = PortState::Active;
                #[cfg(feature = "defmt")]
                defmt::info!("Hub {} port {}: device {} attached", hub, port, child);
            }
            Err(UsbError::EnumerationBusy) => {
                if let Some(me) = me {
                    let delay = core.config().reset_recovery_us;
                    core.timer_mut().start(TimerId::new(me, port), delay);
                }
            }
            Err(e) => {
                record.state = PortState::Disconnect;
                #[cfg(feature = "defmt")]
                defmt::warn!("Hub {} port {}: device not activated: {}", hub, port, e);
                // only logged
                let _ = e;
            }
        }
    }
}

impl<C: HostController, T: Timer> Driver<C, T> for Hub {
    fn claim(&mut self, device: &Device, level: ClaimLevel, descriptors: &[u8]) -> bool {
        if self.device.is_some() || level != ClaimLevel::Device {
            return false;
        }
        if device.class() != HUB_CLASS || device.subclass() != 0 {
            return false;
        }

        let mut walk = Descriptors::new(descriptors);
        let Some(interface) = walk.next().and_then(|d| InterfaceDescriptor::parse(d).ok()) else {
            return false;
        };
        if interface.b_interface_class != HUB_CLASS || interface.b_num_endpoints != 1 {
            return false;
        }
        let Some(endpoint) = walk
            .find(|d| d[1] == descriptor_type::ENDPOINT)
            .and_then(|d| EndpointDescriptor::parse(d).ok())
        else {
            return false;
        };
        if endpoint.transfer_type() != TransferType::Interrupt || endpoint.direction() != Direction::In {
            return false;
        }

        self.endpoint = endpoint.number();
        self.max_packet = endpoint.max_packet_size();
        self.interval = endpoint.b_interval;
        true
    }

    fn configured(&mut self, core: &mut HostCore<C, T>, me: DriverId, device: DeviceId, _level: ClaimLevel) {
        self.me = Some(me);
        self.device = Some(device);

        let buffers = core
            .alloc_buffer(HUB_DESCRIPTOR_LEN as usize)
            .and_then(|control| match core.alloc_buffer(1) {
                Ok(change) => Ok((control, change)),
                Err(e) => {
                    core.free_buffer(control);
                    Err(e)
                }
            });
        let (control, change) = match buffers {
            Ok(pair) => pair,
            Err(e) => {
                #[cfg(feature = "defmt")]
                defmt::warn!("Hub {}: no buffers: {}", device, e);
                // only logged
                let _ = e;
                return;
            }
        };
        self.control_buffer = Some(control);
        self.change_buffer = Some(change);

        let setup = SetupPacket::new(
            HUB_DESCRIPTOR_REQUEST,
            request::GET_DESCRIPTOR,
            (descriptor_type::HUB as u16) << 8,
            0,
            HUB_DESCRIPTOR_LEN,
        );
        if self.gate.try_acquire() && core.queue_control_transfer(device, setup, Some(control), Some(me)).is_err() {
            #[cfg(feature = "defmt")]
            defmt::warn!("Hub {}: hub descriptor request failed", device);
            self.advance_gate(core);
        }
    }

    fn control(&mut self, core: &mut HostCore<C, T>, completion: &Completion) {
        let Some(setup) = completion.setup else {
            return;
        };

        let mut data = [0u8; HUB_DESCRIPTOR_LEN as usize];
        let len = completion.actual.min(data.len());
        if let Some(buffer) = completion.buffer {
            data[..len].copy_from_slice(&core.buffer(buffer)[..len]);
        }

        let is_hub_descriptor = setup.request_type == HUB_DESCRIPTOR_REQUEST
            && setup.request == request::GET_DESCRIPTOR
            && setup.value >> 8 == descriptor_type::HUB as u16;

        if completion.status.is_err() {
            #[cfg(feature = "defmt")]
            defmt::warn!("Hub {}: request {} failed", self.device, setup.words());
        } else if is_hub_descriptor {
            self.on_hub_descriptor(core, &data[..len]);
        } else {
            match HubOp::from_setup(&setup) {
                Some((HubOp::PowerOn, port)) => {
                    if port == self.port_count {
                        self.wait_power_good(core);
                    }
                }
                Some((HubOp::GetStatus, port)) if len >= 4 => {
                    let status = PortStatus::from_le_bytes([data[0], data[1], data[2], data[3]]);
                    self.on_port_status(core, port, status);
                }
                Some(_) => {}
                None => {
                    #[cfg(feature = "defmt")]
                    defmt::warn!("Hub {}: unexpected control echo {}", self.device, setup.words());
                }
            }
        }

        self.advance_gate(core);
    }

    fn on_complete(&mut self, core: &mut HostCore<C, T>, completion: &Completion) {
        if Some(completion.pipe) != self.status_pipe {
            return;
        }
        let Some(buffer) = completion.buffer else {
            return;
        };
        if completion.status.is_ok() && completion.actual >= 1 {
            let changed = core.buffer(buffer)[0];
            for port in self.ports() {
                if changed & (1 << port) != 0 {
                    self.send(core, HubOp::GetStatus, port);
                }
            }
        }
        self.queue_status_read(core, completion.pipe, buffer);
    }

    fn timer_event(&mut self, core: &mut HostCore<C, T>, tag: u8, _elapsed_us: u32) {
        match tag {
            DEBOUNCE_TAG => self.debounce_tick(core),
            POWER_GOOD_TAG => self.start_status_pipe(core),
            port => self.port_timer(core, port),
        }
    }

    fn disconnect(&mut self, core: &mut HostCore<C, T>, device: DeviceId) {
        if self.device != Some(device) {
            return;
        }
        for port in self.ports() {
            if let Some(child) = self.port_device(port) {
                // queued behind the hub itself, or already gone
                let _ = core.request_disconnect(child);
            }
        }
        if let Some(me) = self.me {
            core.timer_mut().stop(TimerId::new(me, DEBOUNCE_TAG));
            core.timer_mut().stop(TimerId::new(me, POWER_GOOD_TAG));
            for port in 1..=MAX_HUB_PORTS {
                core.timer_mut().stop(TimerId::new(me, port));
            }
        }
        for buffer in [self.control_buffer, self.change_buffer].into_iter().flatten() {
            core.free_buffer(buffer);
        }

        #[cfg(feature = "defmt")]
        defmt::info!("Hub {} disconnected", device);

        *self = Self::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connected() -> PortStatus {
        PortStatus::CONNECTION | PortStatus::POWER
    }

    #[test]
    fn test_port_status_parse() {
        let status = PortStatus::from_le_bytes([0x03, 0x01, 0x01, 0x00]);
        assert!(status.contains(PortStatus::CONNECTION | PortStatus::ENABLE | PortStatus::POWER));
        assert!(status.contains(PortStatus::C_CONNECTION));
        assert_eq!(status.speed(), Speed::Full);
        assert_eq!(PortStatus::from_le_bytes([0x03, 0x05, 0, 0]).speed(), Speed::High);
        assert_eq!(PortStatus::from_le_bytes([0x03, 0x03, 0, 0]).speed(), Speed::Low);
    }

    #[test]
    fn test_change_bits_map_to_clears() {
        let status = PortStatus::C_CONNECTION | PortStatus::C_RESET | PortStatus::CONNECTION;
        let mut ops = status.clear_ops();
        assert_eq!(ops.next(), Some(HubOp::ClearConnect));
        assert_eq!(ops.next(), Some(HubOp::ClearReset));
        assert_eq!(ops.next(), None);
    }

    #[test]
    fn test_setup_encoding_and_echo() {
        let reset = HubOp::SetReset.setup(3);
        assert_eq!(reset.to_bytes(), [0x23, 0x03, 0x04, 0x00, 0x03, 0x00, 0x00, 0x00]);
        let status = HubOp::GetStatus.setup(2);
        assert_eq!(status.to_bytes(), [0xA3, 0x00, 0x00, 0x00, 0x02, 0x00, 0x04, 0x00]);
        assert_eq!(HubOp::from_setup(&status), Some((HubOp::GetStatus, 2)));
        assert_eq!(HubOp::from_setup(&HubOp::ClearEnable.setup(5)), Some((HubOp::ClearEnable, 5)));
        assert_eq!(HubOp::from_setup(&SetupPacket::set_configuration(1)), None);
    }

    #[test]
    fn test_short_debounce_never_resets() {
        let mut state = PortState::Disconnect;
        let mut actions = heapless::Vec::<PortAction, 8>::new();
        for status in [connected(), connected(), connected(), PortStatus::POWER] {
            let (next, action) = state.on_status(status);
            state = next;
            actions.push(action).unwrap();
        }
        assert_eq!(state, PortState::Disconnect);
        assert!(!actions.contains(&PortAction::Reset));
        assert_eq!(actions[0], PortAction::StartDebounce);
    }

    #[test]
    fn test_full_debounce_resets_once_then_recovers() {
        let (mut state, action) = PortState::Off.on_status(connected());
        assert_eq!((state, action), (PortState::Debounce(1), PortAction::StartDebounce));

        let mut resets = 0;
        for _ in 0..5 {
            let (next, action) = state.on_status(connected());
            if action == PortAction::Reset {
                resets += 1;
            }
            state = next;
        }
        assert_eq!(resets, 1);
        assert_eq!(state, PortState::Reset);

        // still resetting
        assert_eq!(state.on_status(connected()), (PortState::Reset, PortAction::None));

        let enabled = connected() | PortStatus::ENABLE | PortStatus::HIGH_SPEED | PortStatus::C_RESET;
        let (state, action) = state.on_status(enabled);
        assert_eq!((state, action), (PortState::Recovery, PortAction::StartRecovery(Speed::High)));

        let (state, action) = PortState::Active.on_status(PortStatus::POWER | PortStatus::C_CONNECTION);
        assert_eq!((state, action), (PortState::Disconnect, PortAction::Detach));
    }

    #[test]
    fn test_configurable_poll_count() {
        let (state, _) = PortState::Off.advance(connected(), 2);
        let (state, action) = state.advance(connected(), 2);
        assert_eq!((state, action), (PortState::Debounce(2), PortAction::None));
        let (state, action) = state.advance(connected(), 2);
        assert_eq!((state, action), (PortState::Reset, PortAction::Reset));
    }

    #[test]
    fn test_gate_replays_lowest_port_first_once() {
        let mut gate = ControlGate::new();
        assert!(gate.request(HubOp::GetStatus, 1));
        assert!(!gate.request(HubOp::GetStatus, 4));
        assert!(!gate.request(HubOp::GetStatus, 2));
        assert!(!gate.request(HubOp::GetStatus, 4));
        assert!(gate.is_pending(HubOp::GetStatus, 2));

        assert_eq!(gate.release(), Some((HubOp::GetStatus, 2)));
        assert_eq!(gate.release(), Some((HubOp::GetStatus, 4)));
        assert!(gate.is_busy());
        assert_eq!(gate.release(), None);
        assert!(!gate.is_busy());
    }

    #[test]
    fn test_gate_replays_by_priority() {
        let mut gate = ControlGate::new();
        assert!(gate.try_acquire());
        gate.request(HubOp::SetReset, 1);
        gate.request(HubOp::GetStatus, 1);
        gate.request(HubOp::ClearConnect, 3);
        gate.request(HubOp::PowerOn, 7);

        assert_eq!(gate.release(), Some((HubOp::PowerOn, 7)));
        assert_eq!(gate.release(), Some((HubOp::ClearConnect, 3)));
        assert_eq!(gate.release(), Some((HubOp::GetStatus, 1)));
        assert_eq!(gate.release(), Some((HubOp::SetReset, 1)));
        assert_eq!(gate.release(), None);
    }

    #[test]
    fn test_claim_requires_hub_shape() {
        #[rustfmt::skip]
        let config = [
            9, 4, 0, 0, 1, 9, 0, 0, 0,
            7, 5, 0x81, 0x03, 1, 0, 12,
        ];
        let mut device = Device::new(Speed::High, 0, 0);
        device.class = HUB_CLASS;

        let mut hub = Hub::new();
        assert!(!Driver::<NoController, NoTimer>::claim(&mut hub, &device, ClaimLevel::Interface(0), &config));
        assert!(Driver::<NoController, NoTimer>::claim(&mut hub, &device, ClaimLevel::Device, &config));
        assert_eq!((hub.endpoint, hub.max_packet, hub.interval), (1, 1, 12));

        let mut bulk = config;
        bulk[12] = 0x02;
        let mut hub = Hub::new();
        assert!(!Driver::<NoController, NoTimer>::claim(&mut hub, &device, ClaimLevel::Device, &bulk));

        device.class = 0;
        assert!(!Driver::<NoController, NoTimer>::claim(&mut hub, &device, ClaimLevel::Device, &config));
    }

    struct NoController;
    impl HostController for NoController {
        fn dma_address(&self, ptr: *const u8) -> u32 {
            ptr as usize as u32
        }
        fn link_async(&mut self, _: PipeId, _: &crate::ehci::QueueHead) {}
        fn link_periodic(&mut self, _: PipeId, _: &crate::ehci::QueueHead, _: u8) {}
        fn unlink(&mut self, _: PipeId, _: &crate::ehci::QueueHead, _: TransferType) {}
        fn submit(&mut self, _: PipeId, _: &crate::ehci::QueueHead) {}
    }

    struct NoTimer;
    impl Timer for NoTimer {
        fn start(&mut self, _: TimerId, _: u32) {}
        fn stop(&mut self, _: TimerId) {}
    }
}
