//! Attached device records

use crate::config::MAX_CLAIMS_PER_DEVICE;
use crate::dma::BufferHandle;
use crate::driver::{ClaimLevel, DriverId};
use crate::ehci::Speed;
use crate::enumeration::EnumState;
use crate::error::{Result, UsbError};
use crate::pipe::PipeId;
use crate::pool::Handle;
use bitflags::bitflags;

/// Handle to a [`Device`] record
pub type DeviceId = Handle<Device>;

bitflags! {
    /// Configuration descriptor bmAttributes
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ConfigAttributes: u8 {
        /// Always set by USB 1.1 and later devices
        const RESERVED_ONE = 1 << 7;
        /// Device powers itself
        const SELF_POWERED = 1 << 6;
        /// Device can signal remote wakeup
        const REMOTE_WAKEUP = 1 << 5;
    }
}

/// One string descriptor as far as enumeration tracks it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct StringInfo {
    /// Index advertised by the device descriptor (0 = none)
    pub index: u8,
    /// UTF-16 code units returned by the device (0 when not fetched)
    pub len: u8,
}

impl StringInfo {
    /// The device advertises this string
    pub const fn is_advertised(&self) -> bool {
        self.index != 0
    }
}

/// Manufacturer, product and serial number strings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct StringTable {
    pub manufacturer: StringInfo,
    pub product: StringInfo,
    pub serial: StringInfo,
}

/// A driver's hold on part of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Claim {
    /// Claiming driver
    pub driver: DriverId,
    /// Whole device or one interface
    pub level: ClaimLevel,
}

/// One attached USB device
#[derive(Debug)]
pub struct Device {
    pub(crate) control_pipe: PipeId,
    pub(crate) address: u8,
    pub(crate) reserved_address: u8,
    pub(crate) hub_address: u8,
    pub(crate) hub_port: u8,
    pub(crate) tt: (u8, u8),
    pub(crate) speed: Speed,
    pub(crate) state: EnumState,
    pub(crate) class: u8,
    pub(crate) subclass: u8,
    pub(crate) protocol: u8,
    pub(crate) max_packet_size0: u8,
    pub(crate) vendor_id: u16,
    pub(crate) product_id: u16,
    pub(crate) language_id: u16,
    pub(crate) strings: StringTable,
    pub(crate) configuration: u8,
    pub(crate) interface_count: u8,
    pub(crate) attributes: ConfigAttributes,
    pub(crate) max_power_ma: u16,
    pub(crate) config_len: u16,
    pub(crate) enum_buffer: Option<BufferHandle>,
    pub(crate) claims: heapless::Vec<Claim, MAX_CLAIMS_PER_DEVICE>,
    pub(crate) next: Option<DeviceId>,
}

impl Device {
    /// Fresh record for a device that has just been reset, still at
    /// address 0 with an 8-byte default control packet size.
    pub fn new(speed: Speed, hub_address: u8, hub_port: u8) -> Self {
        Self {
            control_pipe: PipeId::dangling(),
            address: 0,
            reserved_address: 0,
            hub_address,
            hub_port,
            tt: (hub_address, hub_port),
            speed,
            state: EnumState::AwaitDeviceHeader,
            class: 0,
            subclass: 0,
            protocol: 0,
            max_packet_size0: 8,
            vendor_id: 0,
            product_id: 0,
            language_id: 0,
            strings: StringTable::default(),
            configuration: 0,
            interface_count: 0,
            attributes: ConfigAttributes::empty(),
            max_power_ma: 0,
            config_len: 0,
            enum_buffer: None,
            claims: heapless::Vec::new(),
            next: None,
        }
    }

    /// Control pipe (endpoint 0)
    pub fn control_pipe(&self) -> PipeId {
        self.control_pipe
    }

    /// Assigned address, 0 until SET_ADDRESS has completed
    pub fn address(&self) -> u8 {
        self.address
    }

    /// Address of the hub the device hangs off (0 for the root port)
    pub fn hub_address(&self) -> u8 {
        self.hub_address
    }

    /// Hub port number (0 for the root port)
    pub fn hub_port(&self) -> u8 {
        self.hub_port
    }

    /// Hub address and port of the transaction translator that splits
    /// this device's full/low-speed traffic: the nearest high-speed hub
    /// upstream. (0, 0) for the root port.
    pub fn transaction_translator(&self) -> (u8, u8) {
        self.tt
    }

    /// Link speed
    pub fn speed(&self) -> Speed {
        self.speed
    }

    /// Enumeration progress
    pub fn state(&self) -> EnumState {
        self.state
    }

    /// bDeviceClass
    pub fn class(&self) -> u8 {
        self.class
    }

    /// bDeviceSubClass
    pub fn subclass(&self) -> u8 {
        self.subclass
    }

    /// bDeviceProtocol
    pub fn protocol(&self) -> u8 {
        self.protocol
    }

    /// bMaxPacketSize0
    pub fn max_packet_size0(&self) -> u8 {
        self.max_packet_size0
    }

    /// idVendor
    pub fn vendor_id(&self) -> u16 {
        self.vendor_id
    }

    /// idProduct
    pub fn product_id(&self) -> u16 {
        self.product_id
    }

    /// First language the device offers for its strings (0 if none)
    pub fn language_id(&self) -> u16 {
        self.language_id
    }

    /// String descriptor presence and length
    pub fn strings(&self) -> &StringTable {
        &self.strings
    }

    /// bConfigurationValue selected with SET_CONFIGURATION
    pub fn configuration(&self) -> u8 {
        self.configuration
    }

    /// bNumInterfaces of the selected configuration
    pub fn interface_count(&self) -> u8 {
        self.interface_count
    }

    /// bmAttributes of the selected configuration
    pub fn attributes(&self) -> ConfigAttributes {
        self.attributes
    }

    /// Maximum bus current in milliamps
    pub fn max_power_ma(&self) -> u16 {
        self.max_power_ma
    }

    /// Drivers holding the device or its interfaces
    pub fn claims(&self) -> &[Claim] {
        &self.claims
    }

    /// True once enumeration finished and drivers were offered the device
    pub fn is_configured(&self) -> bool {
        self.state == EnumState::Configured
    }

    /// Next device in attachment order
    pub fn next(&self) -> Option<DeviceId> {
        self.next
    }
}

/// Device address allocator (1..=127)
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct AddressMap(u128);

impl AddressMap {
    pub(crate) const fn new() -> Self {
        Self(0)
    }

    /// Reserve the lowest free address
    pub(crate) fn reserve(&mut self) -> Result<u8> {
        let address = (1..=127u8)
            .find(|a| self.0 & (1 << a) == 0)
            .ok_or(UsbError::AddressExhausted)?;
        self.0 |= 1 << address;
        Ok(address)
    }

    pub(crate) fn release(&mut self, address: u8) {
        if (1..=127).contains(&address) {
            self.0 &= !(1 << address);
        }
    }

    #[cfg(test)]
    pub(crate) fn is_reserved(&self, address: u8) -> bool {
        address < 128 && self.0 & (1 << address) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_device_defaults() {
        let device = Device::new(Speed::Low, 3, 2);
        assert_eq!(device.address(), 0);
        assert_eq!(device.max_packet_size0(), 8);
        assert_eq!(device.state().ordinal(), 0);
        assert_eq!((device.hub_address(), device.hub_port()), (3, 2));
        assert!(device.claims().is_empty());
    }

    #[test]
    fn test_addresses_are_unique_until_released() {
        let mut map = AddressMap::new();
        let mut seen = 0u128;
        for _ in 0..127 {
            let address = map.reserve().unwrap();
            assert!((1..=127).contains(&address));
            assert_eq!(seen & (1 << address), 0);
            seen |= 1 << address;
        }
        assert_eq!(map.reserve(), Err(UsbError::AddressExhausted));

        map.release(42);
        assert!(!map.is_reserved(42));
        assert_eq!(map.reserve(), Ok(42));
    }

    #[test]
    fn test_address_zero_never_handed_out() {
        let mut map = AddressMap::new();
        map.release(0);
        assert_eq!(map.reserve(), Ok(1));
        assert!(!map.is_reserved(0));
    }
}
