//! Standard USB descriptors
//!
//! Only the fields the host core acts on are parsed: the device descriptor,
//! the configuration header, interface and endpoint descriptors. Parsing
//! reads little-endian fields byte by byte, so the source buffer needs no
//! particular alignment.

use crate::error::{Result, UsbError};
use crate::transfer::control::descriptor_type;
use crate::transfer::{Direction, TransferType};

/// Hub device and interface class
pub const HUB_CLASS: u8 = 0x09;

/// Length of the configuration descriptor header
pub const CONFIG_HEADER_LEN: usize = 9;

/// Shortest descriptor the configuration walker accepts
const MIN_WALK_LEN: usize = 4;

/// USB device descriptor (18 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DeviceDescriptor {
    pub bcd_usb: u16,
    pub b_device_class: u8,
    pub b_device_sub_class: u8,
    pub b_device_protocol: u8,
    pub b_max_packet_size0: u8,
    pub id_vendor: u16,
    pub id_product: u16,
    pub bcd_device: u16,
    pub i_manufacturer: u8,
    pub i_product: u8,
    pub i_serial_number: u8,
    pub b_num_configurations: u8,
}

impl DeviceDescriptor {
    /// Descriptor length on the wire
    pub const LEN: usize = 18;

    /// Parse from raw bytes
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::LEN || data[1] != descriptor_type::DEVICE {
            return Err(UsbError::InvalidDescriptor);
        }
        Ok(Self {
            bcd_usb: u16::from_le_bytes([data[2], data[3]]),
            b_device_class: data[4],
            b_device_sub_class: data[5],
            b_device_protocol: data[6],
            b_max_packet_size0: data[7],
            id_vendor: u16::from_le_bytes([data[8], data[9]]),
            id_product: u16::from_le_bytes([data[10], data[11]]),
            bcd_device: u16::from_le_bytes([data[12], data[13]]),
            i_manufacturer: data[14],
            i_product: data[15],
            i_serial_number: data[16],
            b_num_configurations: data[17],
        })
    }

    /// Any of the three string indices is set
    pub const fn has_strings(&self) -> bool {
        self.i_manufacturer != 0 || self.i_product != 0 || self.i_serial_number != 0
    }
}

/// Configuration descriptor header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConfigurationDescriptor {
    pub w_total_length: u16,
    pub b_num_interfaces: u8,
    pub b_configuration_value: u8,
    pub i_configuration: u8,
    pub bm_attributes: u8,
    pub b_max_power: u8,
}

impl ConfigurationDescriptor {
    /// Parse the 9-byte header
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < CONFIG_HEADER_LEN || data[1] != descriptor_type::CONFIGURATION {
            return Err(UsbError::InvalidDescriptor);
        }
        Ok(Self {
            w_total_length: u16::from_le_bytes([data[2], data[3]]),
            b_num_interfaces: data[4],
            b_configuration_value: data[5],
            i_configuration: data[6],
            bm_attributes: data[7],
            b_max_power: data[8],
        })
    }
}

/// Interface descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct InterfaceDescriptor {
    pub b_interface_number: u8,
    pub b_alternate_setting: u8,
    pub b_num_endpoints: u8,
    pub b_interface_class: u8,
    pub b_interface_sub_class: u8,
    pub b_interface_protocol: u8,
}

impl InterfaceDescriptor {
    /// Parse from raw bytes
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 9 || data[0] < 9 || data[1] != descriptor_type::INTERFACE {
            return Err(UsbError::InvalidDescriptor);
        }
        Ok(Self {
            b_interface_number: data[2],
            b_alternate_setting: data[3],
            b_num_endpoints: data[4],
            b_interface_class: data[5],
            b_interface_sub_class: data[6],
            b_interface_protocol: data[7],
        })
    }
}

/// Endpoint descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EndpointDescriptor {
    pub b_endpoint_address: u8,
    pub bm_attributes: u8,
    pub w_max_packet_size: u16,
    pub b_interval: u8,
}

impl EndpointDescriptor {
    /// Parse from raw bytes
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 7 || data[0] < 7 || data[1] != descriptor_type::ENDPOINT {
            return Err(UsbError::InvalidDescriptor);
        }
        Ok(Self {
            b_endpoint_address: data[2],
            bm_attributes: data[3],
            w_max_packet_size: u16::from_le_bytes([data[4], data[5]]),
            b_interval: data[6],
        })
    }

    /// Endpoint number without the direction bit
    pub const fn number(&self) -> u8 {
        self.b_endpoint_address & 0x0F
    }

    /// Data direction
    pub const fn direction(&self) -> Direction {
        if self.b_endpoint_address & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }

    /// Transfer type from bmAttributes
    pub const fn transfer_type(&self) -> TransferType {
        match self.bm_attributes & 0x03 {
            0 => TransferType::Control,
            1 => TransferType::Isochronous,
            2 => TransferType::Bulk,
            _ => TransferType::Interrupt,
        }
    }

    /// Packet size without the high-bandwidth multiplier bits
    pub const fn max_packet_size(&self) -> u16 {
        self.w_max_packet_size & 0x07FF
    }
}

/// Walks a run of descriptors, yielding each one's bytes.
///
/// Stops at the first descriptor shorter than four bytes or running past the
/// end of the data.
#[derive(Debug, Clone)]
pub struct Descriptors<'a> {
    rest: &'a [u8],
}

impl<'a> Descriptors<'a> {
    /// Walk `data`
    pub const fn new(data: &'a [u8]) -> Self {
        Self { rest: data }
    }
}

impl<'a> Iterator for Descriptors<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        let len = *self.rest.first()? as usize;
        if len < MIN_WALK_LEN || len > self.rest.len() {
            self.rest = &[];
            return None;
        }
        let (descriptor, rest) = self.rest.split_at(len);
        self.rest = rest;
        Some(descriptor)
    }
}

/// Splits configuration bytes (after the 9-byte header) into interfaces.
///
/// Each item is the interface number and the bytes from its interface
/// descriptor up to, not including, the next interface descriptor.
#[derive(Debug, Clone)]
pub struct Interfaces<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Interfaces<'a> {
    /// Split `data`
    pub const fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }
}

impl<'a> Iterator for Interfaces<'a> {
    type Item = (u8, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        let mut start = None;
        let mut cursor = self.offset;
        for descriptor in Descriptors::new(self.data.get(self.offset..)?) {
            if descriptor[1] == descriptor_type::INTERFACE && descriptor.len() >= 9 {
                if start.is_some() {
                    break;
                }
                start = Some(cursor);
            }
            cursor += descriptor.len();
        }
        let start = start?;
        self.offset = cursor;
        Some((self.data[start + 2], &self.data[start..cursor]))
    }
}
