//! USB control request encoding
//!
//! The 8-byte setup packet is reproduced bit-for-bit per USB 2.0 §9.3.
//! Besides the byte form used for DMA, the packet has a two-word raw view:
//! word 0 is `bmRequestType | bRequest << 8 | wValue << 16` and word 1 is
//! `wIndex | wLength << 16`. Drivers use word 0 to recognise which request a
//! completion belongs to.

use crate::transfer::Direction;

/// Standard request codes (USB 2.0 Table 9-4)
#[allow(missing_docs)]
pub mod request {
    pub const GET_STATUS: u8 = 0x00;
    pub const CLEAR_FEATURE: u8 = 0x01;
    pub const SET_FEATURE: u8 = 0x03;
    pub const SET_ADDRESS: u8 = 0x05;
    pub const GET_DESCRIPTOR: u8 = 0x06;
    pub const SET_CONFIGURATION: u8 = 0x09;
}

/// bmRequestType fields
#[allow(missing_docs)]
pub mod request_type {
    pub const DIR_IN: u8 = 0x80;
    pub const TYPE_STANDARD: u8 = 0x00;
    pub const TYPE_CLASS: u8 = 0x20;
    pub const TYPE_VENDOR: u8 = 0x40;
    pub const RECIPIENT_DEVICE: u8 = 0x00;
    pub const RECIPIENT_INTERFACE: u8 = 0x01;
    pub const RECIPIENT_ENDPOINT: u8 = 0x02;
    pub const RECIPIENT_OTHER: u8 = 0x03;
}

/// Descriptor type codes used by the host core
#[allow(missing_docs)]
pub mod descriptor_type {
    pub const DEVICE: u8 = 0x01;
    pub const CONFIGURATION: u8 = 0x02;
    pub const STRING: u8 = 0x03;
    pub const INTERFACE: u8 = 0x04;
    pub const ENDPOINT: u8 = 0x05;
    pub const HUB: u8 = 0x29;
}

/// USB setup packet
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SetupPacket {
    /// bmRequestType
    pub request_type: u8,
    /// bRequest
    pub request: u8,
    /// wValue
    pub value: u16,
    /// wIndex
    pub index: u16,
    /// wLength
    pub length: u16,
}

impl SetupPacket {
    /// Build a setup packet from its five fields
    pub const fn new(request_type: u8, request: u8, value: u16, index: u16, length: u16) -> Self {
        Self {
            request_type,
            request,
            value,
            index,
            length,
        }
    }

    /// Standard GET_DESCRIPTOR request
    pub const fn get_descriptor(desc_type: u8, desc_index: u8, language_id: u16, length: u16) -> Self {
        Self::new(
            request_type::DIR_IN,
            request::GET_DESCRIPTOR,
            ((desc_type as u16) << 8) | desc_index as u16,
            language_id,
            length,
        )
    }

    /// Standard SET_ADDRESS request
    pub const fn set_address(address: u8) -> Self {
        Self::new(0x00, request::SET_ADDRESS, address as u16, 0, 0)
    }

    /// Standard SET_CONFIGURATION request
    pub const fn set_configuration(config_value: u8) -> Self {
        Self::new(0x00, request::SET_CONFIGURATION, config_value as u16, 0, 0)
    }

    /// SET_FEATURE addressed to `recipient` (device, interface, endpoint)
    pub const fn set_feature(recipient: u8, feature: u16, index: u16) -> Self {
        Self::new(recipient & 0x1F, request::SET_FEATURE, feature, index, 0)
    }

    /// CLEAR_FEATURE addressed to `recipient`
    pub const fn clear_feature(recipient: u8, feature: u16, index: u16) -> Self {
        Self::new(recipient & 0x1F, request::CLEAR_FEATURE, feature, index, 0)
    }

    /// Standard CLEAR_FEATURE(ENDPOINT_HALT)
    pub const fn clear_halt(endpoint: u8) -> Self {
        Self::clear_feature(request_type::RECIPIENT_ENDPOINT, 0, endpoint as u16)
    }

    /// Direction of the data stage (and of a zero-length request: OUT)
    pub const fn direction(&self) -> Direction {
        if self.request_type & request_type::DIR_IN != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }

    /// Wire form, little endian
    pub const fn to_bytes(&self) -> [u8; 8] {
        let value = self.value.to_le_bytes();
        let index = self.index.to_le_bytes();
        let length = self.length.to_le_bytes();
        [
            self.request_type,
            self.request,
            value[0],
            value[1],
            index[0],
            index[1],
            length[0],
            length[1],
        ]
    }

    /// Parse the wire form
    pub const fn from_bytes(bytes: [u8; 8]) -> Self {
        Self::new(
            bytes[0],
            bytes[1],
            u16::from_le_bytes([bytes[2], bytes[3]]),
            u16::from_le_bytes([bytes[4], bytes[5]]),
            u16::from_le_bytes([bytes[6], bytes[7]]),
        )
    }

    /// Two-word raw view: `[type | request << 8 | value << 16, index | length << 16]`
    pub const fn words(&self) -> [u32; 2] {
        [
            self.request_type as u32 | (self.request as u32) << 8 | (self.value as u32) << 16,
            self.index as u32 | (self.length as u32) << 16,
        ]
    }

    /// Build from the two-word raw view
    pub const fn from_words(words: [u32; 2]) -> Self {
        Self::new(
            words[0] as u8,
            (words[0] >> 8) as u8,
            (words[0] >> 16) as u16,
            words[1] as u16,
            (words[1] >> 16) as u16,
        )
    }
}
