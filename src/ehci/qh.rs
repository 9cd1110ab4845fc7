//! Queue Head (qH)
//!
//! Based on EHCI Specification Section 3.6. One queue head exists per pipe;
//! it carries the endpoint characteristics the controller needs to talk to
//! the endpoint and an overlay area that holds the qTD being executed.

use super::qtd::token;
use super::Speed;
use crate::error::{Result, UsbError};
use core::sync::atomic::{AtomicU32, Ordering};

/// Endpoint characteristics field bits
#[allow(missing_docs)]
pub mod endpoint {
    pub const DEVICE_ADDRESS_MASK: u32 = 0x7F;
    pub const ENDPOINT_NUMBER_SHIFT: u32 = 8;
    pub const ENDPOINT_NUMBER_MASK: u32 = 0xF;
    pub const ENDPOINT_SPEED_SHIFT: u32 = 12;
    pub const ENDPOINT_SPEED_MASK: u32 = 0x3;
    pub const DATA_TOGGLE_CONTROL: u32 = 1 << 14;
    pub const HEAD_OF_LIST: u32 = 1 << 15;
    pub const MAX_PACKET_LENGTH_SHIFT: u32 = 16;
    pub const MAX_PACKET_LENGTH_MASK: u32 = 0x7FF;
    pub const CONTROL_ENDPOINT: u32 = 1 << 27;
    pub const NAK_COUNT_RELOAD_SHIFT: u32 = 28;
}

/// Endpoint capabilities field bits
#[allow(missing_docs)]
pub mod capabilities {
    pub const INTERRUPT_SCHEDULE_MASK_SHIFT: u32 = 0;
    pub const SPLIT_COMPLETION_MASK_SHIFT: u32 = 8;
    pub const HUB_ADDRESS_SHIFT: u32 = 16;
    pub const HUB_ADDRESS_MASK: u32 = 0x7F;
    pub const PORT_NUMBER_SHIFT: u32 = 23;
    pub const PORT_NUMBER_MASK: u32 = 0x7F;
    pub const MULT_SHIFT: u32 = 30;

    /// Complete-split in microframes 2, 3 and 4
    pub const DEFAULT_SPLIT_COMPLETION: u32 = 0x1C;
}

/// Everything a queue head encodes about its endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointConfig {
    /// Device address (0 while enumerating)
    pub address: u8,
    /// Endpoint number 0..=15
    pub endpoint: u8,
    /// Device link speed
    pub speed: Speed,
    /// wMaxPacketSize
    pub max_packet_len: u16,
    /// Control endpoint (toggle taken from the qTD)
    pub control: bool,
    /// Periodic endpoint (needs an interrupt schedule mask)
    pub periodic: bool,
    /// Transaction-translator hub address for full/low-speed devices
    pub hub_address: u8,
    /// Transaction-translator hub port
    pub hub_port: u8,
}

/// Queue Head
///
/// Must be 32-byte aligned for DMA
#[repr(C, align(32))]
pub struct QueueHead {
    /// Horizontal link pointer to next qH (bit 0 = terminate, bits 2:1 = type)
    pub horizontal_link: AtomicU32,
    /// Endpoint characteristics
    pub endpoint_chars: AtomicU32,
    /// Endpoint capabilities (split transaction, schedule masks, multiplier)
    pub endpoint_caps: AtomicU32,
    /// Current qTD pointer (overlay area begins here)
    pub current_qtd: AtomicU32,
    /// Overlay: next qTD pointer
    pub next_qtd: AtomicU32,
    /// Overlay: alternate next qTD
    pub alt_next_qtd: AtomicU32,
    /// Overlay: token
    pub token: AtomicU32,
    /// Overlay: buffer pointers
    pub buffer_pointers: [AtomicU32; 5],
}

impl QueueHead {
    /// Horizontal link type: queue head
    pub const TYPE_QH: u32 = 1 << 1;

    /// Terminator bit
    pub const TERMINATE: u32 = 1;

    /// An unlinked, inactive queue head
    pub const fn new() -> Self {
        Self {
            horizontal_link: AtomicU32::new(Self::TERMINATE),
            endpoint_chars: AtomicU32::new(0),
            endpoint_caps: AtomicU32::new(0),
            current_qtd: AtomicU32::new(0),
            next_qtd: AtomicU32::new(Self::TERMINATE),
            alt_next_qtd: AtomicU32::new(Self::TERMINATE),
            token: AtomicU32::new(0),
            buffer_pointers: [
                AtomicU32::new(0),
                AtomicU32::new(0),
                AtomicU32::new(0),
                AtomicU32::new(0),
                AtomicU32::new(0),
            ],
        }
    }

    /// Program the endpoint characteristics and capabilities
    pub fn configure(&self, config: &EndpointConfig) -> Result<()> {
        if config.address > 127 || config.endpoint > 15 || config.max_packet_len > 1024 {
            return Err(UsbError::InvalidParameter);
        }

        let mut chars = config.address as u32
            | (config.endpoint as u32) << endpoint::ENDPOINT_NUMBER_SHIFT
            | config.speed.ehci_bits() << endpoint::ENDPOINT_SPEED_SHIFT
            | (config.max_packet_len as u32) << endpoint::MAX_PACKET_LENGTH_SHIFT;
        if config.control {
            chars |= endpoint::DATA_TOGGLE_CONTROL;
            if config.speed != Speed::High {
                chars |= endpoint::CONTROL_ENDPOINT;
            }
        }
        if !config.periodic {
            chars |= 15 << endpoint::NAK_COUNT_RELOAD_SHIFT;
        }

        let mut caps = 1 << capabilities::MULT_SHIFT;
        if config.speed != Speed::High {
            caps |= (config.hub_address as u32 & capabilities::HUB_ADDRESS_MASK) << capabilities::HUB_ADDRESS_SHIFT;
            caps |= (config.hub_port as u32 & capabilities::PORT_NUMBER_MASK) << capabilities::PORT_NUMBER_SHIFT;
        }
        if config.periodic {
            caps |= 0x01 << capabilities::INTERRUPT_SCHEDULE_MASK_SHIFT;
            if config.speed != Speed::High {
                caps |= capabilities::DEFAULT_SPLIT_COMPLETION << capabilities::SPLIT_COMPLETION_MASK_SHIFT;
            }
        }

        self.endpoint_chars.store(chars, Ordering::Release);
        self.endpoint_caps.store(caps, Ordering::Release);
        self.reset_overlay();
        Ok(())
    }

    /// Rewrite the device address field
    pub fn set_address(&self, address: u8) {
        let chars = self.endpoint_chars.load(Ordering::Acquire) & !endpoint::DEVICE_ADDRESS_MASK;
        self.endpoint_chars
            .store(chars | (address as u32 & endpoint::DEVICE_ADDRESS_MASK), Ordering::Release);
    }

    /// Rewrite the maximum packet length field
    pub fn set_max_packet_len(&self, len: u16) {
        let mask = endpoint::MAX_PACKET_LENGTH_MASK << endpoint::MAX_PACKET_LENGTH_SHIFT;
        let chars = self.endpoint_chars.load(Ordering::Acquire) & !mask;
        let len = (len as u32 & endpoint::MAX_PACKET_LENGTH_MASK) << endpoint::MAX_PACKET_LENGTH_SHIFT;
        self.endpoint_chars.store(chars | len, Ordering::Release);
    }

    /// Device address currently programmed
    pub fn address(&self) -> u8 {
        (self.endpoint_chars.load(Ordering::Acquire) & endpoint::DEVICE_ADDRESS_MASK) as u8
    }

    /// Maximum packet length currently programmed
    pub fn max_packet_len(&self) -> u16 {
        ((self.endpoint_chars.load(Ordering::Acquire) >> endpoint::MAX_PACKET_LENGTH_SHIFT)
            & endpoint::MAX_PACKET_LENGTH_MASK) as u16
    }

    /// Transaction translator (hub address, port) used for split transactions
    pub fn split_target(&self) -> (u8, u8) {
        let caps = self.endpoint_caps.load(Ordering::Acquire);
        (
            ((caps >> capabilities::HUB_ADDRESS_SHIFT) & capabilities::HUB_ADDRESS_MASK) as u8,
            ((caps >> capabilities::PORT_NUMBER_SHIFT) & capabilities::PORT_NUMBER_MASK) as u8,
        )
    }

    /// Hand an idle queue head a fresh qTD chain
    pub fn attach_chain(&self, first_bus_address: u32) -> Result<()> {
        if first_bus_address & 0x1F != 0 {
            return Err(UsbError::InvalidParameter);
        }
        self.next_qtd.store(first_bus_address, Ordering::Release);
        self.alt_next_qtd.store(Self::TERMINATE, Ordering::Release);
        // clear active/halted so the controller fetches next_qtd
        self.token.store(0, Ordering::Release);
        Ok(())
    }

    /// Overlay shows a halted endpoint
    pub fn is_halted(&self) -> bool {
        self.token.load(Ordering::Acquire) & token::STATUS_HALTED != 0
    }

    /// Overlay holds no active qTD and has nowhere to advance to
    pub fn is_idle(&self) -> bool {
        self.token.load(Ordering::Acquire) & token::STATUS_ACTIVE == 0
            && self.next_qtd.load(Ordering::Acquire) & Self::TERMINATE != 0
    }

    /// Reset the overlay area
    pub fn reset_overlay(&self) {
        self.current_qtd.store(0, Ordering::Release);
        self.next_qtd.store(Self::TERMINATE, Ordering::Release);
        self.alt_next_qtd.store(Self::TERMINATE, Ordering::Release);
        self.token.store(0, Ordering::Release);
        for pointer in &self.buffer_pointers {
            pointer.store(0, Ordering::Release);
        }
    }

    /// Return to the freshly constructed state
    pub fn clear(&self) {
        self.horizontal_link.store(Self::TERMINATE, Ordering::Release);
        self.endpoint_chars.store(0, Ordering::Release);
        self.endpoint_caps.store(0, Ordering::Release);
        self.reset_overlay();
    }
}

const _: () = assert!(core::mem::size_of::<QueueHead>() == 64);
const _: () = assert!(core::mem::align_of::<QueueHead>() == 32);

#[cfg(test)]
mod tests {
    use super::*;

    fn control(speed: Speed) -> EndpointConfig {
        EndpointConfig {
            address: 0,
            endpoint: 0,
            speed,
            max_packet_len: 8,
            control: true,
            periodic: false,
            hub_address: 3,
            hub_port: 2,
        }
    }

    #[test]
    fn test_control_endpoint_full_speed() {
        let qh = QueueHead::new();
        qh.configure(&control(Speed::Full)).unwrap();

        let chars = qh.endpoint_chars.load(Ordering::Relaxed);
        assert_ne!(chars & endpoint::CONTROL_ENDPOINT, 0);
        assert_ne!(chars & endpoint::DATA_TOGGLE_CONTROL, 0);
        assert_eq!(qh.max_packet_len(), 8);

        let caps = qh.endpoint_caps.load(Ordering::Relaxed);
        assert_eq!((caps >> capabilities::HUB_ADDRESS_SHIFT) & capabilities::HUB_ADDRESS_MASK, 3);
        assert_eq!((caps >> capabilities::PORT_NUMBER_SHIFT) & capabilities::PORT_NUMBER_MASK, 2);
    }

    #[test]
    fn test_high_speed_has_no_split_fields() {
        let qh = QueueHead::new();
        qh.configure(&control(Speed::High)).unwrap();
        let chars = qh.endpoint_chars.load(Ordering::Relaxed);
        assert_eq!(chars & endpoint::CONTROL_ENDPOINT, 0);
        assert_eq!(qh.endpoint_caps.load(Ordering::Relaxed), 1 << capabilities::MULT_SHIFT);
    }

    #[test]
    fn test_periodic_split_masks() {
        let qh = QueueHead::new();
        let config = EndpointConfig {
            endpoint: 1,
            control: false,
            periodic: true,
            ..control(Speed::Low)
        };
        qh.configure(&config).unwrap();
        let caps = qh.endpoint_caps.load(Ordering::Relaxed);
        assert_eq!(caps & 0xFF, 0x01);
        assert_eq!((caps >> capabilities::SPLIT_COMPLETION_MASK_SHIFT) & 0xFF, 0x1C);
    }

    #[test]
    fn test_invalid_parameters() {
        let qh = QueueHead::new();
        let bad = [
            EndpointConfig { address: 128, ..control(Speed::Full) },
            EndpointConfig { endpoint: 16, ..control(Speed::Full) },
            EndpointConfig { max_packet_len: 1025, ..control(Speed::Full) },
        ];
        for config in bad {
            assert_eq!(qh.configure(&config), Err(UsbError::InvalidParameter));
        }
    }

    #[test]
    fn test_address_and_maxlen_rewrite() {
        let qh = QueueHead::new();
        qh.configure(&control(Speed::Full)).unwrap();
        qh.set_address(42);
        qh.set_max_packet_len(64);
        assert_eq!(qh.address(), 42);
        assert_eq!(qh.max_packet_len(), 64);
        let chars = qh.endpoint_chars.load(Ordering::Relaxed);
        assert_ne!(chars & endpoint::CONTROL_ENDPOINT, 0);
    }

    #[test]
    fn test_attach_chain_requires_alignment() {
        let qh = QueueHead::new();
        assert_eq!(qh.attach_chain(0x2000_0004), Err(UsbError::InvalidParameter));
        assert!(qh.attach_chain(0x2000_0040).is_ok());
        assert_eq!(qh.next_qtd.load(Ordering::Relaxed), 0x2000_0040);
    }

    #[test]
    fn test_qh_size_alignment() {
        let qh = QueueHead::new();
        let addr = &qh as *const _ as usize;
        assert_eq!(addr & 0x1F, 0, "QueueHead not 32-byte aligned");
    }
}
