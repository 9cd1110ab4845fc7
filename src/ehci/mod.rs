//! EHCI data structures shared with the host controller
//!
//! The core builds and retires the hardware-resident records defined here
//! (queue heads and transfer descriptors). Linking them into the async and
//! periodic schedules, and walking them, is the job of the register-level
//! scheduling layer, which the core reaches through [`HostController`].
//!
//! References:
//! - EHCI Specification Section 3 (Data Structures)
//! - i.MX RT1060 Reference Manual, Chapter 66.6 (USB Host Controller Registers)

pub mod qh;
pub mod qtd;

pub use qh::{EndpointConfig, QueueHead};
pub use qtd::{Pid, QueueTD};

pub use qh::{capabilities, endpoint};
pub use qtd::token;

use crate::pipe::PipeId;
use crate::transfer::TransferType;
use bitflags::bitflags;

/// Negotiated link speed of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Speed {
    /// 1.5 Mbit/s
    Low,
    /// 12 Mbit/s
    #[default]
    Full,
    /// 480 Mbit/s
    High,
}

impl Speed {
    /// Encoding used by the queue head endpoint speed field
    pub const fn ehci_bits(self) -> u32 {
        match self {
            Self::Full => 0,
            Self::Low => 1,
            Self::High => 2,
        }
    }
}

bitflags! {
    /// USB Status Register (USBSTS) bits the core reacts to
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UsbSts: u32 {
        /// USB Interrupt (transfer completed with IOC set)
        const USB_INTERRUPT = 1 << 0;
        /// USB Error Interrupt (transfer completed with an error)
        const USB_ERROR_INTERRUPT = 1 << 1;
        /// Port Change Detect
        const PORT_CHANGE_DETECT = 1 << 2;
        /// Frame List Rollover
        const FRAME_LIST_ROLLOVER = 1 << 3;
        /// Host System Error
        const HOST_SYSTEM_ERROR = 1 << 4;
        /// Interrupt on Async Advance
        const INTERRUPT_ON_ASYNC_ADVANCE = 1 << 5;
    }
}

impl UsbSts {
    /// Status bits that mean descriptors may have been retired
    pub const TRANSFER_EVENTS: Self = Self::USB_INTERRUPT.union(Self::USB_ERROR_INTERRUPT);
}

/// Register-level scheduling layer.
///
/// Implemented outside this crate by whatever owns the EHCI registers. The
/// queue heads handed over live in the host's DMA arena and stay put until
/// `unlink` is called for them.
pub trait HostController {
    /// Bus address the controller must use for the CPU address `ptr`
    fn dma_address(&self, ptr: *const u8) -> u32;

    /// Insert a control or bulk queue head into the async schedule
    fn link_async(&mut self, pipe: PipeId, qh: &QueueHead);

    /// Insert an interrupt queue head into the periodic schedule
    fn link_periodic(&mut self, pipe: PipeId, qh: &QueueHead, interval: u8);

    /// Remove a queue head from whichever schedule holds it
    fn unlink(&mut self, pipe: PipeId, qh: &QueueHead, kind: TransferType);

    /// New descriptors were attached to `qh`
    fn submit(&mut self, pipe: PipeId, qh: &QueueHead);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_speed_encoding() {
        assert_eq!(Speed::Full.ehci_bits(), 0);
        assert_eq!(Speed::Low.ehci_bits(), 1);
        assert_eq!(Speed::High.ehci_bits(), 2);
        assert_eq!(Speed::default(), Speed::Full);
    }

    #[test]
    fn test_transfer_events_mask() {
        let status = UsbSts::USB_ERROR_INTERRUPT | UsbSts::PORT_CHANGE_DETECT;
        assert!(status.intersects(UsbSts::TRANSFER_EVENTS));
        assert!(!UsbSts::FRAME_LIST_ROLLOVER.intersects(UsbSts::TRANSFER_EVENTS));
    }
}
