//! Queue Transfer Descriptor (qTD)
//!
//! Based on EHCI Specification Section 3.5. Every field the controller reads
//! or writes is an `AtomicU32` so stores are never reordered or elided.

use crate::error::{Result, UsbError};
use core::sync::atomic::{AtomicU32, Ordering};

/// qTD token field bit definitions
#[allow(missing_docs)]
pub mod token {
    pub const STATUS_ACTIVE: u32 = 1 << 7;
    pub const STATUS_HALTED: u32 = 1 << 6;
    pub const STATUS_DATA_BUFFER_ERROR: u32 = 1 << 5;
    pub const STATUS_BABBLE: u32 = 1 << 4;
    pub const STATUS_TRANSACTION_ERROR: u32 = 1 << 3;
    pub const STATUS_MISSED_MICROFRAME: u32 = 1 << 2;
    pub const STATUS_MASK: u32 = 0xFF;

    pub const PID_SHIFT: u32 = 8;
    pub const PID_OUT: u32 = 0x0 << PID_SHIFT;
    pub const PID_IN: u32 = 0x1 << PID_SHIFT;
    pub const PID_SETUP: u32 = 0x2 << PID_SHIFT;

    pub const ERROR_COUNTER_SHIFT: u32 = 10;
    pub const INTERRUPT_ON_COMPLETE: u32 = 1 << 15;

    pub const TOTAL_BYTES_SHIFT: u32 = 16;
    pub const TOTAL_BYTES_MASK: u32 = 0x7FFF;

    pub const DATA_TOGGLE: u32 = 1 << 31;
}

/// Token packet identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Pid {
    /// Host to device data
    Out,
    /// Device to host data
    In,
    /// Setup stage of a control transfer
    Setup,
}

impl Pid {
    const fn bits(self) -> u32 {
        match self {
            Self::Out => token::PID_OUT,
            Self::In => token::PID_IN,
            Self::Setup => token::PID_SETUP,
        }
    }
}

/// Queue Transfer Descriptor
///
/// Must be 32-byte aligned for DMA
#[repr(C, align(32))]
pub struct QueueTD {
    /// Next qTD pointer (bits 31:5 valid, bit 0 = terminate)
    pub next_qtd: AtomicU32,
    /// Alternate next qTD pointer (taken on short packets)
    pub alt_next_qtd: AtomicU32,
    /// Status, PID, error counter, byte count, toggle
    pub token: AtomicU32,
    /// Buffer page pointers (5 x 4 KiB)
    pub buffer_pointers: [AtomicU32; 5],
}

impl QueueTD {
    /// Link terminator bit
    pub const TERMINATE: u32 = 1;

    /// Largest byte count one qTD can describe (five pages, worst alignment)
    pub const MAX_TRANSFER_SIZE: usize = 16 * 1024;

    /// An inactive, unlinked descriptor
    pub const fn new() -> Self {
        Self {
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

    /// Arm the descriptor for one stage.
    ///
    /// `buffer` is the bus address of the data (ignored when `len` is zero).
    /// The descriptor is written inactive-first and the token stored last so
    /// the controller never sees a half-built qTD as active.
    pub fn prepare(&self, pid: Pid, data_toggle: bool, buffer: u32, len: usize, interrupt_on_complete: bool) -> Result<()> {
        if len > Self::MAX_TRANSFER_SIZE {
            return Err(UsbError::BufferOverflow);
        }

        self.token.store(0, Ordering::Release);
        self.next_qtd.store(Self::TERMINATE, Ordering::Release);
        self.alt_next_qtd.store(Self::TERMINATE, Ordering::Release);

        let mut page = buffer;
        for (i, pointer) in self.buffer_pointers.iter().enumerate() {
            if len == 0 {
                pointer.store(0, Ordering::Release);
            } else if i == 0 {
                pointer.store(buffer, Ordering::Release);
                page = buffer & !0xFFF;
            } else {
                page = page.wrapping_add(0x1000);
                pointer.store(page, Ordering::Release);
            }
        }

        let mut bits = token::STATUS_ACTIVE | pid.bits() | 3 << token::ERROR_COUNTER_SHIFT;
        bits |= (len as u32 & token::TOTAL_BYTES_MASK) << token::TOTAL_BYTES_SHIFT;
        if data_toggle {
            bits |= token::DATA_TOGGLE;
        }
        if interrupt_on_complete {
            bits |= token::INTERRUPT_ON_COMPLETE;
        }
        self.token.store(bits, Ordering::Release);
        Ok(())
    }

    /// Point this descriptor at the next one in the chain
    pub fn link_next(&self, next_bus_address: u32) {
        self.next_qtd.store(next_bus_address & !0x1F, Ordering::Release);
    }

    /// Still owned by the controller
    pub fn is_active(&self) -> bool {
        self.token.load(Ordering::Acquire) & token::STATUS_ACTIVE != 0
    }

    /// Outcome recorded by the controller
    pub fn status(&self) -> Result<()> {
        let bits = self.token.load(Ordering::Acquire);
        if bits & token::STATUS_HALTED == 0 {
            return Ok(());
        }
        if bits & token::STATUS_BABBLE != 0 {
            Err(UsbError::Babble)
        } else if bits & token::STATUS_DATA_BUFFER_ERROR != 0 {
            Err(UsbError::BufferOverflow)
        } else if bits & token::STATUS_TRANSACTION_ERROR != 0 {
            Err(UsbError::TransactionError)
        } else if bits & token::STATUS_MISSED_MICROFRAME != 0 {
            Err(UsbError::MissedMicroframe)
        } else {
            Err(UsbError::Stall)
        }
    }

    /// Bytes the controller did not move (counts down from the armed length)
    pub fn remaining(&self) -> usize {
        ((self.token.load(Ordering::Acquire) >> token::TOTAL_BYTES_SHIFT) & token::TOTAL_BYTES_MASK) as usize
    }

    /// Return to the idle state before going back to the arena
    pub fn reset(&self) {
        self.next_qtd.store(Self::TERMINATE, Ordering::Release);
        self.alt_next_qtd.store(Self::TERMINATE, Ordering::Release);
        self.token.store(0, Ordering::Release);
        for pointer in &self.buffer_pointers {
            pointer.store(0, Ordering::Release);
        }
    }
}

const _: () = assert!(core::mem::size_of::<QueueTD>() == 32);
const _: () = assert!(core::mem::align_of::<QueueTD>() == 32);
