//! USB host error types

use core::fmt;

/// USB operation result type
pub type Result<T> = core::result::Result<T, UsbError>;

/// USB host error types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UsbError {
    /// Device not found or already disconnected
    DeviceDisconnected,
    /// Endpoint answered with STALL (halted without another error bit)
    Stall,
    /// Babble detected (device sent more than requested)
    Babble,
    /// Transaction error (CRC, timeout, bad PID)
    TransactionError,
    /// Missed split-transaction microframe
    MissedMicroframe,
    /// Buffer too small for the request, or data buffer over/underrun
    BufferOverflow,
    /// Invalid parameter
    InvalidParameter,
    /// Invalid state for operation
    InvalidState,
    /// Pool exhausted (devices, pipes, transfers, buffers, drivers)
    NoResources,
    /// All 127 device addresses are in use
    AddressExhausted,
    /// Another device is already being enumerated
    EnumerationBusy,
    /// Unsupported operation
    Unsupported,
    /// Malformed or short descriptor
    InvalidDescriptor,
}

impl fmt::Display for UsbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DeviceDisconnected => write!(f, "Device disconnected"),
            Self::Stall => write!(f, "USB stall"),
            Self::Babble => write!(f, "Babble detected"),
            Self::TransactionError => write!(f, "Transaction error"),
            Self::MissedMicroframe => write!(f, "Missed microframe"),
            Self::BufferOverflow => write!(f, "Buffer overflow"),
            Self::InvalidParameter => write!(f, "Invalid parameter"),
            Self::InvalidState => write!(f, "Invalid state"),
            Self::NoResources => write!(f, "No resources available"),
            Self::AddressExhausted => write!(f, "No free device address"),
            Self::EnumerationBusy => write!(f, "Enumeration already in progress"),
            Self::Unsupported => write!(f, "Unsupported operation"),
            Self::InvalidDescriptor => write!(f, "Invalid descriptor"),
        }
    }
}
