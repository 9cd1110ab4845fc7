//! Build-time capacities and runtime tunables
//!
//! Record pools are sized here at compile time. Nothing in the host grows at
//! runtime: when a pool runs dry the request that needed it fails with
//! [`UsbError::NoResources`](crate::UsbError::NoResources).

/// Attached devices, including hubs and devices mid-enumeration
pub const MAX_DEVICES: usize = 16;

/// Pipes (one control pipe per device plus driver-requested pipes)
pub const MAX_PIPES: usize = 32;

/// Transfer records. A control transfer consumes two or three of them.
pub const MAX_TRANSFERS: usize = 64;

/// Registered drivers
pub const MAX_DRIVERS: usize = 16;

/// Drivers that may claim pieces of a single device
pub const MAX_CLAIMS_PER_DEVICE: usize = 4;

/// 64-byte DMA buffers
pub const SMALL_BUFFERS: usize = 16;

/// 512-byte DMA buffers
pub const LARGE_BUFFERS: usize = 4;

/// Size of a small DMA buffer
pub const SMALL_BUFFER_SIZE: usize = 64;

/// Size of a large DMA buffer, also the upper bound on a configuration
/// descriptor the enumeration will read
pub const LARGE_BUFFER_SIZE: usize = 512;

/// Downstream ports handled per hub. The status-change bitmap is one byte:
/// bit 0 is the hub itself, bits 1..=7 are ports.
pub const MAX_HUB_PORTS: u8 = 7;

/// Devices removed per dispatch round (hub cascades included)
pub const MAX_PENDING_REMOVALS: usize = MAX_DEVICES;

/// Runtime timing configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct HostConfig {
    /// Interval between hub debounce polls
    pub debounce_interval_us: u32,
    /// Consecutive connected polls required before a port is reset
    pub debounce_polls: u8,
    /// Time granted to a device after port reset before it is addressed
    pub reset_recovery_us: u32,
    /// How long a hub port may stay in reset before it is given up
    pub reset_timeout_us: u32,
}

impl HostConfig {
    /// Default timing: 20 ms debounce polls, five of them, 25 ms recovery,
    /// one second for a port reset to finish
    pub const fn new() -> Self {
        Self {
            debounce_interval_us: 20_000,
            debounce_polls: 5,
            reset_recovery_us: 25_000,
            reset_timeout_us: 1_000_000,
        }
    }

    /// Override the debounce poll interval
    pub const fn with_debounce_interval_us(mut self, us: u32) -> Self {
        self.debounce_interval_us = us;
        self
    }

    /// Override the number of debounce polls, clamped to 1..=5
    pub const fn with_debounce_polls(mut self, polls: u8) -> Self {
        self.debounce_polls = if polls == 0 {
            1
        } else if polls > 5 {
            5
        } else {
            polls
        };
        self
    }

    /// Override the post-reset recovery time
    pub const fn with_reset_recovery_us(mut self, us: u32) -> Self {
        self.reset_recovery_us = us;
        self
    }

    /// Override the port reset timeout
    pub const fn with_reset_timeout_us(mut self, us: u32) -> Self {
        self.reset_timeout_us = us;
        self
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self::new()
    }
}
