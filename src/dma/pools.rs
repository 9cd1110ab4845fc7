//! Zero-allocation DMA pools with compile-time sizing
//!
//! [`DescriptorArena`] holds one queue head per pipe slot and one transfer
//! descriptor (plus setup packet storage) per transfer slot. Records are
//! addressed by index, never by pointer, so the software records in
//! [`crate::pool::Pool`] can be moved and dropped freely while the hardware
//! view stays where the controller expects it.

use crate::config::{
    LARGE_BUFFERS, LARGE_BUFFER_SIZE, MAX_PIPES, MAX_TRANSFERS, SMALL_BUFFERS, SMALL_BUFFER_SIZE,
};
use crate::ehci::{QueueHead, QueueTD};
use crate::error::{Result, UsbError};

/// DMA storage for the 8-byte setup stage of a control transfer
#[repr(C, align(32))]
#[derive(Debug, Clone, Copy, Default)]
pub struct SetupBuffer(pub [u8; 8]);

#[repr(C, align(32))]
struct SmallBuffer([u8; SMALL_BUFFER_SIZE]);

#[repr(C, align(32))]
struct LargeBuffer([u8; LARGE_BUFFER_SIZE]);

/// Hardware-resident descriptor records
pub struct DescriptorArena {
    qh: [QueueHead; MAX_PIPES],
    qtd: [QueueTD; MAX_TRANSFERS],
    setup: [SetupBuffer; MAX_TRANSFERS],
}

impl DescriptorArena {
    /// Arena with every record idle
    pub fn new() -> Self {
        Self {
            qh: core::array::from_fn(|_| QueueHead::new()),
            qtd: core::array::from_fn(|_| QueueTD::new()),
            setup: [SetupBuffer::default(); MAX_TRANSFERS],
        }
    }

    /// Queue head of the pipe in slot `index`
    #[inline]
    pub fn qh(&self, index: usize) -> Option<&QueueHead> {
        self.qh.get(index)
    }

    /// Transfer descriptor of the transfer in slot `index`
    #[inline]
    pub fn qtd(&self, index: usize) -> Option<&QueueTD> {
        self.qtd.get(index)
    }

    /// Setup packet storage of the transfer in slot `index`
    #[inline]
    pub fn setup(&self, index: usize) -> Option<&SetupBuffer> {
        self.setup.get(index)
    }

    /// Mutable setup packet storage of the transfer in slot `index`
    #[inline]
    pub fn setup_mut(&mut self, index: usize) -> Option<&mut SetupBuffer> {
        self.setup.get_mut(index)
    }
}

impl Default for DescriptorArena {
    fn default() -> Self {
        Self::new()
    }
}

/// Size class of a data buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BufferClass {
    /// 64 bytes
    Small,
    /// 512 bytes
    Large,
}

/// Handle to an allocated data buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BufferHandle {
    class: BufferClass,
    index: u8,
}

impl BufferHandle {
    /// Size class
    pub const fn class(&self) -> BufferClass {
        self.class
    }

    /// Usable bytes
    pub const fn capacity(&self) -> usize {
        match self.class {
            BufferClass::Small => SMALL_BUFFER_SIZE,
            BufferClass::Large => LARGE_BUFFER_SIZE,
        }
    }

    /// Slot within its size class
    pub const fn index(&self) -> usize {
        self.index as usize
    }
}

/// Buffer pool for data stages with two size classes
pub struct BufferPool {
    small: [SmallBuffer; SMALL_BUFFERS],
    large: [LargeBuffer; LARGE_BUFFERS],
    small_used: [bool; SMALL_BUFFERS],
    large_used: [bool; LARGE_BUFFERS],
}

impl BufferPool {
    /// Pool with every buffer free and zeroed
    pub fn new() -> Self {
        Self {
            small: core::array::from_fn(|_| SmallBuffer([0; SMALL_BUFFER_SIZE])),
            large: core::array::from_fn(|_| LargeBuffer([0; LARGE_BUFFER_SIZE])),
            small_used: [false; SMALL_BUFFERS],
            large_used: [false; LARGE_BUFFERS],
        }
    }

    /// Allocate the smallest buffer class that fits `len` bytes
    pub fn alloc(&mut self, len: usize) -> Result<BufferHandle> {
        let (class, used) = if len <= SMALL_BUFFER_SIZE {
            (BufferClass::Small, &mut self.small_used[..])
        } else if len <= LARGE_BUFFER_SIZE {
            (BufferClass::Large, &mut self.large_used[..])
        } else {
            return Err(UsbError::BufferOverflow);
        };

        let index = used.iter().position(|taken| !taken).ok_or(UsbError::NoResources)?;
        used[index] = true;

        let handle = BufferHandle {
            class,
            index: index as u8,
        };
        self.get_mut(handle).fill(0);
        Ok(handle)
    }

    /// Buffer contents
    pub fn get(&self, handle: BufferHandle) -> &[u8] {
        match handle.class {
            BufferClass::Small => &self.small[handle.index()].0,
            BufferClass::Large => &self.large[handle.index()].0,
        }
    }

    /// Mutable buffer contents
    pub fn get_mut(&mut self, handle: BufferHandle) -> &mut [u8] {
        match handle.class {
            BufferClass::Small => &mut self.small[handle.index()].0,
            BufferClass::Large => &mut self.large[handle.index()].0,
        }
    }

    /// Return a buffer to the pool. Freeing a free buffer returns `false`.
    pub fn free(&mut self, handle: BufferHandle) -> bool {
        let used = match handle.class {
            BufferClass::Small => &mut self.small_used[handle.index()],
            BufferClass::Large => &mut self.large_used[handle.index()],
        };
        core::mem::replace(used, false)
    }

    /// Small buffers in use / total
    pub fn small_stats(&self) -> (usize, usize) {
        (self.small_used.iter().filter(|u| **u).count(), SMALL_BUFFERS)
    }

    /// Large buffers in use / total
    pub fn large_stats(&self) -> (usize, usize) {
        (self.large_used.iter().filter(|u| **u).count(), LARGE_BUFFERS)
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}
