//! DMA-visible memory for USB transfers
//!
//! Everything the controller reads or writes lives in two places owned by the
//! host core: the [`DescriptorArena`] (queue heads, transfer descriptors and
//! setup packets, index-addressed by the owning record's pool slot) and the
//! [`BufferPool`] (data stage buffers).
//!
//! **CRITICAL**: the host core must sit in memory the controller can reach,
//! and must not move once a device is attached. On Teensy 4.x place it in
//! OCRAM (`0x2020_0000`), or in DTCM with the data cache left as is; cache
//! maintenance below handles cacheable placement.

pub mod pools;

pub use pools::{BufferClass, BufferHandle, BufferPool, DescriptorArena, SetupBuffer};

/// DMA alignment requirement (32-byte cache line and EHCI record alignment)
pub const DMA_ALIGNMENT: usize = 32;

/// Round `addr` up to DMA alignment
#[inline]
pub const fn align_dma(addr: usize) -> usize {
    (addr + DMA_ALIGNMENT - 1) & !(DMA_ALIGNMENT - 1)
}

/// Check if an address is DMA-aligned
#[inline]
pub const fn is_dma_aligned(addr: usize) -> bool {
    addr & (DMA_ALIGNMENT - 1) == 0
}

/// Order descriptor writes before the controller is told about them
#[inline]
pub fn barrier() {
    #[cfg(all(target_arch = "arm", target_os = "none"))]
    cortex_m::asm::dsb();
    #[cfg(not(all(target_arch = "arm", target_os = "none")))]
    core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
}

/// Make CPU writes to `buffer` visible to the controller
#[inline]
pub fn prepare_for_device(buffer: &[u8]) {
    #[cfg(all(target_arch = "arm", target_os = "none"))]
    cache_ops::clean_dcache(buffer.as_ptr() as usize, buffer.len());
    #[cfg(not(all(target_arch = "arm", target_os = "none")))]
    let _ = buffer;
    barrier();
}

/// Drop stale cache lines over a buffer the controller has written
#[inline]
pub fn prepare_for_cpu(buffer: &[u8]) {
    barrier();
    #[cfg(all(target_arch = "arm", target_os = "none"))]
    cache_ops::invalidate_dcache(buffer.as_ptr() as usize, buffer.len());
    #[cfg(not(all(target_arch = "arm", target_os = "none")))]
    let _ = buffer;
}

/// Cache maintenance for cacheable DMA buffers (Cortex-M7)
#[cfg(all(target_arch = "arm", target_os = "none"))]
mod cache_ops {
    use cortex_m::asm::{dsb, isb};

    const DCACHE_LINE_SIZE: usize = 32;

    /// Clean by MVA to PoC
    const SCB_DCCMVAC: *mut u32 = 0xE000_EF68 as *mut u32;
    /// Invalidate by MVA to PoC
    const SCB_DCIMVAC: *mut u32 = 0xE000_EF5C as *mut u32;

    fn for_each_line(addr: usize, size: usize, register: *mut u32) {
        let start = addr & !(DCACHE_LINE_SIZE - 1);
        let end = (addr + size + DCACHE_LINE_SIZE - 1) & !(DCACHE_LINE_SIZE - 1);
        dsb();
        for line in (start..end).step_by(DCACHE_LINE_SIZE) {
            // Safety: SCB cache maintenance registers are always mapped on
            // Cortex-M7 and writing a line address has no other side effect
            unsafe { core::ptr::write_volatile(register, line as u32) };
        }
        dsb();
        isb();
    }

    pub fn clean_dcache(addr: usize, size: usize) {
        for_each_line(addr, size, SCB_DCCMVAC);
    }

    pub fn invalidate_dcache(addr: usize, size: usize) {
        for_each_line(addr, size, SCB_DCIMVAC);
    }
}
