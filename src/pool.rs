//! Fixed-capacity record pools
//!
//! Device, pipe and transfer records live in [`Pool`]s sized at build time.
//! A pool hands out [`Handle`]s instead of references: a handle is a slot
//! index plus the slot's generation, and the generation is bumped every time
//! the slot is freed. A handle kept past `free` therefore never resolves to
//! the slot's next owner.
//!
//! The slot index doubles as the index into the DMA arena
//! ([`crate::dma::DescriptorArena`]), which keeps hardware descriptors apart
//! from these software records.

use core::fmt;
use core::marker::PhantomData;

/// Typed, generation-checked reference to a pool slot
pub struct Handle<T> {
    index: u16,
    generation: u16,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    const fn new(index: u16, generation: u16) -> Self {
        Self {
            index,
            generation,
            _marker: PhantomData,
        }
    }

    /// A handle that never resolves, for records not yet wired up
    pub(crate) const fn dangling() -> Self {
        Self::new(u16::MAX, u16::MAX)
    }

    /// Slot index, shared with the DMA arena
    #[inline(always)]
    pub const fn index(self) -> usize {
        self.index as usize
    }

    /// Generation the handle was issued with
    #[inline(always)]
    pub const fn generation(self) -> u16 {
        self.generation
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl<T> Eq for Handle<T> {}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

#[cfg(feature = "defmt")]
impl<T> defmt::Format for Handle<T> {
    fn format(&self, fmt: defmt::Formatter) {
        defmt::write!(fmt, "#{}.{}", self.index, self.generation)
    }
}

enum Slot<T> {
    Free { next: Option<u16> },
    Used(T),
}

/// Fixed-capacity free-list pool
pub struct Pool<T, const N: usize> {
    slots: [Slot<T>; N],
    generations: [u16; N],
    free_head: Option<u16>,
    used: usize,
}

impl<T, const N: usize> Pool<T, N> {
    /// Create a pool with every slot on the free list
    pub fn new() -> Self {
        assert!(N <= u16::MAX as usize);
        Self {
            slots: core::array::from_fn(|i| Slot::Free {
                next: if i + 1 < N { Some((i + 1) as u16) } else { None },
            }),
            generations: [0; N],
            free_head: if N > 0 { Some(0) } else { None },
            used: 0,
        }
    }

    /// Take a slot off the free list and move `value` into it.
    ///
    /// Returns `None` when the pool is exhausted.
    pub fn allocate(&mut self, value: T) -> Option<Handle<T>> {
        let index = self.free_head?;
        let slot = &mut self.slots[index as usize];
        let Slot::Free { next } = *slot else {
            // free list points at a live slot: refuse rather than alias it
            return None;
        };
        self.free_head = next;
        *slot = Slot::Used(value);
        self.used += 1;
        Some(Handle::new(index, self.generations[index as usize]))
    }

    /// Return a slot to the pool, handing back the record it held.
    ///
    /// Stale handles are ignored and return `None`.
    pub fn free(&mut self, handle: Handle<T>) -> Option<T> {
        if !self.contains(handle) {
            return None;
        }
        let index = handle.index();
        let slot = core::mem::replace(
            &mut self.slots[index],
            Slot::Free {
                next: self.free_head,
            },
        );
        self.generations[index] = self.generations[index].wrapping_add(1);
        self.free_head = Some(handle.index);
        self.used -= 1;
        match slot {
            Slot::Used(value) => Some(value),
            Slot::Free { .. } => None,
        }
    }

    /// True while `handle` refers to a live record
    pub fn contains(&self, handle: Handle<T>) -> bool {
        handle.index() < N
            && self.generations[handle.index()] == handle.generation
            && matches!(self.slots[handle.index()], Slot::Used(_))
    }

    /// Borrow a live record
    pub fn get(&self, handle: Handle<T>) -> Option<&T> {
        if !self.contains(handle) {
            return None;
        }
        match &self.slots[handle.index()] {
            Slot::Used(value) => Some(value),
            Slot::Free { .. } => None,
        }
    }

    /// Mutably borrow a live record
    pub fn get_mut(&mut self, handle: Handle<T>) -> Option<&mut T> {
        if !self.contains(handle) {
            return None;
        }
        match &mut self.slots[handle.index()] {
            Slot::Used(value) => Some(value),
            Slot::Free { .. } => None,
        }
    }

    /// Iterate over live records with their handles
    pub fn iter(&self) -> impl Iterator<Item = (Handle<T>, &T)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(move |(i, slot)| match slot {
                Slot::Used(value) => Some((Handle::new(i as u16, self.generations[i]), value)),
                Slot::Free { .. } => None,
            })
    }

    /// Number of live records
    pub fn len(&self) -> usize {
        self.used
    }

    /// True when no record is live
    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    /// Total number of slots
    pub const fn capacity(&self) -> usize {
        N
    }

    /// Number of slots still on the free list
    pub fn available(&self) -> usize {
        N - self.used
    }
}

impl<T, const N: usize> Default for Pool<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Pool utilization statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PoolStats {
    /// Device records in use / total
    pub devices: (usize, usize),
    /// Pipe records in use / total
    pub pipes: (usize, usize),
    /// Transfer records in use / total
    pub transfers: (usize, usize),
    /// Small DMA buffers in use / total
    pub small_buffers: (usize, usize),
    /// Large DMA buffers in use / total
    pub large_buffers: (usize, usize),
}

impl PoolStats {
    /// Check if any pool is more than 80% used
    pub fn is_low(&self) -> bool {
        let low = |(used, total): (usize, usize)| total > 0 && used * 5 > total * 4;
        low(self.devices)
            || low(self.pipes)
            || low(self.transfers)
            || low(self.small_buffers)
            || low(self.large_buffers)
    }
}
