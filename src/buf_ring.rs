//! Ring-provided buffer pool using IORING_REGISTER_PBUF_RING.
//!
//! The ring entries and the buffers they advertise live in one page-aligned
//! allocation. The kernel picks buffers straight from the ring for each
//! multishot recvmsg completion, so recycling a buffer is a ring write and a
//! tail store, never an SQE.

use io_uring::types::BufRingEntry;
use std::alloc::{self, Layout};
use std::io;
use std::mem;
use std::sync::atomic::{AtomicU16, Ordering};

/// Largest ring the kernel accepts.
pub const MAX_RING_ENTRIES: u16 = 1 << 15;

const PAGE_SIZE: usize = 4096;

/// Buffers start on this boundary so the cmsghdr records the kernel writes
/// after the recvmsg-out header are naturally aligned.
const BUFFER_ALIGN: usize = mem::align_of::<libc::cmsghdr>();

/// Provided buffer ring plus the buffer memory it hands to the kernel.
pub struct BufRing {
    /// Layout: [BufRingEntry; ring_entries] followed by buffer data.
    memory: *mut u8,
    memory_layout: Layout,
    /// Length advertised to the kernel for every buffer.
    buffer_size: usize,
    /// Distance between buffer starts (`buffer_size` rounded up to `BUFFER_ALIGN`).
    stride: usize,
    ring_entries: u16,
    /// Tail shared with the kernel (aliases the resv field of entry 0).
    tail: *const AtomicU16,
    local_tail: u16,
    mask: u16,
}

impl BufRing {
    /// Allocate a ring of `ring_entries` buffers of `buffer_size` bytes each.
    ///
    /// Every buffer is added tagged with its pool index and the tail is then
    /// advanced once, publishing the whole pool in a single step.
    pub fn new(ring_entries: u16, buffer_size: usize) -> io::Result<Self> {
        if ring_entries == 0 || !ring_entries.is_power_of_two() || ring_entries > MAX_RING_ENTRIES
        {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "ring entries must be a power of two no larger than 32768",
            ));
        }
        if buffer_size == 0 || buffer_size > u32::MAX as usize {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "buffer size out of range",
            ));
        }

        let stride = buffer_size
            .checked_next_multiple_of(BUFFER_ALIGN)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "buffer size overflow"))?;
        let ring_size = ring_entries as usize * mem::size_of::<BufRingEntry>();
        let total_size = (ring_entries as usize)
            .checked_mul(stride)
            .and_then(|data| data.checked_add(ring_size))
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "pool size overflow"))?;

        let layout = Layout::from_size_align(total_size, PAGE_SIZE)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid layout"))?;

        let memory = unsafe { alloc::alloc_zeroed(layout) };
        if memory.is_null() {
            return Err(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "allocation failed",
            ));
        }

        let tail =
            unsafe { BufRingEntry::tail(memory as *const BufRingEntry) as *const AtomicU16 };

        let mut ring = Self {
            memory,
            memory_layout: layout,
            buffer_size,
            stride,
            ring_entries,
            tail,
            local_tail: 0,
            mask: ring_entries - 1,
        };

        for bid in 0..ring_entries {
            ring.add_buffer(bid);
        }
        ring.commit();

        Ok(ring)
    }

    /// Ring base address for registration.
    #[inline]
    pub fn ring_addr(&self) -> u64 {
        self.memory as u64
    }

    #[inline]
    pub fn ring_entries(&self) -> u16 {
        self.ring_entries
    }

    #[inline]
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    #[inline]
    fn buffer_base(&self) -> *mut u8 {
        let ring_size = self.ring_entries as usize * mem::size_of::<BufRingEntry>();
        unsafe { self.memory.add(ring_size) }
    }

    #[inline]
    fn buffer_ptr(&self, buf_id: u16) -> *mut u8 {
        debug_assert!(buf_id < self.ring_entries);
        unsafe { self.buffer_base().add(buf_id as usize * self.stride) }
    }

    /// Full buffer by ID, or `None` if the ID is outside the pool.
    ///
    /// Only meaningful for a buffer the kernel has handed back through a
    /// completion and that has not been recycled yet.
    #[inline]
    pub fn get(&self, buf_id: u16) -> Option<&[u8]> {
        if buf_id >= self.ring_entries {
            return None;
        }
        Some(unsafe { std::slice::from_raw_parts(self.buffer_ptr(buf_id), self.buffer_size) })
    }

    /// Write an entry for `buf_id` at the local tail (not yet visible).
    #[inline]
    fn add_buffer(&mut self, buf_id: u16) {
        let idx = (self.local_tail & self.mask) as usize;
        let entry = unsafe { &mut *(self.memory as *mut BufRingEntry).add(idx) };

        entry.set_addr(self.buffer_ptr(buf_id) as u64);
        entry.set_len(self.buffer_size as u32);
        entry.set_bid(buf_id);

        self.local_tail = self.local_tail.wrapping_add(1);
    }

    /// Publish pending entries to the kernel.
    #[inline]
    fn commit(&self) {
        // Release so the kernel observes the entry writes before the tail.
        unsafe {
            (*self.tail).store(self.local_tail, Ordering::Release);
        }
    }

    /// Hand a buffer back to the kernel under its original ID and size.
    #[inline]
    pub fn return_buffer(&mut self, buf_id: u16) {
        self.add_buffer(buf_id);
        self.commit();
    }

    #[cfg(test)]
    pub(crate) fn tail(&self) -> u16 {
        unsafe { (*self.tail).load(Ordering::Acquire) }
    }

    #[cfg(test)]
    fn entry(&self, idx: u16) -> (u64, u32, u16) {
        let entry = unsafe { &*(self.memory as *const BufRingEntry).add((idx & self.mask) as usize) };
        (entry.addr(), entry.len(), entry.bid())
    }
}

impl Drop for BufRing {
    fn drop(&mut self) {
        unsafe {
            alloc::dealloc(self.memory, self.memory_layout);
        }
    }
}
