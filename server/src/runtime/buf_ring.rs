// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::io;
use std::sync::atomic::{AtomicU16, Ordering};

use io_uring::types::BufRingEntry;
use io_uring::Submitter;
use resp::memory::{tracker, Category};

/// A provisioned buffer ring: a kernel-shared ring of buffer descriptors
/// plus the buffers themselves. The kernel picks an entry per
/// buffer-selecting recv and reports its id in the completion; the entry
/// goes back into the ring once the client is done with the bytes.
///
/// Entry ownership follows a strict take/put protocol: a buffer id reported
/// by a completion is taken exactly once, and pushed back exactly once.
pub struct BufRing {
    /// The mmap'd descriptor ring shared with the kernel,
    /// `num_entries * size_of::<BufRingEntry>()` bytes.
    ring_addr: *mut libc::c_void,
    num_entries: u16,
    entry_size: u32,
    /// Next unused descriptor slot, including unpublished ones.
    private_tail: u16,
    buffers: Vec<Option<Box<[u8]>>>,
}

impl BufRing {
    pub fn new(
        submitter: Submitter<'_>,
        num_entries: u16,
        entry_size: u32,
        group_id: u16,
    ) -> io::Result<Self> {
        assert!(num_entries.is_power_of_two());

        let ring_len = num_entries as usize * std::mem::size_of::<BufRingEntry>();
        // SAFETY: fresh anonymous mapping, length is non-zero.
        let ring_addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                ring_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_ANONYMOUS | libc::MAP_SHARED | libc::MAP_POPULATE,
                -1,
                0,
            )
        };
        if ring_addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        // SAFETY: the mapping outlives the registration; unregistration
        // happens implicitly when the ring itself is torn down at exit.
        unsafe { submitter.register_buf_ring(ring_addr as u64, num_entries, group_id)? };

        tracker().allocate(
            Category::QueryBuffer,
            num_entries as usize * entry_size as usize,
        );

        let mut buf_ring = BufRing {
            ring_addr,
            num_entries,
            entry_size,
            private_tail: 0,
            buffers: Vec::with_capacity(num_entries as usize),
        };
        for id in 0..num_entries {
            let block = vec![0u8; entry_size as usize].into_boxed_slice();
            buf_ring.push_entry(block.as_ptr(), entry_size, id);
            buf_ring.buffers.push(Some(block));
        }
        buf_ring.publish();
        Ok(buf_ring)
    }

    pub fn entry_size(&self) -> u32 {
        self.entry_size
    }

    /// Takes the buffer whose id the kernel reported in a completion. The
    /// id must come from a completion and must not have been taken already.
    pub fn take(&mut self, id: u16) -> Box<[u8]> {
        self.buffers[id as usize]
            .take()
            .expect("buffer id double-taken")
    }

    /// Returns a taken buffer to the kernel's ring under its original id.
    pub fn put(&mut self, id: u16, block: Box<[u8]>) {
        debug_assert!(self.buffers[id as usize].is_none());
        self.push_entry(block.as_ptr(), self.entry_size, id);
        self.buffers[id as usize] = Some(block);
        self.publish();
    }

    fn push_entry(&mut self, addr: *const u8, len: u32, bid: u16) {
        let entries = self.ring_addr as *mut BufRingEntry;
        let index = self.private_tail & (self.num_entries - 1);
        // SAFETY: index is masked into the mapped descriptor array.
        let entry = unsafe { &mut *entries.add(index as usize) };
        entry.set_addr(addr as u64);
        entry.set_len(len);
        entry.set_bid(bid);
        self.private_tail = self.private_tail.wrapping_add(1);
    }

    /// Advances the shared tail, handing new descriptors to the kernel.
    fn publish(&mut self) {
        let base = self.ring_addr as *const BufRingEntry;
        // SAFETY: the tail word lives inside the mapped ring; the kernel
        // reads it with acquire ordering.
        let shared_tail = unsafe { BufRingEntry::tail(base) } as *const AtomicU16;
        unsafe { (*shared_tail).store(self.private_tail, Ordering::Release) };
    }
}

impl Drop for BufRing {
    fn drop(&mut self) {
        tracker().deallocate(
            Category::QueryBuffer,
            self.num_entries as usize * self.entry_size as usize,
        );
        let ring_len = self.num_entries as usize * std::mem::size_of::<BufRingEntry>();
        // SAFETY: unmapping the mapping created in new().
        unsafe { libc::munmap(self.ring_addr, ring_len) };
    }
}
