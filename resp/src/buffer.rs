// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use log::*;

use crate::memory::{tracker, Category};

/// Growth threshold: below this the buffer doubles the required size, above
/// it adds this much on top.
const RESIZE_THRESHOLD: usize = 1024 * 1024;

/// A byte buffer with separate read and write cursors,
/// `read_index <= write_index <= capacity`.
///
/// Writing: `ensure_available` guarantees tail room, `sink` exposes it,
/// `produce` commits bytes the caller wrote. Reading: `source` is the
/// readable range, `consume` retires it.
///
/// Instead of owning storage, the buffer may temporarily hold a *loan*: a
/// fixed-size entry taken from a provisioned buffer ring. A loaned buffer is
/// read-only; the owner takes the loan back before returning the entry to
/// the ring.
#[derive(Default)]
pub struct Buffer {
    data: Vec<u8>,
    read_index: usize,
    write_index: usize,
    loan: Option<Box<[u8]>>,
}

impl Buffer {
    /// An owned buffer with `capacity` bytes of storage. A capacity of zero
    /// makes a storage-less buffer intended for loans.
    pub fn with_capacity(capacity: usize) -> Self {
        tracker().allocate(Category::QueryBuffer, capacity);
        Buffer {
            data: vec![0; capacity],
            read_index: 0,
            write_index: 0,
            loan: None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn is_loaned(&self) -> bool {
        self.loan.is_some()
    }

    /// Guarantees `capacity - write_index >= n`. Returns true if the storage
    /// relocated; parsed argument views are offsets, so callers only use
    /// this for stats.
    pub fn ensure_available(&mut self, n: usize, greedy: bool) -> bool {
        debug_assert!(self.loan.is_none());
        let needed = self.write_index + n;
        if self.data.len() >= needed {
            return false;
        }
        let new_size = if !greedy {
            needed
        } else if needed < RESIZE_THRESHOLD {
            needed * 2
        } else {
            needed + RESIZE_THRESHOLD
        };
        trace!("buffer: resize {} -> {}", self.data.len(), new_size);
        tracker().allocate(Category::QueryBuffer, new_size - self.data.len());
        self.data.resize(new_size, 0);
        true
    }

    /// Writable tail. Call `produce` after filling a prefix of it.
    pub fn sink(&mut self) -> &mut [u8] {
        debug_assert!(self.loan.is_none());
        &mut self.data[self.write_index..]
    }

    pub fn available(&self) -> usize {
        self.data.len() - self.write_index
    }

    pub fn produce(&mut self, n: usize) {
        debug_assert!(self.write_index + n <= self.data.len());
        self.write_index += n;
    }

    /// The readable range `[read_index, write_index)`.
    pub fn source(&self) -> &[u8] {
        let storage: &[u8] = match &self.loan {
            Some(loan) => loan,
            None => &self.data,
        };
        &storage[self.read_index..self.write_index]
    }

    pub fn consume(&mut self, n: usize) {
        debug_assert!(self.read_index + n <= self.write_index);
        self.read_index += n;
    }

    /// Position of the read cursor from the start of storage. Parsed
    /// argument views are recorded relative to the storage start, so they
    /// stay valid across both consumption and relocation.
    pub fn read_pos(&self) -> usize {
        self.read_index
    }

    pub fn unread(&self) -> usize {
        self.write_index - self.read_index
    }

    /// Bytes at absolute storage offsets `[start, start + len)`.
    pub fn view(&self, start: usize, len: usize) -> &[u8] {
        let storage: &[u8] = match &self.loan {
            Some(loan) => loan,
            None => &self.data,
        };
        &storage[start..start + len]
    }

    /// Installs a loaned storage block holding `len` readable bytes. The
    /// buffer must be empty: a loan replaces the whole readable state.
    pub fn install_loan(&mut self, block: Box<[u8]>, len: usize) {
        debug_assert!(self.loan.is_none() && self.unread() == 0);
        debug_assert!(len <= block.len());
        self.read_index = 0;
        self.write_index = len;
        self.loan = Some(block);
    }

    /// Takes the loan back, discarding any unread loaned bytes.
    pub fn take_loan(&mut self) -> Option<Box<[u8]>> {
        let loan = self.loan.take();
        if loan.is_some() {
            self.read_index = 0;
            self.write_index = 0;
        }
        loan
    }

    /// Moves the loaned bytes into owned storage, preserving all offsets, and
    /// returns the loan. Used when a command spans receives: the ring entry
    /// goes back to the kernel while parsing continues in owned memory.
    pub fn adopt_loan(&mut self) -> Box<[u8]> {
        let loan = self.loan.take().expect("adopt_loan without a loan");
        let (read, write) = (self.read_index, self.write_index);
        self.read_index = 0;
        self.write_index = 0;
        self.ensure_available(write, false);
        self.data[..write].copy_from_slice(&loan[..write]);
        self.read_index = read;
        self.write_index = write;
        loan
    }

    /// Discards everything. Owned storage is kept for reuse.
    pub fn reset(&mut self) {
        debug_assert!(self.loan.is_none());
        self.read_index = 0;
        self.write_index = 0;
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        tracker().deallocate(Category::QueryBuffer, self.data.len());
    }
}
