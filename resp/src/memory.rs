// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Process-wide memory accounting.
//!
//! The accountant is the single source of truth for the `maxmemory` check.
//! Everything that backs user-visible data reports here: keys and values
//! under [`Category::Data`], connection query/output buffers and provisioned
//! buffer rings under [`Category::QueryBuffer`]. Counters are relaxed
//! atomics; the reported total is advisory, which is all the evictor needs.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    /// Key and value byte strings.
    Data = 0,
    /// I/O buffers backing client queries and replies.
    QueryBuffer = 1,
}

pub struct MemoryTracker {
    counters: [AtomicUsize; 2],
    peak: AtomicUsize,
}

static TRACKER: MemoryTracker = MemoryTracker {
    counters: [AtomicUsize::new(0), AtomicUsize::new(0)],
    peak: AtomicUsize::new(0),
};

/// The process-wide accountant. Available from the first allocation to
/// process exit; no setup or teardown required.
pub fn tracker() -> &'static MemoryTracker {
    &TRACKER
}

impl MemoryTracker {
    pub fn allocate(&self, category: Category, n: usize) {
        self.counters[category as usize].fetch_add(n, Ordering::Relaxed);

        let sum = self.total_allocated();
        let mut peak = self.peak.load(Ordering::Relaxed);
        while sum > peak {
            match self
                .peak
                .compare_exchange_weak(peak, sum, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(cur) => peak = cur,
            }
        }
    }

    pub fn deallocate(&self, category: Category, n: usize) {
        self.counters[category as usize].fetch_sub(n, Ordering::Relaxed);
    }

    pub fn allocated(&self, category: Category) -> usize {
        self.counters[category as usize].load(Ordering::Relaxed)
    }

    pub fn total_allocated(&self) -> usize {
        self.counters[0].load(Ordering::Relaxed) + self.counters[1].load(Ordering::Relaxed)
    }

    pub fn peak_allocated(&self) -> usize {
        self.peak.load(Ordering::Relaxed)
    }
}

/// An accounted byte string. Construction and growth report to the
/// accountant under [`Category::Data`]; dropping gives the bytes back.
pub struct TrackedString {
    data: Vec<u8>,
}

/// Values are shared by reference so read commands can hand them to the
/// reply path without copying. Writers copy-on-write when the count is
/// above one.
pub type SharedString = Arc<TrackedString>;

impl TrackedString {
    pub fn from_slice(bytes: &[u8]) -> Self {
        let data = bytes.to_vec();
        tracker().allocate(Category::Data, data.capacity());
        TrackedString { data }
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        tracker().allocate(Category::Data, data.capacity());
        TrackedString { data }
    }

    pub fn shared(bytes: &[u8]) -> SharedString {
        Arc::new(Self::from_slice(bytes))
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn append(&mut self, bytes: &[u8]) {
        let before = self.data.capacity();
        self.data.extend_from_slice(bytes);
        self.account_growth(before);
    }

    /// Writes `bytes` at `offset`, zero-padding the gap if `offset` is past
    /// the current end and extending the string as needed.
    pub fn overwrite_at(&mut self, offset: usize, bytes: &[u8]) {
        let before = self.data.capacity();
        if offset > self.data.len() {
            self.data.resize(offset, 0);
        }
        let overlap = self.data.len().saturating_sub(offset).min(bytes.len());
        self.data[offset..offset + overlap].copy_from_slice(&bytes[..overlap]);
        self.data.extend_from_slice(&bytes[overlap..]);
        self.account_growth(before);
    }

    fn account_growth(&self, before: usize) {
        let after = self.data.capacity();
        if after > before {
            tracker().allocate(Category::Data, after - before);
        }
    }
}

impl std::ops::Deref for TrackedString {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl Clone for TrackedString {
    fn clone(&self) -> Self {
        Self::from_slice(&self.data)
    }
}

impl Drop for TrackedString {
    fn drop(&mut self) {
        tracker().deallocate(Category::Data, self.data.capacity());
    }
}

impl std::fmt::Debug for TrackedString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TrackedString({:?})", String::from_utf8_lossy(&self.data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The accountant is process-global and other tests allocate through it
    // concurrently, so the assertions use a block large enough to dominate
    // any interference.
    #[test]
    fn counters_and_peak() {
        const BLOCK: usize = 1 << 20;
        let s = TrackedString::from_slice(&vec![7u8; BLOCK]);
        assert!(tracker().allocated(Category::Data) >= BLOCK);
        assert!(tracker().total_allocated() >= BLOCK);
        assert!(tracker().peak_allocated() >= BLOCK);
        drop(s);
        assert!(tracker().allocated(Category::Data) < BLOCK / 2);
    }

    #[test]
    fn overwrite_pads_and_extends() {
        let mut s = TrackedString::from_slice(b"hello");
        s.overwrite_at(2, b"LLO");
        assert_eq!(s.as_slice(), b"heLLO");
        s.overwrite_at(7, b"x");
        assert_eq!(s.as_slice(), b"heLLO\0\0x");
        s.overwrite_at(1, b"??");
        assert_eq!(s.as_slice(), b"h??LO\0\0x");
    }
}
