// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::collections::HashSet;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

/// Connection-level counters, updated from the I/O workers.
#[derive(Default)]
pub struct ClientStats {
    pub net_input_bytes: AtomicU64,
    pub net_output_bytes: AtomicU64,
    pub max_input_buffer: AtomicU64,
    pub max_output_buffer: AtomicU64,
}

/// Tracks the live connections. Workers add and remove concurrently, so the
/// fd set is locked; the count is read lock-free by the accept path and by
/// INFO.
#[derive(Default)]
pub struct ClientManager {
    clients: Mutex<HashSet<RawFd>>,
    active_clients: AtomicU32,
    pub stats: ClientStats,
}

impl ClientManager {
    pub fn add(&self, fd: RawFd) {
        let mut clients = self.clients.lock().expect("client set poisoned");
        let inserted = clients.insert(fd);
        debug_assert!(inserted, "fd {fd} added twice");
        self.active_clients.fetch_add(1, Ordering::Relaxed);
    }

    pub fn remove(&self, fd: RawFd) {
        let mut clients = self.clients.lock().expect("client set poisoned");
        let removed = clients.remove(&fd);
        debug_assert!(removed, "fd {fd} removed without add");
        self.active_clients.fetch_sub(1, Ordering::Release);
    }

    pub fn active_clients(&self) -> u32 {
        self.active_clients.load(Ordering::Relaxed)
    }

    /// Closes every connection still registered. Called at shutdown after
    /// the workers have been joined, so nothing races the close.
    pub fn close_all(&self) {
        let mut clients = self.clients.lock().expect("client set poisoned");
        for fd in clients.drain() {
            // SAFETY: the fd was accepted by us and its worker is gone.
            unsafe { libc::close(fd) };
            self.active_clients.fetch_sub(1, Ordering::Relaxed);
        }
    }

    pub fn update_max_input_buffer(&self, size: u64) {
        update_max(&self.stats.max_input_buffer, size);
    }

    pub fn update_max_output_buffer(&self, size: u64) {
        update_max(&self.stats.max_output_buffer, size);
    }
}

fn update_max(slot: &AtomicU64, value: u64) {
    let mut current = slot.load(Ordering::Relaxed);
    while value > current {
        match slot.compare_exchange_weak(current, value, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => break,
            Err(now) => current = now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_remove_count() {
        let manager = ClientManager::default();
        manager.add(10);
        manager.add(11);
        assert_eq!(manager.active_clients(), 2);
        manager.remove(10);
        assert_eq!(manager.active_clients(), 1);
        manager.remove(11);
        assert_eq!(manager.active_clients(), 0);
    }

    #[test]
    fn max_counters_only_grow() {
        let manager = ClientManager::default();
        manager.update_max_input_buffer(100);
        manager.update_max_input_buffer(50);
        assert_eq!(manager.stats.max_input_buffer.load(Ordering::Relaxed), 100);
        manager.update_max_input_buffer(200);
        assert_eq!(manager.stats.max_input_buffer.load(Ordering::Relaxed), 200);
    }
}
