// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::os::fd::RawFd;

use io_uring::{opcode, squeue, types};
use log::*;

use crate::runtime::ring::RingWorker;

/// An accepted socket plus its optional registered-fd slot on the owning
/// I/O worker. The prep methods build the submission for each operation;
/// a registered connection names its fixed-file slot instead of the fd.
///
/// Buffers referenced by a prepared entry must stay untouched until its
/// completion arrives; the owning client guarantees that.
pub struct Connection {
    fd: RawFd,
    slot: Option<u32>,
    open: bool,
}

impl Connection {
    pub fn new(fd: RawFd) -> Self {
        Connection {
            fd,
            slot: None,
            open: true,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Publishes the fd into one of the worker's registered slots, when one
    /// is free. Must run on the worker that owns this connection.
    pub fn try_register(&mut self, worker: &mut RingWorker) {
        debug_assert!(self.slot.is_none());
        self.slot = worker.register_fd(self.fd);
    }

    /// Gives the registered slot back. Must precede or accompany close.
    pub fn release_slot(&mut self, worker: &mut RingWorker) {
        if let Some(slot) = self.slot.take() {
            worker.unregister_fd(slot);
        }
    }

    pub fn prep_recv(&self, sink: &mut [u8]) -> squeue::Entry {
        let (ptr, len) = (sink.as_mut_ptr(), sink.len() as u32);
        match self.slot {
            Some(slot) => opcode::Recv::new(types::Fixed(slot), ptr, len).build(),
            None => opcode::Recv::new(types::Fd(self.fd), ptr, len).build(),
        }
    }

    /// A recv with kernel buffer selection from the worker's provisioned
    /// ring; the completion reports the chosen entry id in its flags.
    pub fn prep_buf_recv(&self, group: u16) -> squeue::Entry {
        let entry = match self.slot {
            Some(slot) => opcode::Recv::new(types::Fixed(slot), std::ptr::null_mut(), 0)
                .buf_group(group)
                .build(),
            None => opcode::Recv::new(types::Fd(self.fd), std::ptr::null_mut(), 0)
                .buf_group(group)
                .build(),
        };
        entry.flags(squeue::Flags::BUFFER_SELECT)
    }

    pub fn prep_send(&self, data: &[u8]) -> squeue::Entry {
        let (ptr, len) = (data.as_ptr(), data.len() as u32);
        match self.slot {
            Some(slot) => opcode::Send::new(types::Fixed(slot), ptr, len).build(),
            None => opcode::Send::new(types::Fd(self.fd), ptr, len).build(),
        }
    }

    pub fn prep_writev(&self, iovecs: &[libc::iovec]) -> squeue::Entry {
        let (ptr, len) = (iovecs.as_ptr(), iovecs.len() as u32);
        match self.slot {
            Some(slot) => opcode::Writev::new(types::Fixed(slot), ptr, len).build(),
            None => opcode::Writev::new(types::Fd(self.fd), ptr, len).build(),
        }
    }

    /// Closes the socket. Idempotent; in-flight operations on the fd are
    /// cancelled by the kernel.
    pub fn close(&mut self) {
        if !self.open {
            return;
        }
        // SAFETY: we own the fd and close it exactly once.
        if unsafe { libc::close(self.fd) } != 0 {
            error!("close: {}", std::io::Error::last_os_error());
        }
        self.open = false;
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}
