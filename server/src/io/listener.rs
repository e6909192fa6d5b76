// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::io;
use std::net::TcpListener;
use std::os::fd::{AsRawFd, RawFd};

use io_uring::{opcode, squeue, types};
use log::*;

/// The listening socket. Accepts are ring operations; their completions
/// carry the new connection's fd.
pub struct Listener {
    inner: TcpListener,
}

impl Listener {
    pub fn bind(port: u16) -> io::Result<Self> {
        let inner = TcpListener::bind(("0.0.0.0", port))?;
        inner.set_nonblocking(true)?;
        info!("listening on port {} with fd {}", port, inner.as_raw_fd());
        Ok(Listener { inner })
    }

    pub fn raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }

    pub fn prep_accept(&self) -> squeue::Entry {
        opcode::Accept::new(
            types::Fd(self.raw_fd()),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
        )
        .build()
    }
}
