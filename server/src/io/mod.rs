// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Typed wrappers over the socket operations the ring runtime submits.

pub mod connection;
pub mod listener;

pub use connection::Connection;
pub use listener::Listener;
