// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The ring runtime: pinned single-issuer workers, each owning one
//! completion ring, plus the provisioned buffer ring and the task pointer
//! protocol that lets suspended work travel between rings.

pub mod buf_ring;
pub mod ring;
pub mod task;

pub use buf_ring::BufRing;
pub use ring::{event_loop, post_to_ring, CompletionHandler, RingConfig, RingWorker};
pub use task::{Disposition, Task};
