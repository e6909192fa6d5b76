// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! RESP wire-protocol support for the ringkv server: the process-wide memory
//! accountant, the growable I/O buffer, the inline and multi-bulk request
//! parsers, and the reply formatter.

pub mod buffer;
pub mod memory;
pub mod parser;
pub mod replier;
pub mod reply;

pub use buffer::Buffer;
pub use memory::{tracker, Category, MemoryTracker, SharedString, TrackedString};
pub use parser::{parse_inline, ArgView, ArgViews, MultiBulkParser, ParserState};
pub use replier::{needs_gather, reply_to_iovecs, reply_to_view};
pub use reply::{ErrorKind, Reply};
