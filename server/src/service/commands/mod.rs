// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Command implementations, grouped the way the command table groups them:
//! string commands, key commands, server/misc commands, and per-connection
//! commands.

pub mod client;
pub mod keys;
pub mod misc;
pub mod strings;

use resp::reply::{ErrorKind, Reply};

use crate::clock::UnixMillis;
use crate::service::DataStructureService;

pub fn register_all(service: &mut DataStructureService) {
    strings::register(service);
    keys::register(service);
    misc::register(service);
    client::register(service);
}

/// Strict decimal parse of a whole argument: no sign prefix `+`, no
/// surrounding junk, no empty input.
pub(crate) fn parse_i64(bytes: &[u8]) -> Option<i64> {
    if bytes.is_empty() || bytes[0] == b'+' {
        return None;
    }
    std::str::from_utf8(bytes).ok()?.parse::<i64>().ok()
}

pub(crate) enum ExtractExpire {
    /// An expire option was recognized and consumed (its operand too).
    Done,
    /// `args[*i]` is not an expire option.
    NotFound,
    /// Malformed; the error has been written to the reply.
    Error,
}

/// Recognizes `EX|PX|EXAT|PXAT <n>` at `args[*i]`, producing the absolute
/// expiration instant in `expire_time` and advancing `*i` over the operand.
pub(crate) fn extract_expire_option(
    args: &[&[u8]],
    i: &mut usize,
    cmd_time: UnixMillis,
    reply: &mut Reply,
    expire_time: &mut Option<UnixMillis>,
) -> ExtractExpire {
    type ToInstant = fn(UnixMillis, i64) -> Option<UnixMillis>;
    let to_instant: ToInstant = match args[*i] {
        b"PX" => |now, n| now.checked_add(n),
        b"EX" => |now, n| now.checked_add(n.checked_mul(1000)?),
        b"PXAT" => |_, n| Some(n),
        b"EXAT" => |_, n| n.checked_mul(1000),
        _ => return ExtractExpire::NotFound,
    };

    if *i == args.len() - 1 {
        *reply = Reply::Err(ErrorKind::Syntax);
        return ExtractExpire::Error;
    }
    if expire_time.is_some() {
        *reply = Reply::Err(ErrorKind::Syntax);
        return ExtractExpire::Error;
    }

    let operand = match parse_i64(args[*i + 1]) {
        Some(n) if n > 0 => n,
        _ => {
            *reply = Reply::Err(ErrorKind::NotAnInt);
            return ExtractExpire::Error;
        }
    };
    match to_instant(cmd_time, operand) {
        Some(instant) => *expire_time = Some(instant),
        None => {
            *reply = Reply::Err(ErrorKind::NotAnInt);
            return ExtractExpire::Error;
        }
    }

    *i += 1;
    ExtractExpire::Done
}
