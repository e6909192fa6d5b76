// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Converts a [`Reply`] into wire bytes: either a contiguous view for
//! `send`, or a scatter/gather iovec list for `writev` that borrows the
//! shared value bytes instead of copying them.

use crate::buffer::Buffer;
use crate::memory::SharedString;
use crate::reply::Reply;

static OK_STR: &[u8] = b"+OK\r\n";
static NIL_STR: &[u8] = b"$-1\r\n";

/// Most digits of an i64 plus sign plus CRLF, rounded up.
const INT_ROOM: usize = 32;

/// Whether the reply must go out via `writev`. String replies gather the
/// value bytes by reference; everything else fits in one contiguous view.
pub fn needs_gather(reply: &Reply) -> bool {
    matches!(reply, Reply::Bulk(_) | Reply::Array(_))
}

/// Formats a contiguous reply. Fixed forms come straight from static
/// storage; integers and simple strings are rendered into `out`.
pub fn reply_to_view<'a>(reply: &Reply, out: &'a mut Buffer) -> &'a [u8] {
    match reply {
        Reply::Ok => OK_STR,
        Reply::Nil => NIL_STR,
        Reply::Err(kind) => kind.wire(),
        Reply::Simple(s) => {
            out.ensure_available(s.len() + 4, false);
            let sink = out.sink();
            sink[0] = b'+';
            sink[1..1 + s.len()].copy_from_slice(s.as_bytes());
            sink[1 + s.len()] = b'\r';
            sink[2 + s.len()] = b'\n';
            out.produce(s.len() + 3);
            out.source()
        }
        Reply::Int(value) => {
            out.ensure_available(INT_ROOM, false);
            let sink = out.sink();
            sink[0] = b':';
            let n = write_decimal_crlf(&mut sink[1..], *value);
            out.produce(n + 1);
            out.source()
        }
        Reply::Bulk(_) | Reply::Array(_) => {
            unreachable!("gather replies are formatted as iovecs")
        }
    }
}

/// Builds the iovec list for a gather reply. Headers are rendered into
/// `out` up front (one `ensure_available`, so the recorded pointers stay
/// put); value bytes are referenced from the shared strings. `out`, the
/// reply, and `iovecs` must all stay untouched until the writev completes.
pub fn reply_to_iovecs(reply: &Reply, out: &mut Buffer, iovecs: &mut Vec<libc::iovec>) {
    match reply {
        Reply::Bulk(value) => {
            out.ensure_available(INT_ROOM * 2, false);
            let sink = out.sink();
            let used = bulk_to_iovecs(Some(value), sink, iovecs);
            out.produce(used);
        }
        Reply::Array(items) => {
            out.ensure_available((items.len() + 1) * INT_ROOM, false);
            iovecs.reserve(1 + items.len() * 3);
            let sink = out.sink();

            sink[0] = b'*';
            let mut cursor = 1 + write_decimal_crlf(&mut sink[1..], items.len() as i64);
            iovecs.push(iovec_of(&sink[..cursor]));

            for item in items {
                cursor += bulk_to_iovecs(item.as_ref(), &mut sink[cursor..], iovecs);
            }
            out.produce(cursor);
        }
        _ => unreachable!("contiguous replies are formatted as a view"),
    }
}

/// Emits the gather triple for one bulk string into `iovecs`: length header
/// in `sink`, value bytes by reference, and a trailing CRLF that reuses the
/// header's own CRLF bytes. Nil elements emit the fixed nil form. Returns
/// the number of header bytes written to `sink`.
fn bulk_to_iovecs(
    value: Option<&SharedString>,
    sink: &mut [u8],
    iovecs: &mut Vec<libc::iovec>,
) -> usize {
    let value = match value {
        Some(value) => value,
        None => {
            iovecs.push(iovec_of(NIL_STR));
            return 0;
        }
    };
    sink[0] = b'$';
    let header_len = 1 + write_decimal_crlf(&mut sink[1..], value.len() as i64);
    iovecs.push(iovec_of(&sink[..header_len]));
    iovecs.push(iovec_of(value.as_slice()));
    iovecs.push(iovec_of(&sink[header_len - 2..header_len]));
    header_len
}

fn iovec_of(bytes: &[u8]) -> libc::iovec {
    libc::iovec {
        iov_base: bytes.as_ptr() as *mut libc::c_void,
        iov_len: bytes.len(),
    }
}

/// Renders `value` in decimal followed by CRLF, returning bytes written.
fn write_decimal_crlf(sink: &mut [u8], value: i64) -> usize {
    use std::io::Write;
    let mut cursor = std::io::Cursor::new(&mut *sink);
    write!(cursor, "{value}\r\n").expect("decimal always fits the reserved sink");
    cursor.position() as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::TrackedString;
    use crate::reply::ErrorKind;

    fn gather_bytes(reply: &Reply) -> Vec<u8> {
        let mut out = Buffer::with_capacity(64);
        let mut iovecs = Vec::new();
        reply_to_iovecs(reply, &mut out, &mut iovecs);
        let mut flat = Vec::new();
        for iov in &iovecs {
            let part =
                unsafe { std::slice::from_raw_parts(iov.iov_base as *const u8, iov.iov_len) };
            flat.extend_from_slice(part);
        }
        flat
    }

    #[test]
    fn contiguous_forms() {
        let mut out = Buffer::with_capacity(64);
        assert_eq!(reply_to_view(&Reply::Ok, &mut out), b"+OK\r\n");
        assert_eq!(reply_to_view(&Reply::Nil, &mut out), b"$-1\r\n");
        assert_eq!(
            reply_to_view(&Reply::Err(ErrorKind::Syntax), &mut out),
            b"-ERR syntax error\r\n"
        );

        let mut out = Buffer::with_capacity(64);
        assert_eq!(reply_to_view(&Reply::Int(42), &mut out), b":42\r\n");
        let mut out = Buffer::with_capacity(64);
        assert_eq!(reply_to_view(&Reply::Int(-7), &mut out), b":-7\r\n");
        let mut out = Buffer::with_capacity(64);
        assert_eq!(
            reply_to_view(&Reply::Simple("PONG"), &mut out),
            b"+PONG\r\n"
        );
    }

    #[test]
    fn gather_detection() {
        assert!(!needs_gather(&Reply::Ok));
        assert!(!needs_gather(&Reply::Int(1)));
        assert!(needs_gather(&Reply::Bulk(TrackedString::shared(b"x"))));
        assert!(needs_gather(&Reply::Array(vec![])));
    }

    #[test]
    fn bulk_gather() {
        let reply = Reply::Bulk(TrackedString::shared(b"FOOBAR"));
        assert_eq!(gather_bytes(&reply), b"$6\r\nFOOBAR\r\n");

        let reply = Reply::Bulk(TrackedString::shared(b""));
        assert_eq!(gather_bytes(&reply), b"$0\r\n\r\n");
    }

    #[test]
    fn array_gather_with_nils() {
        let reply = Reply::Array(vec![
            Some(TrackedString::shared(b"1")),
            Some(TrackedString::shared(b"2")),
            None,
            Some(TrackedString::shared(b"3")),
        ]);
        assert_eq!(
            gather_bytes(&reply),
            b"*4\r\n$1\r\n1\r\n$1\r\n2\r\n$-1\r\n$1\r\n3\r\n"
        );
    }

    #[test]
    fn empty_array_gather() {
        let reply = Reply::Array(vec![]);
        assert_eq!(gather_bytes(&reply), b"*0\r\n");
    }
}
