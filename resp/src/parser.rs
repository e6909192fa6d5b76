// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use log::*;

use crate::buffer::Buffer;

/// The inline parser gives up if no CRLF shows up within this many bytes.
const MAX_INLINE_BUFFER_SIZE: usize = 1024 * 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserState {
    /// Parsing has not started yet.
    Init,
    /// Parsing error, state resets on the next parse call.
    Error,
    /// In progress; definitively interpreted bytes have been consumed.
    Parsing,
    Done,
}

/// A parsed argument as an offset range into the query buffer's storage.
/// Offsets are from the start of storage, so neither consumption nor
/// relocation invalidates a view.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArgView {
    pub start: u32,
    pub len: u32,
}

impl ArgView {
    pub fn slice<'a>(&self, buffer: &'a Buffer) -> &'a [u8] {
        buffer.view(self.start as usize, self.len as usize)
    }
}

/// Reused across queries to avoid reallocating argument storage per command.
pub type ArgViews = Vec<ArgView>;

fn find_crlf(haystack: &[u8], from: usize) -> Option<usize> {
    if haystack.len() < 2 {
        return None;
    }
    (from..haystack.len() - 1).find(|&i| haystack[i] == b'\r' && haystack[i + 1] == b'\n')
}

fn parse_decimal(bytes: &[u8]) -> Option<i64> {
    // str::parse accepts a leading '+', the wire format does not.
    if bytes.is_empty() || bytes[0] == b'+' {
        return None;
    }
    std::str::from_utf8(bytes).ok()?.parse::<i64>().ok()
}

fn record_arg(result: &mut ArgViews, index: usize, view: ArgView) {
    if result.len() == index {
        result.push(view);
    } else {
        result[index] = view;
    }
}

/// Parses one inline command: bytes up to CRLF, split on whitespace. Views
/// are filled into `result` in place; on `Done`, `result_size` is the
/// argument count (the vector may be longer from earlier commands).
pub fn parse_inline(
    buffer: &mut Buffer,
    result: &mut ArgViews,
    result_size: &mut usize,
) -> ParserState {
    let base = buffer.read_pos();
    let src = buffer.source();
    if src.is_empty() {
        return ParserState::Error;
    }

    let crlf = match find_crlf(src, 0) {
        Some(pos) => pos,
        None => {
            if src.len() >= MAX_INLINE_BUFFER_SIZE {
                return ParserState::Error;
            }
            return ParserState::Parsing;
        }
    };

    let mut i = 0;
    let mut arg_index = 0;
    while i < crlf {
        if src[i].is_ascii_whitespace() {
            i += 1;
            continue;
        }
        let mut next_space = i + 1;
        while next_space < crlf && !src[next_space].is_ascii_whitespace() {
            next_space += 1;
        }
        record_arg(
            result,
            arg_index,
            ArgView {
                start: (base + i) as u32,
                len: (next_space - i) as u32,
            },
        );
        arg_index += 1;
        i = next_space;
    }
    buffer.consume(crlf + 2);
    if arg_index == 0 {
        return ParserState::Parsing;
    }
    *result_size = arg_index;
    ParserState::Done
}

/// Restartable parser for `*N\r\n$L\r\n<L bytes>\r\n...` requests.
///
/// `(expected args, current index)` persist across calls, so a request
/// arriving in arbitrary pieces just keeps returning `Parsing` until the
/// last byte shows up. Only definitively interpreted bytes are consumed: an
/// argument whose payload has not fully arrived is re-parsed from its `$`
/// header on the next call.
pub struct MultiBulkParser {
    state: ParserState,
    args: usize,
    cur_arg_idx: usize,
}

impl Default for MultiBulkParser {
    fn default() -> Self {
        Self::new()
    }
}

impl MultiBulkParser {
    pub fn new() -> Self {
        MultiBulkParser {
            state: ParserState::Init,
            args: 0,
            cur_arg_idx: 0,
        }
    }

    pub fn in_progress(&self) -> bool {
        self.state == ParserState::Parsing
    }

    pub fn reset(&mut self) {
        self.state = ParserState::Init;
        self.args = 0;
        self.cur_arg_idx = 0;
    }

    /// Argument count of the parsed request. Only meaningful after `parse`
    /// returned `Done`.
    pub fn result_size(&self) -> usize {
        debug_assert_eq!(self.state, ParserState::Done);
        self.args
    }

    pub fn parse(&mut self, buffer: &mut Buffer, result: &mut ArgViews) -> ParserState {
        if self.state == ParserState::Error || self.state == ParserState::Done {
            self.reset();
        }

        if buffer.unread() == 0 {
            return self.state;
        }

        if self.state == ParserState::Init && !self.parse_arg_num(buffer) {
            return self.state;
        }
        result.reserve(self.args);

        while self.cur_arg_idx < self.args {
            let base = buffer.read_pos();
            let src = buffer.source();
            if src.is_empty() {
                return self.state;
            }

            if src[0] != b'$' {
                self.state = ParserState::Error;
                return self.state;
            }
            let crlf = match find_crlf(src, 1) {
                Some(pos) => pos,
                None => return self.state,
            };
            let str_len = match parse_decimal(&src[1..crlf]) {
                Some(len) if len >= 0 && len <= i32::MAX as i64 => len as usize,
                _ => {
                    self.state = ParserState::Error;
                    return self.state;
                }
            };

            let payload = crlf + 2;
            if payload + str_len + 2 > src.len() {
                return self.state;
            }
            if src[payload + str_len] != b'\r' || src[payload + str_len + 1] != b'\n' {
                self.state = ParserState::Error;
                return self.state;
            }
            record_arg(
                result,
                self.cur_arg_idx,
                ArgView {
                    start: (base + payload) as u32,
                    len: str_len as u32,
                },
            );
            self.cur_arg_idx += 1;
            buffer.consume(payload + str_len + 2);
        }
        self.state = ParserState::Done;
        self.state
    }

    /// Parses the `*N\r\n` header, consuming it on success. Returns whether
    /// the argument loop should run.
    fn parse_arg_num(&mut self, buffer: &mut Buffer) -> bool {
        let src = buffer.source();
        if src[0] != b'*' {
            self.state = ParserState::Error;
            return false;
        }
        let crlf = match find_crlf(src, 1) {
            Some(pos) => pos,
            None => return false,
        };
        let parsed = match parse_decimal(&src[1..crlf]) {
            Some(n) if n >= 0 && n <= i32::MAX as i64 => n as usize,
            _ => {
                self.state = ParserState::Error;
                return false;
            }
        };
        self.args = parsed;
        trace!("multibulk: {} args", self.args);
        self.state = ParserState::Parsing;
        buffer.consume(crlf + 2);
        true
    }
}
