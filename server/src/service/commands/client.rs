// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use resp::memory::TrackedString;
use resp::reply::{ErrorKind, Reply};

use crate::service::{Command, DataStructureService};

pub fn register(service: &mut DataStructureService) {
    service.register_command("HELLO", Command::read(hello));
    service.register_command("PING", Command::read(ping));
}

/// Only the RESP3 handshake level is accepted; the reply stays RESP2-shaped.
fn hello(_svc: &mut DataStructureService, args: &[&[u8]], reply: &mut Reply) {
    if args.len() == 2 && args[1] == b"3" {
        *reply = Reply::Ok;
    } else {
        *reply = Reply::Err(ErrorKind::Protocol);
    }
}

fn ping(_svc: &mut DataStructureService, args: &[&[u8]], reply: &mut Reply) {
    match args.len() {
        1 => *reply = Reply::Simple("PONG"),
        2 => *reply = Reply::Bulk(TrackedString::shared(args[1])),
        _ => *reply = Reply::Err(ErrorKind::WrongArgNum),
    }
}

#[cfg(test)]
mod tests {
    use crate::service::test_util::*;
    use resp::reply::{ErrorKind, Reply};

    #[test]
    fn hello_accepts_only_protocol_3() {
        let mut h = Harness::new();
        expect_ok(&h.invoke("HELLO 3"));
        expect_err(&h.invoke("HELLO 2"), ErrorKind::Protocol);
        expect_err(&h.invoke("HELLO"), ErrorKind::Protocol);
    }

    #[test]
    fn ping_pong_and_echo() {
        let mut h = Harness::new();
        assert!(matches!(h.invoke("PING"), Reply::Simple("PONG")));
        expect_bulk(&h.invoke("PING hey"), b"hey");
        expect_err(&h.invoke("PING a b"), ErrorKind::WrongArgNum);
    }
}
