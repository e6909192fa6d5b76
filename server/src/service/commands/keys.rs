// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use resp::reply::{ErrorKind, Reply};

use crate::service::{Command, DataStructureService};

pub fn register(service: &mut DataStructureService) {
    service.register_command("TTL", Command::read(ttl));
    service.register_command("DEL", Command::write(del));
}

/// Remaining time-to-live in whole seconds: -2 for a missing (or stale) key,
/// -1 for a key without expiration.
fn ttl(svc: &mut DataStructureService, args: &[&[u8]], reply: &mut Reply) {
    if args.len() != 2 {
        *reply = Reply::Err(ErrorKind::WrongArgNum);
        return;
    }
    let key = args[1];
    if svc.data_ht.find(key).is_none() {
        *reply = Reply::Int(-2);
        return;
    }
    let expire_at = match svc.expire_ht.find(key) {
        None => {
            *reply = Reply::Int(-1);
            return;
        }
        Some(entry) => entry.value,
    };
    let now = svc.command_time_snapshot();
    if expire_at <= now {
        svc.data_ht.erase(key);
        svc.expire_ht.erase(key);
        *reply = Reply::Int(-2);
        return;
    }
    *reply = Reply::Int((expire_at - now) / 1000);
}

fn del(svc: &mut DataStructureService, args: &[&[u8]], reply: &mut Reply) {
    if args.len() < 2 {
        *reply = Reply::Err(ErrorKind::WrongArgNum);
        return;
    }
    let mut deleted = 0;
    for key in &args[1..] {
        if svc.find_or_expire(key).is_some() {
            svc.erase_key(key);
            deleted += 1;
        }
    }
    *reply = Reply::Int(deleted);
}
