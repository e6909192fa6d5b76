// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::sync::Arc;

use resp::memory::TrackedString;
use resp::reply::{ErrorKind, Reply};

use super::{extract_expire_option, parse_i64, ExtractExpire};
use crate::clock::UnixMillis;
use crate::service::{Command, DataStructureService, SetMode, SetStatus};

pub fn register(service: &mut DataStructureService) {
    service.register_command("SET", Command::write(set));
    service.register_command("SETEX", Command::write(setex));
    service.register_command("PSETEX", Command::write(psetex));
    service.register_command("SETNX", Command::write(setnx));
    service.register_command("SETRANGE", Command::write(setrange));
    service.register_command("MSET", Command::write(mset));
    service.register_command("MSETNX", Command::write(msetnx));
    service.register_command("GET", Command::read(get));
    service.register_command("MGET", Command::read(mget));
    service.register_command("GETDEL", Command::read(getdel));
    service.register_command("GETEX", Command::read(getex));
    service.register_command("GETSET", Command::read(getset));
    service.register_command("GETRANGE", Command::read(getrange));
    service.register_command("SUBSTR", Command::read(getrange));
    service.register_command("APPEND", Command::read(append));
    service.register_command("EXISTS", Command::read(exists));
    service.register_command("STRLEN", Command::read(strlen));
}

/// Looks up `key`, expiring it if stale. A live entry has its last-access
/// stamped and its value put in the reply; a missing one replies nil.
fn get_base(svc: &mut DataStructureService, key: &[u8], reply: &mut Reply) -> bool {
    let lru = svc.lru_clock();
    match svc.find_or_expire(key) {
        None => {
            *reply = Reply::Nil;
            false
        }
        Some(entry) => {
            entry.key.set_last_access(lru);
            *reply = Reply::Bulk(entry.value.clone());
            true
        }
    }
}

/// Parses the trailing options of SET: `[NX|XX] [GET]
/// [EX s | PX ms | EXAT s | PXAT ms | KEEPTTL]`. Returns false and sets the
/// reply on conflict or malformed input.
fn extract_set_options(
    args: &[&[u8]],
    cmd_time: UnixMillis,
    reply: &mut Reply,
    set_mode: &mut SetMode,
    expire_time: &mut Option<UnixMillis>,
    keep_ttl: &mut bool,
    get: &mut bool,
) -> bool {
    let mut i = 0;
    while i < args.len() {
        match args[i] {
            b"GET" => *get = true,
            b"NX" => {
                if *set_mode != SetMode::Regular {
                    *reply = Reply::Err(ErrorKind::Syntax);
                    return false;
                }
                *set_mode = SetMode::Nx;
            }
            b"XX" => {
                if *set_mode != SetMode::Regular {
                    *reply = Reply::Err(ErrorKind::Syntax);
                    return false;
                }
                *set_mode = SetMode::Xx;
            }
            b"KEEPTTL" => {
                if expire_time.is_some() {
                    *reply = Reply::Err(ErrorKind::Syntax);
                    return false;
                }
                *keep_ttl = true;
            }
            _ => match extract_expire_option(args, &mut i, cmd_time, reply, expire_time) {
                ExtractExpire::Error => return false,
                ExtractExpire::NotFound => {
                    *reply = Reply::Err(ErrorKind::Syntax);
                    return false;
                }
                ExtractExpire::Done => {
                    // KEEPTTL and an expire option contradict each other.
                    if *keep_ttl {
                        *reply = Reply::Err(ErrorKind::Syntax);
                        return false;
                    }
                }
            },
        }
        i += 1;
    }
    true
}

fn set(svc: &mut DataStructureService, args: &[&[u8]], reply: &mut Reply) {
    if args.len() < 3 {
        *reply = Reply::Err(ErrorKind::WrongArgNum);
        return;
    }
    let cmd_time = svc.command_time_snapshot();

    let mut set_mode = SetMode::Regular;
    let mut expire_time: Option<UnixMillis> = None;
    let mut keep_ttl = false;
    let mut get = false;
    if args.len() > 3
        && !extract_set_options(
            &args[3..],
            cmd_time,
            reply,
            &mut set_mode,
            &mut expire_time,
            &mut keep_ttl,
            &mut get,
        )
    {
        return;
    }

    let key = args[1];
    let (status, record, old_value) = svc.set_data(key, args[2], set_mode, get);
    if status == SetStatus::NoOp {
        *reply = Reply::Nil;
        return;
    }

    if let Some(instant) = expire_time {
        let record = record.as_ref().expect("set_data touched an entry");
        svc.expire_ht.upsert_shared(record, instant);
    } else if status == SetStatus::Updated && !keep_ttl {
        // A plain SET over an existing key clears any TTL.
        svc.expire_ht.erase(key);
    }

    if get {
        *reply = match old_value {
            None => Reply::Nil,
            Some(value) => Reply::Bulk(value),
        };
    } else {
        *reply = Reply::Ok;
    }
}

fn setex_base(
    svc: &mut DataStructureService,
    args: &[&[u8]],
    reply: &mut Reply,
    to_instant: fn(UnixMillis, i64) -> Option<UnixMillis>,
) {
    if args.len() != 4 {
        *reply = Reply::Err(ErrorKind::WrongArgNum);
        return;
    }
    let now = svc.command_time_snapshot();
    let operand = match parse_i64(args[2]) {
        Some(n) => n,
        None => {
            *reply = Reply::Err(ErrorKind::NotAnInt);
            return;
        }
    };
    let instant = match to_instant(now, operand) {
        Some(instant) => instant,
        None => {
            *reply = Reply::Err(ErrorKind::NotAnInt);
            return;
        }
    };

    let lru = svc.lru_clock();
    let (entry, _) = svc.data_ht.upsert(args[1], TrackedString::shared(args[3]));
    let record = entry.key.clone();
    record.set_last_access(lru);
    svc.expire_ht.upsert_shared(&record, instant);
}

fn setex(svc: &mut DataStructureService, args: &[&[u8]], reply: &mut Reply) {
    setex_base(svc, args, reply, |now, n| {
        if n <= 0 {
            return None;
        }
        now.checked_add(n.checked_mul(1000)?)
    });
}

fn psetex(svc: &mut DataStructureService, args: &[&[u8]], reply: &mut Reply) {
    setex_base(svc, args, reply, |now, n| {
        if n <= 0 {
            return None;
        }
        now.checked_add(n)
    });
}

fn setnx(svc: &mut DataStructureService, args: &[&[u8]], reply: &mut Reply) {
    if args.len() != 3 {
        *reply = Reply::Err(ErrorKind::WrongArgNum);
        return;
    }
    let (status, _, _) = svc.set_data(args[1], args[2], SetMode::Nx, false);
    debug_assert!(status != SetStatus::Updated);
    *reply = Reply::Int((status == SetStatus::Inserted) as i64);
}

fn setrange(svc: &mut DataStructureService, args: &[&[u8]], reply: &mut Reply) {
    if args.len() != 4 {
        *reply = Reply::Err(ErrorKind::WrongArgNum);
        return;
    }
    let offset = match parse_i64(args[2]) {
        Some(n) if (0..=u32::MAX as i64).contains(&n) => n as usize,
        _ => {
            *reply = Reply::Err(ErrorKind::NotAnInt);
            return;
        }
    };

    let key = args[1];
    let now = svc.command_time_snapshot();
    let lru = svc.lru_clock();
    let expired = matches!(svc.expire_ht.find(key), Some(e) if e.value <= now);

    let (entry, mut exists) = svc
        .data_ht
        .find_or_create(key, || TrackedString::shared(b""));
    if exists && expired {
        svc.expire_ht.erase(key);
        exists = false;
    }

    if !exists || Arc::strong_count(&entry.value) != 1 {
        let mut fresh = TrackedString::from_slice(b"");
        fresh.overwrite_at(offset, args[3]);
        entry.value = Arc::new(fresh);
    } else {
        Arc::get_mut(&mut entry.value)
            .expect("sole owner")
            .overwrite_at(offset, args[3]);
    }
    entry.key.set_last_access(lru);
    *reply = Reply::Int(entry.value.len() as i64);
}

fn mset(svc: &mut DataStructureService, args: &[&[u8]], reply: &mut Reply) {
    if args.len() < 3 || args.len() % 2 == 0 {
        *reply = Reply::Err(ErrorKind::WrongArgNum);
        return;
    }
    for pair in args[1..].chunks_exact(2) {
        svc.set_data(pair[0], pair[1], SetMode::Regular, false);
        svc.expire_ht.erase(pair[0]);
    }
}

fn msetnx(svc: &mut DataStructureService, args: &[&[u8]], reply: &mut Reply) {
    if args.len() < 3 || args.len() % 2 == 0 {
        *reply = Reply::Err(ErrorKind::WrongArgNum);
        return;
    }
    let mut succeeded = false;
    for pair in args[1..].chunks_exact(2) {
        let (status, _, _) = svc.set_data(pair[0], pair[1], SetMode::Nx, false);
        succeeded |= status == SetStatus::Inserted;
    }
    *reply = Reply::Int(succeeded as i64);
}

fn get(svc: &mut DataStructureService, args: &[&[u8]], reply: &mut Reply) {
    if args.len() != 2 {
        *reply = Reply::Err(ErrorKind::WrongArgNum);
        return;
    }
    get_base(svc, args[1], reply);
}

fn mget(svc: &mut DataStructureService, args: &[&[u8]], reply: &mut Reply) {
    if args.len() < 2 {
        *reply = Reply::Err(ErrorKind::WrongArgNum);
        return;
    }
    *reply = Reply::Array(Vec::with_capacity(args.len() - 1));
    for key in &args[1..] {
        let lru = svc.lru_clock();
        match svc.find_or_expire(key) {
            None => reply.push_bulk(None),
            Some(entry) => {
                entry.key.set_last_access(lru);
                reply.push_bulk(Some(entry.value.clone()));
            }
        }
    }
}

fn getdel(svc: &mut DataStructureService, args: &[&[u8]], reply: &mut Reply) {
    if args.len() != 2 {
        *reply = Reply::Err(ErrorKind::WrongArgNum);
        return;
    }
    if get_base(svc, args[1], reply) {
        svc.erase_key(args[1]);
    }
}

fn getex(svc: &mut DataStructureService, args: &[&[u8]], reply: &mut Reply) {
    if args.len() < 2 {
        *reply = Reply::Err(ErrorKind::WrongArgNum);
        return;
    }

    let mut persist = false;
    let mut expire_time: Option<UnixMillis> = None;
    let mut i = 2;
    while i < args.len() {
        if args[i] == b"PERSIST" {
            if expire_time.is_some() || persist {
                *reply = Reply::Err(ErrorKind::Syntax);
                return;
            }
            persist = true;
            i += 1;
            continue;
        }
        let cmd_time = svc.command_time_snapshot();
        match extract_expire_option(args, &mut i, cmd_time, reply, &mut expire_time) {
            ExtractExpire::Error => return,
            ExtractExpire::NotFound => {
                *reply = Reply::Err(ErrorKind::Syntax);
                return;
            }
            ExtractExpire::Done => {
                if persist {
                    *reply = Reply::Err(ErrorKind::Syntax);
                    return;
                }
            }
        }
        i += 1;
    }

    let key = args[1];
    if get_base(svc, key, reply) {
        if persist {
            svc.expire_ht.erase(key);
        } else if let Some(instant) = expire_time {
            let record = svc
                .data_ht
                .find(key)
                .map(|entry| entry.key.clone())
                .expect("entry was just found live");
            svc.expire_ht.upsert_shared(&record, instant);
        }
    }
}

fn getset(svc: &mut DataStructureService, args: &[&[u8]], reply: &mut Reply) {
    if args.len() != 3 {
        *reply = Reply::Err(ErrorKind::WrongArgNum);
        return;
    }
    let (status, _, old_value) = svc.set_data(args[1], args[2], SetMode::Regular, true);
    debug_assert!(status != SetStatus::NoOp);
    match old_value {
        None => *reply = Reply::Nil,
        Some(value) => {
            *reply = Reply::Bulk(value);
            svc.expire_ht.erase(args[1]);
        }
    }
}

fn getrange(svc: &mut DataStructureService, args: &[&[u8]], reply: &mut Reply) {
    if args.len() != 4 {
        *reply = Reply::Err(ErrorKind::WrongArgNum);
        return;
    }
    let parse_index = |bytes: &[u8]| match parse_i64(bytes) {
        Some(n) if (i32::MIN as i64..=i32::MAX as i64).contains(&n) => Some(n),
        _ => None,
    };
    let (start, end) = match (parse_index(args[2]), parse_index(args[3])) {
        (Some(start), Some(end)) => (start, end),
        _ => {
            *reply = Reply::Err(ErrorKind::NotAnInt);
            return;
        }
    };

    let lru = svc.lru_clock();
    let entry = match svc.find_or_expire(args[1]) {
        None => {
            *reply = Reply::Bulk(TrackedString::shared(b""));
            return;
        }
        Some(entry) => entry,
    };

    let size = entry.value.len() as i64;
    let clamp = |index: i64| {
        let index = if index < 0 { (size + index).max(0) } else { index };
        index.min(size)
    };
    let start_index = clamp(start);
    let end_index = clamp(end);
    if start_index == size || end_index <= start_index {
        *reply = Reply::Bulk(TrackedString::shared(b""));
    } else {
        let stop = ((end_index + 1) as usize).min(size as usize);
        *reply = Reply::Bulk(TrackedString::shared(
            &entry.value[start_index as usize..stop],
        ));
    }
    entry.key.set_last_access(lru);
}

fn append(svc: &mut DataStructureService, args: &[&[u8]], reply: &mut Reply) {
    if args.len() != 3 {
        *reply = Reply::Err(ErrorKind::WrongArgNum);
        return;
    }
    let lru = svc.lru_clock();
    let (entry, exists) = svc
        .data_ht
        .find_or_create(args[1], || TrackedString::shared(args[2]));
    if exists {
        if Arc::strong_count(&entry.value) != 1 {
            // Shared with a reader: copy-on-write.
            entry.value = Arc::new((*entry.value).clone());
        }
        Arc::get_mut(&mut entry.value)
            .expect("sole owner after copy")
            .append(args[2]);
    }
    entry.key.set_last_access(lru);
    *reply = Reply::Int(entry.value.len() as i64);
}

fn exists(svc: &mut DataStructureService, args: &[&[u8]], reply: &mut Reply) {
    if args.len() < 2 {
        *reply = Reply::Err(ErrorKind::WrongArgNum);
        return;
    }
    let mut count = 0;
    for key in &args[1..] {
        let lru = svc.lru_clock();
        if let Some(entry) = svc.find_or_expire(key) {
            entry.key.set_last_access(lru);
            count += 1;
        }
    }
    *reply = Reply::Int(count);
}

fn strlen(svc: &mut DataStructureService, args: &[&[u8]], reply: &mut Reply) {
    if args.len() != 2 {
        *reply = Reply::Err(ErrorKind::WrongArgNum);
        return;
    }
    let lru = svc.lru_clock();
    match svc.find_or_expire(args[1]) {
        None => *reply = Reply::Int(0),
        Some(entry) => {
            entry.key.set_last_access(lru);
            *reply = Reply::Int(entry.value.len() as i64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::test_util::*;

    #[test]
    fn set_insert_update() {
        let mut h = Harness::new();
        expect_ok(&h.invoke("SET k0 v0"));
        expect_bulk(&h.invoke("GET k0"), b"v0");
        expect_ok(&h.invoke("SET k0 v1"));
        expect_bulk(&h.invoke("GET k0"), b"v1");
    }

    #[test]
    fn set_nx_xx() {
        let mut h = Harness::new();
        expect_ok(&h.invoke("SET k v NX"));
        expect_nil(&h.invoke("SET k v2 NX"));
        expect_bulk(&h.invoke("GET k"), b"v");
        expect_ok(&h.invoke("SET k v3 XX"));
        expect_bulk(&h.invoke("GET k"), b"v3");
        expect_nil(&h.invoke("SET other v XX"));
        expect_nil(&h.invoke("GET other"));
        expect_err(&h.invoke("SET k v NX XX"), resp::reply::ErrorKind::Syntax);
    }

    #[test]
    fn set_expire_options() {
        let mut h = Harness::new();
        expect_ok(&h.invoke("SET k v PX 100"));
        expect_int(&h.invoke("TTL k"), 0);
        expect_ok(&h.invoke("SET k v PX 2000"));
        expect_int(&h.invoke("TTL k"), 2);
        // A plain SET clears the TTL.
        expect_ok(&h.invoke("SET k v"));
        expect_int(&h.invoke("TTL k"), -1);

        expect_ok(&h.invoke("SET k v EX 100"));
        expect_int(&h.invoke("TTL k"), 100);

        let pxat = START_TIME + 5_000;
        expect_ok(&h.invoke(&format!("SET k v PXAT {pxat}")));
        expect_int(&h.invoke("TTL k"), 5);
        let exat = (START_TIME + 7_000) / 1000;
        expect_ok(&h.invoke(&format!("SET k v EXAT {exat}")));
        expect_int(&h.invoke("TTL k"), 7);

        expect_err(&h.invoke("SET k v EX"), resp::reply::ErrorKind::Syntax);
        expect_err(&h.invoke("SET k v EX 0"), resp::reply::ErrorKind::NotAnInt);
        expect_err(&h.invoke("SET k v EX -5"), resp::reply::ErrorKind::NotAnInt);
        expect_err(&h.invoke("SET k v EX abc"), resp::reply::ErrorKind::NotAnInt);
        expect_err(
            &h.invoke("SET k v EX 10 PX 100"),
            resp::reply::ErrorKind::Syntax,
        );
    }

    #[test]
    fn set_keepttl() {
        let mut h = Harness::new();
        expect_ok(&h.invoke("SET k v"));
        expect_ok(&h.invoke("SET k v KEEPTTL"));
        expect_int(&h.invoke("TTL k"), -1);
        expect_ok(&h.invoke("SET k v EX 100"));
        expect_ok(&h.invoke("SET k v2 KEEPTTL"));
        expect_int(&h.invoke("TTL k"), 100);
        expect_bulk(&h.invoke("GET k"), b"v2");
        expect_err(
            &h.invoke("SET k v KEEPTTL EX 10"),
            resp::reply::ErrorKind::Syntax,
        );
        expect_err(
            &h.invoke("SET k v EX 10 KEEPTTL"),
            resp::reply::ErrorKind::Syntax,
        );
    }

    #[test]
    fn set_with_get() {
        let mut h = Harness::new();
        expect_ok(&h.invoke("SET k v0"));
        expect_bulk(&h.invoke("SET k v1 GET"), b"v0");
        expect_ok(&h.invoke("SET k v1 PX 100"));
        expect_bulk(&h.invoke("SET k v2 GET PX 100"), b"v1");
        h.advance(100);
        // GET over an expired value returns nil.
        expect_nil(&h.invoke("SET k v3 GET"));
    }

    #[test]
    fn set_nx_xx_on_expired_keys() {
        let mut h = Harness::new();
        expect_ok(&h.invoke("SET k v0 EX 1"));
        expect_nil(&h.invoke("SET k v1 NX"));
        expect_bulk(&h.invoke("GET k"), b"v0");
        h.advance(1000);
        expect_ok(&h.invoke("SET k v1 NX"));
        expect_bulk(&h.invoke("GET k"), b"v1");

        expect_ok(&h.invoke("SET j v0 EX 1"));
        h.advance(1000);
        expect_nil(&h.invoke("SET j v1 XX"));
        expect_nil(&h.invoke("GET j"));
    }

    #[test]
    fn setex_psetex() {
        let mut h = Harness::new();
        expect_ok(&h.invoke("SETEX k 100 v"));
        expect_int(&h.invoke("TTL k"), 100);
        expect_bulk(&h.invoke("GET k"), b"v");
        expect_ok(&h.invoke("PSETEX k 5000 v2"));
        expect_int(&h.invoke("TTL k"), 5);
        expect_bulk(&h.invoke("GET k"), b"v2");

        expect_err(&h.invoke("SETEX k 0 v"), resp::reply::ErrorKind::NotAnInt);
        expect_err(&h.invoke("SETEX k v"), resp::reply::ErrorKind::WrongArgNum);
    }

    #[test]
    fn setnx_setrange() {
        let mut h = Harness::new();
        expect_int(&h.invoke("SETNX k v"), 1);
        expect_int(&h.invoke("SETNX k v2"), 0);
        expect_bulk(&h.invoke("GET k"), b"v");

        expect_int(&h.invoke("SETRANGE r 0 hello"), 5);
        expect_bulk(&h.invoke("GET r"), b"hello");
        expect_int(&h.invoke("SETRANGE r 2 LLO"), 5);
        expect_bulk(&h.invoke("GET r"), b"heLLO");
        expect_int(&h.invoke("SETRANGE r 7 x"), 8);
        expect_err(
            &h.invoke("SETRANGE r -1 x"),
            resp::reply::ErrorKind::NotAnInt,
        );
    }

    #[test]
    fn mset_msetnx_mget() {
        let mut h = Harness::new();
        expect_ok(&h.invoke("MSET a 1 b 2 c 3"));
        expect_array(
            &h.invoke("MGET a b x c"),
            &[Some(b"1"), Some(b"2"), None, Some(b"3")],
        );
        expect_err(&h.invoke("MSET a 1 b"), resp::reply::ErrorKind::WrongArgNum);

        expect_int(&h.invoke("MSETNX a 9 d 4"), 1);
        expect_bulk(&h.invoke("GET a"), b"1");
        expect_bulk(&h.invoke("GET d"), b"4");
        expect_int(&h.invoke("MSETNX a 9 b 9"), 0);
    }

    #[test]
    fn getdel_getset() {
        let mut h = Harness::new();
        expect_ok(&h.invoke("SET k v"));
        expect_bulk(&h.invoke("GETDEL k"), b"v");
        expect_nil(&h.invoke("GET k"));
        expect_nil(&h.invoke("GETDEL k"));

        expect_nil(&h.invoke("GETSET g v0"));
        expect_bulk(&h.invoke("GETSET g v1"), b"v0");
        expect_bulk(&h.invoke("GET g"), b"v1");
    }

    #[test]
    fn getex_variants() {
        let mut h = Harness::new();
        expect_ok(&h.invoke("SET k v"));
        expect_bulk(&h.invoke("GETEX k EX 100"), b"v");
        expect_int(&h.invoke("TTL k"), 100);
        expect_bulk(&h.invoke("GETEX k PERSIST"), b"v");
        expect_int(&h.invoke("TTL k"), -1);
        expect_err(
            &h.invoke("GETEX k PERSIST EX 10"),
            resp::reply::ErrorKind::Syntax,
        );
        expect_nil(&h.invoke("GETEX missing EX 10"));
    }

    #[test]
    fn append_strlen_getrange() {
        let mut h = Harness::new();
        expect_ok(&h.invoke("SET k hello"));
        expect_int(&h.invoke("APPEND k world"), 10);
        expect_bulk(&h.invoke("GET k"), b"helloworld");
        expect_int(&h.invoke("STRLEN k"), 10);
        expect_int(&h.invoke("STRLEN missing"), 0);
        expect_bulk(&h.invoke("GETRANGE k 0 4"), b"hello");
        expect_bulk(&h.invoke("GETRANGE k 5 100"), b"world");
        expect_bulk(&h.invoke("GETRANGE missing 0 4"), b"");
        expect_int(&h.invoke("APPEND fresh abc"), 3);
    }

    // Append after a GET handed the value out: the reader's copy must not
    // observe the mutation.
    #[test]
    fn append_copies_when_shared() {
        let mut h = Harness::new();
        expect_ok(&h.invoke("SET k abc"));
        let before = h.invoke("GET k");
        expect_int(&h.invoke("APPEND k def"), 6);
        expect_bulk(&before, b"abc");
        expect_bulk(&h.invoke("GET k"), b"abcdef");
    }

    #[test]
    fn exists_counts_live_keys() {
        let mut h = Harness::new();
        expect_ok(&h.invoke("SET a 1"));
        expect_ok(&h.invoke("SET b 1 PX 50"));
        expect_int(&h.invoke("EXISTS a b missing a"), 3);
        h.advance(50);
        expect_int(&h.invoke("EXISTS a b missing a"), 2);
        expect_err(&h.invoke("EXISTS"), resp::reply::ErrorKind::WrongArgNum);
    }

    #[test]
    fn lazy_expiration_on_read() {
        let mut h = Harness::new();
        expect_ok(&h.invoke("SET k v EX 1"));
        h.advance(1000);
        expect_int(&h.invoke("TTL k"), -2);
        expect_nil(&h.invoke("GET k"));
        assert_eq!(h.svc.data_ht.count(), 0);
        assert_eq!(h.svc.expire_ht.count(), 0);
    }
}
