// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::fmt::Write;
use std::sync::atomic::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};

use resp::memory::{tracker, TrackedString};
use resp::reply::{ErrorKind, Reply};

use crate::service::{Command, DataStructureService};

pub fn register(service: &mut DataStructureService) {
    service.register_command("DBSIZE", Command::read(dbsize));
    service.register_command("INFO", Command::read(info));
    service.register_command("COMMAND", Command::read(command));
    service.register_command("SHUTDOWN", Command::read(shutdown));
}

fn dbsize(svc: &mut DataStructureService, _args: &[&[u8]], reply: &mut Reply) {
    *reply = Reply::Int(svc.data_ht.count() as i64);
}

fn collect_server_info(svc: &DataStructureService) -> String {
    let mut s = String::new();
    let now_usec = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros())
        .unwrap_or(0);
    let uptime_ms = (svc.clock.now() - svc.shared.start_time_ms).max(0);

    s.push_str("# Server\n");
    s.push_str("multiplexing_api:io_uring\n");
    let _ = writeln!(s, "process_id:{}", std::process::id());
    let _ = writeln!(s, "tcp_port:{}", svc.config.port);
    let _ = writeln!(s, "server_time_usec:{now_usec}");
    let _ = writeln!(s, "uptime_in_seconds:{}", uptime_ms / 1000);
    let _ = writeln!(s, "uptime_in_days:{}", uptime_ms / 1000 / 86400);
    let _ = writeln!(s, "hz:{}", svc.config.hz);
    let _ = writeln!(s, "configured_hz:{}", svc.config.hz);
    s.push('\n');
    s
}

fn collect_clients_info(svc: &DataStructureService) -> String {
    let manager = &svc.shared.manager;
    let mut s = String::new();
    s.push_str("# Clients\n");
    let _ = writeln!(s, "connected_clients:{}", manager.active_clients());
    let _ = writeln!(s, "maxclients:{}", svc.config.maxclients);
    let _ = writeln!(
        s,
        "client_recent_max_input_buffer:{}",
        manager.stats.max_input_buffer.load(Ordering::Relaxed)
    );
    let _ = writeln!(
        s,
        "client_recent_max_output_buffer:{}",
        manager.stats.max_output_buffer.load(Ordering::Relaxed)
    );
    s.push('\n');
    s
}

fn collect_memory_info(svc: &DataStructureService) -> String {
    let mut s = String::new();
    s.push_str("# Memory\n");
    let _ = writeln!(s, "used_memory:{}", tracker().total_allocated());
    let _ = writeln!(s, "used_memory_peak:{}", tracker().peak_allocated());
    let _ = writeln!(s, "maxmemory:{}", svc.config.maxmemory);
    let _ = writeln!(s, "maxmemory_policy:{}", svc.config.maxmemory_policy);
    let _ = writeln!(
        s,
        "evicted_keys:{}",
        svc.stats.evicted_keys.load(Ordering::Relaxed)
    );
    let _ = writeln!(
        s,
        "active_expired_keys:{}",
        svc.stats.active_expired_keys.load(Ordering::Relaxed)
    );
    s.push('\n');
    s
}

fn info(svc: &mut DataStructureService, args: &[&[u8]], reply: &mut Reply) {
    let mut s = String::new();
    if args.len() == 1 {
        s += &collect_server_info(svc);
        s += &collect_clients_info(svc);
        s += &collect_memory_info(svc);
    } else {
        for section in &args[1..] {
            if section.eq_ignore_ascii_case(b"server") {
                s += &collect_server_info(svc);
            } else if section.eq_ignore_ascii_case(b"clients") {
                s += &collect_clients_info(svc);
            } else if section.eq_ignore_ascii_case(b"memory") {
                s += &collect_memory_info(svc);
            }
        }
    }
    *reply = Reply::Bulk(TrackedString::shared(s.as_bytes()));
}

// A placeholder until introspection data is worth reporting.
fn command(_svc: &mut DataStructureService, _args: &[&[u8]], reply: &mut Reply) {
    *reply = Reply::Bulk(TrackedString::shared(b" "));
}

fn shutdown(svc: &mut DataStructureService, args: &[&[u8]], reply: &mut Reply) {
    if args.len() > 1 {
        *reply = Reply::Err(ErrorKind::WrongArgNum);
        return;
    }
    svc.shutdown();
    *reply = Reply::Nil;
}

#[cfg(test)]
mod tests {
    use crate::service::test_util::*;
    use resp::reply::Reply;

    #[test]
    fn dbsize_counts() {
        let mut h = Harness::new();
        expect_int(&h.invoke("DBSIZE"), 0);
        expect_ok(&h.invoke("SET a 1"));
        expect_ok(&h.invoke("SET b 2"));
        expect_int(&h.invoke("DBSIZE"), 2);
    }

    #[test]
    fn info_sections() {
        let mut h = Harness::new();
        let text = |reply: &Reply| match reply {
            Reply::Bulk(s) => String::from_utf8_lossy(s.as_slice()).into_owned(),
            other => panic!("expected bulk, got {other:?}"),
        };

        let all = text(&h.invoke("INFO"));
        assert!(all.contains("# Server"));
        assert!(all.contains("# Clients"));
        assert!(all.contains("# Memory"));
        assert!(all.contains("multiplexing_api:io_uring"));
        assert!(all.contains("tcp_port:6379"));

        let server_only = text(&h.invoke("INFO server"));
        assert!(server_only.contains("# Server"));
        assert!(!server_only.contains("# Clients"));

        let memory = text(&h.invoke("INFO MEMORY"));
        assert!(memory.contains("used_memory:"));
        assert!(memory.contains("maxmemory_policy:noeviction"));
    }

    #[test]
    fn command_is_a_placeholder() {
        let mut h = Harness::new();
        expect_bulk(&h.invoke("COMMAND"), b" ");
    }

    #[test]
    fn shutdown_fulfills_the_future() {
        let mut h = Harness::new();
        assert!(!h.shutdown_requested());
        expect_nil(&h.invoke("SHUTDOWN"));
        assert!(h.shutdown_requested());
        expect_err(
            &h.invoke("SHUTDOWN NOSAVE"),
            resp::reply::ErrorKind::WrongArgNum,
        );
    }
}
