// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! End-to-end sessions against a live server: spawn it on a loopback port,
//! speak RESP over a TcpStream, and compare raw reply bytes.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::thread;
use std::time::Duration;

use ringkv::config::{Config, MaxmemoryPolicy};

fn start_server(port: u16, tweak: impl FnOnce(&mut Config)) -> thread::JoinHandle<()> {
    let mut config = Config::default();
    config.port = port;
    tweak(&mut config);
    thread::spawn(move || {
        ringkv::server::run(config).expect("server run");
    })
}

fn wait_for_server(port: u16) -> TcpStream {
    let mut tries = 250;
    loop {
        match TcpStream::connect(("127.0.0.1", port)) {
            Ok(stream) => {
                stream
                    .set_read_timeout(Some(Duration::from_secs(5)))
                    .unwrap();
                return stream;
            }
            Err(e) => {
                if tries == 0 {
                    panic!("server did not come up on port {port}: {e}");
                }
                tries -= 1;
                thread::sleep(Duration::from_millis(20));
            }
        }
    }
}

fn roundtrip(stream: &mut TcpStream, request: &[u8], expected: &[u8]) {
    stream.write_all(request).unwrap();
    expect_reply(stream, expected);
}

fn expect_reply(stream: &mut TcpStream, expected: &[u8]) {
    let mut response = vec![0u8; expected.len()];
    stream.read_exact(&mut response).unwrap();
    assert_eq!(
        response,
        expected,
        "got {:?}, want {:?}",
        String::from_utf8_lossy(&response),
        String::from_utf8_lossy(expected)
    );
}

fn shut_down(stream: &mut TcpStream, handle: thread::JoinHandle<()>) {
    // Whether the nil reply makes it out races against worker deactivation,
    // so only the clean exit is asserted.
    stream.write_all(b"SHUTDOWN\r\n").unwrap();
    handle.join().expect("clean server exit");
}

#[test]
fn set_get_del_lifecycle() {
    let handle = start_server(17801, |_| {});
    let mut stream = wait_for_server(17801);

    roundtrip(&mut stream, b"SET k v\r\n", b"+OK\r\n");
    roundtrip(&mut stream, b"GET k\r\n", b"$1\r\nv\r\n");
    roundtrip(&mut stream, b"DEL k\r\n", b":1\r\n");
    roundtrip(&mut stream, b"GET k\r\n", b"$-1\r\n");

    shut_down(&mut stream, handle);
}

#[test]
fn ttl_expires_in_real_time() {
    let handle = start_server(17802, |_| {});
    let mut stream = wait_for_server(17802);

    roundtrip(&mut stream, b"SET k v PX 100\r\n", b"+OK\r\n");
    thread::sleep(Duration::from_millis(250));
    roundtrip(&mut stream, b"TTL k\r\n", b":-2\r\n");
    roundtrip(&mut stream, b"GET k\r\n", b"$-1\r\n");

    shut_down(&mut stream, handle);
}

#[test]
fn mset_mget_array_reply() {
    let handle = start_server(17803, |_| {});
    let mut stream = wait_for_server(17803);

    roundtrip(&mut stream, b"MSET a 1 b 2 c 3\r\n", b"+OK\r\n");
    roundtrip(
        &mut stream,
        b"MGET a b x c\r\n",
        b"*4\r\n$1\r\n1\r\n$1\r\n2\r\n$-1\r\n$1\r\n3\r\n",
    );

    shut_down(&mut stream, handle);
}

#[test]
fn string_editing_commands() {
    let handle = start_server(17804, |_| {});
    let mut stream = wait_for_server(17804);

    roundtrip(&mut stream, b"SET k hello\r\n", b"+OK\r\n");
    roundtrip(&mut stream, b"APPEND k world\r\n", b":10\r\n");
    roundtrip(&mut stream, b"GET k\r\n", b"$10\r\nhelloworld\r\n");
    roundtrip(&mut stream, b"STRLEN k\r\n", b":10\r\n");
    roundtrip(&mut stream, b"GETRANGE k 0 4\r\n", b"$5\r\nhello\r\n");

    shut_down(&mut stream, handle);
}

#[test]
fn nx_xx_modes() {
    let handle = start_server(17805, |_| {});
    let mut stream = wait_for_server(17805);

    roundtrip(&mut stream, b"SET k v NX\r\n", b"+OK\r\n");
    roundtrip(&mut stream, b"SET k v2 NX\r\n", b"$-1\r\n");
    roundtrip(&mut stream, b"SET k v3 XX\r\n", b"+OK\r\n");
    roundtrip(&mut stream, b"GET k\r\n", b"$3\r\nv3\r\n");

    shut_down(&mut stream, handle);
}

#[test]
fn oom_refusal_under_noeviction() {
    let handle = start_server(17806, |config| {
        config.maxmemory = 1;
        config.maxmemory_policy = MaxmemoryPolicy::NoEviction;
    });
    let mut stream = wait_for_server(17806);

    roundtrip(
        &mut stream,
        b"SET k v\r\n",
        b"-OOM command not allowed when used memory > 'maxmemory'.\r\n",
    );
    // Reads still work; the connection stays healthy.
    roundtrip(&mut stream, b"GET k\r\n", b"$-1\r\n");

    shut_down(&mut stream, handle);
}

#[test]
fn multibulk_split_across_receives() {
    let handle = start_server(17807, |_| {});
    let mut stream = wait_for_server(17807);

    let request: &[u8] = b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$5\r\nhello\r\n";
    for split in [1, 5, 14, request.len() - 2] {
        stream.write_all(&request[..split]).unwrap();
        stream.flush().unwrap();
        thread::sleep(Duration::from_millis(30));
        stream.write_all(&request[split..]).unwrap();
        expect_reply(&mut stream, b"+OK\r\n");
    }
    roundtrip(&mut stream, b"GET k\r\n", b"$5\r\nhello\r\n");

    shut_down(&mut stream, handle);
}

#[test]
fn multibulk_and_inline_interleave() {
    let handle = start_server(17808, |_| {});
    let mut stream = wait_for_server(17808);

    roundtrip(
        &mut stream,
        b"*3\r\n$3\r\nSET\r\n$2\r\nk1\r\n$2\r\nv1\r\n",
        b"+OK\r\n",
    );
    roundtrip(&mut stream, b"GET k1\r\n", b"$2\r\nv1\r\n");
    roundtrip(&mut stream, b"*2\r\n$3\r\nGET\r\n$2\r\nk1\r\n", b"$2\r\nv1\r\n");

    shut_down(&mut stream, handle);
}

#[test]
fn protocol_error_keeps_connection_usable() {
    let handle = start_server(17809, |_| {});
    let mut stream = wait_for_server(17809);

    roundtrip(
        &mut stream,
        b"*1\r\nnot-a-bulk\r\n",
        b"-ERR Protocol error\r\n",
    );
    roundtrip(&mut stream, b"PING\r\n", b"+PONG\r\n");
    roundtrip(&mut stream, b"NOSUCHCMD\r\n", b"-ERR unknown command\r\n");
    roundtrip(&mut stream, b"HELLO 3\r\n", b"+OK\r\n");
    roundtrip(&mut stream, b"HELLO 2\r\n", b"-ERR Protocol error\r\n");
    roundtrip(&mut stream, b"GET\r\n", b"-ERR wrong number of arguments.\r\n");

    shut_down(&mut stream, handle);
}

#[test]
fn second_connection_sees_first_connections_writes() {
    let handle = start_server(17810, |_| {});
    let mut first = wait_for_server(17810);
    roundtrip(&mut first, b"SET shared-key 42\r\n", b"+OK\r\n");

    let mut second = wait_for_server(17810);
    roundtrip(&mut second, b"GET shared-key\r\n", b"$2\r\n42\r\n");
    roundtrip(&mut second, b"DBSIZE\r\n", b":1\r\n");

    shut_down(&mut first, handle);
}
