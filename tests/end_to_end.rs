//! End-to-end tests driving the demo binary over real TCP connections.
//!
//! The demo answers each received line with `[<pid>, <next counter>]` from a
//! per-connection `[1, 2, 3]` list and closes once the list drains. That is
//! enough to observe, from the outside: which process serviced an event,
//! whether the counter survived a process rotation, and when the server side
//! of a connection actually closed.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::process::{Child, Command};
use std::thread;
use std::time::{Duration, Instant};

struct DemoServer {
    child: Child,
    port: u16,
}

impl DemoServer {
    fn start(read_timeout_ms: u64) -> Self {
        let port = free_port();
        let child = Command::new(env!("CARGO_BIN_EXE_refork"))
            .args([
                "--port",
                &port.to_string(),
                "--read-timeout-ms",
                &read_timeout_ms.to_string(),
                "--log-level",
                "warn",
            ])
            .spawn()
            .expect("failed to spawn demo server");
        Self { child, port }
    }

    fn connect(&self) -> TcpStream {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match TcpStream::connect(("127.0.0.1", self.port)) {
                Ok(stream) => return stream,
                Err(_) if Instant::now() < deadline => {
                    thread::sleep(Duration::from_millis(25));
                }
                Err(e) => panic!("server never came up: {e}"),
            }
        }
    }
}

impl Drop for DemoServer {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Send one line and parse the `[pid, counter]` response.
fn exchange(stream: &mut TcpStream, reader: &mut BufReader<TcpStream>) -> (u32, u32) {
    stream.write_all(b"go\n").unwrap();
    let mut line = String::new();
    reader.read_line(&mut line).unwrap();
    parse_response(&line)
}

fn parse_response(line: &str) -> (u32, u32) {
    let inner = line
        .trim()
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .unwrap_or_else(|| panic!("malformed response: {line:?}"));
    let mut parts = inner.split(", ");
    let pid = parts.next().unwrap().parse().unwrap();
    let counter = parts.next().unwrap().parse().unwrap();
    (pid, counter)
}

#[test]
fn counter_survives_process_rotation() {
    let server = DemoServer::start(300);
    let mut stream = server.connect();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let mut reader = BufReader::new(stream.try_clone().unwrap());

    // Two lines inside one burst: same handler process services both.
    let (pid1, c1) = exchange(&mut stream, &mut reader);
    let (pid2, c2) = exchange(&mut stream, &mut reader);
    assert_eq!(c1, 1);
    assert_eq!(c2, 2);
    assert_eq!(pid1, pid2, "a burst without idle gaps must stay in one process");

    // Idle past twice the read timeout: the next line lands in a fresh
    // process, with the counter intact.
    thread::sleep(Duration::from_millis(700));
    let (pid3, c3) = exchange(&mut stream, &mut reader);
    assert_eq!(c3, 3, "connection data must accumulate across rotations");
    assert_ne!(pid3, pid1, "an idle gap must rotate to a new process");

    // The list drained, so the demo closed the connection.
    let mut rest = Vec::new();
    reader.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty());
}

#[test]
fn reconnect_starts_from_fresh_state() {
    let server = DemoServer::start(300);

    let mut stream = server.connect();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let mut reader = BufReader::new(stream.try_clone().unwrap());
    let (_, c1) = exchange(&mut stream, &mut reader);
    assert_eq!(c1, 1);
    // Let the handler rotate so state has actually been persisted once.
    thread::sleep(Duration::from_millis(700));
    let (_, c2) = exchange(&mut stream, &mut reader);
    assert_eq!(c2, 2);
    drop(reader);
    drop(stream);

    // Give the supervisor a moment to observe the close and tear down.
    thread::sleep(Duration::from_millis(700));

    // Same peer reconnecting is a brand-new connection: the counter restarts.
    let mut stream = server.connect();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let mut reader = BufReader::new(stream.try_clone().unwrap());
    let (_, c1_again) = exchange(&mut stream, &mut reader);
    assert_eq!(c1_again, 1, "discarded state must not leak into a reconnect");
}

#[test]
fn unrelated_handler_does_not_hold_a_closed_connection_open() {
    // A peer sees EOF only once every server-side copy of its socket is
    // closed. If a forked handler leaked descriptors of other connections,
    // a half-closing peer would keep waiting until that unrelated handler
    // exited. Hold one handler alive with a trickle of traffic and verify
    // another connection's teardown is still observed promptly.
    let server = DemoServer::start(500);

    // Connection B: consume one counter item, then idle past the timeout so
    // its socket is parked in the supervisor.
    let mut b = server.connect();
    b.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let mut b_reader = BufReader::new(b.try_clone().unwrap());
    let (_, c) = exchange(&mut b, &mut b_reader);
    assert_eq!(c, 1);
    thread::sleep(Duration::from_millis(1200));

    // Connection A: its handler forks while B's socket is parked, inherits
    // a copy of it across fork, and must close that copy. Keep the handler
    // alive in the background with sends spaced inside the read timeout.
    let mut a = server.connect();
    a.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let mut a_reader = BufReader::new(a.try_clone().unwrap());
    let (_, c) = exchange(&mut a, &mut a_reader);
    assert_eq!(c, 1);
    let keep_alive = thread::spawn(move || {
        for _ in 0..2 {
            thread::sleep(Duration::from_millis(450));
            let _ = exchange(&mut a, &mut a_reader);
        }
    });

    // Half-close B. Its handler observes EOF and exits without any shutdown
    // of its own, so B's read unblocks only when the last server-side copy
    // of the socket is gone.
    b.shutdown(std::net::Shutdown::Write).unwrap();
    let start = Instant::now();
    let mut rest = Vec::new();
    b_reader.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty());
    assert!(
        start.elapsed() < Duration::from_millis(600),
        "peer close was delayed by a descriptor leaked into another handler"
    );

    keep_alive.join().unwrap();
}
