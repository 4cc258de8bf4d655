// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use kbio::{Config, Fail, Runtime};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::thread;
use std::time::{Duration, Instant};

fn runtime() -> std::sync::Arc<Runtime> {
    Runtime::with_libc_stack(Config::default()).expect("failed to start runtime")
}

#[test]
fn echo_round_trips() {
    let rt = runtime();
    let listener = rt.listen("tcp", "127.0.0.1:0").unwrap();
    let addr = listener.addr().unwrap();

    let echo = thread::spawn(move || {
        let conn = listener.accept().unwrap();
        let mut buf = [0u8; 1024];
        loop {
            match conn.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    let (_, res) = conn.write(&buf[..n]);
                    res.unwrap();
                }
                Err(_) => break,
            }
        }
    });

    let mut client = TcpStream::connect(addr).unwrap();
    let mut buf = [0u8; 9];
    for _ in 0..2048 {
        client.write_all(b"data_xxxx").unwrap();
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"data_xxxx");
    }
    drop(client);
    echo.join().unwrap();
}

#[test]
fn deferred_writer() {
    let rt = runtime();
    let listener = rt.listen("tcp", "127.0.0.1:0").unwrap();
    let addr = listener.addr().unwrap();

    let server = thread::spawn(move || {
        let conn = listener.accept().unwrap();
        let mut buf = [0u8; 1024];
        let n = conn.read(&mut buf).unwrap();
        (n, buf[..n].to_vec())
    });

    let mut client = TcpStream::connect(addr).unwrap();
    thread::sleep(Duration::from_millis(300));
    client.write_all(b"data_xxx").unwrap();

    let (n, data) = server.join().unwrap();
    assert_eq!(n, 8);
    assert_eq!(&data, b"data_xxx");
}

#[test]
fn read_deadline_past() {
    let rt = runtime();
    let listener = rt.listen("tcp", "127.0.0.1:0").unwrap();
    let addr = listener.addr().unwrap();

    let server = thread::spawn(move || {
        let conn = listener.accept().unwrap();
        conn.set_read_deadline(Some(Instant::now() - Duration::from_secs(1)));
        let mut buf = [0u8; 16];
        let first = conn.read(&mut buf);
        let second = conn.read(&mut buf);
        (first, second)
    });

    let _client = TcpStream::connect(addr).unwrap();
    let (first, second) = server.join().unwrap();
    assert_eq!(first.unwrap_err(), Fail::DeadlineExceeded);
    assert_eq!(second.unwrap_err(), Fail::DeadlineExceeded);
}

#[test]
fn read_deadline_updated_mid_block() {
    let rt = runtime();
    let listener = rt.listen("tcp", "127.0.0.1:0").unwrap();
    let addr = listener.addr().unwrap();

    let accepted = thread::spawn(move || listener.accept().unwrap());
    let _client = TcpStream::connect(addr).unwrap();
    let conn = std::sync::Arc::new(accepted.join().unwrap());

    let reader = {
        let conn = conn.clone();
        thread::spawn(move || {
            let mut buf = [0u8; 16];
            let started = Instant::now();
            let result = conn.read(&mut buf);
            (result, started.elapsed())
        })
    };

    thread::sleep(Duration::from_millis(300));
    conn.set_read_deadline(Some(Instant::now() + Duration::from_millis(300)));

    let (result, elapsed) = reader.join().unwrap();
    assert_eq!(result.unwrap_err(), Fail::DeadlineExceeded);
    assert!(elapsed >= Duration::from_millis(550), "elapsed = {:?}", elapsed);
}

#[test]
fn close_during_read() {
    let rt = runtime();
    let listener = rt.listen("tcp", "127.0.0.1:0").unwrap();
    let addr = listener.addr().unwrap();

    let server = thread::spawn(move || {
        let conn = listener.accept().unwrap();
        let mut buf = [0u8; 16];
        let after_peer_close = conn.read(&mut buf);
        conn.close().unwrap();
        let after_local_close = conn.read(&mut buf);
        (after_peer_close, after_local_close)
    });

    let client = TcpStream::connect(addr).unwrap();
    drop(client);

    let (after_peer_close, after_local_close) = server.join().unwrap();
    assert_eq!(after_peer_close.unwrap(), 0);
    assert_eq!(after_local_close.unwrap_err(), Fail::Invalid);
}

#[test]
fn write_back_pressure_with_deadline() {
    let rt = runtime();
    let listener = rt.listen("tcp", "127.0.0.1:0").unwrap();
    let addr = listener.addr().unwrap();

    let server = thread::spawn(move || {
        let conn = listener.accept().unwrap();
        conn.set_write_deadline(Some(Instant::now() + Duration::from_millis(300)));
        loop {
            let (_, result) = conn.write(b"data_xxxx");
            if let Err(e) = result {
                return e;
            }
        }
    });

    // Connect but never read, so the peer's receive window fills and the
    // server's writes eventually block on EAGAIN until the deadline fires.
    let client = TcpStream::connect(addr).unwrap();

    let err = server.join().unwrap();
    assert_eq!(err, Fail::DeadlineExceeded);
    drop(client);
}
