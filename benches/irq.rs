// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use criterion::{criterion_group, criterion_main, Criterion};
use kbio::{Config, Runtime};
use std::net::TcpStream;
use std::thread;

fn read_write_round_trip(c: &mut Criterion) {
    let rt = Runtime::with_libc_stack(Config::default()).expect("failed to start runtime");
    let listener = rt.listen("tcp", "127.0.0.1:0").expect("listen failed");
    let addr = listener.addr().expect("addr failed");

    let echo = thread::spawn(move || {
        let conn = listener.accept().expect("accept failed");
        let mut buf = [0u8; 64];
        loop {
            match conn.read(&mut buf) {
                Ok(0) | Err(_) => return,
                Ok(n) => {
                    let _ = conn.write(&buf[..n]);
                }
            }
        }
    });

    let mut client = TcpStream::connect(addr).expect("connect failed");
    let mut buf = [0u8; 8];

    c.bench_function("irq_read_write_round_trip", |b| {
        b.iter(|| {
            use std::io::{Read, Write};
            client.write_all(b"bench_xx").unwrap();
            client.read_exact(&mut buf).unwrap();
        })
    });

    drop(client);
    echo.join().unwrap();
}

criterion_group!(benches, read_write_round_trip);
criterion_main!(benches);
