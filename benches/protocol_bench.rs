//! Performance benchmarks for the HAT line protocol.
//!
//! Measures line classification, line framing and the upload checksum. The
//! reader loop classifies every line the HAT emits (motor feedback streams
//! at up to 100 lines per second per port) and the checksum runs over the
//! whole firmware image before an upload.
//!
//! Run benchmarks with:
//! ```sh
//! cargo bench --bench protocol_bench
//! ```

use bytes::BytesMut;
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use hatlink_protocol::{HatLineCodec, checksum, parse_line};
use std::hint::black_box;
use tokio_util::codec::Decoder;

const LINES: &[(&str, &str)] = &[
    ("data_combi", "P0C0: 12 -1437 -37"),
    ("data_float", "P2C0: 0.25 13.75 180.5 1.0"),
    ("status_connected", "P1: connected to active ID 4b"),
    ("status_ramp_done", "P3: ramp done"),
    ("voltage", "8.2 V"),
    ("firmware_banner", "Firmware version: 1636109636 2021-11-05T10:53:56+00:00"),
    ("noise", "some negotiation chatter nobody listens to"),
];

/// Benchmark classification of each kind of line.
fn bench_parse_line(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse_line");
    group.throughput(Throughput::Elements(1));

    for (name, line) in LINES {
        group.bench_with_input(BenchmarkId::from_parameter(name), line, |b, line| {
            b.iter(|| black_box(parse_line(black_box(line))));
        });
    }

    group.finish();
}

/// Benchmark framing a burst of feedback lines.
fn bench_decode_burst(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_burst");

    let mut burst = Vec::new();
    for i in 0..100 {
        burst.extend_from_slice(format!("P{}C0: {} {} {}\r\n", i % 4, i, i * 10, i - 50).as_bytes());
    }
    group.throughput(Throughput::Bytes(burst.len() as u64));

    group.bench_function("100_lines", |b| {
        b.iter(|| {
            let mut codec = HatLineCodec::new();
            let mut buf = BytesMut::from(&burst[..]);
            let mut count = 0;
            while let Some(line) = codec.decode(&mut buf).unwrap() {
                black_box(line);
                count += 1;
            }
            assert_eq!(count, 100);
        });
    });

    group.finish();
}

/// Benchmark the checksum over image-sized buffers.
fn bench_checksum(c: &mut Criterion) {
    let mut group = c.benchmark_group("checksum");

    for size in [1024usize, 64 * 1024, 256 * 1024] {
        let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &data, |b, data| {
            b.iter(|| black_box(checksum(black_box(data))));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_parse_line, bench_decode_burst, bench_checksum);
criterion_main!(benches);
