// Criterion benchmarks for the trxd-common wire codec
//
// Run benchmarks with:
//   cargo bench -p trxd-common
//
// For detailed output with plots:
//   cargo bench -p trxd-common -- --save-baseline main

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use trxd_common::transport::Codec;
use trxd_common::{Command, Message};

fn payload(size: usize) -> Vec<u8> {
    let mut body = b"<FareQuote>".to_vec();
    body.resize(size.saturating_sub(12), b'F');
    body.extend_from_slice(b"</FareQuote>");
    body
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_encode");

    for size in [64usize, 4 * 1024, 256 * 1024] {
        let msg = Message::new(Command::REQUEST, "0010", payload(size));
        group.bench_with_input(BenchmarkId::new("standard", size), &msg, |b, msg| {
            b.iter(|| Codec::standard().encode(black_box(msg)));
        });
        group.bench_with_input(BenchmarkId::new("legacy", size), &msg, |b, msg| {
            b.iter(|| Codec::legacy().encode(black_box(msg)));
        });
    }

    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_decode");

    for size in [64usize, 4 * 1024, 256 * 1024] {
        let msg = Message::new(Command::REQUEST, "0010", payload(size));
        let standard = Codec::standard().encode(&msg);
        let legacy = Codec::legacy().encode(&msg);

        group.bench_with_input(BenchmarkId::new("standard", size), &standard, |b, bytes| {
            b.iter(|| Codec::standard().decode(black_box(bytes)));
        });
        group.bench_with_input(BenchmarkId::new("legacy", size), &legacy, |b, bytes| {
            b.iter(|| Codec::legacy().decode(black_box(bytes)));
        });
    }

    group.finish();
}

fn bench_error_response(c: &mut Criterion) {
    c.bench_function("error_response", |b| {
        b.iter(|| {
            Message::error(
                black_box(9001),
                black_box("Transaction threshold reached & retry later"),
            )
        });
    });
}

criterion_group!(benches, bench_encode, bench_decode, bench_error_response);
criterion_main!(benches);
