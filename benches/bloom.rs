//! Benchmarks for bloom object operations.
//!
//! Covers the per-item hot paths and whole-object encode/decode.

#![allow(missing_docs)]

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use std::sync::Arc;
use viator_bloom::persistence::codec;
use viator_bloom::{BloomMetrics, BloomObject, BloomOptions, Scaling, SeedChoice, SizeLimit};

const LIMIT: u64 = 128 * 1024 * 1024;

fn options(capacity: i64, fp_rate: f64) -> BloomOptions {
    BloomOptions {
        capacity,
        fp_rate,
        tightening_ratio: 0.5,
        scaling: Scaling::Expansion(2),
        seed: SeedChoice::Fixed,
    }
}

fn filled(capacity: i64, fp_rate: f64, items: u64, metrics: &Arc<BloomMetrics>) -> BloomObject {
    let mut bloom =
        BloomObject::new(options(capacity, fp_rate), None, SizeLimit::enforced(LIMIT), metrics)
            .expect("valid options");
    for i in 0..items {
        let _ = bloom.add_item(format!("item:{i}").as_bytes(), SizeLimit::enforced(LIMIT));
    }
    bloom
}

/// Benchmark inserts, including scale-outs
fn bench_add(c: &mut Criterion) {
    let mut group = c.benchmark_group("add");
    group.throughput(Throughput::Elements(1));

    for fp_rate in [0.01, 0.0001] {
        group.bench_with_input(BenchmarkId::new("fp_rate", fp_rate), &fp_rate, |b, &fp| {
            let metrics = Arc::new(BloomMetrics::new());
            let mut bloom = filled(1_000, fp, 0, &metrics);
            let mut i = 0u64;
            b.iter(|| {
                i += 1;
                let item = i.to_le_bytes();
                black_box(bloom.add_item(&item, SizeLimit::enforced(LIMIT)))
            });
        });
    }

    group.finish();
}

/// Benchmark lookups against objects with several units
fn bench_exists(c: &mut Criterion) {
    let mut group = c.benchmark_group("exists");
    group.throughput(Throughput::Elements(1));

    for items in [1_000u64, 100_000] {
        let metrics = Arc::new(BloomMetrics::new());
        let bloom = filled(1_000, 0.01, items, &metrics);

        group.bench_with_input(BenchmarkId::new("hit", items), &bloom, |b, bloom| {
            b.iter(|| black_box(bloom.item_exists(b"item:7")));
        });
        group.bench_with_input(BenchmarkId::new("miss", items), &bloom, |b, bloom| {
            b.iter(|| black_box(bloom.item_exists(b"absent")));
        });
    }

    group.finish();
}

/// Benchmark the persistence codec
fn bench_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec");
    let metrics = Arc::new(BloomMetrics::new());
    let bloom = filled(10_000, 0.001, 50_000, &metrics);
    let encoded = codec::encode(&bloom);
    group.throughput(Throughput::Bytes(encoded.len() as u64));

    group.bench_function("encode", |b| b.iter(|| black_box(codec::encode(&bloom))));
    group.bench_function("decode", |b| {
        b.iter(|| {
            black_box(codec::decode(&encoded, SizeLimit::enforced(LIMIT), &metrics).expect("valid"))
        })
    });
    group.bench_function("digest", |b| b.iter(|| black_box(bloom.digest())));

    group.finish();
}

criterion_group!(benches, bench_add, bench_exists, bench_codec);
criterion_main!(benches);
