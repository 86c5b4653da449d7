// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

#![allow(clippy::uninlined_format_args)] // Bench code readability over pedantic
#![allow(clippy::semicolon_if_nothing_returned)] // Benchmark code formatting

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use segmem::{PoolOptions, SegmentPool, ZeroPolicy, SEGMENT_SIZE};

/// Benchmark: rent + release of a single segment (the hot path).
fn bench_rent_release_one_segment(c: &mut Criterion) {
    let pool = SegmentPool::new(PoolOptions::default());
    c.bench_function("pool_rent_release_1seg", |b| {
        b.iter(|| {
            let buf = pool.rent(black_box(SEGMENT_SIZE), false);
            pool.release(buf, ZeroPolicy::None);
        })
    });
}

/// Benchmark: four-segment rent with zeroing demanded each round.
///
/// Releases with `None` so every rent pays the clear; the gap to the
/// plain benchmark is the zero-fill cost.
fn bench_rent_release_cleared(c: &mut Criterion) {
    let pool = SegmentPool::new(PoolOptions::default());
    c.bench_function("pool_rent_release_4seg_cleared", |b| {
        b.iter(|| {
            let buf = pool.rent(black_box(4 * SEGMENT_SIZE), true);
            pool.release(buf, ZeroPolicy::None);
        })
    });
}

/// Benchmark: follow-the-block rent, the stream append pattern.
fn bench_preferred_chain(c: &mut Criterion) {
    let pool = SegmentPool::new(PoolOptions::default());
    c.bench_function("pool_rent_preferred_chain", |b| {
        b.iter(|| {
            let first = pool.rent(SEGMENT_SIZE, false);
            let (second, _) = pool.rent_preferred(SEGMENT_SIZE, false, first.origin());
            pool.release(second, ZeroPolicy::None);
            pool.release(first, ZeroPolicy::None);
        })
    });
}

criterion_group!(
    benches,
    bench_rent_release_one_segment,
    bench_rent_release_cleared,
    bench_preferred_chain
);
criterion_main!(benches);
