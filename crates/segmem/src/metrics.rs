// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Process-wide allocation gauges.
//!
//! Two gauges track how many segments of backing memory are currently
//! allocated, split by backing kind. They exist for observability only:
//! no allocator decision reads them.
//!
//! # Performance
//!
//! - update: single atomic add/sub (Relaxed)
//! - read: single atomic load

use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::BackingKind;

/// Gauge name for heap-backed segments (unit: segments).
pub const GC_ALLOCATED_GAUGE: &str = "segment_memory.gc_allocated";

/// Gauge name for native-backed segments (unit: segments).
pub const NATIVE_ALLOCATED_GAUGE: &str = "segment_memory.native_allocated";

static GC_ALLOCATED: AtomicU64 = AtomicU64::new(0);
static NATIVE_ALLOCATED: AtomicU64 = AtomicU64::new(0);

/// Serializes tests that assert exact native-gauge deltas; the gauges are
/// process-wide and the test harness runs in parallel.
#[cfg(test)]
pub(crate) static NATIVE_GAUGE_TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

fn gauge(kind: BackingKind) -> &'static AtomicU64 {
    match kind {
        BackingKind::Heap => &GC_ALLOCATED,
        BackingKind::Native => &NATIVE_ALLOCATED,
    }
}

/// Record `segments` of backing memory allocated.
pub(crate) fn record_allocated(kind: BackingKind, segments: usize) {
    gauge(kind).fetch_add(segments as u64, Ordering::Relaxed);
}

/// Record `segments` of backing memory released.
pub(crate) fn record_released(kind: BackingKind, segments: usize) {
    gauge(kind).fetch_sub(segments as u64, Ordering::Relaxed);
}

/// Current number of heap-backed segments allocated across the process.
pub fn gc_allocated_segments() -> u64 {
    GC_ALLOCATED.load(Ordering::Relaxed)
}

/// Current number of native-backed segments allocated across the process.
pub fn native_allocated_segments() -> u64 {
    NATIVE_ALLOCATED.load(Ordering::Relaxed)
}
