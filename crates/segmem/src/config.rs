// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Segmem global configuration - single source of truth.
//!
//! This module centralizes ALL allocator constants and per-pool options.
//! **NEVER hardcode elsewhere!**
//!
//! # Architecture
//!
//! - **Level 1 (Static)**: compile-time constants (segment size, group bounds,
//!   queue capacities, retry limits)
//! - **Level 2 (Dynamic)**: [`PoolOptions`] for per-pool construction choices
//!   (backing kind, initial group size, trim interval)

use std::time::Duration;

/// Size of one segment in bytes (64 KiB).
///
/// Large enough to amortize per-buffer metadata, small enough that a
/// 512-segment group stays at 32 MiB. Every rentable size is a positive
/// multiple of this value.
/// **NEVER hardcode 65536 elsewhere!**
pub const SEGMENT_SIZE: usize = 65_536;

/// Smallest allowed group size, in segments.
///
/// Also the default size of a pool's first group.
pub const MIN_GROUP_SEGMENTS: usize = 4;

/// Largest allowed group size, in segments (32 MiB of backing).
///
/// One buffer handle is one contiguous run inside one group, so this also
/// caps the largest rentable buffer.
pub const MAX_GROUP_SEGMENTS: usize = 512;

/// Additive cap on group growth.
///
/// A new tail group doubles the previous tail, but never grows by more than
/// this many segments in one expansion. Keeps the exponential ramp from
/// overshooting once groups are large.
pub const GROWTH_ADDITIVE_CAP: usize = 32;

/// Capacity of the out-of-band zeroing queue, in buffers.
///
/// Releases beyond this fall back to synchronous zeroing; the queue must
/// never block a releasing thread.
pub const ZERO_QUEUE_CAPACITY: usize = 100;

/// How many times a rent pass is repeated when the only obstacle was a
/// locked group.
///
/// Re-scanning the generation is cheaper than spinning on a group lock;
/// after this many passes the pool expands instead.
pub const RENT_LOCKED_RETRY_LIMIT: usize = 4;

/// Trim timer interval.
///
/// Debug builds trim aggressively so reclamation bugs surface in minutes,
/// not hours.
pub const TRIM_INTERVAL: Duration = if cfg!(debug_assertions) {
    Duration::from_secs(20)
} else {
    Duration::from_secs(600)
};

/// Where a pool's group chunks live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackingKind {
    /// Chunks come from the Rust global allocator.
    Heap,
    /// Chunks come from `malloc`, outside the managed heap.
    Native,
}

/// Per-pool construction options.
///
/// The backing kind is fixed for the lifetime of the pool; heap and native
/// backings are observationally identical.
#[derive(Debug, Clone, Copy)]
pub struct PoolOptions {
    /// Backing memory kind for every group chunk of this pool.
    pub backing: BackingKind,
    /// Segment count of the pool's first group. Clamped to
    /// `[MIN_GROUP_SEGMENTS, MAX_GROUP_SEGMENTS]`.
    pub initial_segments: usize,
    /// Interval of the background trim timer.
    pub trim_interval: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            backing: BackingKind::Heap,
            initial_segments: MIN_GROUP_SEGMENTS,
            trim_interval: TRIM_INTERVAL,
        }
    }
}

impl PoolOptions {
    /// Options for a native-memory pool, otherwise default.
    pub fn native() -> Self {
        Self {
            backing: BackingKind::Native,
            ..Self::default()
        }
    }
}
