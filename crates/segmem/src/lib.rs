// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # segmem - segmented memory-buffer allocator
//!
//! A concurrent allocator of byte buffers sized in whole segments
//! (64 KiB), backing growable in-memory byte streams. Buffers are served
//! from large pre-allocated chunks carved into same-size segments and
//! tracked by bitmaps; returned buffers are reused, and chunks that stay
//! empty are reclaimed by a background trim pass.
//!
//! ## Quick Start
//!
//! ```rust
//! use segmem::{PoolOptions, SegmentPool, ZeroPolicy, SEGMENT_SIZE};
//!
//! let pool = SegmentPool::new(PoolOptions::default());
//!
//! // Rent two segments, zero-filled.
//! let mut buf = pool.rent(2 * SEGMENT_SIZE, true);
//! buf.as_mut_slice()[..5].copy_from_slice(b"hello");
//!
//! // Grow the stream by renting the block right after the previous one.
//! let (next, _contiguous) = pool.rent_preferred(SEGMENT_SIZE, false, buf.origin());
//!
//! pool.release(next, ZeroPolicy::None);
//! pool.release(buf, ZeroPolicy::OutOfBand); // cleared in the background
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------+
//! |                     SegmentPool (pool.rs)                    |
//! |  rent / rent_preferred / release / reduce / trim / dispose   |
//! +--------------------------------------------------------------+
//! |              Generation (generation.rs, ArcSwap)             |
//! |    immutable group snapshot; expand / contract via CAS       |
//! +--------------------------------------------------------------+
//! |                      Group (group.rs)                        |
//! |  used/zeroed bitmaps | CAS lock | closest-fit reservation    |
//! +--------------------------------------------------------------+
//! |        Backing (backing.rs): heap or native chunk            |
//! +--------------------------------------------------------------+
//! ```
//!
//! ## Concurrency model
//!
//! All pool operations are safe under arbitrary concurrent invocation.
//! Rents never block across groups: a locked group is skipped and the
//! snapshot re-scanned; releases spin on the issuing group's flag because
//! returns must not fail. The generation snapshot is immutable after
//! publication, so readers share it without coordination.

mod backing;
mod bits;
mod buffer;
mod generation;
mod group;
mod pool;
mod trim;
mod view;

pub mod config;
pub mod metrics;

pub use buffer::{BufferOrigin, SegmentBuffer};
pub use config::{BackingKind, PoolOptions, SEGMENT_SIZE};
pub use pool::{PoolStats, SegmentPool, SegmentSource, ZeroPolicy};
pub use view::SegmentView;

use std::sync::OnceLock;

static GLOBAL_POOL: OnceLock<SegmentPool> = OnceLock::new();

/// The process-wide default pool (heap backing, default options).
///
/// Created on first use; never disposed. Streams that do not carry their
/// own pool rent from this one.
pub fn global_pool() -> &'static SegmentPool {
    GLOBAL_POOL.get_or_init(|| SegmentPool::new(PoolOptions::default()))
}
