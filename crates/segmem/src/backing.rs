// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Backing chunks: one uninitialized memory region per group.
//!
//! A chunk is `segments * SEGMENT_SIZE` bytes from either the Rust global
//! allocator or `malloc`, allocated without any zero fill (segments report
//! their own zero state through the group's zero bitmap). The chunk is freed
//! when the owning group releases its memory.

use std::alloc::{alloc, dealloc, handle_alloc_error, Layout};
use std::ptr::NonNull;

use crate::config::{BackingKind, SEGMENT_SIZE};
use crate::metrics;

/// Alignment of every heap chunk. Segment starts stay cache-line aligned.
const CHUNK_ALIGN: usize = 64;

/// One contiguous uninitialized memory region owned by a group.
///
/// Freed on drop; the allocation gauges are updated on both edges.
pub(crate) struct Backing {
    ptr: NonNull<u8>,
    len: usize,
    kind: BackingKind,
    segments: usize,
}

// SAFETY: Backing is a uniquely-owned region. All shared access goes through
// views handed out by the owning group, whose bitmap reservation guarantees
// no two live views alias a segment. The raw pointer itself carries no
// thread affinity.
unsafe impl Send for Backing {}
unsafe impl Sync for Backing {}

impl Backing {
    /// Allocate an uninitialized chunk of `segments` segments.
    ///
    /// # Panics
    ///
    /// Aborts via `handle_alloc_error` when the underlying allocator fails.
    pub(crate) fn allocate(kind: BackingKind, segments: usize) -> Self {
        debug_assert!(segments > 0, "zero-segment backing");
        let len = segments * SEGMENT_SIZE;
        let ptr = match kind {
            BackingKind::Heap => {
                // Layout construction only fails on size overflow, which the
                // MAX_GROUP_SEGMENTS cap rules out.
                let layout = Layout::from_size_align(len, CHUNK_ALIGN)
                    .expect("chunk layout should be valid");
                // SAFETY: layout has non-zero size.
                let raw = unsafe { alloc(layout) };
                NonNull::new(raw).unwrap_or_else(|| handle_alloc_error(layout))
            }
            BackingKind::Native => {
                // SAFETY: plain malloc of a non-zero size.
                let raw = unsafe { libc::malloc(len) }.cast::<u8>();
                NonNull::new(raw).unwrap_or_else(|| {
                    let layout = Layout::from_size_align(len, 1)
                        .expect("chunk layout should be valid");
                    handle_alloc_error(layout)
                })
            }
        };
        metrics::record_allocated(kind, segments);
        log::trace!("[backing] allocated {segments} segments ({kind:?})");
        Self {
            ptr,
            len,
            kind,
            segments,
        }
    }

    /// Base pointer of the chunk.
    pub(crate) fn base(&self) -> NonNull<u8> {
        self.ptr
    }

    /// Chunk length in bytes.
    pub(crate) fn len(&self) -> usize {
        self.len
    }
}

impl Drop for Backing {
    fn drop(&mut self) {
        match self.kind {
            BackingKind::Heap => {
                let layout = Layout::from_size_align(self.len, CHUNK_ALIGN)
                    .expect("chunk layout should be valid");
                // SAFETY: ptr was returned by alloc with this exact layout.
                unsafe { dealloc(self.ptr.as_ptr(), layout) };
            }
            BackingKind::Native => {
                // SAFETY: ptr was returned by malloc and not freed before.
                unsafe { libc::free(self.ptr.as_ptr().cast()) };
            }
        }
        metrics::record_released(self.kind, self.segments);
        log::trace!(
            "[backing] released {} segments ({:?})",
            self.segments,
            self.kind
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heap_chunk_is_writable() {
        let backing = Backing::allocate(BackingKind::Heap, 1);
        assert_eq!(backing.len(), SEGMENT_SIZE);
        // SAFETY: exclusive owner, in-bounds writes.
        unsafe {
            backing.base().as_ptr().write(0xA5);
            backing.base().as_ptr().add(SEGMENT_SIZE - 1).write(0x5A);
            assert_eq!(backing.base().as_ptr().read(), 0xA5);
        }
    }

    #[test]
    fn test_native_chunk_updates_gauge() {
        let _serial = metrics::NATIVE_GAUGE_TEST_LOCK
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let before = metrics::native_allocated_segments();
        let backing = Backing::allocate(BackingKind::Native, 4);
        assert_eq!(metrics::native_allocated_segments(), before + 4);
        drop(backing);
        assert_eq!(metrics::native_allocated_segments(), before);
    }
}
