// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Groups: one backing chunk plus bitmap-tracked segment reservation.
//!
//! A group owns up to `N * SEGMENT_SIZE` bytes of backing and two bitmaps:
//! `used` (segment is rented) and `zeroed` (segment is known zero-filled).
//! Structural mutations are serialized by a single CAS test-and-set flag;
//! a contended rent reports [`Reservation::Locked`] immediately so the pool
//! can try other groups, while a release spins because returns must not
//! fail. The counters next to the bitmaps are atomics so heuristic paths
//! (full check, trim) can read them without the lock.
//!
//! # Design
//!
//! - **Lock-free heuristics, locked structure**: `in_use`, `emptied_count`
//!   and `released` are atomics; the bitmaps and the backing live in an
//!   `UnsafeCell` only touched while the flag is held.
//! - **Closest-fit reservation**: the scan walks maximal free runs and
//!   stops at the first one that satisfies the request; when none does, the
//!   longest run is granted in full and the caller decides whether a short
//!   grant is acceptable.
//! - **Deferred marking**: the scan only chooses a range; used/zero bits
//!   are flipped in a separate reserve step after the choice.

use std::cell::UnsafeCell;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::backing::Backing;
use crate::bits;
use crate::buffer::{BufferOrigin, SegmentBuffer};
use crate::config::{BackingKind, MAX_GROUP_SEGMENTS, MIN_GROUP_SEGMENTS, SEGMENT_SIZE};
use crate::view::SegmentView;

/// `last_trim_check` value that cannot equal `emptied_count` before the
/// first empty transition has been observed.
const TRIM_NEVER_CHECKED: u64 = u64::MAX;

/// Group ids are process-unique and never reused.
static NEXT_GROUP_ID: AtomicU32 = AtomicU32::new(1);

/// Outcome of a reservation attempt.
#[derive(Debug)]
pub(crate) enum Reservation {
    /// A run was reserved. `preferred_hit` is true iff the run starts at
    /// the requested preferred segment. The buffer may cover fewer segments
    /// than requested (longest-run fallback, or a short preferred run).
    Granted {
        buffer: SegmentBuffer,
        preferred_hit: bool,
    },
    /// Another thread holds the group lock; try elsewhere and come back.
    Locked,
    /// No free run satisfies the request (or the preferred index is taken).
    Full,
    /// The group is terminal and refuses rents.
    Released,
}

/// Bitmap and backing state guarded by the group lock.
struct GroupState {
    backing: Option<Backing>,
    used: Box<[u64]>,
    zeroed: Box<[u64]>,
}

/// One chunk of `segment_count` segments and its reservation metadata.
pub(crate) struct Group {
    id: u32,
    segment_count: usize,
    backing_kind: BackingKind,
    /// Test-and-set structural lock. Rents skip, releases spin.
    locked: AtomicBool,
    /// Rented segment count; equals popcount(used) when the lock is free.
    in_use: AtomicUsize,
    /// Incremented on each in_use transition to zero.
    emptied_count: AtomicU64,
    /// emptied_count observed by the previous trim pass.
    last_trim_check: AtomicU64,
    released: AtomicBool,
    /// Pool-wide diagnostic: segments cleared because a renter required
    /// zeroed memory the zero bitmap could not vouch for. Shared by every
    /// group of the owning pool.
    zero_fill_count: Arc<AtomicU64>,
    state: UnsafeCell<GroupState>,
}

// SAFETY: GroupState is only accessed while the `locked` flag is held
// (acquired with Acquire, dropped with Release), which gives mutual
// exclusion plus the necessary happens-before edges. Everything else in
// the struct is atomic.
unsafe impl Send for Group {}
unsafe impl Sync for Group {}

/// Scoped ownership of a group's structural lock.
struct LockGuard<'a>(&'a Group);

impl LockGuard<'_> {
    fn state(&mut self) -> &mut GroupState {
        // SAFETY: the guard's existence proves the lock is held, so no
        // other thread can touch the cell until drop.
        unsafe { &mut *self.0.state.get() }
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.0.locked.store(false, Ordering::Release);
    }
}

impl Group {
    pub(crate) fn new(
        backing_kind: BackingKind,
        segment_count: usize,
        zero_fill_count: Arc<AtomicU64>,
    ) -> Self {
        assert!(
            (MIN_GROUP_SEGMENTS..=MAX_GROUP_SEGMENTS).contains(&segment_count),
            "group segment count {segment_count} out of range"
        );
        let words = bits::words_for(segment_count);
        Self {
            id: NEXT_GROUP_ID.fetch_add(1, Ordering::Relaxed),
            segment_count,
            backing_kind,
            locked: AtomicBool::new(false),
            in_use: AtomicUsize::new(0),
            emptied_count: AtomicU64::new(0),
            last_trim_check: AtomicU64::new(TRIM_NEVER_CHECKED),
            released: AtomicBool::new(false),
            zero_fill_count,
            state: UnsafeCell::new(GroupState {
                backing: None,
                used: vec![0u64; words].into_boxed_slice(),
                zeroed: vec![0u64; words].into_boxed_slice(),
            }),
        }
    }

    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    pub(crate) fn segment_count(&self) -> usize {
        self.segment_count
    }

    /// Rented segments right now (heuristic read, no lock).
    pub(crate) fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Relaxed)
    }

    pub(crate) fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    fn try_lock(&self) -> Option<LockGuard<'_>> {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
            .then_some(LockGuard(self))
    }

    /// Acquire the lock unconditionally. Releases must not fail, so this
    /// spins, yielding the thread every 64 failed attempts.
    fn lock_spin(&self) -> LockGuard<'_> {
        let mut attempts = 0u32;
        loop {
            if let Some(guard) = self.try_lock() {
                return guard;
            }
            attempts += 1;
            if attempts % 64 == 0 {
                std::thread::yield_now();
            } else {
                std::hint::spin_loop();
            }
        }
    }

    /// Try to reserve `size` bytes (a positive multiple of `SEGMENT_SIZE`).
    ///
    /// With `preferred_first_segment`, only a run starting exactly there is
    /// attempted (up to the requested length); the pool retries without the
    /// preference on a miss. Without it, the closest-fit scan runs and may
    /// grant the longest free run when nothing satisfies the request.
    ///
    /// Never blocks: a contended lock reports [`Reservation::Locked`].
    pub(crate) fn get_buffer(
        &self,
        size: usize,
        require_zeroed: bool,
        preferred_first_segment: Option<usize>,
    ) -> Reservation {
        debug_assert!(size > 0 && size % SEGMENT_SIZE == 0);
        let requested = size / SEGMENT_SIZE;

        if self.is_released() {
            return Reservation::Released;
        }
        // Heuristic full check; the scan below is authoritative.
        if self.in_use.load(Ordering::Relaxed) == self.segment_count {
            return Reservation::Full;
        }
        let Some(mut guard) = self.try_lock() else {
            return Reservation::Locked;
        };
        if self.is_released() {
            return Reservation::Released;
        }

        let n = self.segment_count;
        let (start, len, preferred_hit) = {
            let state = guard.state();
            let chosen = match preferred_first_segment {
                Some(pref) => {
                    if pref >= n || bits::test(&state.used, pref) {
                        None
                    } else {
                        let end = bits::next_set_bit(&state.used, pref, n).unwrap_or(n);
                        Some((pref, (end - pref).min(requested), true))
                    }
                }
                None if requested == 1 => bits::next_clear_bit(&state.used, 0, n)
                    .map(|start| (start, 1, false)),
                None => {
                    let mut best: Option<(usize, usize)> = None;
                    for (start, len) in bits::FreeRuns::new(&state.used, n) {
                        if len >= requested {
                            // First acceptable run wins, truncated to the
                            // request.
                            best = Some((start, requested));
                            break;
                        }
                        if best.map_or(true, |(_, blen)| len > blen) {
                            best = Some((start, len));
                        }
                    }
                    best.map(|(start, len)| (start, len, false))
                }
            };
            match chosen {
                Some(run) => run,
                None => return Reservation::Full,
            }
        };

        let (base, was_zeroed) = self.reserve(guard.state(), start, len);
        drop(guard);

        let mut view = SegmentView::new(base, start * SEGMENT_SIZE, len * SEGMENT_SIZE);
        if require_zeroed && !was_zeroed {
            // The run is exclusively ours now; clearing outside the lock
            // keeps the critical section short.
            view.clear();
            self.zero_fill_count.fetch_add(len as u64, Ordering::Relaxed);
        }
        #[cfg(feature = "trace")]
        log::trace!(
            "[group] g{} reserved [{start}, {}) of {n}",
            self.id,
            start + len
        );
        Reservation::Granted {
            buffer: SegmentBuffer::new(
                view,
                BufferOrigin {
                    group_id: self.id,
                    first_segment: start,
                    segment_count: len,
                },
            ),
            preferred_hit,
        }
    }

    /// Flip the chosen range to used, allocating the backing on the first
    /// successful rent. Returns the chunk base and whether the whole range
    /// was already known zero-filled.
    fn reserve(&self, state: &mut GroupState, start: usize, len: usize) -> (NonNull<u8>, bool) {
        debug_assert!(!bits::range_any_set(&state.used, start, len));
        let backing = state
            .backing
            .get_or_insert_with(|| Backing::allocate(self.backing_kind, self.segment_count));
        debug_assert_eq!(backing.len(), self.segment_count * SEGMENT_SIZE);
        let base = backing.base();
        bits::set_range(&mut state.used, start, len);
        let was_zeroed = bits::range_all_set(&state.zeroed, start, len);
        // A rented segment has no meaningful zero state.
        bits::clear_range(&mut state.zeroed, start, len);
        self.in_use.fetch_add(len, Ordering::Relaxed);
        (base, was_zeroed)
    }

    /// Return the run `[first_segment, first_segment + count)` to this
    /// group. Spins for the lock; returns must not fail.
    pub(crate) fn release_buffer(&self, origin: BufferOrigin, segments_are_zeroed: bool) {
        debug_assert_eq!(origin.group_id, self.id, "buffer routed to wrong group");
        assert!(
            origin.end_segment() <= self.segment_count,
            "buffer run [{}, {}) exceeds group of {}",
            origin.first_segment,
            origin.end_segment(),
            self.segment_count
        );
        if origin.segment_count == 0 {
            return;
        }
        let mut guard = self.lock_spin();
        let state = guard.state();
        debug_assert!(
            bits::range_all_set(&state.used, origin.first_segment, origin.segment_count),
            "releasing segments that are not rented"
        );
        bits::clear_range(&mut state.used, origin.first_segment, origin.segment_count);
        if segments_are_zeroed {
            bits::set_range(&mut state.zeroed, origin.first_segment, origin.segment_count);
        } else {
            bits::clear_range(&mut state.zeroed, origin.first_segment, origin.segment_count);
        }
        let remaining = self.in_use.fetch_sub(origin.segment_count, Ordering::Relaxed)
            - origin.segment_count;
        if remaining == 0 {
            self.emptied_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Attempt to reclaim the backing under the two-consecutive-observations
    /// rule: the group must be empty now *and* must not have been emptied
    /// since the previous call that stored its observation.
    ///
    /// With `memory_only` the group stays usable and reallocates lazily on
    /// the next successful rent; otherwise it becomes terminal.
    pub(crate) fn release_group(&self, memory_only: bool) -> bool {
        let mut guard = self.lock_spin();
        if self.is_released() || self.in_use.load(Ordering::Relaxed) > 0 {
            return false;
        }
        let emptied = self.emptied_count.load(Ordering::Relaxed);
        if emptied != self.last_trim_check.load(Ordering::Relaxed) {
            self.last_trim_check.store(emptied, Ordering::Relaxed);
            return false;
        }

        let state = guard.state();
        debug_assert_eq!(bits::popcount(&state.used), 0);
        state.backing = None;
        state.zeroed.fill(0);
        if memory_only {
            self.emptied_count.store(0, Ordering::Relaxed);
            self.last_trim_check.store(TRIM_NEVER_CHECKED, Ordering::Relaxed);
            log::debug!("[group] g{} backing released, group kept", self.id);
        } else {
            self.released.store(true, Ordering::Release);
            log::debug!("[group] g{} released", self.id);
        }
        true
    }

    /// Snapshot both bitmaps (test/debug helper; takes the lock).
    pub(crate) fn snapshot_bits(&self) -> (Vec<u64>, Vec<u64>) {
        let mut guard = self.lock_spin();
        let state = guard.state();
        (state.used.to_vec(), state.zeroed.to_vec())
    }

    /// Whether the backing chunk is currently allocated (takes the lock).
    pub(crate) fn has_backing(&self) -> bool {
        let mut guard = self.lock_spin();
        guard.state().backing.is_some()
    }
}

impl std::fmt::Debug for Group {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Group")
            .field("id", &self.id)
            .field("segment_count", &self.segment_count)
            .field("in_use", &self.in_use())
            .field("released", &self.is_released())
            .finish()
    }
}
