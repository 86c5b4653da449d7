// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The segment pool: rent/release routing, generation growth, out-of-band
//! zeroing and trimming.
//!
//! A pool owns the current [generation](crate::generation) through an
//! `ArcSwap` pointer. Rents scan the snapshot tail-first (bigger groups sit
//! later in the array), skip full and released groups, re-scan a bounded
//! number of times when lock contention was the only obstacle, and expand
//! the generation otherwise. Releases are routed to the issuing group by id
//! and retried against the freshest snapshot when the one in hand is stale.
//!
//! # Design
//!
//! - **Lock-free across groups**: the only lock a rent can hit is one
//!   group's reservation flag, and a contended group is skipped, not
//!   waited on.
//! - **Copy-on-write scaling**: expansion and contraction publish a new
//!   snapshot via compare-and-swap; a loser adopts the winner's snapshot.
//! - **Deferred zeroing**: `ZeroPolicy::OutOfBand` parks the buffer in a
//!   bounded queue drained by a one-shot worker thread that re-arms itself
//!   while work remains, never processing more than the queue length it
//!   observed at entry in one round.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use crossbeam::queue::ArrayQueue;
use parking_lot::Mutex;

use crate::buffer::{BufferOrigin, SegmentBuffer};
use crate::config::{
    BackingKind, MAX_GROUP_SEGMENTS, MIN_GROUP_SEGMENTS, PoolOptions, RENT_LOCKED_RETRY_LIMIT,
    SEGMENT_SIZE, ZERO_QUEUE_CAPACITY,
};
use crate::generation::Generation;
use crate::group::Reservation;
use crate::trim::TrimTimer;

/// What happens to a buffer's contents when it is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZeroPolicy {
    /// Release as-is; the segments lose their known-zero status.
    None,
    /// Clear synchronously before the segments become rentable again.
    OnRelease,
    /// Park the buffer in the zeroing queue; a background worker clears it
    /// and completes the release.
    OutOfBand,
}

/// The rent/release contract the stream facade and the sub-segment pool
/// program against.
pub trait SegmentSource {
    /// Rent `size` bytes (`size > 0`, multiple of `SEGMENT_SIZE`, at most
    /// `MAX_GROUP_SEGMENTS * SEGMENT_SIZE`). Never fails for lack of
    /// capacity. With `clear_new` the returned contents are all zero.
    fn rent(&self, size: usize, clear_new: bool) -> SegmentBuffer;

    /// Rent, preferring the segments immediately after `prev` in the same
    /// group. The flag is true iff the grant starts there; such a grant may
    /// cover fewer segments than requested, and the caller composes the
    /// remainder with a follow-up rent.
    fn rent_preferred(
        &self,
        size: usize,
        clear_new: bool,
        prev: BufferOrigin,
    ) -> (SegmentBuffer, bool);

    /// Hand a rented buffer back.
    fn release(&self, buffer: SegmentBuffer, zero: ZeroPolicy);

    /// Shrink a buffer to its first `new_segment_count` segments, releasing
    /// the tail with `zero`.
    fn reduce(
        &self,
        buffer: SegmentBuffer,
        new_segment_count: usize,
        zero: ZeroPolicy,
    ) -> SegmentBuffer;
}

/// Point-in-time usage snapshot, assembled from atomics without locks.
#[derive(Debug, Clone, Copy)]
pub struct PoolStats {
    /// Id of the current generation (strictly increasing).
    pub generation_id: u64,
    /// Number of groups in the current generation.
    pub group_count: usize,
    /// Sum of all group segment counts.
    pub total_segments: usize,
    /// Segments currently rented out.
    pub segments_in_use: usize,
    /// Largest group in the current generation, in segments.
    pub max_group_segments: usize,
}

/// A segmented memory-buffer pool.
///
/// Cheap to clone; clones are handles onto the same pool.
#[derive(Clone)]
pub struct SegmentPool {
    core: Arc<PoolCore>,
}

struct PoolCore {
    backing: BackingKind,
    current: ArcSwap<Generation>,
    generation_counter: AtomicU64,
    zero_queue: ArrayQueue<SegmentBuffer>,
    zero_worker_active: AtomicBool,
    trim_gate: AtomicBool,
    timer: Mutex<Option<TrimTimer>>,
    /// Diagnostic: segments this pool cleared on the rent path because
    /// their zero bits were not set.
    zero_fill_count: Arc<AtomicU64>,
}

fn assert_valid_size(size: usize) {
    assert!(size > 0, "rent size must be positive");
    assert!(
        size % SEGMENT_SIZE == 0,
        "rent size {size} is not a multiple of the segment size {SEGMENT_SIZE}"
    );
    assert!(
        size <= MAX_GROUP_SEGMENTS * SEGMENT_SIZE,
        "rent size {size} exceeds the largest buffer of {} bytes",
        MAX_GROUP_SEGMENTS * SEGMENT_SIZE
    );
}

impl SegmentPool {
    /// Create a pool and arm its trim timer.
    pub fn new(options: PoolOptions) -> Self {
        let initial = options
            .initial_segments
            .clamp(MIN_GROUP_SEGMENTS, MAX_GROUP_SEGMENTS);
        let zero_fill_count = Arc::new(AtomicU64::new(0));
        let core = Arc::new(PoolCore {
            backing: options.backing,
            current: ArcSwap::from_pointee(Generation::initial(
                1,
                options.backing,
                initial,
                &zero_fill_count,
            )),
            generation_counter: AtomicU64::new(1),
            zero_queue: ArrayQueue::new(ZERO_QUEUE_CAPACITY),
            zero_worker_active: AtomicBool::new(false),
            trim_gate: AtomicBool::new(false),
            timer: Mutex::new(None),
            zero_fill_count,
        });
        let weak = Arc::downgrade(&core);
        let timer = TrimTimer::spawn(options.trim_interval, move || match weak.upgrade() {
            Some(core) => {
                core.trim();
                true
            }
            None => false,
        });
        *core.timer.lock() = Some(timer);
        log::debug!(
            "[pool] created ({:?} backing, first group x{initial} segments)",
            options.backing
        );
        Self { core }
    }

    /// Rent `size` bytes. See [`SegmentSource::rent`].
    pub fn rent(&self, size: usize, clear_new: bool) -> SegmentBuffer {
        assert_valid_size(size);
        self.core.rent_full(size, clear_new)
    }

    /// Rent, preferring the block after `prev`. See
    /// [`SegmentSource::rent_preferred`].
    pub fn rent_preferred(
        &self,
        size: usize,
        clear_new: bool,
        prev: BufferOrigin,
    ) -> (SegmentBuffer, bool) {
        assert_valid_size(size);
        if prev.segment_count > 0 {
            let generation = self.core.current.load_full();
            if let Some(group) = generation.find_group(prev.group_id) {
                match group.get_buffer(size, clear_new, Some(prev.end_segment())) {
                    Reservation::Granted {
                        buffer,
                        preferred_hit,
                    } => {
                        // A preferred-only attempt grants nothing else.
                        debug_assert!(preferred_hit);
                        return (buffer, preferred_hit);
                    }
                    Reservation::Locked | Reservation::Full | Reservation::Released => {}
                }
            }
        }
        (self.core.rent_full(size, clear_new), false)
    }

    /// Hand a rented buffer back. The empty sentinel is accepted and
    /// ignored.
    pub fn release(&self, buffer: SegmentBuffer, zero: ZeroPolicy) {
        if buffer.is_empty() {
            return;
        }
        match zero {
            ZeroPolicy::None => self.core.route_release(buffer.origin(), false),
            ZeroPolicy::OnRelease => {
                let mut buffer = buffer;
                buffer.view_mut().clear();
                self.core.route_release(buffer.origin(), true);
            }
            ZeroPolicy::OutOfBand => self.core.enqueue_zero(buffer),
        }
    }

    /// Shrink `buffer` to `new_segment_count` segments; the tail goes back
    /// to the pool under `zero`.
    pub fn reduce(
        &self,
        buffer: SegmentBuffer,
        new_segment_count: usize,
        zero: ZeroPolicy,
    ) -> SegmentBuffer {
        assert!(!buffer.is_empty(), "cannot reduce the empty sentinel");
        assert!(
            new_segment_count > 0 && new_segment_count <= buffer.segment_count(),
            "cannot reduce {}-segment buffer to {new_segment_count}",
            buffer.segment_count()
        );
        if new_segment_count == buffer.segment_count() {
            return buffer;
        }
        let (head, tail) = buffer.split(new_segment_count);
        self.release(tail, zero);
        head
    }

    /// Run one trim pass: reclaim backings of groups empty across two
    /// consecutive observations, then contract the generation if any group
    /// became terminal. The timer calls this; callers may too.
    pub fn trim(&self) {
        self.core.trim();
    }

    /// On-demand memory release: two back-to-back sweeps, so every group
    /// that is empty *right now* gives its backing up without waiting for
    /// two timer periods.
    pub fn release_unused_memory(&self) {
        if !self.core.enter_trim_gate() {
            return;
        }
        let mut any = self.core.sweep();
        any |= self.core.sweep();
        if any {
            self.core.contract_current();
        }
        self.core.leave_trim_gate();
    }

    /// Stop the trim timer. Live buffers stay valid and releasable; the
    /// zeroing worker drains naturally.
    pub fn dispose(&self) {
        if let Some(timer) = self.core.timer.lock().take() {
            drop(timer);
            log::debug!("[pool] disposed, trim timer stopped");
        }
    }

    /// Usage snapshot of the current generation.
    pub fn stats(&self) -> PoolStats {
        let generation = self.core.current.load_full();
        let groups = generation.groups();
        PoolStats {
            generation_id: generation.id(),
            group_count: groups.len(),
            total_segments: groups.iter().map(|g| g.segment_count()).sum(),
            segments_in_use: groups.iter().map(|g| g.in_use()).sum(),
            max_group_segments: generation.max_group_segments(),
        }
    }

    /// Number of buffers currently parked in the zeroing queue.
    pub fn pending_zero(&self) -> usize {
        self.core.zero_queue.len()
    }

    /// Total segments this pool has zero-filled on the rent path
    /// (monotonic). A rent that reuses segments with intact zero bits does
    /// not move this counter.
    pub fn zero_filled_segments(&self) -> u64 {
        self.core.zero_fill_count.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    fn core(&self) -> &Arc<PoolCore> {
        &self.core
    }
}

impl SegmentSource for SegmentPool {
    fn rent(&self, size: usize, clear_new: bool) -> SegmentBuffer {
        SegmentPool::rent(self, size, clear_new)
    }

    fn rent_preferred(
        &self,
        size: usize,
        clear_new: bool,
        prev: BufferOrigin,
    ) -> (SegmentBuffer, bool) {
        SegmentPool::rent_preferred(self, size, clear_new, prev)
    }

    fn release(&self, buffer: SegmentBuffer, zero: ZeroPolicy) {
        SegmentPool::release(self, buffer, zero);
    }

    fn reduce(
        &self,
        buffer: SegmentBuffer,
        new_segment_count: usize,
        zero: ZeroPolicy,
    ) -> SegmentBuffer {
        SegmentPool::reduce(self, buffer, new_segment_count, zero)
    }
}

impl std::fmt::Debug for SegmentPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("SegmentPool")
            .field("backing", &self.core.backing)
            .field("generation_id", &stats.generation_id)
            .field("group_count", &stats.group_count)
            .field("segments_in_use", &stats.segments_in_use)
            .finish()
    }
}

impl PoolCore {
    /// Rent exactly `size` bytes, expanding the generation as needed.
    fn rent_full(self: &Arc<Self>, size: usize, require_zeroed: bool) -> SegmentBuffer {
        let requested = size / SEGMENT_SIZE;
        let mut generation = self.current.load_full();
        loop {
            let mut locked_passes = 0;
            loop {
                let mut any_locked = false;
                // Tail-first: bigger groups sit later in the array, so big
                // requests probe big groups first.
                for group in generation.groups().iter().rev() {
                    if group.segment_count() < requested {
                        continue;
                    }
                    match group.get_buffer(size, require_zeroed, None) {
                        Reservation::Granted { buffer, .. } => {
                            if buffer.segment_count() == requested {
                                return buffer;
                            }
                            // Short grant: rents are all-or-nothing, so hand
                            // it straight back. Its zero state survives when
                            // the grant was cleared for us.
                            group.release_buffer(buffer.origin(), require_zeroed);
                        }
                        Reservation::Locked => any_locked = true,
                        Reservation::Full | Reservation::Released => {}
                    }
                }
                if !any_locked || locked_passes >= RENT_LOCKED_RETRY_LIMIT {
                    break;
                }
                // Re-scanning the snapshot is cheaper than spinning on one
                // group's lock.
                locked_passes += 1;
            }
            generation = self.grow(&generation, size);
        }
    }

    /// Publish an expanded generation, or adopt a competitor's newer one.
    fn grow(self: &Arc<Self>, current: &Arc<Generation>, needed_bytes: usize) -> Arc<Generation> {
        let next_id = self.generation_counter.fetch_add(1, Ordering::Relaxed) + 1;
        let expanded = Arc::new(current.expand(
            next_id,
            self.backing,
            needed_bytes,
            &self.zero_fill_count,
        ));
        let witness = self
            .current
            .compare_and_swap(current, Arc::clone(&expanded));
        if Arc::ptr_eq(&witness, current) {
            expanded
        } else {
            // Someone published first; their snapshot is at least as new as
            // ours would have been. Ours is abandoned to reclamation.
            self.current.load_full()
        }
    }

    /// Route a release to the issuing group, retrying on stale snapshots.
    fn route_release(&self, origin: BufferOrigin, segments_are_zeroed: bool) {
        let mut generation = self.current.load_full();
        loop {
            if generation.release_buffer(origin, segments_are_zeroed) {
                return;
            }
            let fresh = self.current.load_full();
            assert!(
                !Arc::ptr_eq(&fresh, &generation),
                "buffer from group {} does not belong to this pool",
                origin.group_id
            );
            generation = fresh;
        }
    }

    /// Park a buffer for out-of-band zeroing, falling back to synchronous
    /// zeroing when the queue is full. Never blocks.
    fn enqueue_zero(self: &Arc<Self>, buffer: SegmentBuffer) {
        match self.zero_queue.push(buffer) {
            Ok(()) => self.arm_zero_worker(),
            Err(mut buffer) => {
                log::debug!("[zero] queue full, clearing synchronously");
                buffer.view_mut().clear();
                self.route_release(buffer.origin(), true);
            }
        }
    }

    /// Start the zero worker unless one is already running.
    fn arm_zero_worker(self: &Arc<Self>) {
        if self
            .zero_worker_active
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return;
        }
        let core = Arc::clone(self);
        std::thread::Builder::new()
            .name("segmem-zero".to_string())
            .spawn(move || core.zero_worker())
            .expect("failed to spawn zero worker thread");
    }

    /// Drain the zeroing queue in rounds bounded by the length observed at
    /// round entry, re-arming while work remains.
    fn zero_worker(self: Arc<Self>) {
        loop {
            let budget = self.zero_queue.len();
            #[cfg(feature = "trace")]
            log::trace!("[zero] worker round, budget {budget}");
            let mut processed = 0;
            while processed < budget {
                let Some(mut buffer) = self.zero_queue.pop() else {
                    break;
                };
                buffer.view_mut().clear();
                let generation = self.current.load_full();
                if !generation.release_buffer(buffer.origin(), true) {
                    // Stale snapshot. Park the buffer again and let the
                    // next round load a fresher generation.
                    if let Err(buffer) = self.zero_queue.push(buffer) {
                        self.route_release(buffer.origin(), true);
                    }
                    break;
                }
                processed += 1;
            }
            self.zero_worker_active.store(false, Ordering::Release);
            if self.zero_queue.is_empty() {
                return;
            }
            // Work arrived while deactivating; keep the thread if nobody
            // else armed a worker in between.
            if self
                .zero_worker_active
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                return;
            }
        }
    }

    fn enter_trim_gate(&self) -> bool {
        self.trim_gate
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    fn leave_trim_gate(&self) {
        self.trim_gate.store(false, Ordering::Release);
    }

    fn trim(&self) {
        if !self.enter_trim_gate() {
            return;
        }
        if self.sweep() {
            self.contract_current();
        }
        self.leave_trim_gate();
    }

    /// One pass over the current groups: group 0 may only give up its
    /// backing, every other group may become terminal. Returns whether any
    /// group became terminal.
    fn sweep(&self) -> bool {
        let generation = self.current.load_full();
        let mut any_released = false;
        for (index, group) in generation.groups().iter().enumerate() {
            if index == 0 {
                group.release_group(true);
            } else if group.release_group(false) {
                any_released = true;
            }
        }
        any_released
    }

    /// Swap in a contracted generation; losers retry against the winner.
    fn contract_current(&self) {
        loop {
            let current = self.current.load_full();
            if !current.groups().iter().any(|g| g.is_released()) {
                return;
            }
            let next_id = self.generation_counter.fetch_add(1, Ordering::Relaxed) + 1;
            let Some(contracted) = current.contract(next_id) else {
                return;
            };
            let contracted = Arc::new(contracted);
            let witness = self.current.compare_and_swap(&current, contracted);
            if Arc::ptr_eq(&witness, &current) {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics;
    use std::time::{Duration, Instant};

    fn test_pool() -> SegmentPool {
        SegmentPool::new(PoolOptions {
            trim_interval: Duration::from_secs(3600),
            ..PoolOptions::default()
        })
    }

    fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if done() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        done()
    }

    #[test]
    fn test_single_segment_rent_and_release() {
        let pool = test_pool();
        let buf = pool.rent(SEGMENT_SIZE, false);
        assert_eq!(buf.len(), SEGMENT_SIZE);
        assert_eq!(buf.segment_count(), 1);
        assert_eq!(pool.stats().segments_in_use, 1);

        pool.release(buf, ZeroPolicy::None);
        assert_eq!(pool.stats().segments_in_use, 0);
    }

    #[test]
    fn test_rent_clear_new_returns_zeroed() {
        let pool = test_pool();
        let mut buf = pool.rent(2 * SEGMENT_SIZE, true);
        assert!(buf.as_slice().iter().all(|&b| b == 0));
        buf.as_mut_slice().fill(0xEE);
        pool.release(buf, ZeroPolicy::None);

        // Same segments come back dirty without clear_new...
        let buf = pool.rent(2 * SEGMENT_SIZE, false);
        assert_eq!(buf.as_slice()[0], 0xEE);
        pool.release(buf, ZeroPolicy::None);

        // ...and zeroed with it.
        let buf = pool.rent(2 * SEGMENT_SIZE, true);
        assert!(buf.as_slice().iter().all(|&b| b == 0));
        pool.release(buf, ZeroPolicy::None);
    }

    #[test]
    fn test_saturation_expands_generation_by_one() {
        let pool = test_pool();
        assert_eq!(pool.stats().generation_id, 1);
        let first = pool.rent(4 * SEGMENT_SIZE, false);

        let second = pool.rent(SEGMENT_SIZE, false);
        let stats = pool.stats();
        assert_eq!(stats.generation_id, 2, "exactly one expansion");
        assert_eq!(stats.group_count, 2);
        assert_eq!(stats.max_group_segments, 8, "new tail doubles the 4-segment tail");
        assert_ne!(second.origin().group_id, first.origin().group_id);

        pool.release(first, ZeroPolicy::None);
        pool.release(second, ZeroPolicy::None);
    }

    #[test]
    fn test_fragmented_groups_do_not_yield_short_rents() {
        let pool = test_pool();
        // Fragment the 4-segment first group into free runs of one segment.
        let a = pool.rent(SEGMENT_SIZE, false);
        let b = pool.rent(SEGMENT_SIZE, false);
        let c = pool.rent(SEGMENT_SIZE, false);
        let d = pool.rent(SEGMENT_SIZE, false);
        pool.release(a, ZeroPolicy::None);
        pool.release(c, ZeroPolicy::None);

        // Two free segments exist but no contiguous pair: the rent must
        // come from an expansion, at full size.
        let buf = pool.rent(2 * SEGMENT_SIZE, false);
        assert_eq!(buf.segment_count(), 2);
        assert_eq!(pool.stats().generation_id, 2);
        let first_group = pool.core().current.load_full().groups()[0].id();
        assert_ne!(buf.origin().group_id, first_group);
        // The short grants were handed back, not leaked.
        assert_eq!(
            pool.core().current.load_full().groups()[0].in_use(),
            2,
            "only b and d remain rented in the first group"
        );

        pool.release(buf, ZeroPolicy::None);
        pool.release(b, ZeroPolicy::None);
        pool.release(d, ZeroPolicy::None);
        assert_eq!(pool.stats().segments_in_use, 0);
    }

    #[test]
    fn test_rent_preferred_follows_block() {
        let pool = test_pool();
        let first = pool.rent(2 * SEGMENT_SIZE, false);
        assert_eq!(first.origin().first_segment, 0);

        let (next, is_next_in_block) =
            pool.rent_preferred(2 * SEGMENT_SIZE, false, first.origin());
        assert!(is_next_in_block);
        assert_eq!(next.origin().group_id, first.origin().group_id);
        assert_eq!(next.origin().first_segment, 2);
        assert_eq!(next.segment_count(), 2);

        // The group is now full; the preference cannot be honored.
        let (elsewhere, hit) = pool.rent_preferred(SEGMENT_SIZE, false, next.origin());
        assert!(!hit);
        assert_eq!(elsewhere.segment_count(), 1);

        pool.release(first, ZeroPolicy::None);
        pool.release(next, ZeroPolicy::None);
        pool.release(elsewhere, ZeroPolicy::None);
    }

    #[test]
    fn test_reduce_returns_head_and_releases_tail() {
        let pool = test_pool();
        let mut buf = pool.rent(4 * SEGMENT_SIZE, true);
        buf.as_mut_slice().fill(1);
        let head = pool.reduce(buf, 1, ZeroPolicy::None);
        assert_eq!(head.segment_count(), 1);
        assert_eq!(head.origin().first_segment, 0);
        assert_eq!(pool.stats().segments_in_use, 1);

        // The freed tail is immediately rentable and contiguous.
        let tail = pool.rent(3 * SEGMENT_SIZE, false);
        assert_eq!(tail.origin().first_segment, 1);

        pool.release(head, ZeroPolicy::None);
        pool.release(tail, ZeroPolicy::None);
    }

    #[test]
    fn test_on_release_zeroing_is_remembered() {
        let pool = test_pool();
        let mut buf = pool.rent(2 * SEGMENT_SIZE, false);
        buf.as_mut_slice().fill(0x7F);
        let origin = buf.origin();
        pool.release(buf, ZeroPolicy::OnRelease);

        let before = pool.zero_filled_segments();
        let again = pool.rent(2 * SEGMENT_SIZE, true);
        assert_eq!(again.origin(), origin, "same run reused");
        assert!(again.as_slice().iter().all(|&b| b == 0));
        assert_eq!(
            pool.zero_filled_segments(),
            before,
            "no re-zero cost for segments released with OnRelease"
        );
        pool.release(again, ZeroPolicy::None);
    }

    #[test]
    fn test_out_of_band_zeroing_drains() {
        let pool = test_pool();
        let mut buf = pool.rent(8 * SEGMENT_SIZE, false);
        buf.as_mut_slice().fill(0xAB);
        let origin = buf.origin();
        pool.release(buf, ZeroPolicy::OutOfBand);

        assert!(
            wait_until(Duration::from_secs(5), || pool.pending_zero() == 0
                && pool.stats().segments_in_use == 0),
            "zero worker should drain the queue"
        );

        let before = pool.zero_filled_segments();
        let again = pool.rent(8 * SEGMENT_SIZE, true);
        assert_eq!(again.origin(), origin);
        assert!(again.as_slice().iter().all(|&b| b == 0));
        assert_eq!(pool.zero_filled_segments(), before, "already zeroed out of band");
        pool.release(again, ZeroPolicy::None);
    }

    #[test]
    fn test_trim_releases_idle_tail_group_and_contracts() {
        let pool = test_pool();
        let first = pool.rent(4 * SEGMENT_SIZE, false);
        let second = pool.rent(SEGMENT_SIZE, false);
        assert_eq!(pool.stats().group_count, 2);
        let generation_before = pool.stats().generation_id;

        pool.release(first, ZeroPolicy::None);
        pool.release(second, ZeroPolicy::None);

        // First pass records the observation, second pass releases and
        // contracts.
        pool.trim();
        assert_eq!(pool.stats().group_count, 2);
        pool.trim();
        let stats = pool.stats();
        assert_eq!(stats.group_count, 1);
        assert!(stats.generation_id > generation_before);

        // The pool still serves rents afterwards.
        let buf = pool.rent(SEGMENT_SIZE, false);
        pool.release(buf, ZeroPolicy::None);
    }

    #[test]
    fn test_trim_never_releases_group_with_outstanding_buffer() {
        let pool = test_pool();
        let first = pool.rent(4 * SEGMENT_SIZE, false);
        let tail = pool.rent(SEGMENT_SIZE, false);
        pool.release(first, ZeroPolicy::None);

        pool.trim();
        pool.trim();
        pool.trim();
        assert_eq!(pool.stats().group_count, 2, "tail group still has a renter");

        pool.release(tail, ZeroPolicy::None);
        pool.trim();
        pool.trim();
        assert_eq!(pool.stats().group_count, 1);
    }

    #[test]
    fn test_release_unused_memory_frees_first_group_backing() {
        let pool = test_pool();
        let buf = pool.rent(SEGMENT_SIZE, false);
        pool.release(buf, ZeroPolicy::None);

        let first = Arc::clone(&pool.core().current.load_full().groups()[0]);
        assert!(first.has_backing());
        pool.release_unused_memory();
        assert!(!first.has_backing(), "on-demand release reclaims immediately");
        assert!(!first.is_released(), "first group is never terminal");

        // Lazily reallocates on the next rent.
        let buf = pool.rent(SEGMENT_SIZE, false);
        assert!(first.has_backing());
        pool.release(buf, ZeroPolicy::None);
    }

    #[test]
    fn test_dispose_is_idempotent_and_keeps_pool_usable() {
        let pool = test_pool();
        pool.dispose();
        pool.dispose();
        let buf = pool.rent(SEGMENT_SIZE, false);
        pool.release(buf, ZeroPolicy::None);
    }

    #[test]
    fn test_generation_ids_strictly_increase_across_trim_cycles() {
        let pool = test_pool();
        let mut last = pool.stats().generation_id;
        for _ in 0..3 {
            // Force an expansion...
            let hold = pool.rent(pool.stats().max_group_segments * SEGMENT_SIZE, false);
            let extra = pool.rent(SEGMENT_SIZE, false);
            let expanded = pool.stats().generation_id;
            assert!(expanded > last);
            // ...then trim it away again.
            pool.release(extra, ZeroPolicy::None);
            pool.release(hold, ZeroPolicy::None);
            pool.trim();
            pool.trim();
            let contracted = pool.stats().generation_id;
            assert!(contracted > expanded);
            last = contracted;
        }
    }

    #[test]
    #[should_panic(expected = "not a multiple")]
    fn test_rent_rejects_unaligned_size() {
        let pool = test_pool();
        let _ = pool.rent(SEGMENT_SIZE + 1, false);
    }

    #[test]
    #[should_panic(expected = "must be positive")]
    fn test_rent_rejects_zero_size() {
        let pool = test_pool();
        let _ = pool.rent(0, false);
    }

    #[test]
    #[should_panic(expected = "exceeds the largest buffer")]
    fn test_rent_rejects_oversized_request() {
        let pool = test_pool();
        let _ = pool.rent((MAX_GROUP_SEGMENTS + 1) * SEGMENT_SIZE, false);
    }

    #[test]
    fn test_native_pool_round_trip() {
        let _serial = metrics::NATIVE_GAUGE_TEST_LOCK
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let pool = SegmentPool::new(PoolOptions {
            trim_interval: Duration::from_secs(3600),
            ..PoolOptions::native()
        });
        let before = metrics::native_allocated_segments();
        let mut buf = pool.rent(2 * SEGMENT_SIZE, true);
        assert_eq!(metrics::native_allocated_segments(), before + 4);
        buf.as_mut_slice().fill(3);
        assert_eq!(buf.as_slice()[SEGMENT_SIZE], 3);
        pool.release(buf, ZeroPolicy::OnRelease);
        pool.release_unused_memory();
        assert_eq!(metrics::native_allocated_segments(), before);
    }
}
