// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Generation arrays: immutable snapshots of the active groups.
//!
//! The pool publishes a generation through an atomic pointer swap; once
//! published, a generation never changes, so readers share it without any
//! coordination. Growth and shrink both build a fresh array:
//! [`Generation::expand`] appends one new group sized by the growth ramp,
//! [`Generation::contract`] drops released tail groups. The first group is
//! carried by every generation and is never released terminally.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use crate::buffer::BufferOrigin;
use crate::config::{
    BackingKind, GROWTH_ADDITIVE_CAP, MAX_GROUP_SEGMENTS, MIN_GROUP_SEGMENTS, SEGMENT_SIZE,
};
use crate::group::Group;

/// Immutable snapshot of the pool's groups.
pub(crate) struct Generation {
    id: u64,
    groups: Box<[Arc<Group>]>,
    /// Largest segment count among the groups, cached so the rent path can
    /// skip generations that cannot possibly serve a request.
    max_group_segments: usize,
}

/// Segment count for the next tail group: double the previous tail, but no
/// more than `GROWTH_ADDITIVE_CAP` extra segments, and never less than the
/// request that triggered the expansion.
fn next_group_segments(prev_tail: usize, needed_bytes: usize) -> usize {
    let needed = needed_bytes.div_ceil(SEGMENT_SIZE);
    let ramp = (prev_tail * 2).min(prev_tail + GROWTH_ADDITIVE_CAP);
    ramp.max(needed)
        .clamp(MIN_GROUP_SEGMENTS, MAX_GROUP_SEGMENTS)
}

impl Generation {
    /// The pool's first generation: one small group.
    pub(crate) fn initial(
        id: u64,
        backing: BackingKind,
        initial_segments: usize,
        zero_fill_count: &Arc<AtomicU64>,
    ) -> Self {
        let first = Arc::new(Group::new(
            backing,
            initial_segments,
            Arc::clone(zero_fill_count),
        ));
        Self {
            id,
            max_group_segments: first.segment_count(),
            groups: vec![first].into_boxed_slice(),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn groups(&self) -> &[Arc<Group>] {
        &self.groups
    }

    pub(crate) fn max_group_segments(&self) -> usize {
        self.max_group_segments
    }

    /// Find a group by id (linear; generations stay small).
    pub(crate) fn find_group(&self, group_id: u32) -> Option<&Arc<Group>> {
        self.groups.iter().find(|g| g.id() == group_id)
    }

    /// Route a released buffer to its issuing group.
    ///
    /// Returns false when the group is not present in this snapshot (the
    /// handle belongs to a newer generation, or the group was dropped by a
    /// contraction); the caller retries against the current generation.
    pub(crate) fn release_buffer(&self, origin: BufferOrigin, segments_are_zeroed: bool) -> bool {
        match self.find_group(origin.group_id) {
            Some(group) if !group.is_released() => {
                group.release_buffer(origin, segments_are_zeroed);
                true
            }
            _ => false,
        }
    }

    /// Build the expanded successor: every non-released group plus one new
    /// tail group sized for `needed_bytes`.
    ///
    /// `released` flags may flip while we copy; the single-pass filter
    /// re-reads each flag once, and a group released mid-copy is at worst
    /// carried until the next contraction.
    pub(crate) fn expand(
        &self,
        id: u64,
        backing: BackingKind,
        needed_bytes: usize,
        zero_fill_count: &Arc<AtomicU64>,
    ) -> Self {
        let mut groups: Vec<Arc<Group>> = self
            .groups
            .iter()
            .filter(|g| !g.is_released())
            .cloned()
            .collect();
        let prev_tail = groups
            .last()
            .map_or(MIN_GROUP_SEGMENTS, |g| g.segment_count());
        let tail = Arc::new(Group::new(
            backing,
            next_group_segments(prev_tail, needed_bytes),
            Arc::clone(zero_fill_count),
        ));
        log::debug!(
            "[generation] expand #{} -> #{id}: {} groups, new tail g{} x{} segments",
            self.id,
            groups.len() + 1,
            tail.id(),
            tail.segment_count()
        );
        groups.push(tail);
        Self::from_groups(id, groups)
    }

    /// Build the contracted successor without released tail groups, or
    /// `None` when there is nothing to drop.
    pub(crate) fn contract(&self, id: u64) -> Option<Self> {
        if !self.groups.iter().any(|g| g.is_released()) {
            return None;
        }
        let groups: Vec<Arc<Group>> = self
            .groups
            .iter()
            .filter(|g| !g.is_released())
            .cloned()
            .collect();
        log::debug!(
            "[generation] contract #{} -> #{id}: {} -> {} groups",
            self.id,
            self.groups.len(),
            groups.len()
        );
        Some(Self::from_groups(id, groups))
    }

    fn from_groups(id: u64, groups: Vec<Arc<Group>>) -> Self {
        debug_assert!(!groups.is_empty(), "a generation always has its first group");
        Self {
            id,
            max_group_segments: groups.iter().map(|g| g.segment_count()).max().unwrap_or(0),
            groups: groups.into_boxed_slice(),
        }
    }
}

impl std::fmt::Debug for Generation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Generation")
            .field("id", &self.id)
            .field("groups", &self.groups.len())
            .field("max_group_segments", &self.max_group_segments)
            .finish()
    }
}
