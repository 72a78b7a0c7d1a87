//! The segment index: the ordered mapping from key ranges to segments.
//!
//! A segment is a run of consecutive pages created together at bulk load
//! or by a rewrite. The index maps each segment's lower-bound key to its
//! metadata under a reader/writer latch. The latch protects the map
//! structure only and is held for short, structure-bounded sections;
//! logical locks on segment ids live in the [`LockManager`] and outlive
//! any latch acquisition.
//!
//! Rewrite regions are acquired in two phases: the candidate set is built
//! under the shared latch, the Reorg locks are taken with no latch held
//! (lock acquisition may be slow), and a final latch-protected validation
//! detects interleaved reorganizations. A failed validation releases the
//! locks and surfaces an empty region; the caller retries.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, RwLock};

use crate::backoff::RandExpBackoff;
use crate::corruption;
use crate::error::Result;
use crate::lock::{LockManager, SegmentMode};
use crate::model::Key;

pub type SegmentId = u64;

/// Per-segment metadata.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SegmentInfo {
    id: SegmentId,
    page_count: usize,
    overflow: bool,
}

impl SegmentInfo {
    pub fn new(id: SegmentId, page_count: usize) -> Self {
        Self {
            id,
            page_count,
            overflow: false,
        }
    }

    pub fn id(&self) -> SegmentId {
        self.id
    }

    pub fn page_count(&self) -> usize {
        self.page_count
    }

    /// Whether any chain in the segment has spilled into overflow pages,
    /// making the segment a rewrite candidate.
    pub fn has_overflow(&self) -> bool {
        self.overflow
    }

    pub fn set_overflow(&mut self, overflow: bool) {
        self.overflow = overflow;
    }
}

/// A snapshot copy of one index entry. `upper` is the next segment's
/// lower bound, or `Key::MAX` for the last segment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SegmentEntry {
    pub lower: Key,
    pub upper: Key,
    pub sinfo: SegmentInfo,
}

/// Concurrent ordered map from segment lower-bound key to segment info.
pub struct SegmentIndex {
    lock_manager: Arc<LockManager>,
    index: RwLock<BTreeMap<Key, SegmentInfo>>,
}

impl SegmentIndex {
    pub fn new(lock_manager: Arc<LockManager>, segments: BTreeMap<Key, SegmentInfo>) -> Self {
        Self {
            lock_manager,
            index: RwLock::new(segments),
        }
    }

    /// The entry whose lower bound is the greatest key <= `key`. Probes
    /// below the first segment clamp to it.
    pub fn segment_for_key(&self, key: Key) -> SegmentEntry {
        let index = self.index.read().unwrap();
        let (lower, sinfo) = Self::floor(&index, key);
        Self::entry_for(&index, lower, sinfo)
    }

    /// Resolve the covering segment and acquire `mode` on it, backing off
    /// and re-resolving on contention. Returns only once the lock is
    /// held; the caller owns the lock and does not hold the latch.
    pub fn segment_for_key_with_lock(&self, key: Key, mode: SegmentMode) -> SegmentEntry {
        let mut backoff = RandExpBackoff::default();
        loop {
            {
                let index = self.index.read().unwrap();
                let (lower, sinfo) = Self::floor(&index, key);
                if self.lock_manager.try_acquire(sinfo.id(), mode) {
                    return Self::entry_for(&index, lower, sinfo);
                }
            }
            backoff.wait();
        }
    }

    /// The entry strictly after the segment covering `key`, or `None`
    /// past the last.
    pub fn next_segment_for_key(&self, key: Key) -> Option<SegmentEntry> {
        let index = self.index.read().unwrap();
        index
            .range((Bound::Excluded(key), Bound::Unbounded))
            .next()
            .map(|(lower, sinfo)| Self::entry_for(&index, *lower, sinfo))
    }

    /// Locked variant of [`Self::next_segment_for_key`].
    pub fn next_segment_for_key_with_lock(
        &self,
        key: Key,
        mode: SegmentMode,
    ) -> Option<SegmentEntry> {
        let mut backoff = RandExpBackoff::default();
        loop {
            {
                let index = self.index.read().unwrap();
                let Some((lower, sinfo)) = index
                    .range((Bound::Excluded(key), Bound::Unbounded))
                    .next()
                else {
                    return None;
                };
                if self.lock_manager.try_acquire(sinfo.id(), mode) {
                    return Some(Self::entry_for(&index, *lower, sinfo));
                }
            }
            backoff.wait();
        }
    }

    /// Set the overflow flag on the segment covering `key`.
    pub fn set_segment_overflow(&self, key: Key, overflow: bool) {
        let mut index = self.index.write().unwrap();
        let lower = Self::floor(&index, key).0;
        if let Some(sinfo) = index.get_mut(&lower) {
            sinfo.set_overflow(overflow);
        }
    }

    /// The covering segment's lower bound and the next segment's lower
    /// bound (or `Key::MAX` for the last segment).
    pub fn get_segment_bounds_for(&self, key: Key) -> (Key, Key) {
        let index = self.index.read().unwrap();
        let lower = Self::floor(&index, key).0;
        let upper = Self::upper_for(&index, lower);
        (lower, upper)
    }

    /// Acquire a contiguous run of segments around `segment_base` for
    /// rewriting. The candidate set grows backward through overflowing
    /// predecessors and forward through overflowing successors plus the
    /// first non-overflowing one, bounded by `search_radius` on each side.
    ///
    /// Returns the locked candidates sorted by lower bound; the caller
    /// owns their Reorg locks. An empty vector means another
    /// reorganization interleaved and the caller should retry.
    pub fn find_and_lock_rewrite_region(
        &self,
        segment_base: Key,
        search_radius: u32,
    ) -> Result<Vec<SegmentEntry>> {
        let mut candidates = Vec::new();
        {
            let index = self.index.read().unwrap();
            let Some(base_info) = index.get(&segment_base) else {
                return corruption!("rewrite region base {segment_base} is not a segment boundary");
            };
            candidates.push(Self::entry_for(&index, segment_base, base_info));

            // Backward: only while the predecessor itself overflows.
            for (lower, sinfo) in index
                .range(..segment_base)
                .rev()
                .take(search_radius as usize)
            {
                if !sinfo.has_overflow() {
                    break;
                }
                candidates.push(Self::entry_for(&index, *lower, sinfo));
            }

            // Forward: overflowing successors, plus the first
            // non-overflowing one.
            for (lower, sinfo) in index
                .range((Bound::Excluded(segment_base), Bound::Unbounded))
                .take(search_radius as usize)
            {
                candidates.push(Self::entry_for(&index, *lower, sinfo));
                if !sinfo.has_overflow() {
                    break;
                }
            }
        }

        candidates.sort_by_key(|entry| entry.lower);

        // Acquire the Reorg locks in order with no latch held; acquiring
        // them may take time.
        let mut backoff = RandExpBackoff::default();
        for candidate in &candidates {
            backoff.reset();
            while !self
                .lock_manager
                .try_acquire(candidate.sinfo.id(), SegmentMode::Reorg)
            {
                backoff.wait();
            }
        }

        // The locked segments must still be a contiguous run with the same
        // lower bounds; another reorg may have intervened.
        let still_valid = {
            let index = self.index.read().unwrap();
            let mut walk = index.range(candidates[0].lower..);
            candidates
                .iter()
                .all(|candidate| matches!(walk.next(), Some((lower, _)) if *lower == candidate.lower))
        };

        if !still_valid {
            for candidate in &candidates {
                self.lock_manager
                    .release(candidate.sinfo.id(), SegmentMode::Reorg);
            }
            candidates.clear();
        }

        Ok(candidates)
    }

    /// Atomically replace a run of segments with freshly built ones.
    pub fn install_region(&self, old_lowers: &[Key], new_segments: Vec<(Key, SegmentInfo)>) {
        let mut index = self.index.write().unwrap();
        for lower in old_lowers {
            let removed = index.remove(lower);
            debug_assert!(removed.is_some(), "installed over missing segment {lower}");
        }
        for (lower, sinfo) in new_segments {
            index.insert(lower, sinfo);
        }
    }

    /// Whether `key` is exactly a segment lower bound.
    pub fn contains_base(&self, key: Key) -> bool {
        self.index.read().unwrap().contains_key(&key)
    }

    /// Lower bounds of every segment currently flagged as overflowed.
    pub fn overflowed_segment_bases(&self) -> Vec<Key> {
        let index = self.index.read().unwrap();
        index
            .iter()
            .filter(|(_, sinfo)| sinfo.has_overflow())
            .map(|(lower, _)| *lower)
            .collect()
    }

    pub fn num_segments(&self) -> usize {
        self.index.read().unwrap().len()
    }

    fn floor(index: &BTreeMap<Key, SegmentInfo>, key: Key) -> (Key, &SegmentInfo) {
        index
            .range(..=key)
            .next_back()
            .map(|(lower, sinfo)| (*lower, sinfo))
            .unwrap_or_else(|| {
                index
                    .iter()
                    .next()
                    .map(|(lower, sinfo)| (*lower, sinfo))
                    .expect("segment index is never empty once the store is open")
            })
    }

    fn upper_for(index: &BTreeMap<Key, SegmentInfo>, lower: Key) -> Key {
        index
            .range((Bound::Excluded(lower), Bound::Unbounded))
            .next()
            .map(|(next_lower, _)| *next_lower)
            .unwrap_or(Key::MAX)
    }

    fn entry_for(index: &BTreeMap<Key, SegmentInfo>, lower: Key, sinfo: &SegmentInfo) -> SegmentEntry {
        SegmentEntry {
            lower,
            upper: Self::upper_for(index, lower),
            sinfo: sinfo.clone(),
        }
    }
}
