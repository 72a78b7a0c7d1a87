//! The spline store: a learned-index paged key-value engine.
//!
//! ```text
//!            writes                     reads / scans
//!               │                             │
//!               ▼                             ▼
//!       ┌──────────────┐              ┌──────────────┐
//!       │   Memtable   │              │    Spline /  │
//!       │  (SkipMap)   │              │  Page model  │
//!       └──────┬───────┘              └──────┬───────┘
//!              │ size threshold              │ page id
//!              ▼                             ▼
//!       ┌──────────────┐              ┌──────────────┐
//!       │Flush planner │─ batches ──▶ │ Page chains  │
//!       │ (deferral)   │              │ (buffer mgr) │
//!       └──────────────┘              └──────┬───────┘
//!                                            │ overflow
//!                                            ▼
//!                                     ┌──────────────┐
//!                                     │Segment index │◀─ reorg
//!                                     │ + lock mgr   │
//!                                     └──────────────┘
//! ```
//!
//! # Write path
//!
//! Writes land in the active memtable; each insert also bumps the spline
//! bucket counter for its destination page. When the memtable crosses the
//! size threshold a flush cycle runs: pages with enough locality (or with
//! exhausted deferrals) get their one logical write, everything else is
//! carried into the fresh memtable. Landing a batch can spill a chain
//! into overflow pages, which flags the covering segment for background
//! reorganization.
//!
//! # Read path
//!
//! Point reads check the active memtable (deferred entries must be
//! visible), then pin the destination chain under a shared segment lock.
//! Range scans walk chains guided by the model only, keeping the previous
//! chain pinned across every model re-query so a concurrent reorg can
//! never strand the scan.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::backoff::RandExpBackoff;
use crate::buffer::{BufferManager, OverflowChain};
use crate::config::Config;
use crate::errinput;
use crate::error::Result;
use crate::flush::{FlushPlanner, PageBatch, PageWriteCounters};
use crate::lock::{LockManager, SegmentMode};
use crate::memtable::Memtable;
use crate::metrics::Metrics;
use crate::model::{Key, PageModel, Spline};
use crate::scan::PageMergeIterator;
use crate::scheduler::Scheduler;
use crate::segment::{SegmentEntry, SegmentId, SegmentIndex, SegmentInfo};
use crate::tasks::{FlushTask, MetricsTask, ReorgTask};
use crate::Error;

/// The storage engine.
pub struct SplineStore {
    config: Config,
    spline: Spline,
    num_pages: usize,
    model: PageModel,
    buffers: BufferManager,
    lock_manager: Arc<LockManager>,
    segments: SegmentIndex,
    counters: Arc<PageWriteCounters>,
    active: RwLock<Arc<Memtable>>,
    planner: Mutex<FlushPlanner>,
    metrics: Metrics,
    next_segment_id: AtomicU64,
}

impl SplineStore {
    /// Open a store over a sorted initial record set. The spline model is
    /// fit over the loaded key distribution and the records are packed
    /// into pages grouped into segments. An empty load installs a single
    /// empty page so the index is never empty.
    pub fn bulk_load(config: Config, records: Vec<(Key, Vec<u8>)>) -> Result<Self> {
        for pair in records.windows(2) {
            if pair[1].0 <= pair[0].0 {
                return errinput!("bulk load records must have strictly ascending keys");
            }
        }

        let keys: Vec<Key> = records.iter().map(|(key, _)| *key).collect();
        let spline = Spline::build(&keys);

        let records_per_page = config.records_per_page.max(1);
        let num_pages = records.len().div_ceil(records_per_page).max(1);

        let buffers = BufferManager::new();
        let mut mapping = BTreeMap::new();
        let mut page_lowers = Vec::new();

        if records.is_empty() {
            let id = buffers.allocate(0, records_per_page);
            mapping.insert(0, id);
            page_lowers.push(0);
        } else {
            let mut iter = records.into_iter();
            loop {
                let chunk: Vec<(Key, Vec<u8>)> =
                    iter.by_ref().take(records_per_page).collect();
                if chunk.is_empty() {
                    break;
                }
                let lower = chunk[0].0;
                let id = buffers.allocate_with(
                    lower,
                    records_per_page,
                    chunk.into_iter().map(|(key, value)| (key, Some(value))),
                );
                mapping.insert(lower, id);
                page_lowers.push(lower);
            }
        }

        let lock_manager = Arc::new(LockManager::new());
        let next_segment_id = AtomicU64::new(0);
        let mut segment_map = BTreeMap::new();
        for pages in page_lowers.chunks(config.pages_per_segment.max(1)) {
            let id = next_segment_id.fetch_add(1, Ordering::SeqCst);
            segment_map.insert(pages[0], SegmentInfo::new(id, pages.len()));
        }
        let segments = SegmentIndex::new(lock_manager.clone(), segment_map);

        let counters = Arc::new(PageWriteCounters::new(num_pages));
        let planner = Mutex::new(FlushPlanner::new(
            counters.clone(),
            config.io_threshold,
            config.max_deferrals,
        ));

        Ok(Self {
            config,
            spline,
            num_pages,
            model: PageModel::new(mapping),
            buffers,
            lock_manager,
            segments,
            counters,
            active: RwLock::new(Arc::new(Memtable::new())),
            planner,
            metrics: Metrics::new(),
            next_segment_id,
        })
    }

    /// Register the store's background tasks on a scheduler.
    pub fn spawn_tasks(self: &Arc<Self>, scheduler: &Scheduler) {
        scheduler.register(Arc::new(FlushTask::new(self.clone())));
        scheduler.register(Arc::new(ReorgTask::new(self.clone())));
        scheduler.register(Arc::new(MetricsTask::new(self.clone())));
    }

    pub fn insert(&self, key: Key, value: Vec<u8>) -> Result<()> {
        self.write(key, Some(value))
    }

    pub fn delete(&self, key: Key) -> Result<()> {
        self.write(key, None)
    }

    fn write(&self, key: Key, value: Option<Vec<u8>>) -> Result<()> {
        let mut backoff = RandExpBackoff::default();
        loop {
            let active = self.active.read().unwrap().clone();
            match active.add(key, value.clone()) {
                Ok(()) => {
                    self.counters.note_insert(self.page_index_for(key));
                    if active.approximate_memory_usage() >= self.config.memtable_flush_threshold {
                        self.flush()?;
                    }
                    return Ok(());
                }
                // A flush froze this memtable; retry against its successor.
                Err(Error::ReadOnly) => backoff.wait(),
                Err(e) => return Err(e),
            }
        }
    }

    /// Point read: the active memtable first (deferred entries must be
    /// visible), then the destination chain under a shared segment lock.
    pub fn get(&self, key: Key) -> Result<Option<Vec<u8>>> {
        let active = self.active.read().unwrap().clone();
        if let Some(entry) = active.get(key) {
            // A memtable tombstone is an authoritative miss.
            return Ok(entry);
        }

        let seg = self
            .segments
            .segment_for_key_with_lock(key, SegmentMode::PageRead);
        let mut backoff = RandExpBackoff::default();
        let found = loop {
            let pid = self.model.key_to_page_id(key);
            match self.buffers.fix_chain(pid, false) {
                Some(chain) => {
                    let mut found = None;
                    for page in chain.pages() {
                        if let Some(value) = page.read().get(key) {
                            found = Some(value.clone());
                            break;
                        }
                    }
                    chain.release(false);
                    break found;
                }
                None => backoff.wait(),
            }
        };
        self.lock_manager
            .release(seg.sinfo.id(), SegmentMode::PageRead);
        Ok(found.flatten())
    }

    /// Range scan: from `start_key`, the next `num_records` records in
    /// ascending order, read from the page chains.
    ///
    /// At every model query at least one of the previous or current chain
    /// stays pinned (except before the very first pin), so a concurrent
    /// reorganization can invalidate a page id but never the scan's
    /// position: a failed pin re-queries the model from the retained
    /// lower boundary.
    pub fn get_range(&self, start_key: Key, num_records: usize) -> Result<Vec<(Key, Vec<u8>)>> {
        let mut results = Vec::with_capacity(num_records);
        let mut curr_chain: Option<OverflowChain> = None;
        let mut next_pid = Some(self.model.key_to_page_id(start_key));
        let mut is_first = true;

        while results.len() < num_records {
            let Some(mut pid) = next_pid else { break };
            let prev_chain = curr_chain.take();

            let fixed = loop {
                match self.buffers.fix_chain(pid, false) {
                    Some(chain) => break Some(chain),
                    None => {
                        // The id went stale under us; ask the model again.
                        let requeried = if is_first {
                            Some(self.model.key_to_page_id(start_key))
                        } else {
                            let prev = prev_chain
                                .as_ref()
                                .expect("a non-first scan step holds the previous chain");
                            self.model.key_to_next_page_id(prev.lower_boundary())
                        };
                        match requeried {
                            Some(id) => pid = id,
                            None => break None,
                        }
                    }
                }
            };

            // Only now is it safe to drop the previous chain.
            if let Some(prev) = prev_chain {
                prev.release(false);
            }

            let Some(chain) = fixed else { break };

            let start = if is_first { Some(start_key) } else { None };
            for (key, value) in PageMergeIterator::new(&chain, start) {
                results.push((key, value));
                if results.len() >= num_records {
                    break;
                }
            }
            is_first = false;

            next_pid = self.model.key_to_next_page_id(chain.lower_boundary());
            curr_chain = Some(chain);
        }

        if let Some(chain) = curr_chain {
            chain.release(false);
        }
        Ok(results)
    }

    /// Run one flush cycle unless another flusher is active. Returns
    /// whether a cycle ran.
    pub fn flush(&self) -> Result<bool> {
        let mut planner = match self.planner.try_lock() {
            Ok(planner) => planner,
            Err(_) => return Ok(false),
        };
        self.flush_with(&mut planner)
    }

    fn flush_with(&self, planner: &mut FlushPlanner) -> Result<bool> {
        // Freeze and plan before installing the replacement: no write may
        // interleave between the two buffers.
        let frozen = {
            let active = self.active.read().unwrap();
            if active.is_empty() {
                return Ok(false);
            }
            active.clone()
        };
        frozen.freeze()?;

        let next = Arc::new(Memtable::new());
        let outcome = planner.plan(&frozen, &next, |key| self.page_index_for(key))?;

        {
            let mut active = self.active.write().unwrap();
            *active = next;
        }

        let ios = outcome.batches.len() as u64;
        let flushed = outcome.entries_flushed() as u64;
        let deferred = outcome.deferred as u64;
        self.apply_batches(outcome.batches)?;
        self.metrics.note_flush(ios, flushed, deferred);

        tracing::info!(ios, flushed, deferred, "flushed memtable");
        Ok(true)
    }

    /// Terminal flush at shutdown: every page with pending entries incurs
    /// one I/O, counters are left untouched, and exactly one flush is
    /// counted.
    pub fn drain(&self) -> Result<()> {
        let planner = self.planner.lock().unwrap();

        let frozen = {
            let mut active = self.active.write().unwrap();
            let old = active.clone();
            old.freeze()?;
            *active = Arc::new(Memtable::new());
            old
        };

        let outcome = planner.drain(&frozen, |key| self.page_index_for(key));
        let ios = outcome.batches.len() as u64;
        let flushed = outcome.entries_flushed() as u64;
        self.apply_batches(outcome.batches)?;
        self.metrics.note_flush(ios, flushed, 0);

        tracing::info!(ios, flushed, "drained memtable at close");
        Ok(())
    }

    fn apply_batches(&self, batches: Vec<PageBatch>) -> Result<()> {
        for batch in batches {
            self.apply_batch(batch)?;
        }
        Ok(())
    }

    /// Issue the one logical write for a planner page: land every staged
    /// entry in its destination chain under a PageWrite segment lock.
    fn apply_batch(&self, batch: PageBatch) -> Result<()> {
        let mut current: Option<(OverflowChain, SegmentEntry)> = None;

        for (key, value) in batch.entries {
            let pid = self.model.key_to_page_id(key);
            let reusable =
                matches!(&current, Some((chain, _)) if chain.base().id() == pid);
            if !reusable {
                if let Some((chain, seg)) = current.take() {
                    chain.release(true);
                    self.lock_manager
                        .release(seg.sinfo.id(), SegmentMode::PageWrite);
                }
                current = Some(self.fix_for_write(key));
            }

            let (chain, _) = current.as_mut().expect("chain was just fixed");
            self.insert_into_chain(chain, key, value);
        }

        if let Some((chain, seg)) = current.take() {
            chain.release(true);
            self.lock_manager
                .release(seg.sinfo.id(), SegmentMode::PageWrite);
        }
        Ok(())
    }

    /// Lock the covering segment for writing and pin the destination
    /// chain, re-resolving when a reorganization slips in between the
    /// lookup and the pin.
    fn fix_for_write(&self, key: Key) -> (OverflowChain, SegmentEntry) {
        let mut backoff = RandExpBackoff::default();
        loop {
            let seg = self
                .segments
                .segment_for_key_with_lock(key, SegmentMode::PageWrite);
            let pid = self.model.key_to_page_id(key);
            if let Some(chain) = self.buffers.fix_chain(pid, true) {
                return (chain, seg);
            }
            self.lock_manager
                .release(seg.sinfo.id(), SegmentMode::PageWrite);
            backoff.wait();
        }
    }

    fn insert_into_chain(&self, chain: &mut OverflowChain, key: Key, value: Option<Vec<u8>>) {
        // In-place update if the key already lives somewhere in the chain.
        for page in chain.pages() {
            if page.read().contains(key) {
                page.write().put(key, value);
                return;
            }
        }

        // Otherwise the first page with room takes it.
        for page in chain.pages() {
            if !page.read().is_full() {
                page.write().put(key, value);
                return;
            }
        }

        // The chain is full: extend it with an overflow page and flag the
        // covering segment as a rewrite candidate.
        let page = self
            .buffers
            .allocate_pinned(chain.lower_boundary(), self.config.records_per_page);
        page.write().put(key, value);
        chain.tail().write().set_next(Some(page.id()));
        chain.push(page);
        self.segments.set_segment_overflow(key, true);
    }

    /// The spline bucket an inserted key is accounted against.
    fn page_index_for(&self, key: Key) -> usize {
        let position = self.spline.estimated_position(key) as usize;
        (position / self.config.records_per_page.max(1)).min(self.num_pages - 1)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn segments(&self) -> &SegmentIndex {
        &self.segments
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn memtable_usage(&self) -> usize {
        self.active.read().unwrap().approximate_memory_usage()
    }

    pub(crate) fn model(&self) -> &PageModel {
        &self.model
    }

    pub(crate) fn buffers(&self) -> &BufferManager {
        &self.buffers
    }

    pub(crate) fn lock_manager(&self) -> &LockManager {
        &self.lock_manager
    }

    /// Mint a fresh segment id.
    pub(crate) fn next_segment_id(&self) -> SegmentId {
        self.next_segment_id.fetch_add(1, Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load(config: Config, keys: impl IntoIterator<Item = Key>) -> SplineStore {
        let records: Vec<(Key, Vec<u8>)> = keys
            .into_iter()
            .map(|key| (key, format!("v{key}").into_bytes()))
            .collect();
        SplineStore::bulk_load(config, records).expect("bulk load")
    }

    #[test]
    fn test_bulk_load_rejects_unsorted_input() {
        let records = vec![(2u64, b"b".to_vec()), (1, b"a".to_vec())];
        assert!(matches!(
            SplineStore::bulk_load(Config::default(), records),
            Err(Error::InvalidInput(_))
        ));

        let duplicates = vec![(1u64, b"a".to_vec()), (1, b"b".to_vec())];
        assert!(matches!(
            SplineStore::bulk_load(Config::default(), duplicates),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_bulk_load_packs_pages_and_segments() {
        let config = Config::default().records_per_page(4).pages_per_segment(2);
        let store = load(config, (0..16).map(|i| i * 10));

        // 16 records at 4 per page, 4 pages at 2 per segment.
        assert_eq!(store.buffers().num_pages(), 4);
        assert_eq!(store.model().num_pages(), 4);
        assert_eq!(store.segments().num_segments(), 2);

        // Loaded records are readable through the chains.
        for i in 0..16u64 {
            let key = i * 10;
            assert_eq!(store.get(key).unwrap(), Some(format!("v{key}").into_bytes()));
        }
        assert_eq!(store.get(5).unwrap(), None);
    }

    #[test]
    fn test_empty_load_installs_one_segment() {
        let store = SplineStore::bulk_load(Config::default(), Vec::new()).expect("bulk load");
        assert_eq!(store.segments().num_segments(), 1);
        assert_eq!(store.model().num_pages(), 1);
        assert_eq!(store.get(42).unwrap(), None);
    }

    #[test]
    fn test_reads_see_deferred_writes() {
        // Nothing ever clears the threshold, so every flush defers.
        let config = Config::default()
            .records_per_page(4)
            .io_threshold(u64::MAX)
            .max_deferrals(u64::MAX);
        let store = load(config, (0..8).map(|i| i * 10));

        store.insert(15, b"inserted".to_vec()).unwrap();
        store.flush().unwrap();

        // The entry was deferred back into the memtable, not paged.
        assert_eq!(store.metrics().snapshot().num_ios, 0);
        assert_eq!(store.get(15).unwrap(), Some(b"inserted".to_vec()));
    }

    #[test]
    fn test_flushed_writes_are_read_from_chains() {
        let config = Config::default().records_per_page(4);
        let store = load(config, (0..8).map(|i| i * 10));

        store.insert(15, b"flushed".to_vec()).unwrap();
        store.insert(30, b"updated".to_vec()).unwrap();
        assert!(store.flush().unwrap());

        // Default thresholds flush everything; the memtable is empty.
        assert_eq!(store.memtable_usage(), 0);
        assert_eq!(store.get(15).unwrap(), Some(b"flushed".to_vec()));
        assert_eq!(store.get(30).unwrap(), Some(b"updated".to_vec()));
    }

    #[test]
    fn test_delete_is_visible_through_both_paths() {
        let config = Config::default().records_per_page(4);
        let store = load(config, (0..8).map(|i| i * 10));

        // Tombstone still in the memtable.
        store.delete(30).unwrap();
        assert_eq!(store.get(30).unwrap(), None);

        // Tombstone applied to the page.
        assert!(store.flush().unwrap());
        assert_eq!(store.get(30).unwrap(), None);

        // And hidden from scans.
        let keys: Vec<Key> = store
            .get_range(0, 100)
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert!(!keys.contains(&30));
    }

    #[test]
    fn test_threshold_gating_counts_one_io() {
        // Two pages; three entries to page 0 clear T=2, the one page-1
        // entry defers and ages its page.
        let config = Config::default()
            .records_per_page(4)
            .pages_per_segment(1)
            .io_threshold(2)
            .max_deferrals(10);
        let store = load(config, 0..8);

        for key in [0u64, 1, 2] {
            store.insert(key, b"hot".to_vec()).unwrap();
        }
        store.insert(6, b"cold".to_vec()).unwrap();

        assert!(store.flush().unwrap());

        let snapshot = store.metrics().snapshot();
        assert_eq!(snapshot.num_flushes, 1);
        assert_eq!(snapshot.num_ios, 1);
        assert_eq!(snapshot.entries_flushed, 3);
        assert_eq!(snapshot.entries_deferred, 1);

        // The deferred entry is still answered from the memtable.
        assert!(store.memtable_usage() > 0);
        assert_eq!(store.get(6).unwrap(), Some(b"cold".to_vec()));
    }

    #[test]
    fn test_deferral_cap_forces_io() {
        // T is unreachable; the page is forced out on the third cycle by
        // D=2. One I/O total across the three cycles.
        let config = Config::default()
            .records_per_page(4)
            .io_threshold(100)
            .max_deferrals(2);
        let store = load(config, 0..8);

        for cycle in 0..3u64 {
            store.insert(cycle, b"w".to_vec()).unwrap();
            assert!(store.flush().unwrap());
        }

        let snapshot = store.metrics().snapshot();
        assert_eq!(snapshot.num_flushes, 3);
        assert_eq!(snapshot.num_ios, 1);

        // Forced out: all three entries live on pages now.
        assert_eq!(store.memtable_usage(), 0);
        for cycle in 0..3u64 {
            assert_eq!(store.get(cycle).unwrap(), Some(b"w".to_vec()));
        }
    }

    #[test]
    fn test_empty_flush_is_a_noop() {
        let store = load(Config::default(), 0..8);

        assert!(!store.flush().unwrap());
        let snapshot = store.metrics().snapshot();
        assert_eq!(snapshot.num_flushes, 0);
        assert_eq!(snapshot.num_ios, 0);
    }

    #[test]
    fn test_drain_at_close() {
        // T is unreachable, so nothing flushes until the terminal drain,
        // which issues one I/O per page with pending entries and counts
        // exactly one flush.
        let config = Config::default()
            .records_per_page(4)
            .io_threshold(u64::MAX)
            .max_deferrals(u64::MAX);
        let store = load(config, 0..16);

        // Keys 0, 1 land in page 0; key 14 lands in page 3.
        for key in [0u64, 1, 14] {
            store.insert(key, b"pending".to_vec()).unwrap();
        }

        store.drain().unwrap();

        let snapshot = store.metrics().snapshot();
        assert_eq!(snapshot.num_flushes, 1);
        assert_eq!(snapshot.num_ios, 2);
        assert_eq!(snapshot.entries_flushed, 3);

        for key in [0u64, 1, 14] {
            assert_eq!(store.get(key).unwrap(), Some(b"pending".to_vec()));
        }
    }

    #[test]
    fn test_get_range_is_ascending_and_bounded() {
        let config = Config::default().records_per_page(4).pages_per_segment(2);
        let store = load(config, (0..40).map(|i| i * 5));

        let results = store.get_range(42, 10).unwrap();
        assert_eq!(results.len(), 10);

        let keys: Vec<Key> = results.iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, vec![45, 50, 55, 60, 65, 70, 75, 80, 85, 90]);
        for (key, value) in &results {
            assert_eq!(value, &format!("v{key}").into_bytes());
        }
    }

    #[test]
    fn test_get_range_stops_at_end_of_space() {
        let store = load(Config::default().records_per_page(4), (0..8).map(|i| i * 10));

        let results = store.get_range(55, 100).unwrap();
        let keys: Vec<Key> = results.into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![60, 70]);

        assert!(store.get_range(1000, 5).unwrap().is_empty());
    }

    #[test]
    fn test_get_range_sees_flushed_updates() {
        let config = Config::default().records_per_page(4);
        let store = load(config, (0..8).map(|i| i * 10));

        store.insert(15, b"new".to_vec()).unwrap();
        store.insert(20, b"overwritten".to_vec()).unwrap();
        assert!(store.flush().unwrap());

        let results = store.get_range(10, 4).unwrap();
        assert_eq!(
            results,
            vec![
                (10, b"v10".to_vec()),
                (15, b"new".to_vec()),
                (20, b"overwritten".to_vec()),
                (30, b"v30".to_vec()),
            ]
        );
    }

    #[test]
    fn test_overflow_flags_segment_for_rewrite() {
        // Two-record pages overflow quickly.
        let config = Config::default()
            .records_per_page(2)
            .pages_per_segment(2);
        let store = load(config, (0..8).map(|i| i * 10));

        // Pile updates plus fresh keys onto the first page's range.
        for key in [1u64, 2, 3, 4, 5] {
            store.insert(key, b"spill".to_vec()).unwrap();
        }
        assert!(store.flush().unwrap());

        assert!(!store.segments().overflowed_segment_bases().is_empty());

        // Overflowed data is still readable.
        for key in [1u64, 2, 3, 4, 5] {
            assert_eq!(store.get(key).unwrap(), Some(b"spill".to_vec()));
        }
    }

    #[test]
    fn test_concurrent_writers_and_readers() {
        let config = Config::default()
            .records_per_page(8)
            .memtable_flush_threshold(512);
        let store = Arc::new(load(config, (0..64).map(|i| i * 10)));

        let mut handles = Vec::new();
        for t in 0..4u64 {
            let store = store.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..50u64 {
                    let key = t * 1000 + i;
                    store.insert(key, key.to_be_bytes().to_vec()).unwrap();
                }
            }));
        }
        for t in 0..2 {
            let store = store.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..50u64 {
                    // Loaded keys stay readable throughout.
                    let key = (i % 64) * 10;
                    let value = store.get(key).unwrap();
                    assert!(value.is_some(), "key {key} vanished (reader {t})");
                }
            }));
        }
        for handle in handles {
            handle.join().expect("worker");
        }

        store.drain().unwrap();
        for t in 0..4u64 {
            for i in 0..50u64 {
                let key = t * 1000 + i;
                assert_eq!(
                    store.get(key).unwrap(),
                    Some(key.to_be_bytes().to_vec()),
                    "key {key} lost"
                );
            }
        }
    }
}
