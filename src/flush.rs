//! The flush planner: the dual-buffer deferral engine.
//!
//! When the active memtable crosses its size threshold, the planner walks
//! it in key order and decides, per destination page, whether this cycle
//! issues the page's I/O or defers its entries into the fresh memtable.
//! A page earns its I/O either by locality (at least `io_threshold`
//! pending entries) or by staleness (`max_deferrals` consecutive skipped
//! cycles). This trade is what bounds write amplification.
//!
//! The planner runs on one thread at a time; holding the store's flush
//! lock is a precondition. Of the three per-page vectors, only the insert
//! counters are shared: the write path increments them as entries land,
//! and the planner resets them when a page's I/O is issued.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::Result;
use crate::memtable::Memtable;
use crate::model::Key;

/// Per-page insert counters shared between the write path and the
/// planner.
pub struct PageWriteCounters {
    counts: Vec<AtomicU64>,
}

impl PageWriteCounters {
    pub fn new(num_pages: usize) -> Self {
        Self {
            counts: (0..num_pages).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    /// Record an insert directed at `page`.
    pub fn note_insert(&self, page: usize) {
        self.counts[page].fetch_add(1, Ordering::SeqCst);
    }

    pub fn get(&self, page: usize) -> u64 {
        self.counts[page].load(Ordering::SeqCst)
    }

    fn reset(&self, page: usize) {
        self.counts[page].store(0, Ordering::SeqCst);
    }

    pub fn num_pages(&self) -> usize {
        self.counts.len()
    }
}

/// One page's staged entries for a flush cycle, in ascending key order.
#[derive(Debug)]
pub struct PageBatch {
    pub page_index: usize,
    pub entries: Vec<(Key, Option<Vec<u8>>)>,
}

/// What one planning pass decided.
#[derive(Debug)]
pub struct FlushOutcome {
    /// One batch per page chosen for I/O this cycle.
    pub batches: Vec<PageBatch>,
    /// Number of entries carried into the next memtable.
    pub deferred: usize,
}

impl FlushOutcome {
    pub fn entries_flushed(&self) -> usize {
        self.batches.iter().map(|batch| batch.entries.len()).sum()
    }
}

/// Decides per destination page whether a flush cycle issues its I/O or
/// carries its entries forward.
pub struct FlushPlanner {
    io_threshold: u64,
    max_deferrals: u64,
    counters: Arc<PageWriteCounters>,
    deferral_count: Vec<u64>,
    flushed_this_time: Vec<bool>,
}

impl FlushPlanner {
    pub fn new(counters: Arc<PageWriteCounters>, io_threshold: u64, max_deferrals: u64) -> Self {
        let num_pages = counters.num_pages();
        Self {
            io_threshold,
            max_deferrals,
            counters,
            deferral_count: vec![0; num_pages],
            flushed_this_time: vec![false; num_pages],
        }
    }

    /// Plan one flush cycle over the frozen memtable. Entries whose page
    /// clears the I/O threshold or has exhausted its deferrals are staged
    /// per page; every other entry re-enters `next` intact. The caller
    /// issues one logical I/O per returned batch.
    ///
    /// An empty memtable is a no-op: no batches, no counter changes.
    pub fn plan<F>(&mut self, frozen: &Memtable, next: &Memtable, page_index_for: F) -> Result<FlushOutcome>
    where
        F: Fn(Key) -> usize,
    {
        if frozen.is_empty() {
            return Ok(FlushOutcome {
                batches: Vec::new(),
                deferred: 0,
            });
        }

        let num_pages = self.deferral_count.len();
        let mut staged: Vec<Vec<(Key, Option<Vec<u8>>)>> = vec![Vec::new(); num_pages];
        let mut deferred = 0;

        for (key, value) in frozen.iter_sorted() {
            let page = page_index_for(key).min(num_pages - 1);
            if self.counters.get(page) >= self.io_threshold
                || self.deferral_count[page] >= self.max_deferrals
            {
                self.flushed_this_time[page] = true;
                staged[page].push((key, value));
            } else {
                next.add(key, value)?;
                deferred += 1;
            }
        }

        let mut batches = Vec::new();
        for page in 0..num_pages {
            if self.flushed_this_time[page] {
                self.counters.reset(page);
                self.deferral_count[page] = 0;
                self.flushed_this_time[page] = false;
                batches.push(PageBatch {
                    page_index: page,
                    entries: std::mem::take(&mut staged[page]),
                });
            } else {
                self.deferral_count[page] += 1;
            }
        }

        Ok(FlushOutcome { batches, deferred })
    }

    /// Terminal drain at shutdown: stage every pending entry, one batch
    /// per page with pending entries. Counters are left as they are.
    pub fn drain<F>(&self, memtable: &Memtable, page_index_for: F) -> FlushOutcome
    where
        F: Fn(Key) -> usize,
    {
        let num_pages = self.deferral_count.len();
        let mut staged: Vec<Vec<(Key, Option<Vec<u8>>)>> = vec![Vec::new(); num_pages];

        for (key, value) in memtable.iter_sorted() {
            let page = page_index_for(key).min(num_pages - 1);
            staged[page].push((key, value));
        }

        let batches = staged
            .into_iter()
            .enumerate()
            .filter(|(_, entries)| !entries.is_empty())
            .map(|(page_index, entries)| PageBatch {
                page_index,
                entries,
            })
            .collect();

        FlushOutcome {
            batches,
            deferred: 0,
        }
    }

    pub fn deferral_count(&self, page: usize) -> u64 {
        self.deferral_count[page]
    }

    pub fn num_pages(&self) -> usize {
        self.deferral_count.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn planner(num_pages: usize, io_threshold: u64, max_deferrals: u64) -> FlushPlanner {
        let counters = Arc::new(PageWriteCounters::new(num_pages));
        FlushPlanner::new(counters, io_threshold, max_deferrals)
    }

    /// Inserts into the memtable with the write path's counter side effect.
    fn insert<F>(planner: &FlushPlanner, memtable: &Memtable, page_index_for: F, key: Key)
    where
        F: Fn(Key) -> usize,
    {
        memtable.add(key, Some(key.to_be_bytes().to_vec())).unwrap();
        planner.counters.note_insert(page_index_for(key));
    }

    // Keys 0..100 map to page 0, 100..200 to page 1, and so on.
    fn page_of(key: Key) -> usize {
        (key / 100) as usize
    }

    #[test]
    fn test_threshold_gating() {
        // Three entries to page 0 clear T=2; the single page-1 entry is
        // deferred and re-enters the new memtable.
        let mut planner = planner(2, 2, 10);
        let memtable = Memtable::new();
        let next = Memtable::new();

        for key in [10, 20, 30, 150] {
            insert(&planner, &memtable, page_of, key);
        }

        let outcome = planner.plan(&memtable, &next, page_of).unwrap();

        assert_eq!(outcome.batches.len(), 1);
        assert_eq!(outcome.batches[0].page_index, 0);
        assert_eq!(outcome.entries_flushed(), 3);
        assert_eq!(outcome.deferred, 1);

        assert_eq!(next.len(), 1);
        assert!(next.get(150).is_some());

        assert_eq!(planner.deferral_count(0), 0);
        assert_eq!(planner.deferral_count(1), 1);
        assert_eq!(planner.counters.get(0), 0);
        assert_eq!(planner.counters.get(1), 1);
    }

    #[test]
    fn test_forced_by_deferral_cap() {
        // T is unreachable; page 5 is flushed on the third cycle because
        // its deferral count hits D=2.
        let mut planner = planner(8, 100, 2);
        let mut memtable = Memtable::new();
        let mut total_ios = 0;

        for cycle in 0..3 {
            insert(&planner, &memtable, page_of, 500 + cycle);

            if cycle == 2 {
                assert_eq!(planner.deferral_count(5), 2);
            }

            let next = Memtable::new();
            let outcome = planner.plan(&memtable, &next, page_of).unwrap();
            total_ios += outcome.batches.len();
            memtable = next;
        }

        assert_eq!(total_ios, 1);
        assert_eq!(planner.deferral_count(5), 0);
        assert_eq!(planner.counters.get(5), 0);
        assert!(memtable.is_empty());
    }

    #[test]
    fn test_deferred_entries_reenter_intact() {
        let mut planner = planner(4, 10, 5);
        let memtable = Memtable::new();
        let next = Memtable::new();

        memtable.add(42, Some(b"payload".to_vec())).unwrap();
        planner.counters.note_insert(page_of(42));
        memtable.add(77, None).unwrap();
        planner.counters.note_insert(page_of(77));

        let outcome = planner.plan(&memtable, &next, page_of).unwrap();
        assert!(outcome.batches.is_empty());
        assert_eq!(outcome.deferred, 2);

        // Value bytes and tombstone kind both survive the carry.
        assert_eq!(next.get(42), Some(Some(b"payload".to_vec())));
        assert_eq!(next.get(77), Some(None));
    }

    #[test]
    fn test_flushed_pages_reset_and_skipped_pages_age() {
        let mut planner = planner(3, 1, 10);
        let memtable = Memtable::new();
        let next = Memtable::new();

        insert(&planner, &memtable, page_of, 50);

        let outcome = planner.plan(&memtable, &next, page_of).unwrap();
        assert_eq!(outcome.batches.len(), 1);

        // Flushed page fully reset; untouched pages aged by one.
        assert_eq!(planner.deferral_count(0), 0);
        assert_eq!(planner.counters.get(0), 0);
        assert_eq!(planner.deferral_count(1), 1);
        assert_eq!(planner.deferral_count(2), 1);
    }

    #[test]
    fn test_empty_flush_is_a_noop() {
        let mut planner = planner(4, 1, 0);
        let memtable = Memtable::new();
        let next = Memtable::new();

        let outcome = planner.plan(&memtable, &next, page_of).unwrap();

        assert!(outcome.batches.is_empty());
        assert_eq!(outcome.deferred, 0);
        for page in 0..4 {
            assert_eq!(planner.deferral_count(page), 0);
        }
    }

    #[test]
    fn test_drain_stages_everything_and_keeps_counters() {
        let mut planner = planner(4, u64::MAX, u64::MAX);
        let mut memtable = Memtable::new();

        for key in [10, 110, 120, 310] {
            insert(&planner, &memtable, page_of, key);
        }

        // A regular cycle defers everything (T and D are unreachable).
        let next = Memtable::new();
        let outcome = planner.plan(&memtable, &next, page_of).unwrap();
        assert!(outcome.batches.is_empty());
        memtable = next;

        let drained = planner.drain(&memtable, page_of);
        let pages: Vec<usize> = drained.batches.iter().map(|b| b.page_index).collect();
        assert_eq!(pages, vec![0, 1, 3]);
        assert_eq!(drained.entries_flushed(), 4);

        // Terminal: counters deliberately untouched.
        assert_eq!(planner.counters.get(0), 1);
        assert_eq!(planner.counters.get(1), 2);
        assert_eq!(planner.deferral_count(0), 1);
    }

    #[test]
    fn test_every_entry_flushed_exactly_once() {
        // Entries either flush in some cycle or survive to the drain;
        // each appears in exactly one staged batch overall.
        let mut planner = planner(10, 3, 4);
        let mut memtable = Memtable::new();
        let mut flushed_keys = Vec::new();

        let mut key = 0;
        for _cycle in 0..6 {
            for _ in 0..4 {
                insert(&planner, &memtable, page_of, key);
                key += 37;
            }
            let next = Memtable::new();
            let outcome = planner.plan(&memtable, &next, page_of).unwrap();
            for batch in outcome.batches {
                flushed_keys.extend(batch.entries.into_iter().map(|(k, _)| k));
            }
            memtable = next;
        }

        let drained = planner.drain(&memtable, page_of);
        for batch in drained.batches {
            flushed_keys.extend(batch.entries.into_iter().map(|(k, _)| k));
        }

        flushed_keys.sort_unstable();
        let expected: Vec<Key> = (0..24).map(|i| i * 37).collect();
        assert_eq!(flushed_keys, expected);
    }
}
