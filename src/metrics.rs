use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::error::Result;
use crate::store::SplineStore;

/// Write-path counters. One logical I/O is counted per page chosen per
/// flush cycle, regardless of how many entries target it.
#[derive(Debug, Default)]
pub struct Metrics {
    num_flushes: AtomicU64,
    num_ios: AtomicU64,
    entries_flushed: AtomicU64,
    entries_deferred: AtomicU64,
    num_reorgs: AtomicU64,
    num_reorg_races: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn note_flush(&self, ios: u64, flushed: u64, deferred: u64) {
        self.num_flushes.fetch_add(1, Ordering::SeqCst);
        self.num_ios.fetch_add(ios, Ordering::SeqCst);
        self.entries_flushed.fetch_add(flushed, Ordering::SeqCst);
        self.entries_deferred.fetch_add(deferred, Ordering::SeqCst);
    }

    pub fn note_reorg(&self) {
        self.num_reorgs.fetch_add(1, Ordering::SeqCst);
    }

    pub fn note_reorg_raced(&self) {
        self.num_reorg_races.fetch_add(1, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            num_flushes: self.num_flushes.load(Ordering::SeqCst),
            num_ios: self.num_ios.load(Ordering::SeqCst),
            entries_flushed: self.entries_flushed.load(Ordering::SeqCst),
            entries_deferred: self.entries_deferred.load(Ordering::SeqCst),
            num_reorgs: self.num_reorgs.load(Ordering::SeqCst),
            num_reorg_races: self.num_reorg_races.load(Ordering::SeqCst),
        }
    }
}

/// Point-in-time counter snapshot for monitoring.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub num_flushes: u64,
    pub num_ios: u64,
    pub entries_flushed: u64,
    pub entries_deferred: u64,
    pub num_reorgs: u64,
    pub num_reorg_races: u64,
}

/// Collect store metrics and log them.
pub fn collect(store: &SplineStore) -> Result<()> {
    let snapshot = store.metrics().snapshot();
    let memtable_bytes = store.memtable_usage();
    let num_segments = store.segments().num_segments();

    tracing::info!(
        memtable_bytes,
        num_segments,
        num_flushes = snapshot.num_flushes,
        num_ios = snapshot.num_ios,
        entries_flushed = snapshot.entries_flushed,
        entries_deferred = snapshot.entries_deferred,
        num_reorgs = snapshot.num_reorgs,
        num_reorg_races = snapshot.num_reorg_races,
        "store metrics"
    );

    Ok(())
}
