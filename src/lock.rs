use std::collections::HashMap;
use std::sync::Mutex;

use crate::segment::SegmentId;

/// Lock modes on a segment id.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SegmentMode {
    PageRead,
    PageWrite,
    Reorg,
}

#[derive(Default)]
struct Held {
    readers: usize,
    writer: bool,
    reorg: bool,
}

impl Held {
    fn is_free(&self) -> bool {
        self.readers == 0 && !self.writer && !self.reorg
    }
}

/// Try-only logical locks on segment ids.
///
/// Only PageRead is compatible with itself; every other pairing is denied.
/// There is no waiter queue: callers spin with randomized exponential
/// backoff, and multi-segment acquisitions go in ascending lower-bound
/// order so two competing rewrites cannot deadlock.
pub struct LockManager {
    table: Mutex<HashMap<SegmentId, Held>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
        }
    }

    /// Grants `mode` if it is compatible with every mode currently held on
    /// the segment, otherwise reports contention. Never blocks.
    pub fn try_acquire(&self, segment: SegmentId, mode: SegmentMode) -> bool {
        let mut table = self.table.lock().unwrap();
        let held = table.entry(segment).or_default();
        match mode {
            SegmentMode::PageRead if !held.writer && !held.reorg => {
                held.readers += 1;
                true
            }
            SegmentMode::PageWrite if held.is_free() => {
                held.writer = true;
                true
            }
            SegmentMode::Reorg if held.is_free() => {
                held.reorg = true;
                true
            }
            _ => false,
        }
    }

    /// Releases one held instance of `mode`. Releasing a mode that is not
    /// held is a bookkeeping bug and trips in debug builds.
    pub fn release(&self, segment: SegmentId, mode: SegmentMode) {
        let mut table = self.table.lock().unwrap();
        let Some(held) = table.get_mut(&segment) else {
            debug_assert!(false, "released lock on unlocked segment {segment}");
            return;
        };
        match mode {
            SegmentMode::PageRead => {
                debug_assert!(held.readers > 0, "PageRead released but not held");
                held.readers = held.readers.saturating_sub(1);
            }
            SegmentMode::PageWrite => {
                debug_assert!(held.writer, "PageWrite released but not held");
                held.writer = false;
            }
            SegmentMode::Reorg => {
                debug_assert!(held.reorg, "Reorg released but not held");
                held.reorg = false;
            }
        }
        if held.is_free() {
            table.remove(&segment);
        }
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}
