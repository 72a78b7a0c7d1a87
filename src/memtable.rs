//! Memtable implementation using a concurrent skip list.
//!
//! The memtable is the in-memory ordered log of pending writes. Entries
//! accumulate here until the flush planner decides, per destination page,
//! whether to issue I/O or carry them into the next memtable.
//!
//! We use `crossbeam-skiplist::SkipMap` for lock-free concurrent reads and
//! naturally ordered traversal. A tombstone is stored as a `None` value;
//! within one memtable a later add for the same key supersedes the earlier
//! one, so an in-order traversal sees exactly one entry per key.
//!
//! Memtables are born empty, become immutable the moment their flush
//! begins (the atomic frozen flag), and are dropped once their replacement
//! is installed and the deferred entries have migrated.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crossbeam_skiplist::SkipMap;

use crate::error::Result;
use crate::model::Key;
use crate::Error;

/// Fixed per-entry charge in the memory estimate (the key itself).
const ENTRY_OVERHEAD: usize = std::mem::size_of::<Key>();

/// In-memory ordered write buffer.
pub struct Memtable {
    data: SkipMap<Key, Option<Vec<u8>>>,
    size: AtomicUsize,
    frozen: AtomicBool,
}

impl Memtable {
    pub fn new() -> Self {
        Self {
            data: SkipMap::new(),
            size: AtomicUsize::new(0),
            frozen: AtomicBool::new(false),
        }
    }

    /// Inserts an entry; a `None` value is a tombstone. A later add with an
    /// equal key supersedes the earlier one.
    pub fn add(&self, key: Key, value: Option<Vec<u8>>) -> Result<()> {
        if self.frozen.load(Ordering::SeqCst) {
            return Err(Error::ReadOnly);
        }
        let entry_size = ENTRY_OVERHEAD + value.as_ref().map_or(0, |v| v.len());
        self.data.insert(key, value);
        self.size.fetch_add(entry_size, Ordering::SeqCst);
        Ok(())
    }

    /// The latest entry for `key`, if any. `Some(None)` is a tombstone.
    pub fn get(&self, key: Key) -> Option<Option<Vec<u8>>> {
        self.data.get(&key).map(|entry| entry.value().clone())
    }

    /// Memory footprint estimate. Monotone non-decreasing between adds
    /// (overwrites charge their full size again); used only to trigger
    /// flushes.
    pub fn approximate_memory_usage(&self) -> usize {
        self.size.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Marks the memtable immutable. A second freeze reports `ReadOnly`.
    pub fn freeze(&self) -> Result<()> {
        if self.frozen.swap(true, Ordering::SeqCst) {
            return Err(Error::ReadOnly);
        }
        Ok(())
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::SeqCst)
    }

    /// Entries in ascending key order, one per key (last write wins).
    pub fn iter_sorted(&self) -> impl Iterator<Item = (Key, Option<Vec<u8>>)> + '_ {
        self.data.iter().map(|entry| (*entry.key(), entry.value().clone()))
    }
}

impl Default for Memtable {
    fn default() -> Self {
        Self::new()
    }
}
