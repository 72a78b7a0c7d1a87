//! Merge iteration over a pinned overflow chain.
//!
//! A chain's base page and its overflow pages each hold a sorted record
//! run, but the runs interleave: overflow pages store whatever spilled.
//! The merge iterator yields their ascending-key union through a min-heap,
//! hiding tombstones. Where the same key appears on more than one page the
//! earliest page in the chain wins.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::buffer::OverflowChain;
use crate::model::Key;

struct HeapEntry {
    key: Key,
    value: Option<Vec<u8>>,
    source: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.source == other.source
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed for min-heap behavior; ties prefer the earlier page.
        match self.key.cmp(&other.key) {
            Ordering::Equal => self.source.cmp(&other.source).reverse(),
            ord => ord.reverse(),
        }
    }
}

/// Ascending-key merge of a pinned chain's pages. Tombstoned entries are
/// hidden; an optional start key filters everything below it.
pub struct PageMergeIterator {
    sources: Vec<std::vec::IntoIter<(Key, Option<Vec<u8>>)>>,
    heap: BinaryHeap<HeapEntry>,
    last_key: Option<Key>,
}

impl PageMergeIterator {
    pub fn new(chain: &OverflowChain, start_key: Option<Key>) -> Self {
        let mut sources: Vec<_> = chain
            .pages()
            .iter()
            .map(|page| page.read().records_from(start_key).into_iter())
            .collect();

        let mut heap = BinaryHeap::new();
        for (source, iter) in sources.iter_mut().enumerate() {
            if let Some((key, value)) = iter.next() {
                heap.push(HeapEntry { key, value, source });
            }
        }

        Self {
            sources,
            heap,
            last_key: None,
        }
    }
}

impl Iterator for PageMergeIterator {
    type Item = (Key, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(entry) = self.heap.pop() {
            if let Some((key, value)) = self.sources[entry.source].next() {
                self.heap.push(HeapEntry {
                    key,
                    value,
                    source: entry.source,
                });
            }

            if self.last_key == Some(entry.key) {
                continue;
            }
            self.last_key = Some(entry.key);

            match entry.value {
                Some(value) => return Some((entry.key, value)),
                None => continue, // tombstone
            }
        }
        None
    }
}
