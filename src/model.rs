//! The learned key model.
//!
//! Two cooperating pieces predict where a key lives:
//!
//! - [`Spline`] is fit once over the bulk-loaded key distribution and never
//!   changes. It estimates a record's position in the loaded ordering;
//!   dividing by the page record capacity turns that into the page bucket
//!   the flush planner accounts against.
//! - [`PageModel`] is the authoritative, mutable mapping from keys to
//!   physical base pages. Reorganization swaps the mappings of a rewritten
//!   key range; readers that pinned a stale page id simply re-query.
//!
//! Keys order by the natural unsigned order on their big-endian byte image,
//! which for `u64` coincides with the natural integer order.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::RwLock;

use crate::buffer::PageId;

/// A record key. Ordered as the unsigned integer it is, which matches the
/// lexicographic order of its big-endian byte image.
pub type Key = u64;

/// Number of high bits of the key image used for the radix table.
const RADIX_BITS: u32 = 12;

/// One spline knot is kept for every this many loaded records.
const KNOT_SPACING: usize = 32;

/// An immutable piecewise-linear position estimator over the loaded key
/// distribution, with a radix table over the high bits of the key for fast
/// knot lookup.
pub struct Spline {
    /// (key, position) knots, ascending by key. Empty for an empty load.
    knots: Vec<(Key, u64)>,
    /// `radix[b]` is the index of the first knot whose radix prefix is >= b.
    radix: Vec<u32>,
    shift: u32,
    min_key: Key,
    max_key: Key,
    num_keys: u64,
}

impl Spline {
    /// Fit a spline over strictly ascending keys.
    pub fn build(keys: &[Key]) -> Self {
        let buckets = 1usize << RADIX_BITS;
        if keys.is_empty() {
            return Self {
                knots: Vec::new(),
                radix: vec![0; buckets + 1],
                shift: 0,
                min_key: 0,
                max_key: 0,
                num_keys: 0,
            };
        }

        let min_key = keys[0];
        let max_key = keys[keys.len() - 1];

        let mut knots = Vec::with_capacity(keys.len() / KNOT_SPACING + 2);
        for (pos, &key) in keys.iter().enumerate() {
            if pos % KNOT_SPACING == 0 {
                knots.push((key, pos as u64));
            }
        }
        if knots.last().map(|&(key, _)| key) != Some(max_key) {
            knots.push((max_key, keys.len() as u64 - 1));
        }

        let range = max_key - min_key;
        let prefix_bits = 64 - range.leading_zeros();
        let shift = prefix_bits.saturating_sub(RADIX_BITS);

        let mut radix = vec![0u32; buckets + 1];
        let mut bucket = 0usize;
        for (i, &(key, _)) in knots.iter().enumerate() {
            let key_bucket = ((key - min_key) >> shift) as usize;
            while bucket <= key_bucket {
                radix[bucket] = i as u32;
                bucket += 1;
            }
        }
        while bucket <= buckets {
            radix[bucket] = knots.len() as u32;
            bucket += 1;
        }

        Self {
            knots,
            radix,
            shift,
            min_key,
            max_key,
            num_keys: keys.len() as u64,
        }
    }

    /// Estimated position of `key` in the loaded ordering, clamped to
    /// `[0, num_keys)`. Deterministic for a fixed model.
    pub fn estimated_position(&self, key: Key) -> u64 {
        if self.num_keys == 0 || key <= self.min_key {
            return 0;
        }
        if key >= self.max_key {
            return self.num_keys - 1;
        }

        let bucket = ((key - self.min_key) >> self.shift) as usize;
        let lo = (self.radix[bucket] as usize).saturating_sub(1);
        let hi = (self.radix[bucket + 1] as usize + 1).min(self.knots.len());
        let slice = &self.knots[lo..hi];

        // knots[lo].0 <= key because radix[bucket] is the first knot at or
        // past the bucket and key > min_key.
        let idx = slice.partition_point(|&(k, _)| k <= key);
        let (k0, p0) = slice[idx - 1];
        if idx == slice.len() {
            return p0;
        }
        let (k1, p1) = slice[idx];

        let frac = (key - k0) as f64 / (k1 - k0) as f64;
        p0 + (frac * (p1 - p0) as f64) as u64
    }

    pub fn num_keys(&self) -> u64 {
        self.num_keys
    }
}

/// The mutable key-to-page mapping. Lookups floor to the greatest mapped
/// lower bound; probes below the loaded range clamp to the first page.
pub struct PageModel {
    mapping: RwLock<BTreeMap<Key, PageId>>,
}

impl PageModel {
    pub fn new(mapping: BTreeMap<Key, PageId>) -> Self {
        Self {
            mapping: RwLock::new(mapping),
        }
    }

    /// The physical base page covering `key`.
    pub fn key_to_page_id(&self, key: Key) -> PageId {
        let mapping = self.mapping.read().unwrap();
        match mapping.range(..=key).next_back() {
            Some((_, page)) => *page,
            None => *mapping
                .values()
                .next()
                .expect("page model is never empty once the store is open"),
        }
    }

    /// The base page whose range strictly follows the page with the given
    /// lower boundary, or `None` past the end of the key space.
    pub fn key_to_next_page_id(&self, lower_bound_key: Key) -> Option<PageId> {
        let mapping = self.mapping.read().unwrap();
        mapping
            .range((Bound::Excluded(lower_bound_key), Bound::Unbounded))
            .next()
            .map(|(_, page)| *page)
    }

    /// Atomically replace the mappings of a rewritten key range.
    pub fn replace_range(&self, old_lowers: &[Key], new_pages: Vec<(Key, PageId)>) {
        let mut mapping = self.mapping.write().unwrap();
        for lower in old_lowers {
            mapping.remove(lower);
        }
        for (lower, page) in new_pages {
            mapping.insert(lower, page);
        }
    }

    pub fn num_pages(&self) -> usize {
        self.mapping.read().unwrap().len()
    }
}
