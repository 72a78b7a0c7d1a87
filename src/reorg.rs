//! Background reorganization of overflowed segments.
//!
//! A rewrite flattens every overflow chain in a locked region back into
//! packed pages: live records are collected in order, tombstones are
//! dropped, fresh pages and segments are built, and the old pages are
//! invalidated. Readers that pinned an old chain keep their stable
//! snapshot; readers that pin afterwards fail and re-query the model.
//!
//! The region itself comes from the segment index's two-phase
//! acquisition; losing the race there is normal and simply retried on a
//! later tick.

use std::collections::BTreeMap;

use crate::error::Result;
use crate::lock::SegmentMode;
use crate::model::Key;
use crate::segment::{SegmentEntry, SegmentInfo};
use crate::store::SplineStore;

/// Rewrite the region around `segment_base`. Returns `false` when a
/// competing reorganization won the region.
pub fn rewrite_region(store: &SplineStore, segment_base: Key) -> Result<bool> {
    let region = store
        .segments()
        .find_and_lock_rewrite_region(segment_base, store.config().search_radius)?;
    if region.is_empty() {
        store.metrics().note_reorg_raced();
        return Ok(false);
    }

    rewrite_locked(store, &region);

    for segment in &region {
        store
            .lock_manager()
            .release(segment.sinfo.id(), SegmentMode::Reorg);
    }

    store.metrics().note_reorg();
    tracing::info!(
        segment_base,
        segments = region.len(),
        "reorganized rewrite region"
    );
    Ok(true)
}

fn rewrite_locked(store: &SplineStore, region: &[SegmentEntry]) {
    let region_lower = region[0].lower;
    let region_upper = region[region.len() - 1].upper;

    // Collect the region's chains in order. The held Reorg locks exclude
    // competing rewrites of these segments; a failed pin can only come
    // from a neighboring rewrite racing the walk, so re-query and go on.
    let mut chains = Vec::new();
    let mut old_page_lowers = Vec::new();
    let mut old_page_ids = Vec::new();
    let mut records: BTreeMap<Key, Vec<u8>> = BTreeMap::new();

    let mut last_lower: Option<Key> = None;
    let mut next_pid = Some(store.model().key_to_page_id(region_lower));
    while let Some(pid) = next_pid {
        let chain = match store.buffers().fix_chain(pid, true) {
            Some(chain) => chain,
            None => {
                next_pid = match last_lower {
                    None => Some(store.model().key_to_page_id(region_lower)),
                    Some(lower) => store.model().key_to_next_page_id(lower),
                };
                continue;
            }
        };

        let lower = chain.lower_boundary();
        if lower >= region_upper {
            chain.release(false);
            break;
        }

        for page in chain.pages() {
            old_page_ids.push(page.id());
            for (key, value) in page.read().records_from(None) {
                // Tombstones die here; the rewrite is where deletes are
                // physically reclaimed.
                if let Some(value) = value {
                    records.insert(key, value);
                }
            }
        }
        old_page_lowers.push(lower);
        last_lower = Some(lower);
        next_pid = store.model().key_to_next_page_id(lower);
        chains.push(chain);
    }

    // Build freshly packed pages with no overflow links.
    let records_per_page = store.config().records_per_page.max(1);
    let records: Vec<(Key, Vec<u8>)> = records.into_iter().collect();
    let mut new_pages: Vec<(Key, crate::buffer::PageId)> = Vec::new();

    if records.is_empty() {
        let id = store.buffers().allocate(region_lower, records_per_page);
        new_pages.push((region_lower, id));
    } else {
        for (i, chunk) in records.chunks(records_per_page).enumerate() {
            // The first page keeps covering the whole region's lower end.
            let lower = if i == 0 { region_lower } else { chunk[0].0 };
            let id = store.buffers().allocate_with(
                lower,
                records_per_page,
                chunk.iter().map(|(key, value)| (*key, Some(value.clone()))),
            );
            new_pages.push((lower, id));
        }
    }

    let mut new_segments = Vec::new();
    for pages in new_pages.chunks(store.config().pages_per_segment.max(1)) {
        let id = store.next_segment_id();
        new_segments.push((pages[0].0, SegmentInfo::new(id, pages.len())));
    }

    // Install, then retire the old pages. Model before invalidation: a
    // reader whose pin fails must find the fresh mapping on re-query.
    let old_lowers: Vec<Key> = region.iter().map(|segment| segment.lower).collect();
    store.segments().install_region(&old_lowers, new_segments);
    store.model().replace_range(&old_page_lowers, new_pages);

    for chain in chains {
        chain.release(false);
    }
    for id in old_page_ids {
        store.buffers().invalidate(id);
    }
}
