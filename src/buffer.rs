//! The in-memory page store behind the buffer-manager interface.
//!
//! Pages are fixed-capacity sorted record maps with an optional overflow
//! link. A base page plus its overflow extensions form a chain, pinned and
//! released as a unit. Pinning keeps the frame alive and its key range
//! stable; content access latches per call through the frame's `RwLock`.
//!
//! Reorganization never mutates the pages it replaces: it builds fresh
//! pages and invalidates the old ids. A pin taken before invalidation
//! therefore stays a stable snapshot; a pin attempted after it fails and
//! the caller re-queries the model.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::model::Key;

/// Opaque handle to a physical page. Ids are never reused; reorganization
/// permanently invalidates the ids of the pages it rewrites.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageId(u64);

impl PageId {
    pub fn raw(self) -> u64 {
        self.0
    }
}

/// A fixed-capacity sorted page with an optional overflow link.
#[derive(Debug)]
pub struct Page {
    lower: Key,
    capacity: usize,
    records: BTreeMap<Key, Option<Vec<u8>>>,
    next: Option<PageId>,
}

impl Page {
    fn new(lower: Key, capacity: usize) -> Self {
        Self {
            lower,
            capacity,
            records: BTreeMap::new(),
            next: None,
        }
    }

    /// The lower-bound key this page's range starts at.
    pub fn lower_boundary(&self) -> Key {
        self.lower
    }

    pub fn is_full(&self) -> bool {
        self.records.len() >= self.capacity
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, key: Key) -> bool {
        self.records.contains_key(&key)
    }

    pub fn get(&self, key: Key) -> Option<&Option<Vec<u8>>> {
        self.records.get(&key)
    }

    /// Insert or overwrite a record. Capacity for fresh keys is the
    /// caller's concern.
    pub fn put(&mut self, key: Key, value: Option<Vec<u8>>) {
        self.records.insert(key, value);
    }

    pub fn next(&self) -> Option<PageId> {
        self.next
    }

    pub fn set_next(&mut self, next: Option<PageId>) {
        self.next = next;
    }

    /// Records at or above `start`, ascending; all records when `None`.
    pub fn records_from(&self, start: Option<Key>) -> Vec<(Key, Option<Vec<u8>>)> {
        match start {
            Some(start) => self
                .records
                .range(start..)
                .map(|(k, v)| (*k, v.clone()))
                .collect(),
            None => self
                .records
                .iter()
                .map(|(k, v)| (*k, v.clone()))
                .collect(),
        }
    }
}

#[derive(Debug)]
struct Frame {
    page: RwLock<Page>,
    pins: AtomicUsize,
    valid: AtomicBool,
    dirty: AtomicBool,
}

/// A pinned page handle. The frame cannot be reclaimed while pinned.
pub struct PinnedPage {
    id: PageId,
    frame: Arc<Frame>,
}

impl PinnedPage {
    pub fn id(&self) -> PageId {
        self.id
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Page> {
        self.frame.page.read().unwrap()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Page> {
        self.frame.page.write().unwrap()
    }

    fn unpin(&self, dirty: bool) {
        if dirty {
            self.frame.dirty.store(true, Ordering::SeqCst);
        }
        self.frame.pins.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A base page and its pinned overflow extensions. Must be released
/// exactly once on every exit path; a chain dropped while still pinned is
/// caught in debug builds.
pub struct OverflowChain {
    pages: Vec<PinnedPage>,
    exclusive: bool,
    released: bool,
}

impl OverflowChain {
    pub fn base(&self) -> &PinnedPage {
        &self.pages[0]
    }

    pub fn pages(&self) -> &[PinnedPage] {
        &self.pages
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    /// The chain's logical lower bound, owned by the base page. Stable
    /// while the chain is pinned.
    pub fn lower_boundary(&self) -> Key {
        self.base().read().lower_boundary()
    }

    pub fn exclusive(&self) -> bool {
        self.exclusive
    }

    pub(crate) fn tail(&self) -> &PinnedPage {
        self.pages.last().expect("a chain is never empty")
    }

    pub(crate) fn push(&mut self, page: PinnedPage) {
        self.pages.push(page);
    }

    /// Release every pin, marking the pages dirty when written.
    pub fn release(mut self, dirty: bool) {
        for page in &self.pages {
            page.unpin(dirty);
        }
        self.released = true;
    }
}

impl Drop for OverflowChain {
    fn drop(&mut self) {
        debug_assert!(self.released, "overflow chain dropped without release");
    }
}

/// Owns every page frame and hands out pinned chains.
pub struct BufferManager {
    frames: RwLock<HashMap<PageId, Arc<Frame>>>,
    next_id: AtomicU64,
}

impl BufferManager {
    pub fn new() -> Self {
        Self {
            frames: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Create an empty page. It is pinnable immediately; wiring it into
    /// the model or a chain is the caller's concern.
    pub fn allocate(&self, lower: Key, capacity: usize) -> PageId {
        self.allocate_with(lower, capacity, std::iter::empty())
    }

    /// Create a page pre-filled with records.
    pub fn allocate_with(
        &self,
        lower: Key,
        capacity: usize,
        records: impl IntoIterator<Item = (Key, Option<Vec<u8>>)>,
    ) -> PageId {
        let id = PageId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let mut page = Page::new(lower, capacity);
        for (key, value) in records {
            page.put(key, value);
        }
        let frame = Arc::new(Frame {
            page: RwLock::new(page),
            pins: AtomicUsize::new(0),
            valid: AtomicBool::new(true),
            dirty: AtomicBool::new(false),
        });
        self.frames.write().unwrap().insert(id, frame);
        id
    }

    /// Allocate an empty page and hand back an already-pinned handle, for
    /// a flush extending a chain it holds.
    pub fn allocate_pinned(&self, lower: Key, capacity: usize) -> PinnedPage {
        let id = self.allocate(lower, capacity);
        let frame = self
            .frames
            .read()
            .unwrap()
            .get(&id)
            .cloned()
            .expect("frame was just allocated");
        frame.pins.fetch_add(1, Ordering::SeqCst);
        PinnedPage { id, frame }
    }

    fn pin(&self, id: PageId) -> Option<PinnedPage> {
        let frame = self.frames.read().unwrap().get(&id).cloned()?;
        frame.pins.fetch_add(1, Ordering::SeqCst);
        if !frame.valid.load(Ordering::SeqCst) {
            frame.pins.fetch_sub(1, Ordering::SeqCst);
            return None;
        }
        Some(PinnedPage { id, frame })
    }

    /// Pin a base page and all of its overflow pages as one unit. Returns
    /// `None` when the id has been invalidated by reorganization; in that
    /// case no pins are held.
    pub fn fix_chain(&self, id: PageId, exclusive: bool) -> Option<OverflowChain> {
        let base = self.pin(id)?;
        let mut next_id = base.read().next();
        let mut pages = vec![base];
        while let Some(id) = next_id {
            match self.pin(id) {
                Some(page) => {
                    next_id = page.read().next();
                    pages.push(page);
                }
                None => {
                    for page in &pages {
                        page.unpin(false);
                    }
                    return None;
                }
            }
        }
        Some(OverflowChain {
            pages,
            exclusive,
            released: false,
        })
    }

    /// Permanently invalidate a page id. Existing pins keep their stable
    /// snapshot; new pins fail.
    pub fn invalidate(&self, id: PageId) {
        if let Some(frame) = self.frames.write().unwrap().remove(&id) {
            frame.valid.store(false, Ordering::SeqCst);
        }
    }

    pub fn num_pages(&self) -> usize {
        self.frames.read().unwrap().len()
    }
}

impl Default for BufferManager {
    fn default() -> Self {
        Self::new()
    }
}
