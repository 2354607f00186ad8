// SPDX-License-Identifier: MPL-2.0

//! The active-section pool (ASP, spec §4.3): a bounded array of windows,
//! each capable of holding one [`CachedSection`]'s pages mapped for CPU
//! access, managed with an LRU list for reclaim order and a modified list
//! for write-behind.
//!
//! Grounded on `original_source/kernel/cache.cpp`'s active-section
//! machinery (`CCActiveSectionReturnToLists`, `CCWriteSectionPrepare`,
//! `CCWriteSection`, `CCDereferenceActiveSection`): a fixed pool of
//! sections, each either on the LRU list (clean, reclaimable), the modified
//! list (dirty, owed a write-behind pass), or on neither (currently pinned
//! by an accessor or mid-I/O) — a three-way, mutually exclusive membership
//! the original expresses with a single intrusive `LIST_ITEM`. Here that
//! same one-of-three membership is expressed with two intrusive
//! `LinkedList`s (`intrusive-collections`, as used throughout
//! `aster-frame`'s own data structures) and the invariant that a section is
//! only ever linked into one of them at a time.
//!
//! Per-page `referenced`/`modified` bitmaps are `bitvec`, grounded on the
//! same crate's use in `aster-frame` for block-device and slab bitmaps.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use bitvec::prelude::{BitVec, Lsb0};
use intrusive_collections::{intrusive_adapter, LinkedList, LinkedListLink};

use crate::backend::CacheBackend;
use crate::config::{CacheConfig, PAGES_PER_SECTION};
use crate::directory::CachedSection;
use crate::frame::{FrameRef, PageFrame};
use crate::prelude::*;
use crate::sync::{Event, Mutex as CacheMutex};

/// Which of the pool's two intrusive lists (or neither) a section is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListMembership {
    None,
    Lru,
    Modified,
}

/// One slot of the active-section pool: a [`CachedSection`] currently bound
/// for CPU access, plus the per-page state the access engine and
/// write-behind worker need while it is bound.
pub struct ActiveSection {
    lru_link: LinkedListLink,
    modified_link: LinkedListLink,
    membership: CacheMutex<ListMembership>,

    pub section: Arc<CachedSection>,
    pub pool_index: usize,
    /// The backend this section's bytes ultimately live in, stashed at
    /// bind time so the write-behind worker (which walks the pool-wide
    /// modified list, not any one `CacheSpace`) knows where to write
    /// without needing its own reference to every `CacheSpace`.
    pub(crate) backend: Arc<dyn CacheBackend>,

    /// Pages currently mapped into this section's window, parallel to
    /// `section`'s own sparse slot array but scoped to exactly the pages
    /// this binding has touched.
    frames: CacheMutex<Vec<Option<PageFrame>>>,

    /// Bit `i` set means page `i` has been referenced since the section was
    /// last returned to the LRU list (spec §4.3's `referenced-pages`).
    referenced_pages: CacheMutex<BitVec<usize, Lsb0>>,
    /// Bit `i` set means page `i` has unwritten modifications (spec's
    /// `modified-pages`).
    modified_pages: CacheMutex<BitVec<usize, Lsb0>>,

    loading: AtomicBool,
    writing: AtomicBool,
    flush_requested: AtomicBool,

    /// Set once by the thread performing the load, consumed by every
    /// waiter (manual-reset: many accessors may be waiting on the same
    /// load).
    load_complete: Event,
    /// Set once the write-behind worker finishes a `CCWriteSection` pass.
    write_complete: Event,

    accessors: AtomicUsize,
}

intrusive_adapter!(LruAdapter = Arc<ActiveSection>: ActiveSection { lru_link: LinkedListLink });
intrusive_adapter!(ModifiedAdapter = Arc<ActiveSection>: ActiveSection { modified_link: LinkedListLink });

impl ActiveSection {
    fn new(section: Arc<CachedSection>, pool_index: usize, backend: Arc<dyn CacheBackend>) -> Arc<Self> {
        let page_count = section.page_count;
        Arc::new(Self {
            lru_link: LinkedListLink::new(),
            modified_link: LinkedListLink::new(),
            membership: CacheMutex::new(ListMembership::None),
            section,
            pool_index,
            backend,
            frames: CacheMutex::new(vec![None; page_count]),
            referenced_pages: CacheMutex::new(BitVec::repeat(false, page_count)),
            modified_pages: CacheMutex::new(BitVec::repeat(false, page_count)),
            loading: AtomicBool::new(false),
            writing: AtomicBool::new(false),
            flush_requested: AtomicBool::new(false),
            load_complete: Event::new(false),
            write_complete: Event::new(false),
            accessors: AtomicUsize::new(0),
        })
    }

    pub fn membership(&self) -> ListMembership {
        *self.membership.lock()
    }

    pub fn is_loading(&self) -> bool {
        self.loading.load(Ordering::Acquire)
    }

    pub fn begin_load(&self) {
        self.loading.store(true, Ordering::Release);
        self.load_complete.reset();
    }

    pub fn finish_load(&self) {
        self.loading.store(false, Ordering::Release);
        self.load_complete.set();
    }

    pub fn wait_for_load(&self) {
        self.load_complete.wait();
    }

    pub fn is_writing(&self) -> bool {
        self.writing.load(Ordering::Acquire)
    }

    pub fn begin_write(&self) {
        self.writing.store(true, Ordering::Release);
        self.write_complete.reset();
    }

    pub fn finish_write(&self) {
        self.writing.store(false, Ordering::Release);
        self.write_complete.set();
    }

    pub fn wait_for_write(&self) {
        self.write_complete.wait();
    }

    pub fn request_flush(&self) {
        self.flush_requested.store(true, Ordering::Release);
    }

    pub fn take_flush_request(&self) -> bool {
        self.flush_requested.swap(false, Ordering::AcqRel)
    }

    pub fn add_accessor(&self) -> usize {
        self.accessors.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn remove_accessor(&self) -> usize {
        self.accessors.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub fn accessor_count(&self) -> usize {
        self.accessors.load(Ordering::Acquire)
    }

    pub fn frame_at(&self, page_index: usize) -> Option<PageFrame> {
        self.frames.lock()[page_index].clone()
    }

    pub fn set_frame_at(&self, page_index: usize, frame: PageFrame) {
        self.frames.lock()[page_index] = Some(frame);
    }

    /// `CCDereferenceActiveSection`: unmaps this binding's pages in
    /// `[start_page, page_count)`, clearing their `referenced`/`modified`
    /// bits and per-binding frame slots (spec §4.3). Does not touch the
    /// owning `CachedSection`'s own directory slots or free any frames —
    /// callers that are discarding (not merely unmapping) a page must also
    /// clear its `CachedSection` slot and return the frame to the PMM, in
    /// that order, so no slot is ever left pointing at a frame no longer
    /// reachable through it (invariant I6).
    pub fn dereference_from(&self, start_page: usize) {
        let mut frames = self.frames.lock();
        let page_count = frames.len();
        let mut referenced = self.referenced_pages.lock();
        let mut modified = self.modified_pages.lock();
        for page_index in start_page..page_count {
            frames[page_index] = None;
            referenced.set(page_index, false);
            modified.set(page_index, false);
        }
    }

    pub fn mark_referenced(&self, page_index: usize) {
        self.referenced_pages.lock().set(page_index, true);
    }

    pub fn is_referenced(&self, page_index: usize) -> bool {
        self.referenced_pages.lock()[page_index]
    }

    pub fn clear_referenced(&self) {
        self.referenced_pages.lock().fill(false);
    }

    pub fn any_referenced(&self) -> bool {
        self.referenced_pages.lock().any()
    }

    pub fn mark_modified(&self, page_index: usize) {
        self.modified_pages.lock().set(page_index, true);
    }

    pub fn is_modified(&self, page_index: usize) -> bool {
        self.modified_pages.lock()[page_index]
    }

    pub fn any_modified(&self) -> bool {
        self.modified_pages.lock().any()
    }

    /// Drains the modified bitmap, returning the page indices that were
    /// set, for `CCWriteSectionPrepare` to hand to the backend as one
    /// coalesced write where possible.
    pub fn take_modified_pages(&self) -> Vec<usize> {
        let mut bits = self.modified_pages.lock();
        let indices: Vec<usize> = bits.iter_ones().collect();
        bits.fill(false);
        indices
    }
}

/// The bounded pool of active sections (spec §4.3).
pub struct ActiveSectionPool {
    config: CacheConfig,
    frame_ref: Arc<FrameRef>,
    slots: CacheMutex<Vec<Option<Arc<ActiveSection>>>>,
    free_slots: CacheMutex<VecDeque<usize>>,
    lru: CacheMutex<LinkedList<LruAdapter>>,
    modified: CacheMutex<LinkedList<ModifiedAdapter>>,
    modified_count: AtomicUsize,
    /// Woken whenever the modified list becomes non-empty; the write-behind
    /// worker waits on this.
    pub modified_non_empty: Event,
    /// Manual-reset; cleared while the modified list is at `max_modified`
    /// and set again once it drops below, so writers blocked in
    /// `WriteSectionPrepare` wake (spec §4.5).
    pub modified_non_full: Event,
}

impl ActiveSectionPool {
    pub fn new(config: CacheConfig, frame_ref: Arc<FrameRef>) -> Arc<Self> {
        let count = config.section_count;
        let modified_non_full = Event::new(false);
        modified_non_full.set();
        Arc::new(Self {
            config,
            frame_ref,
            slots: CacheMutex::new((0..count).map(|_| None).collect()),
            free_slots: CacheMutex::new((0..count).collect()),
            lru: CacheMutex::new(LinkedList::new(LruAdapter::new())),
            modified: CacheMutex::new(LinkedList::new(ModifiedAdapter::new())),
            modified_count: AtomicUsize::new(0),
            modified_non_empty: Event::new(true),
            modified_non_full,
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn modified_count(&self) -> usize {
        self.modified_count.load(Ordering::Acquire)
    }

    /// Returns the active-section binding for `section` if one already
    /// exists in the pool.
    pub fn lookup_bound(&self, section: &Arc<CachedSection>) -> Option<Arc<ActiveSection>> {
        let idx = section.active_pool_index()?;
        self.slots.lock()[idx].clone()
    }

    /// Binds `section` into the pool: reuses an existing binding if one is
    /// live, otherwise claims a free slot or evicts the least-recently-used
    /// clean section (spec: "choose-and-bind" protocol). Returns
    /// `Err(EBUSY)` if every slot is either pinned by an accessor or
    /// dirty-and-not-yet-written (mirrors the original returning failure
    /// when the LRU and modified lists are both unable to supply a victim).
    pub fn bind(
        self: &Arc<Self>,
        section: &Arc<CachedSection>,
        backend: &Arc<dyn CacheBackend>,
    ) -> Result<Arc<ActiveSection>> {
        if let Some(existing) = self.lookup_bound(section) {
            return Ok(existing);
        }

        let index = match self.free_slots.lock().pop_front() {
            Some(idx) => idx,
            None => self.evict_lru_slot()?,
        };

        let active = ActiveSection::new(section.clone(), index, backend.clone());
        self.slots.lock()[index] = Some(active.clone());
        section.bind_active_pool_index(index);
        Ok(active)
    }

    fn evict_lru_slot(&self) -> Result<usize> {
        let victim = {
            let mut lru = self.lru.lock();
            lru.pop_front()
        };
        let victim = match victim {
            Some(v) => v,
            None => return_errno_with_message!(
                Errno::EBUSY,
                "active-section pool exhausted: no reclaimable section on the LRU list"
            ),
        };
        *victim.membership.lock() = ListMembership::None;
        victim.section.unbind_active_pool_index();
        let index = victim.pool_index;
        self.slots.lock()[index] = None;
        Ok(index)
    }

    /// Unlinks `active` from whichever list it is on (spec §4.3's "xor
    /// membership"). A no-op if it is on neither.
    fn unlink(&self, active: &Arc<ActiveSection>) {
        match active.membership() {
            ListMembership::Lru => {
                let mut lru = self.lru.lock();
                let mut cursor = unsafe { lru.cursor_mut_from_ptr(Arc::as_ptr(active)) };
                cursor.remove();
            }
            ListMembership::Modified => {
                let mut modified = self.modified.lock();
                let mut cursor = unsafe { modified.cursor_mut_from_ptr(Arc::as_ptr(active)) };
                if cursor.remove().is_some() {
                    self.modified_count.fetch_sub(1, Ordering::AcqRel);
                }
            }
            ListMembership::None => {}
        }
        *active.membership.lock() = ListMembership::None;
    }

    /// `CCActiveSectionReturnToLists`: called once an accessor is done with
    /// `active` and its accessor count has dropped to zero. Places it on
    /// the modified list if it has unwritten pages, otherwise the back of
    /// the LRU list (most-recently-used end).
    ///
    /// Per invariant I7 and spec §4.4 step 7, placing a section onto the
    /// modified list first blocks on `modified-non-full` if the list is
    /// already at `max_modified` — re-checked after every wakeup, since a
    /// wakeup only means room existed a moment ago, not that it still does
    /// once this thread gets to acquire the list.
    pub fn return_to_lists(&self, active: &Arc<ActiveSection>) {
        if active.accessor_count() != 0 {
            return;
        }
        self.unlink(active);
        if active.any_modified() {
            self.wait_for_modified_capacity();
            let mut modified = self.modified.lock();
            modified.push_back(active.clone());
            *active.membership.lock() = ListMembership::Modified;
            let count = self.modified_count.fetch_add(1, Ordering::AcqRel) + 1;
            self.modified_non_empty.set();
            if count >= self.config.max_modified {
                self.modified_non_full.reset();
            }
        } else {
            let mut lru = self.lru.lock();
            lru.push_back(active.clone());
            *active.membership.lock() = ListMembership::Lru;
        }
    }

    /// Blocks until the modified list has room for one more section
    /// (invariant I7: `|modified-list| ≤ MAX_MODIFIED`). A no-op if there
    /// is already room.
    fn wait_for_modified_capacity(&self) {
        while self.modified_count.load(Ordering::Acquire) >= self.config.max_modified {
            self.modified_non_full.wait();
        }
    }

    /// Moves `active` to the most-recently-used end of the LRU list without
    /// changing its modified status. Used when an accessor merely touches
    /// (rather than releases) a section that was already idle on the LRU.
    pub fn touch(&self, active: &Arc<ActiveSection>) {
        if active.membership() != ListMembership::Lru {
            return;
        }
        let mut lru = self.lru.lock();
        let mut cursor = unsafe { lru.cursor_mut_from_ptr(Arc::as_ptr(active)) };
        if cursor.remove().is_some() {
            lru.push_back(active.clone());
        }
    }

    /// Removes and returns the section at the front of the modified list
    /// (the one longest overdue for write-behind), if any.
    pub fn pop_modified_front(&self) -> Option<Arc<ActiveSection>> {
        let front = self.modified.lock().pop_front();
        if let Some(active) = &front {
            *active.membership.lock() = ListMembership::None;
            let remaining = self.modified_count.fetch_sub(1, Ordering::AcqRel) - 1;
            if remaining == 0 {
                self.modified_non_empty.reset();
            }
            if remaining < self.config.max_modified {
                self.modified_non_full.set();
            }
        }
        front
    }

    /// Removes `active` from the pool entirely regardless of accessor or
    /// modified state, for use by truncate/destroy once callers have
    /// already drained its pages. Safe to call even if `active` is not
    /// currently linked into either list.
    pub fn evict(&self, active: &Arc<ActiveSection>) {
        self.unlink(active);
        let index = active.pool_index;
        self.slots.lock()[index] = None;
        active.section.unbind_active_pool_index();
        self.free_slots.lock().push_back(index);
    }

    pub fn frame_ref(&self) -> &Arc<FrameRef> {
        &self.frame_ref
    }
}

static_assertions::const_assert!(PAGES_PER_SECTION > 0);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SECTION_SIZE;
    use crate::directory::CachedSectionDirectory;
    use crate::sim::SimplePmm;
    use crate::test_support::MemoryBackend;

    fn make_pool(section_count: usize) -> Arc<ActiveSectionPool> {
        let pmm = Arc::new(SimplePmm::new(1024));
        let frame_ref = Arc::new(FrameRef::new(pmm));
        let mut config = CacheConfig::new(section_count);
        config.max_modified = 2;
        ActiveSectionPool::new(config, frame_ref)
    }

    fn backend() -> Arc<dyn CacheBackend> {
        Arc::new(MemoryBackend::zeroed(SECTION_SIZE * 4))
    }

    #[test]
    fn bind_reuses_existing_binding() {
        let pool = make_pool(4);
        let csd = CachedSectionDirectory::new();
        let section = csd.cover(0, SECTION_SIZE as u64);
        let backend = backend();
        let a = pool.bind(&section, &backend).unwrap();
        let b = pool.bind(&section, &backend).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn evicts_lru_when_pool_full() {
        let pool = make_pool(1);
        let csd = CachedSectionDirectory::new();
        let backend = backend();
        let section_size = SECTION_SIZE as u64;
        let s0 = csd.cover(0, section_size * 2);
        let active0 = pool.bind(&s0, &backend).unwrap();
        pool.return_to_lists(&active0);

        let s1 = csd.cover(section_size, section_size * 2);
        let active1 = pool.bind(&s1, &backend).unwrap();
        assert_eq!(active1.pool_index, 0);
        assert!(s0.active_pool_index().is_none());
    }

    #[test]
    fn bind_fails_when_pool_exhausted_and_pinned() {
        let pool = make_pool(1);
        let csd = CachedSectionDirectory::new();
        let backend = backend();
        let section_size = SECTION_SIZE as u64;
        let s0 = csd.cover(0, section_size * 2);
        let active0 = pool.bind(&s0, &backend).unwrap();
        active0.add_accessor();

        let s1 = csd.cover(section_size, section_size * 2);
        assert!(pool.bind(&s1, &backend).is_err());
    }

    #[test]
    fn return_to_lists_routes_dirty_sections_to_modified() {
        let pool = make_pool(4);
        let csd = CachedSectionDirectory::new();
        let backend = backend();
        let section = csd.cover(0, SECTION_SIZE as u64);
        let active = pool.bind(&section, &backend).unwrap();
        active.mark_modified(0);
        pool.return_to_lists(&active);
        assert_eq!(active.membership(), ListMembership::Modified);
        assert_eq!(pool.modified_count(), 1);
    }
}
