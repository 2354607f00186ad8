// SPDX-License-Identifier: MPL-2.0

//! The cached-section directory (CSD): the sparse, per-file index from file
//! offset to physical frame (spec §4.2).
//!
//! Grounded on two sources. The sparse, lazily-populated map shape is
//! grounded on `aster-nix`'s `PageCacheManager`, which keeps its pages in a
//! `BTreeMap<usize, Page>` keyed by page index rather than a dense array, so
//! a sparsely-accessed file never allocates entries for pages nobody has
//! touched. The per-section node contents — a fixed-size page array, a
//! reference count, and the slot that remembers which active-section-pool
//! index currently has the section mapped — are grounded on
//! `CCCachedSection` in `original_source/kernel/cache.cpp`, specifically
//! `CCFindCachedSectionContaining`, `CCSpaceCover`, and `CCSpaceUncover`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};

use crate::config::{round_down, round_up, PAGES_PER_SECTION, PAGE_SIZE, SECTION_SIZE};
use crate::frame::PageFrame;
use crate::prelude::*;
use crate::sync::Mutex as CacheMutex;

/// One page slot within a [`CachedSection`]'s sparse page array.
#[derive(Clone)]
pub enum PageSlotState {
    /// No frame has ever backed this page (or it was evicted and the slot
    /// reset to this at truncate time).
    Empty,
    /// A physical frame backs this page, in either `Standby` or `Active`
    /// [`crate::frame::PageFrameState`].
    Present(PageFrame),
}

impl PageSlotState {
    pub fn frame(&self) -> Option<&PageFrame> {
        match self {
            PageSlotState::Present(f) => Some(f),
            PageSlotState::Empty => None,
        }
    }
}

/// The shared page-slot storage of one [`CachedSection`], split out from
/// `CachedSection` itself so a [`crate::frame::CacheSlotRef`] can hold a
/// [`Weak`](std::sync::Weak) reference to exactly this without keeping the
/// whole section (and its directory-membership bookkeeping) alive.
pub struct CachedSectionHandle {
    pages: CacheMutex<Vec<PageSlotState>>,
}

impl CachedSectionHandle {
    fn new(page_count: usize) -> Self {
        Self {
            pages: CacheMutex::new((0..page_count).map(|_| PageSlotState::Empty).collect()),
        }
    }

    pub fn get(&self, index: usize) -> PageSlotState {
        self.pages.lock()[index].clone()
    }

    pub fn set(&self, index: usize, frame: PageFrame) {
        self.pages.lock()[index] = PageSlotState::Present(frame);
    }

    /// Clears a slot unconditionally. Called by the physical memory manager,
    /// under its own page-frame lock, the instant before a standby frame it
    /// reclaimed through this slot is handed to a new allocation (spec
    /// invariant I6).
    pub(crate) fn clear_slot(&self, index: usize) {
        let mut pages = self.pages.lock();
        if let Some(slot) = pages.get_mut(index) {
            *slot = PageSlotState::Empty;
        }
    }

    pub fn len(&self) -> usize {
        self.pages.lock().len()
    }

    pub fn is_empty_slot(&self, index: usize) -> bool {
        matches!(self.pages.lock()[index], PageSlotState::Empty)
    }
}

/// A node of the cached-section directory: one fixed-size,
/// `SECTION_SIZE`-aligned span of a file, lazily created the first time any
/// byte in its range is accessed (spec §4.2, "sparse").
///
/// `CachedSection` is distinct from
/// [`ActiveSection`](crate::active_pool::ActiveSection): this is a
/// permanent directory entry holding whichever frames are currently
/// reachable for the span (via `Standby` or `Active` state); an
/// `ActiveSection` is the *temporary* binding of one such node into the
/// bounded active-section pool so the CPU can actually touch its pages.
pub struct CachedSection {
    /// Byte offset of the first page in this section; always a multiple of
    /// `SECTION_SIZE`.
    pub start: u64,
    /// Number of valid pages in this section (`PAGES_PER_SECTION`, except
    /// possibly fewer for the section covering end-of-file).
    pub page_count: usize,
    handle: Arc<CachedSectionHandle>,
    /// Index into the active-section pool while this section is bound
    /// there; `-1` when unbound. An `AtomicIsize` rather than a `Mutex`
    /// because the access engine only ever needs to test-and-set it while
    /// already holding the pool's own lock (spec lock order: csd-mutex then
    /// asp-mutex), so a plain atomic avoids a third lock in that path.
    active_index: AtomicIsize,
    /// Count of in-flight accessors (spec's per-section reference count,
    /// distinct from any one frame's `references`).
    accessors: AtomicUsize,
    /// Number of outstanding external mappings covering this section
    /// (spec §3/§4.2's `mapped-region-count`), established by
    /// [`CachedSectionDirectory::cover_range`] and released by
    /// [`CachedSectionDirectory::uncover_range`]. Kept alongside, not
    /// instead of, `accessors`: an accessor is a transient in-flight
    /// `access()` call, while a mapped region is a caller-held reference
    /// (e.g. a live `mmap`) that can outlive every individual access.
    mapped_region_count: AtomicUsize,
}

impl CachedSection {
    fn new(start: u64, page_count: usize) -> Self {
        Self {
            start,
            page_count,
            handle: Arc::new(CachedSectionHandle::new(page_count)),
            active_index: AtomicIsize::new(-1),
            accessors: AtomicUsize::new(0),
            mapped_region_count: AtomicUsize::new(0),
        }
    }

    pub fn handle(&self) -> &Arc<CachedSectionHandle> {
        &self.handle
    }

    pub fn page_slot(&self, page_index: usize) -> PageSlotState {
        self.handle.get(page_index)
    }

    pub fn set_page_slot(self: &Arc<Self>, page_index: usize, frame: PageFrame) {
        self.handle.set(page_index, frame.clone());
        frame.set_cache_reference(Some(crate::frame::CacheSlotRef::new(
            &self.handle,
            page_index,
        )));
    }

    /// Clears this section's slot for `page_index` back to `Empty`. Callers
    /// discarding a page (truncate, destroy) must call this *after* the
    /// underlying frame has had its `cache-reference` cleared and been
    /// returned to the PMM, so the slot is never left `Present` over a
    /// frame no longer reachable through it (invariant I6).
    pub fn clear_page_slot(&self, page_index: usize) {
        self.handle.clear_slot(page_index);
    }

    pub fn active_pool_index(&self) -> Option<usize> {
        let idx = self.active_index.load(Ordering::Acquire);
        if idx < 0 {
            None
        } else {
            Some(idx as usize)
        }
    }

    pub fn bind_active_pool_index(&self, index: usize) {
        self.active_index.store(index as isize, Ordering::Release);
    }

    pub fn unbind_active_pool_index(&self) {
        self.active_index.store(-1, Ordering::Release);
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

    fn add_mapped_region(&self) -> usize {
        self.mapped_region_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Saturates at zero rather than underflowing; `uncover_range`'s own
    /// panic covers the caller-contract violation of uncovering a range
    /// nothing ever covered, so this never needs to.
    fn remove_mapped_region(&self) -> usize {
        let mut current = self.mapped_region_count.load(Ordering::Acquire);
        loop {
            let next = current.saturating_sub(1);
            match self.mapped_region_count.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return next,
                Err(observed) => current = observed,
            }
        }
    }

    pub fn mapped_region_count(&self) -> usize {
        self.mapped_region_count.load(Ordering::Acquire)
    }

    /// True once every slot has gone back to `Empty` (all frames for this
    /// section have been reclaimed or freed) — the condition under which
    /// `CCSpaceUncover` actually removes a directory node rather than
    /// leaving an empty husk behind.
    fn is_fully_empty(&self) -> bool {
        let pages = self.handle.pages.lock();
        pages.iter().all(|p| matches!(p, PageSlotState::Empty))
    }
}

/// The cached-section directory itself: `CCSpaceCover`/`CCSpaceUncover`'s
/// `csd` field, one per cache space.
///
/// Keyed by section-aligned start offset rather than a sorted, merged
/// interval list: because every section is exactly `SECTION_SIZE` and
/// always offset-aligned, a `BTreeMap` keyed by that offset gives
/// non-overlap (invariant I4) for free and O(log n) `find`/`cover`, which is
/// the same trade the teacher's `PageCacheManager` makes by keying its
/// `BTreeMap` on page index instead of keeping a run-length interval list.
pub struct CachedSectionDirectory {
    sections: CacheMutex<BTreeMap<u64, Arc<CachedSection>>>,
}

impl Default for CachedSectionDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl CachedSectionDirectory {
    pub fn new() -> Self {
        Self {
            sections: CacheMutex::new(BTreeMap::new()),
        }
    }

    fn section_start(offset: u64) -> u64 {
        round_down(offset, SECTION_SIZE as u64)
    }

    /// `CCFindCachedSectionContaining`: looks up the section covering
    /// `offset` without creating one.
    pub fn find(&self, offset: u64) -> Option<Arc<CachedSection>> {
        let key = Self::section_start(offset);
        self.sections.lock().get(&key).cloned()
    }

    /// `CCSpaceCover`: returns the section covering `offset`, creating a new
    /// (all-`Empty`) directory node if none exists yet. `file_size` bounds
    /// the new section's `page_count` so the tail section of a file is not
    /// over-sized past EOF.
    pub fn cover(&self, offset: u64, file_size: u64) -> Arc<CachedSection> {
        let key = Self::section_start(offset);
        let mut sections = self.sections.lock();
        sections
            .entry(key)
            .or_insert_with(|| {
                let remaining = file_size.saturating_sub(key);
                let page_count = ((remaining.min(SECTION_SIZE as u64) as usize)
                    + crate::config::PAGE_SIZE
                    - 1)
                    / crate::config::PAGE_SIZE;
                Arc::new(CachedSection::new(key, page_count.max(1).min(PAGES_PER_SECTION)))
            })
            .clone()
    }

    /// `CCSpaceUncover`: drops the directory node for `section` if it has no
    /// in-flight accessors and every page slot has gone back to `Empty`.
    /// Called after a page's last frame is reclaimed/freed, and from
    /// truncate. A no-op (not an error) if the section still holds live
    /// data or accessors, matching the original's tolerance for
    /// `CCSpaceUncover` being called speculatively.
    pub fn uncover(&self, section: &Arc<CachedSection>) {
        if section.accessor_count() != 0 || !section.is_fully_empty() {
            return;
        }
        let mut sections = self.sections.lock();
        if let Some(existing) = sections.get(&section.start) {
            if Arc::ptr_eq(existing, section) {
                sections.remove(&section.start);
            }
        }
    }

    /// `CoverRange` (spec §4.2/§6): the externally-exposed, reference-counted
    /// sibling of `cover`. Rounds `[start, end)` outward to page boundaries,
    /// ensures a directory node exists for every `SECTION_SIZE`-aligned span
    /// it intersects (creating empty ones exactly as `cover` does for a
    /// single section), then increments `mapped-region-count` on every
    /// section intersecting the rounded range.
    ///
    /// Idempotent in the sense the spec means it: calling this twice on the
    /// same range creates no duplicate nodes (sections are keyed by aligned
    /// offset, invariant I4), but it does increment the refcount twice —
    /// each call is a distinct reference that a matching `uncover_range`
    /// must release.
    pub fn cover_range(&self, start: u64, end: u64, file_size: u64) -> Result<()> {
        if end <= start {
            return_errno_with_message!(Errno::EINVAL, "cover_range requires start < end");
        }
        let page_start = round_down(start, PAGE_SIZE as u64);
        let page_end = round_up(end, PAGE_SIZE as u64);

        let mut section_start = round_down(page_start, SECTION_SIZE as u64);
        while section_start < page_end {
            self.cover(section_start, file_size.max(page_end));
            section_start += SECTION_SIZE as u64;
        }

        for section in self.sections_overlapping(page_start, page_end) {
            section.add_mapped_region();
        }
        Ok(())
    }

    /// `UncoverRange` (spec §4.2/§6): decrements `mapped-region-count` on
    /// every section intersecting `[start, end)`, rounded outward to page
    /// boundaries exactly as `cover_range` rounds them. Never removes a
    /// directory node or frees a frame itself — reclaiming a section with no
    /// remaining references is deferred to `flush`/`truncate`/`destroy` or
    /// active-section eviction, same as the plain `uncover` above.
    ///
    /// Panics if no section intersects the range at all: calling this
    /// without a matching prior `cover_range` is a caller contract
    /// violation, not a recoverable condition.
    pub fn uncover_range(&self, start: u64, end: u64) {
        let page_start = round_down(start, PAGE_SIZE as u64);
        let page_end = round_up(end, PAGE_SIZE as u64);
        let sections = self.sections_overlapping(page_start, page_end);
        assert!(
            !sections.is_empty(),
            "uncover_range called on a range with no covering section"
        );
        for section in sections {
            section.remove_mapped_region();
        }
    }

    /// Returns every section whose range overlaps `[start, end)`, in
    /// ascending offset order. Used by flush/truncate, which must visit
    /// every touched section.
    pub fn sections_overlapping(&self, start: u64, end: u64) -> Vec<Arc<CachedSection>> {
        let first_key = Self::section_start(start);
        self.sections
            .lock()
            .range(first_key..)
            .take_while(|(&key, _)| key < end)
            .map(|(_, section)| section.clone())
            .collect()
    }

    /// Removes every section whose start is `>= offset` from the directory,
    /// returning them so the caller can drain and free their frames. Used
    /// by truncate when shrinking a file past a section boundary.
    pub fn split_off_from(&self, offset: u64) -> Vec<Arc<CachedSection>> {
        let key = Self::section_start(offset);
        let mut sections = self.sections.lock();
        let tail = sections.split_off(&key);
        tail.into_values().collect()
    }

    pub fn all_sections(&self) -> Vec<Arc<CachedSection>> {
        self.sections.lock().values().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.sections.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cover_is_idempotent_and_aligned() {
        let csd = CachedSectionDirectory::new();
        let a = csd.cover(10, SECTION_SIZE as u64 * 4);
        let b = csd.cover(SECTION_SIZE as u64 - 1, SECTION_SIZE as u64 * 4);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.start, 0);
    }

    #[test]
    fn find_does_not_create() {
        let csd = CachedSectionDirectory::new();
        assert!(csd.find(0).is_none());
        assert!(csd.is_empty());
    }

    #[test]
    fn uncover_removes_only_when_empty_and_unreferenced() {
        let csd = CachedSectionDirectory::new();
        let section = csd.cover(0, SECTION_SIZE as u64);
        section.add_accessor();
        csd.uncover(&section);
        assert!(csd.find(0).is_some());
        section.remove_accessor();
        csd.uncover(&section);
        assert!(csd.find(0).is_none());
    }

    #[test]
    fn cover_range_increments_every_intersecting_section_and_creates_gaps() {
        let csd = CachedSectionDirectory::new();
        let size = SECTION_SIZE as u64 * 4;

        // Spans section 0's tail through section 1's head; neither section
        // exists yet.
        csd.cover_range(SECTION_SIZE as u64 - 16, SECTION_SIZE as u64 + 16, size)
            .unwrap();

        let s0 = csd.find(0).expect("gap section 0 must be created");
        let s1 = csd
            .find(SECTION_SIZE as u64)
            .expect("gap section 1 must be created");
        assert_eq!(s0.mapped_region_count(), 1);
        assert_eq!(s1.mapped_region_count(), 1);

        // A second call over the same range increments again rather than
        // being a no-op.
        csd.cover_range(SECTION_SIZE as u64 - 16, SECTION_SIZE as u64 + 16, size)
            .unwrap();
        assert_eq!(s0.mapped_region_count(), 2);
        assert_eq!(s1.mapped_region_count(), 2);
    }

    #[test]
    fn uncover_range_decrements_and_never_removes_the_node() {
        let csd = CachedSectionDirectory::new();
        let size = SECTION_SIZE as u64;
        csd.cover_range(0, size, size).unwrap();
        let section = csd.find(0).unwrap();
        assert_eq!(section.mapped_region_count(), 1);

        csd.uncover_range(0, size);
        assert_eq!(section.mapped_region_count(), 0);
        // `uncover_range` never frees the node itself, unlike `uncover`.
        assert!(csd.find(0).is_some());
    }

    #[test]
    #[should_panic(expected = "no covering section")]
    fn uncover_range_panics_if_nothing_covers_the_range() {
        let csd = CachedSectionDirectory::new();
        csd.uncover_range(0, SECTION_SIZE as u64);
    }

    #[test]
    fn split_off_from_returns_tail_sections() {
        let csd = CachedSectionDirectory::new();
        let size = SECTION_SIZE as u64 * 4;
        csd.cover(0, size);
        csd.cover(SECTION_SIZE as u64, size);
        csd.cover(SECTION_SIZE as u64 * 2, size);
        let tail = csd.split_off_from(SECTION_SIZE as u64);
        assert_eq!(tail.len(), 2);
        assert!(csd.find(0).is_some());
        assert!(csd.find(SECTION_SIZE as u64).is_none());
    }
}
