// SPDX-License-Identifier: MPL-2.0

//! `CacheSpace`: one cached file (or other backing object), tying together
//! its directory, its share of the active-section pool, and its backend.
//!
//! Grounded on `CCSpace` in `original_source/kernel/cache.cpp` and on
//! `aster-nix`'s `PageCache`, which plays the same role of bundling a
//! backend with the manager that caches its pages. `CCSpaceFlush`,
//! `CCSpaceTruncate`, and `CCSpaceDestroy` are ported page-for-page, just
//! against this crate's `CachedSectionDirectory`/`ActiveSectionPool` rather
//! than the original's raw AVL-tree `csd` and fixed C array of active
//! sections.

use crate::active_pool::ActiveSectionPool;
use crate::backend::CacheBackend;
use crate::commit::CommitAccountant;
use crate::config::PAGE_SIZE;
use crate::directory::{CachedSectionDirectory, PageSlotState};
use crate::prelude::*;

/// One cached file. Holds its own directory but shares the
/// [`ActiveSectionPool`] (and therefore the LRU/modified lists, and the
/// write-behind worker) with every other `CacheSpace` created from the same
/// [`crate::manager::CacheManager`], exactly as the original's single
/// system-wide active-section array is shared by every `CCSpace`.
pub struct CacheSpace {
    directory: CachedSectionDirectory,
    pool: Arc<ActiveSectionPool>,
    backend: Arc<dyn CacheBackend>,
    commit: Arc<dyn CommitAccountant>,
}

impl CacheSpace {
    pub(crate) fn new(
        pool: Arc<ActiveSectionPool>,
        backend: Arc<dyn CacheBackend>,
        commit: Arc<dyn CommitAccountant>,
    ) -> Self {
        Self {
            directory: CachedSectionDirectory::new(),
            pool,
            backend,
            commit,
        }
    }

    pub fn directory(&self) -> &CachedSectionDirectory {
        &self.directory
    }

    pub fn pool(&self) -> &Arc<ActiveSectionPool> {
        &self.pool
    }

    pub fn backend(&self) -> &Arc<dyn CacheBackend> {
        &self.backend
    }

    pub fn commit(&self) -> &Arc<dyn CommitAccountant> {
        &self.commit
    }

    /// `CoverRange` (spec §6): establishes an external reference on every
    /// directory node covering `[start, end)`, e.g. to keep a memory-mapped
    /// file's pages reachable through the directory for as long as the
    /// mapping exists, independent of whether any `access()` is currently
    /// in flight. Must be paired with a later `uncover_range` over the same
    /// range.
    pub fn cover_range(&self, start: u64, end: u64) -> Result<()> {
        let file_size = self.backend.size();
        self.directory.cover_range(start, end, file_size.max(end))
    }

    /// `UncoverRange` (spec §6): releases a reference previously
    /// established by `cover_range`. Frees nothing by itself; a section
    /// whose `mapped-region-count` reaches zero is reclaimed the same way
    /// as any other unreferenced section, by `flush`/`truncate`/`destroy`
    /// or active-section eviction.
    pub fn uncover_range(&self, start: u64, end: u64) {
        self.directory.uncover_range(start, end);
    }

    /// `CCSpaceFlush`: writes every dirty page currently cached for this
    /// space back to the backend, synchronously. Unlike write-behind (which
    /// drains the pool-wide modified list in arrival order), flush only
    /// touches sections belonging to this space.
    pub fn flush(&self) -> Result<()> {
        let mut first_error = None;
        for section in self.directory.all_sections() {
            let Some(active) = self.pool.lookup_bound(&section) else {
                continue;
            };
            if let Err(e) = crate::write_behind::write_section_prepare_and_write(self, &active) {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// `CCSpaceTruncate`: discards every cached page at or beyond
    /// `new_size`. Sections entirely past `new_size` are removed from the
    /// directory and evicted from the pool; a section straddling the new
    /// boundary keeps its directory node but has its tail pages cleared.
    ///
    /// Per spec invariant I9 (preserved from the original, see
    /// `DESIGN.md`), truncating a section that is mid-load is not
    /// supported here and panics rather than silently corrupting state —
    /// callers must ensure no load is in flight for the truncated range,
    /// e.g. by holding the file's own higher-level size lock.
    pub fn truncate(&self, new_size: u64) -> Result<()> {
        let boundary_section_start = crate::config::round_down(new_size, crate::config::SECTION_SIZE as u64);

        for removed in self.directory.split_off_from(boundary_section_start + crate::config::SECTION_SIZE as u64) {
            self.evict_section(&removed);
        }

        if let Some(boundary) = self.directory.find(boundary_section_start) {
            let active = self.pool.lookup_bound(&boundary);
            assert!(
                !active.as_ref().is_some_and(|a| a.is_loading()),
                "truncate raced with an in-flight load of the boundary section"
            );
            let offset_in_section = (new_size - boundary_section_start) as usize;
            let straddling_page = offset_in_section / PAGE_SIZE;
            let straddling_page_offset = offset_in_section % PAGE_SIZE;
            let first_discarded_page = if straddling_page_offset == 0 {
                straddling_page
            } else {
                straddling_page + 1
            };
            // Zero/free at the CSD-slot level, not gated on `active` being
            // `Some`: a section that has been evicted to standby still has
            // `Present` slots in its `CachedSection`, and those are exactly
            // what a later re-`cover` + read would see if left untouched
            // (P7).
            //
            // P7/scenario 5: the page straddling `new_size` keeps its
            // leading bytes but has `[new_size mod page-size, page-size)`
            // zeroed, rather than being discarded outright.
            if straddling_page_offset != 0 {
                if let PageSlotState::Present(frame) = boundary.page_slot(straddling_page) {
                    frame.zero_range(straddling_page_offset, PAGE_SIZE - straddling_page_offset);
                }
            }
            // `Dereference(S, start=first_discarded_page)` (spec §4.3): free
            // each discarded page's frame, then clear both the directory's
            // own slot and (if bound) this binding's frame/bitmap entries,
            // so no stale `Present` slot nor stale `referenced`/`modified`
            // bit survives the truncate regardless of pool binding.
            for page_index in first_discarded_page..boundary.page_count {
                if let PageSlotState::Present(frame) = boundary.page_slot(page_index) {
                    frame.set_cache_reference(None);
                    self.pool.frame_ref().free_frame(frame);
                }
                boundary.clear_page_slot(page_index);
            }
            if let Some(active) = &active {
                active.dereference_from(first_discarded_page);
            }
            if first_discarded_page == 0 {
                self.evict_section(&boundary);
            }
        }
        Ok(())
    }

    /// `CCSpaceDestroy`: flushes, then evicts every section this space
    /// still owns from the pool, freeing their frames. Called once the
    /// higher-level file object this space backs is being closed for good.
    pub fn destroy(&self) -> Result<()> {
        self.flush()?;
        for section in self.directory.split_off_from(0) {
            self.evict_section(&section);
        }
        Ok(())
    }

    /// Frees every frame still reachable through `section`'s CSD slots and
    /// clears those slots, whether or not `section` currently has a pool
    /// binding. A section evicted to standby keeps its `Present` slots (spec
    /// §4.3: eviction only unbinds from the pool, it does not touch the
    /// frames), so this must walk `section.page_slot` directly rather than
    /// go through `ActiveSection::frame_at` — the latter is `None` for an
    /// unbound section even though its frames are still live.
    fn evict_section(&self, section: &Arc<crate::directory::CachedSection>) {
        if let Some(active) = self.pool.lookup_bound(section) {
            assert!(
                !active.is_loading() && !active.is_writing(),
                "evicting a section with an in-flight load or write"
            );
            active.dereference_from(0);
            self.pool.evict(&active);
        }
        for page_index in 0..section.page_count {
            if let PageSlotState::Present(frame) = section.page_slot(page_index) {
                frame.set_cache_reference(None);
                self.pool.frame_ref().free_frame(frame);
            }
            section.clear_page_slot(page_index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::{AccessBuffer, AccessEngine, AccessFlags};
    use crate::active_pool::ActiveSectionPool;
    use crate::commit::FixedBudgetAccountant;
    use crate::config::{CacheConfig, SECTION_SIZE};
    use crate::directory::PageSlotState;
    use crate::frame::FrameRef;
    use crate::sim::SimplePmm;
    use crate::test_support::MemoryBackend;

    fn make_space(file_size: usize) -> (CacheSpace, Arc<MemoryBackend>) {
        let pmm = Arc::new(SimplePmm::new(4096));
        let frame_ref = Arc::new(FrameRef::new(pmm));
        let pool = ActiveSectionPool::new(CacheConfig::new(8), frame_ref);
        let backend = Arc::new(MemoryBackend::zeroed(file_size));
        let commit = Arc::new(FixedBudgetAccountant::new(1 << 20));
        let space = CacheSpace::new(pool, backend.clone(), commit);
        (space, backend)
    }

    /// Scenario 5: truncating mid-page zeroes the straddling page's tail,
    /// frees pages fully past the new size, and never writes back the
    /// truncated (dirty) bytes.
    #[test]
    fn scenario_truncate_during_dirty_state() {
        let (space, backend) = make_space(512 * 1024);
        AccessEngine::access(
            &space,
            0,
            200 * 1024,
            AccessBuffer::Write(&vec![0xABu8; 200 * 1024]),
            AccessFlags::WRITE,
            None,
        )
        .unwrap();

        let new_size = 100 * 1024 + 50;
        space.truncate(new_size).unwrap();

        assert_eq!(backend.write_count(), 0, "truncate must not flush discarded dirty pages");

        let section = space.directory().find(0).unwrap();
        let active = space.pool().lookup_bound(&section).unwrap();

        // Page 25 (bytes 102400..106496) straddles the new size at byte 50
        // into the page: the leading 50 bytes survive, the rest is zero.
        let mut straddling = [0u8; PAGE_SIZE];
        active.frame_at(25).unwrap().read_at(0, &mut straddling);
        assert!(straddling[..50].iter().all(|&b| b == 0xAB));
        assert!(straddling[50..].iter().all(|&b| b == 0));

        // Every page fully past the new size is gone from both the
        // per-binding frame array and the directory's own slot.
        for page_index in 26..section.page_count {
            assert!(active.frame_at(page_index).is_none());
            assert!(matches!(section.page_slot(page_index), PageSlotState::Empty));
        }
    }

    /// P6-adjacent: two flushes with no intervening writes issue zero
    /// `write_backing` calls on the second.
    #[test]
    fn flush_twice_is_a_noop_the_second_time() {
        let (space, backend) = make_space(SECTION_SIZE);
        AccessEngine::access(
            &space,
            0,
            16,
            AccessBuffer::Write(&[1u8; 16]),
            AccessFlags::WRITE,
            None,
        )
        .unwrap();
        space.flush().unwrap();
        let after_first = backend.write_count();
        assert_eq!(after_first, 1);
        space.flush().unwrap();
        assert_eq!(backend.write_count(), after_first);
    }

    /// Regression: a section evicted to standby by pool pressure (unbound,
    /// `CachedSection` slots still `Present`) must still have its frames
    /// freed and slots zeroed by `truncate`/`destroy`, not just sections
    /// that happen to still be pool-bound.
    #[test]
    fn truncate_frees_frames_of_sections_evicted_to_standby() {
        // A two-slot pool covering a four-section file: binding sections 2
        // and 3 evicts sections 0 and 1 to standby while leaving their CSD
        // slots `Present`.
        let pmm = Arc::new(SimplePmm::new(4096));
        let frame_ref = Arc::new(FrameRef::new(pmm.clone()));
        let pool = ActiveSectionPool::new(CacheConfig::new(2), frame_ref);
        let file_size = SECTION_SIZE * 4;
        let backend = Arc::new(MemoryBackend::zeroed(file_size));
        let commit = Arc::new(FixedBudgetAccountant::new(1 << 20));
        let space = CacheSpace::new(pool, backend.clone(), commit);

        let mut buf = vec![0u8; file_size];
        AccessEngine::access(
            &space,
            0,
            file_size,
            AccessBuffer::Read(&mut buf),
            AccessFlags::READ,
            None,
        )
        .unwrap();

        let first_section = space.directory().find(0).unwrap();
        assert!(
            space.pool().lookup_bound(&first_section).is_none(),
            "section 0 should have been evicted to standby by pool pressure"
        );
        assert!(matches!(first_section.page_slot(0), PageSlotState::Present(_)));

        let free_before = pmm.free_count();
        space.truncate(0).unwrap();

        assert!(space.directory().find(0).is_none());
        assert!(
            pmm.free_count() > free_before,
            "truncate must free the standby section's frames back to the PMM"
        );
    }

    /// Regression, straddling-boundary variant: truncating to a size whose
    /// boundary section is currently in standby (evicted, unbound) must
    /// still zero the straddling page's tail, so a later re-`cover` + read
    /// never observes stale bytes (P7).
    #[test]
    fn truncate_zeroes_standby_boundary_section_tail() {
        let pmm = Arc::new(SimplePmm::new(4096));
        let frame_ref = Arc::new(FrameRef::new(pmm));
        let pool = ActiveSectionPool::new(CacheConfig::new(1), frame_ref);
        let file_size = SECTION_SIZE * 2;
        let backend = Arc::new(MemoryBackend::zeroed(file_size));
        let commit = Arc::new(FixedBudgetAccountant::new(1 << 20));
        let space = CacheSpace::new(pool, backend.clone(), commit);

        AccessEngine::access(
            &space,
            0,
            PAGE_SIZE,
            AccessBuffer::Write(&[0xCDu8; PAGE_SIZE]),
            AccessFlags::WRITE,
            None,
        )
        .unwrap();
        space.flush().unwrap();

        // Binding section 1 (single-slot pool) evicts section 0 to standby,
        // but its page-0 slot is still `Present` with the bytes just
        // written.
        let mut scratch = [0u8; 16];
        AccessEngine::access(
            &space,
            SECTION_SIZE as u64,
            16,
            AccessBuffer::Read(&mut scratch),
            AccessFlags::READ,
            None,
        )
        .unwrap();
        let section0 = space.directory().find(0).unwrap();
        assert!(space.pool().lookup_bound(&section0).is_none());
        assert!(matches!(section0.page_slot(0), PageSlotState::Present(_)));

        space.truncate(50).unwrap();

        let PageSlotState::Present(frame) = section0.page_slot(0) else {
            panic!("page 0 must survive truncate to 50 bytes");
        };
        let mut tail = [0u8; PAGE_SIZE];
        frame.read_at(0, &mut tail);
        assert!(tail[..50].iter().all(|&b| b == 0xCD));
        assert!(tail[50..].iter().all(|&b| b == 0));
    }

    /// `DestroyCache`: every present frame is freed and the directory ends
    /// up empty.
    #[test]
    fn destroy_flushes_and_frees_every_frame() {
        let (space, backend) = make_space(SECTION_SIZE * 2);
        AccessEngine::access(
            &space,
            0,
            16,
            AccessBuffer::Write(&[7u8; 16]),
            AccessFlags::WRITE,
            None,
        )
        .unwrap();
        let mut scratch = [0u8; 16];
        AccessEngine::access(
            &space,
            SECTION_SIZE as u64,
            16,
            AccessBuffer::Read(&mut scratch),
            AccessFlags::READ,
            None,
        )
        .unwrap();

        space.destroy().unwrap();

        assert_eq!(backend.write_count(), 1, "destroy must flush dirty data first");
        assert!(space.directory().is_empty());
    }
}
