// SPDX-License-Identifier: MPL-2.0

//! The page-frame reference adapter (PFR, spec §4.1) and the page-frame
//! state machine it mediates.
//!
//! Grounded on `framework/aster-frame/src/vm/frame.rs`'s `VmFrame`: a small,
//! `Arc`-backed, cheaply-cloned handle to a physical page. The teacher's
//! `VmFrame` wraps a bare physical address backed by a global frame
//! allocator; here the handle additionally carries the bookkeeping the
//! cache itself needs from the page-frame database (state, reference count,
//! and the `cache-reference` back-pointer used by the standby-reclaim
//! protocol), since the physical memory manager is an external collaborator
//! this crate only consumes through the [`PhysicalMemoryManager`] trait.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use crate::config::PAGE_SIZE;
use crate::directory::CachedSectionHandle;
use crate::prelude::*;

static NEXT_FRAME_ID: AtomicU64 = AtomicU64::new(1);

/// The subset of the page-frame state machine this cache observes.
///
/// `Unusable`, `Bad`, `Zeroed`, and `Free` are states owned entirely by the
/// physical memory manager; the cache never sees a frame in those states.
/// It only ever holds frames that are `Active` (pinned by at least one
/// mapping) or `Standby` (reclaimable, but still reachable through exactly
/// one [`CachedSection`](crate::directory::CachedSection) slot).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageFrameState {
    Unusable,
    Bad,
    Zeroed,
    Free,
    Standby,
    Active,
}

/// A weak back-pointer from a physical frame to the exact
/// `CachedSection` slot it is reachable from (spec: "critical for the
/// standby-reclaim protocol").
///
/// This is the safe-Rust equivalent of the original's raw
/// `uintptr_t *cacheReference` pointing into `CCCachedSection::data`: a weak
/// handle plus an index, cleared by [`CacheSlotRef::clear`] under the
/// page-frame lock before the PMM hands the reclaimed frame to a new
/// allocation (spec invariant I6, testable property B4).
#[derive(Clone)]
pub struct CacheSlotRef {
    section: Weak<CachedSectionHandle>,
    page_index: usize,
}

impl CacheSlotRef {
    pub(crate) fn new(section: &Arc<CachedSectionHandle>, page_index: usize) -> Self {
        Self {
            section: Arc::downgrade(section),
            page_index,
        }
    }

    /// Clears the referring CSD slot, if the section it belongs to still
    /// exists. Called by the reference PMM under its page-frame lock,
    /// immediately before a standby frame is handed to a new allocation.
    pub fn clear(&self) {
        if let Some(section) = self.section.upgrade() {
            section.clear_slot(self.page_index);
        }
    }
}

struct FrameInner {
    id: u64,
    data: crate::sync::SpinLock<Vec<u8>>,
    state: crate::sync::SpinLock<PageFrameState>,
    references: AtomicUsize,
    cache_reference: crate::sync::SpinLock<Option<CacheSlotRef>>,
}

/// A handle to a physical page frame.
///
/// Cloning a `PageFrame` is cheap and yields a handle to the *same*
/// physical page (like `VmFrame`, the teacher's equivalent); the page is
/// only actually freed once every clone and every `cache-reference` pointing
/// at it are gone, which this crate enforces structurally (the last owner
/// calls [`PhysicalMemoryManager::free_frame`] explicitly rather than
/// relying on `Drop`, matching the original's explicit `MMPhysicalFree`).
#[derive(Clone)]
pub struct PageFrame {
    inner: Arc<FrameInner>,
}

impl PageFrame {
    pub(crate) fn new(state: PageFrameState) -> Self {
        Self {
            inner: Arc::new(FrameInner {
                id: NEXT_FRAME_ID.fetch_add(1, Ordering::Relaxed),
                data: crate::sync::SpinLock::new(vec![0u8; PAGE_SIZE]),
                state: crate::sync::SpinLock::new(state),
                references: AtomicUsize::new(0),
                cache_reference: crate::sync::SpinLock::new(None),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn state(&self) -> PageFrameState {
        *self.inner.state.lock()
    }

    pub(crate) fn set_state(&self, state: PageFrameState) {
        *self.inner.state.lock() = state;
    }

    pub fn references(&self) -> usize {
        self.inner.references.load(Ordering::Acquire)
    }

    pub(crate) fn add_reference(&self) -> usize {
        self.inner.references.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn remove_reference(&self) -> usize {
        self.inner.references.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub(crate) fn set_cache_reference(&self, slot: Option<CacheSlotRef>) {
        *self.inner.cache_reference.lock() = slot;
    }

    pub(crate) fn cache_reference(&self) -> Option<CacheSlotRef> {
        self.inner.cache_reference.lock().clone()
    }

    pub fn zero(&self) {
        self.inner.data.lock().fill(0);
    }

    /// Zeroes `len` bytes starting at `offset`, clamped to the page.
    pub fn zero_range(&self, offset: usize, len: usize) {
        let mut data = self.inner.data.lock();
        let end = (offset + len).min(PAGE_SIZE);
        if offset < end {
            data[offset..end].fill(0);
        }
    }

    pub fn read_at(&self, offset: usize, buf: &mut [u8]) {
        let data = self.inner.data.lock();
        let len = buf.len().min(PAGE_SIZE.saturating_sub(offset));
        buf[..len].copy_from_slice(&data[offset..offset + len]);
    }

    pub fn write_at(&self, offset: usize, buf: &[u8]) {
        let mut data = self.inner.data.lock();
        let len = buf.len().min(PAGE_SIZE.saturating_sub(offset));
        data[offset..offset + len].copy_from_slice(&buf[..len]);
    }

    /// Copies this frame's full contents into `dst` (used when publishing a
    /// freshly-allocated frame for a to-load page, and when copying pages
    /// through the active section window).
    pub fn copy_into(&self, dst: &mut [u8]) {
        self.read_at(0, dst);
    }

    pub fn copy_from_slice(&self, src: &[u8]) {
        self.write_at(0, src);
    }
}

impl PartialEq for PageFrame {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
impl Eq for PageFrame {}

impl std::fmt::Debug for PageFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageFrame")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .field("references", &self.references())
            .finish()
    }
}

/// The page-frame reference adapter (PFR): the narrow surface the cache
/// uses to pin, activate, and reclaim frames. Backed by an external
/// [`PhysicalMemoryManager`] (spec §4.1's "page-frame database").
pub struct FrameRef {
    pmm: Arc<dyn PhysicalMemoryManager>,
}

impl FrameRef {
    pub fn new(pmm: Arc<dyn PhysicalMemoryManager>) -> Self {
        Self { pmm }
    }

    /// Transitions a standby/free/zeroed frame to `Active` with
    /// `references = 0`, unlinking it from the PMM's own lists.
    pub fn activate(&self, frame: &PageFrame) {
        self.pmm.activate(frame);
    }

    /// Allocates a brand new `Active` frame with `references = 0`.
    pub fn allocate_frame(&self) -> Result<PageFrame> {
        self.pmm.allocate()
    }

    /// Returns a frame to the PMM. The cache calls this only once a frame's
    /// `references` has dropped to zero and no CSD slot refers to it
    /// (during truncate/destroy or after a failed load).
    pub fn free_frame(&self, frame: PageFrame) {
        self.pmm.free(frame);
    }

    /// See [`PhysicalMemoryManager::available_pages`].
    pub fn available_pages(&self) -> usize {
        self.pmm.available_pages()
    }
}

/// The external physical memory manager interface this cache depends on
/// (spec §4.1, §6). A real kernel implements this against its own frame
/// allocator; [`crate::sim::SimplePmm`] is a minimal in-memory reference
/// implementation used by this crate's own tests, with real
/// `FREE`/`ZEROED`/`STANDBY`/`ACTIVE` transitions and the standby-reclaim
/// protocol (clearing a reclaimed frame's `cache-reference` before handing
/// it to a new allocation — spec invariant I6, testable property B4).
pub trait PhysicalMemoryManager: Send + Sync {
    /// Transitions `frame` from `Free`/`Zeroed`/`Standby` to `Active` with
    /// `references = 0`, unlinking it from whatever list it was on.
    fn activate(&self, frame: &PageFrame);

    /// Returns a new `Active` frame with `references = 0`. May reclaim a
    /// standby frame, in which case its `cache-reference` slot is cleared
    /// before this call returns (see [`CacheSlotRef::clear`]).
    fn allocate(&self) -> Result<PageFrame>;

    /// Returns `frame` to the free pool (or the standby list, depending on
    /// whether the frame is zeroed and whether a cache reference remains).
    fn free(&self, frame: PageFrame);

    /// Approximate count of frames reclaimable without disturbing a live
    /// mapping (free + standby). The write-behind worker (spec §4.6) reads
    /// this to decide whether memory pressure is low enough to delay
    /// draining the modified list. Defaults to "never under pressure" for
    /// hosts that don't model this.
    fn available_pages(&self) -> usize {
        usize::MAX
    }
}
