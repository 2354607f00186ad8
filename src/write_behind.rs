// SPDX-License-Identifier: MPL-2.0

//! The write-behind worker (spec §4.6): a dedicated thread that drains the
//! active-section pool's modified list, plus the `WriteSectionPrepare`/
//! `WriteSection` pair it shares with the access engine's `WRITE_BACK` path
//! and `CacheSpace::flush`.
//!
//! Grounded on `CCWriteBehindThread`, `CCWriteSectionPrepare`, and
//! `CCWriteSection` in `original_source/kernel/cache.cpp`: wait for the
//! modified list to become non-empty, defer briefly under low memory
//! pressure, then pop sections front-to-back, writing each one's dirty pages
//! in coalesced runs and releasing the pool lock across the I/O call.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::active_pool::{ActiveSection, ActiveSectionPool};
use crate::cache_space::CacheSpace;
use crate::config::PAGE_SIZE;
use crate::prelude::*;

/// How often the worker re-checks for shutdown while parked on
/// `modified-non-empty`; purely an implementation detail of the `std`-backed
/// wait (a real kernel thread would instead be woken directly at shutdown).
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// `CCWriteSectionPrepare`: takes `active` out of the "idle, dirty" state
/// and into "being written": a synthetic accessor keeps it from being
/// rebound or evicted, and `writing` makes any racing `WRITE` access wait on
/// `write-complete` (spec §4.4 step 2) rather than touch bytes concurrently
/// with the backend call below.
///
/// Callers must have already removed `active` from the modified list
/// (`ActiveSectionPool::pop_modified_front`, or simply never placed it there
/// because it is being flushed directly off the LRU/bound state).
pub(crate) fn write_section_prepare(active: &Arc<ActiveSection>) {
    active.add_accessor();
    active.begin_write();
}

/// `CCWriteSection`: writes every currently-dirty page of `active` to its
/// backend in coalesced contiguous runs, then zeroes the dirty bitmap,
/// signals `write-complete`, and returns the section to the LRU list if the
/// synthetic accessor from [`write_section_prepare`] was the last one
/// outstanding.
///
/// Per the open question recorded in `DESIGN.md`, the dirty bitmap is
/// cleared once the write is attempted regardless of outcome: a failed
/// write leaves the bytes in cache (not lost) but relying on the backend's
/// own error propagation, not a re-armed dirty bit, to signal the failure
/// upward.
pub(crate) fn write_section(pool: &ActiveSectionPool, active: &Arc<ActiveSection>) -> Result<()> {
    let dirty_pages = active.take_modified_pages();
    let result = write_dirty_runs(active, &dirty_pages);

    active.finish_write();
    let remaining = active.remove_accessor();
    if remaining == 0 {
        pool.return_to_lists(active);
    }
    result
}

/// Convenience used by [`CacheSpace::flush`] and the `WRITE_BACK` access
/// flag: prepares and writes `active` in one call, skipping the I/O
/// entirely if it turns out to carry no dirty pages (e.g. a `WRITE_BACK`
/// request that only read, or a section another thread already flushed).
pub(crate) fn write_section_prepare_and_write(
    space: &CacheSpace,
    active: &Arc<ActiveSection>,
) -> Result<()> {
    if !active.any_modified() {
        return Ok(());
    }
    write_section_prepare(active);
    write_section(space.pool(), active)
}

/// Entry point for the access engine's `WRITE_BACK` (non-`PRECISE`) path:
/// kicks an immediate write-behind pass for `active` instead of leaving it
/// for the worker thread.
pub(crate) fn write_section_now(space: &CacheSpace, active: &Arc<ActiveSection>) -> Result<()> {
    write_section_prepare_and_write(space, active)
}

fn write_dirty_runs(active: &Arc<ActiveSection>, pages: &[usize]) -> Result<()> {
    let section_start = active.section.start;
    let mut i = 0;
    while i < pages.len() {
        let mut j = i + 1;
        while j < pages.len() && pages[j] == pages[j - 1] + 1 {
            j += 1;
        }
        let run = &pages[i..j];
        let run_start = section_start + (run[0] * PAGE_SIZE) as u64;
        let mut buf = vec![0u8; run.len() * PAGE_SIZE];
        for (k, &page_index) in run.iter().enumerate() {
            let frame = active
                .frame_at(page_index)
                .expect("modified page has no frame bound");
            frame.copy_into(&mut buf[k * PAGE_SIZE..(k + 1) * PAGE_SIZE]);
        }
        active.backend.write_backing(run_start, &buf)?;
        i = j;
    }
    Ok(())
}

/// The write-behind worker thread itself: a `page-generator` in spec terms
/// (exempt from the critical-pages back-pressure ordinary accessors wait
/// on), spawned once per [`ActiveSectionPool`] and shut down when its
/// handle is dropped.
pub struct WriteBehindWorker {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl WriteBehindWorker {
    pub fn spawn(pool: Arc<ActiveSectionPool>) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let worker_shutdown = shutdown.clone();
        let handle = std::thread::Builder::new()
            .name("cache-write-behind".to_string())
            .spawn(move || run(pool, worker_shutdown))
            .expect("failed to spawn write-behind worker thread");
        Self {
            shutdown,
            handle: Some(handle),
        }
    }
}

impl Drop for WriteBehindWorker {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run(pool: Arc<ActiveSectionPool>, shutdown: Arc<AtomicBool>) {
    trace!("write-behind worker started");
    loop {
        if shutdown.load(Ordering::Acquire) {
            break;
        }
        if !pool.modified_non_empty.wait_timeout(SHUTDOWN_POLL_INTERVAL) {
            continue;
        }

        // Step 2 of spec §4.6: under ample memory, give dirty pages a
        // little longer to coalesce with further writes before draining.
        // `available_pages` defaults to `usize::MAX` for hosts that don't
        // model pressure, so this delay is skipped unless a real PMM says
        // otherwise (see DESIGN.md).
        if !shutdown.load(Ordering::Acquire)
            && pool.frame_ref().available_pages() > pool.config().low_available_threshold
        {
            std::thread::sleep(pool.config().write_behind_delay);
        }

        while let Some(active) = pool.pop_modified_front() {
            write_section_prepare(&active);
            if let Err(err) = write_section(&pool, &active) {
                warn!(
                    "write-behind: write_backing failed for section at offset {}: {}",
                    active.section.start, err
                );
            }
            if shutdown.load(Ordering::Acquire) {
                break;
            }
        }
    }
    trace!("write-behind worker stopped");
}
