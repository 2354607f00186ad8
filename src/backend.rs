// SPDX-License-Identifier: MPL-2.0

//! The backing-store collaborator (spec §6): whatever actually stores a
//! cached file's bytes (a filesystem driver, a block device, a network
//! share).
//!
//! Grounded on `aster-nix`'s `PageCacheBackend` trait in
//! `fs/utils/page_cache.rs`, which this crate's `CacheBackend` mirrors
//! closely: a `read_page`/`write_page`-shaped pair of methods plus an
//! `npages` size query, generalized from single-page calls to the
//! coalesced multi-page ranges `original_source/kernel/cache.cpp`'s
//! `CCSpaceAccess` issues in one I/O per contiguous run of to-load pages.

use crate::prelude::*;

/// The storage behind one cache space. All methods take byte ranges
/// page-aligned by the caller; a backend only needs to move bytes, not
/// understand the cache's page-frame or section bookkeeping.
pub trait CacheBackend: Send + Sync {
    /// Reads `buf.len()` bytes starting at `offset` from backing storage
    /// into `buf`. `buf.len()` is always a multiple of the page size except
    /// for the last page of a file, which may be short (the remainder is
    /// left zeroed by the caller).
    fn read_backing(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Writes `buf` to backing storage at `offset`. Called by
    /// `CCWriteSection`-equivalent write-behind, one coalesced call per
    /// contiguous run of modified pages.
    fn write_backing(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Current size of the backing object in bytes, used to bound reads and
    /// to size the tail section of a file (spec §4.2).
    fn size(&self) -> u64;
}
