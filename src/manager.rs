// SPDX-License-Identifier: MPL-2.0

//! `CacheManager`: the process-wide (or, in a real kernel, system-wide)
//! owner of the active-section pool and its write-behind worker — spec
//! §6's `InitCache` followed by as many `InitCacheSpace` calls as there are
//! files.
//!
//! The spec's design notes call out that "global mutable pool state ... must
//! be passed to all operations as an explicit context rather than accessed
//! via ambient globals if the target language disfavors them" — idiomatic
//! Rust very much disfavors ambient globals, so `CacheManager` is that
//! explicit context: a value the embedding kernel constructs once at boot
//! and holds for the lifetime of the system, handing out [`CacheSpace`]s
//! from it per file the way `original_source/kernel/cache.cpp`'s
//! process-wide `CCActiveSection[M]` array and single write-behind thread
//! are implicitly shared by every `CCSpace`.

use crate::active_pool::ActiveSectionPool;
use crate::backend::CacheBackend;
use crate::cache_space::CacheSpace;
use crate::commit::{CommitAccountant, FixedBudgetAccountant};
use crate::config::CacheConfig;
use crate::frame::{FrameRef, PhysicalMemoryManager};
use crate::prelude::*;
use crate::write_behind::WriteBehindWorker;

/// A generous default commit budget for [`CacheManager::new`] callers that
/// don't yet have their own system-wide accountant wired up: enough pages
/// for every active-section slot to be bound at once with headroom to
/// spare, since commit is meant to bound concurrent binding, not to be the
/// cache's primary size limit (spec §1 Non-goals).
fn default_commit_budget(config: &CacheConfig) -> Arc<dyn CommitAccountant> {
    let pages = config.section_count * crate::config::PAGES_PER_SECTION * 4;
    Arc::new(FixedBudgetAccountant::new(pages.max(1)))
}

/// `InitCache`: owns the bounded active-section pool (and, transitively, its
/// LRU/modified lists and write-behind worker thread) shared by every
/// [`CacheSpace`] it creates.
///
/// Dropping a `CacheManager` stops its write-behind worker; this does not
/// flush any dirty data — callers are expected to `flush`/`destroy` every
/// live `CacheSpace` first (spec §4.5's `DestroyCache` contract).
pub struct CacheManager {
    pool: Arc<ActiveSectionPool>,
    commit: Arc<dyn CommitAccountant>,
    _worker: WriteBehindWorker,
}

impl CacheManager {
    /// `InitCache`: allocates the active-section pool against `config` and
    /// starts its write-behind worker, backed by `pmm` for frame allocation
    /// and reclaim and a generous built-in commit budget (see
    /// [`Self::with_commit_accountant`] to supply the host's own).
    pub fn new(config: CacheConfig, pmm: Arc<dyn PhysicalMemoryManager>) -> Arc<Self> {
        let commit = default_commit_budget(&config);
        Self::with_commit_accountant(config, pmm, commit)
    }

    /// Like [`Self::new`], but delegates commit reservation to a
    /// host-supplied [`CommitAccountant`] instead of this crate's built-in
    /// fixed-budget default.
    pub fn with_commit_accountant(
        config: CacheConfig,
        pmm: Arc<dyn PhysicalMemoryManager>,
        commit: Arc<dyn CommitAccountant>,
    ) -> Arc<Self> {
        let frame_ref = Arc::new(FrameRef::new(pmm));
        let pool = ActiveSectionPool::new(config, frame_ref);
        let worker = WriteBehindWorker::spawn(pool.clone());
        Arc::new(Self {
            pool,
            commit,
            _worker: worker,
        })
    }

    /// `InitCacheSpace(cache)`: creates a fresh, empty cache for one file,
    /// sharing this manager's pool and commit accountant.
    pub fn init_cache_space(&self, backend: Arc<dyn CacheBackend>) -> CacheSpace {
        CacheSpace::new(self.pool.clone(), backend, self.commit.clone())
    }

    pub fn pool(&self) -> &Arc<ActiveSectionPool> {
        &self.pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::{AccessBuffer, AccessEngine, AccessFlags};
    use crate::sim::SimplePmm;
    use crate::test_support::MemoryBackend;

    #[test]
    fn init_cache_space_shares_the_pool_across_spaces() {
        let manager = CacheManager::new(CacheConfig::new(4), Arc::new(SimplePmm::new(256)));
        let a = manager.init_cache_space(Arc::new(MemoryBackend::zeroed(4096)));
        let b = manager.init_cache_space(Arc::new(MemoryBackend::zeroed(4096)));
        assert!(Arc::ptr_eq(a.pool(), b.pool()));
    }

    #[test]
    fn read_through_a_manager_created_space_round_trips() {
        let manager = CacheManager::new(CacheConfig::new(4), Arc::new(SimplePmm::new(256)));
        let backend = Arc::new(MemoryBackend::new(b"hello world".to_vec()));
        let space = manager.init_cache_space(backend);

        let mut buf = vec![0u8; 11];
        AccessEngine::access(
            &space,
            0,
            11,
            AccessBuffer::Read(&mut buf),
            AccessFlags::READ,
            None,
        )
        .unwrap();
        assert_eq!(&buf, b"hello world");
    }
}
