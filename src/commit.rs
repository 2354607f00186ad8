// SPDX-License-Identifier: MPL-2.0

//! The commit accountant (spec §6): the system-wide memory accounting
//! authority that the cache must ask before pinning new pages and must
//! notify when it releases them.
//!
//! A real kernel's commit/overcommit accounting lives far outside any one
//! subsystem; this crate only needs the narrow `reserve`/`release` contract
//! `original_source/kernel/cache.cpp` calls through `MMCommit`/`MMDecommit`
//! before/after `MMPhysicalAllocate`/`MMPhysicalFree`. Grounded the same way
//! `aster-nix` treats its VM allocator (`FrameAllocOptions`) as an opaque
//! collaborator it calls but does not implement.

use crate::prelude::*;

/// Tracks how many page-sized commitments this cache currently holds
/// against a system-wide budget.
pub trait CommitAccountant: Send + Sync {
    /// Reserves `pages` page-sized commitments. `Err(ENOMEM)` if the
    /// request would exceed the accountant's budget; the cache must not
    /// allocate frames it failed to reserve commit for.
    fn reserve(&self, pages: usize) -> Result<()>;

    /// Releases `pages` previously-reserved commitments.
    fn release(&self, pages: usize);

    /// Blocks the calling thread until system memory pressure is not
    /// "critical" (spec §4.4 Preconditions: "If pressure is critical and the
    /// current thread is not marked a page-generator, the engine waits on
    /// `available-not-critical` before proceeding"). `is_page_generator`
    /// lets an exempt caller (the write-behind worker) skip the wait.
    ///
    /// Default: never blocks. Real pressure signalling is owned by the
    /// commit accountant itself, an external collaborator this crate only
    /// consumes (spec §1); a host without one should let accessors proceed.
    fn wait_until_not_critical(&self, is_page_generator: bool) {
        let _ = is_page_generator;
    }
}

/// A simple in-memory accountant bounded by a fixed page budget, used by
/// this crate's own tests and as a default for hosts that don't yet have
/// their own accounting in place.
pub struct FixedBudgetAccountant {
    budget: std::sync::atomic::AtomicUsize,
}

impl FixedBudgetAccountant {
    pub fn new(total_pages: usize) -> Self {
        Self {
            budget: std::sync::atomic::AtomicUsize::new(total_pages),
        }
    }

    pub fn available(&self) -> usize {
        self.budget.load(std::sync::atomic::Ordering::Acquire)
    }
}

impl CommitAccountant for FixedBudgetAccountant {
    fn reserve(&self, pages: usize) -> Result<()> {
        use std::sync::atomic::Ordering;
        let mut current = self.budget.load(Ordering::Acquire);
        loop {
            if current < pages {
                return_errno_with_message!(Errno::ENOMEM, "commit budget exhausted");
            }
            match self.budget.compare_exchange_weak(
                current,
                current - pages,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(observed) => current = observed,
            }
        }
    }

    fn release(&self, pages: usize) {
        self.budget
            .fetch_add(pages, std::sync::atomic::Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_and_release_round_trip() {
        let accountant = FixedBudgetAccountant::new(4);
        accountant.reserve(3).unwrap();
        assert_eq!(accountant.available(), 1);
        accountant.release(3);
        assert_eq!(accountant.available(), 4);
    }

    #[test]
    fn reserve_fails_past_budget() {
        let accountant = FixedBudgetAccountant::new(2);
        assert!(accountant.reserve(3).is_err());
        assert_eq!(accountant.available(), 2);
    }
}
