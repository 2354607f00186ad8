// SPDX-License-Identifier: MPL-2.0

//! Tunable constants, grouped into a `CacheConfig` so a host kernel can
//! override them per [`crate::active_pool::ActiveSectionPool`] instance
//! rather than relying on process-wide globals.

use std::time::Duration;

/// Default page size. Real kernels fix this at boot from the architecture;
/// here it is a plain constant since this crate owns no physical memory.
pub const PAGE_SIZE: usize = 4096;

/// Size of one active section: a fixed-size window of address space into
/// which file data is mapped for CPU access. Must be page-aligned and a
/// power of two at least 16 pages.
pub const SECTION_SIZE: usize = 256 * 1024;

/// Number of pages per active section.
pub const PAGES_PER_SECTION: usize = SECTION_SIZE / PAGE_SIZE;

static_assertions::const_assert!(SECTION_SIZE % PAGE_SIZE == 0);
static_assertions::const_assert!(PAGES_PER_SECTION >= 16);
static_assertions::const_assert!(PAGES_PER_SECTION.is_power_of_two());

/// Upper bound on the size of the modified list, expressed in bytes and
/// converted to a section count via [`CacheConfig::max_modified_sections`].
pub const MAX_MODIFIED_BYTES: usize = 64 * 1024 * 1024;

/// How long the write-behind worker waits for memory pressure to ease
/// before draining the modified list anyway.
pub const WRITE_BEHIND_DELAY: Duration = Duration::from_secs(1);

/// Runtime-configurable knobs for one [`crate::active_pool::ActiveSectionPool`].
#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    /// Number of active-section slots in the pool (the "fixed array of
    /// fixed-size windows" from spec §4.3). Total kernel VA reserved by a
    /// real kernel would be `section_count * SECTION_SIZE`, chosen as a
    /// fraction (~1/4) of the fixed-commit limit.
    pub section_count: usize,
    /// Maximum number of active sections allowed on the modified list
    /// before writers block on `modified-non-full`.
    pub max_modified: usize,
    /// Delay the write-behind worker waits for `available-low` under
    /// sufficient memory pressure.
    pub write_behind_delay: Duration,
    /// Threshold (in frames) above which the write-behind worker considers
    /// memory pressure low enough to defer draining the modified list for
    /// up to `write_behind_delay` (spec §4.6, `LOW_AVAILABLE_THRESHOLD`).
    pub low_available_threshold: usize,
}

impl CacheConfig {
    pub fn new(section_count: usize) -> Self {
        Self {
            section_count,
            max_modified: (MAX_MODIFIED_BYTES / SECTION_SIZE).max(1),
            write_behind_delay: WRITE_BEHIND_DELAY,
            low_available_threshold: 64,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        // A modest default pool: enough sections to cover MAX_MODIFIED_BYTES
        // twice over, so write-behind pressure can be exercised without
        // exhausting the LRU on ordinary test workloads.
        Self::new(((MAX_MODIFIED_BYTES / SECTION_SIZE) * 2).max(4))
    }
}

pub(crate) fn round_down(value: u64, align: u64) -> u64 {
    value - (value % align)
}

pub(crate) fn round_up(value: u64, align: u64) -> u64 {
    round_down(value + align - 1, align)
}
