// SPDX-License-Identifier: MPL-2.0

//! The virtual-address-space collaborator (spec §6): maps cache pages into
//! a caller's address space when the `MAP` access flag is set.
//!
//! The active-section pool's own window mapping (kernel-side, used so the
//! CPU can read/write page contents at all) is internal bookkeeping this
//! crate owns directly in [`crate::active_pool`]. This trait is the
//! separate, optional user-space mapping spec §7's `MAP` flag asks for —
//! grounded on `aster-frame`'s `VmSpace`/`VmMapOptions`, which `aster-nix`
//! calls to map a `VmFrame` into a process's page table the same way a
//! `mmap`-backed file read would.

use crate::frame::PageFrame;
use crate::prelude::*;

bitflags::bitflags! {
    /// Protection requested for a user-space mapping.
    pub struct MapFlags: u32 {
        const READ = 0b001;
        const WRITE = 0b010;
        const EXEC = 0b100;
    }
}

/// A caller-supplied virtual address space to map cache pages into.
pub trait AddressSpace: Send + Sync {
    /// Maps `frame` at `vaddr` with `flags`. Implementations are expected
    /// to replace any existing mapping at `vaddr`.
    fn map_page(&self, vaddr: u64, frame: &PageFrame, flags: MapFlags) -> Result<()>;

    /// Removes whatever mapping(s) cover `[vaddr, vaddr + count * PAGE_SIZE)`.
    fn unmap_pages(&self, vaddr: u64, count: usize);
}
