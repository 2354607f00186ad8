// SPDX-License-Identifier: MPL-2.0

//! Shared test doubles, `#[cfg(test)]`-only.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex as StdMutex;

use crate::backend::CacheBackend;
use crate::frame::PageFrame;
use crate::prelude::*;
use crate::vmspace::{AddressSpace, MapFlags};

/// A recorded call to [`RecordingAddressSpace::map_page`].
#[derive(Debug, Clone, Copy)]
pub struct MapCall {
    pub vaddr: u64,
    pub flags: MapFlags,
}

/// An [`AddressSpace`] double that just records every mapping request, for
/// tests of the `MAP` access flag (spec §4.4).
#[derive(Default)]
pub struct RecordingAddressSpace {
    mapped: StdMutex<Vec<MapCall>>,
}

impl RecordingAddressSpace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mapped_calls(&self) -> Vec<MapCall> {
        self.mapped.lock().unwrap().clone()
    }
}

impl AddressSpace for RecordingAddressSpace {
    fn map_page(&self, vaddr: u64, _frame: &PageFrame, flags: MapFlags) -> Result<()> {
        self.mapped.lock().unwrap().push(MapCall { vaddr, flags });
        Ok(())
    }

    fn unmap_pages(&self, _vaddr: u64, _count: usize) {}
}

/// One logged call to [`MemoryBackend::read_backing`] or
/// [`MemoryBackend::write_backing`], recorded so scenario tests can assert
/// on coalescing (spec property P6, scenarios 1/3/6, boundary behavior B1)
/// without caring about the cache's internal bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendCall {
    pub offset: u64,
    pub len: usize,
}

/// An in-memory [`CacheBackend`] backed by a growable byte buffer, used
/// across this crate's unit and scenario tests in place of a real
/// filesystem or block device.
pub struct MemoryBackend {
    data: StdMutex<Vec<u8>>,
    fail_writes: std::sync::atomic::AtomicBool,
    reads: StdMutex<Vec<BackendCall>>,
    writes: StdMutex<Vec<BackendCall>>,
    read_count: AtomicUsize,
    write_count: AtomicUsize,
}

impl MemoryBackend {
    pub fn new(initial: Vec<u8>) -> Self {
        Self {
            data: StdMutex::new(initial),
            fail_writes: std::sync::atomic::AtomicBool::new(false),
            reads: StdMutex::new(Vec::new()),
            writes: StdMutex::new(Vec::new()),
            read_count: AtomicUsize::new(0),
            write_count: AtomicUsize::new(0),
        }
    }

    pub fn zeroed(size: usize) -> Self {
        Self::new(vec![0u8; size])
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.data.lock().unwrap().clone()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes
            .store(fail, std::sync::atomic::Ordering::Release);
    }

    pub fn read_calls(&self) -> Vec<BackendCall> {
        self.reads.lock().unwrap().clone()
    }

    pub fn write_calls(&self) -> Vec<BackendCall> {
        self.writes.lock().unwrap().clone()
    }

    pub fn read_count(&self) -> usize {
        self.read_count.load(Ordering::Acquire)
    }

    pub fn write_count(&self) -> usize {
        self.write_count.load(Ordering::Acquire)
    }

    pub fn reset_calls(&self) {
        self.reads.lock().unwrap().clear();
        self.writes.lock().unwrap().clear();
        self.read_count.store(0, Ordering::Release);
        self.write_count.store(0, Ordering::Release);
    }
}

impl CacheBackend for MemoryBackend {
    fn read_backing(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.reads.lock().unwrap().push(BackendCall {
            offset,
            len: buf.len(),
        });
        self.read_count.fetch_add(1, Ordering::AcqRel);

        let data = self.data.lock().unwrap();
        let start = offset as usize;
        let available = data.len().saturating_sub(start).min(buf.len());
        buf[..available].copy_from_slice(&data[start..start + available]);
        for b in &mut buf[available..] {
            *b = 0;
        }
        Ok(())
    }

    fn write_backing(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if self.fail_writes.load(std::sync::atomic::Ordering::Acquire) {
            return_errno_with_message!(Errno::EIO, "simulated backend write failure");
        }
        self.writes.lock().unwrap().push(BackendCall {
            offset,
            len: buf.len(),
        });
        self.write_count.fetch_add(1, Ordering::AcqRel);

        let mut data = self.data.lock().unwrap();
        let start = offset as usize;
        let end = start + buf.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn size(&self) -> u64 {
        self.data.lock().unwrap().len() as u64
    }
}
