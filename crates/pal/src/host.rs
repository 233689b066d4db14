//! In-process PAL implementation.
//!
//! `HostMemory` does not map anything. It keeps a page-granular ledger of
//! what has been committed with which protection, so the library OS can run
//! against it and callers can observe the platform-side effect of every
//! request. One-shot failure injection lets error paths be driven on demand.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;

use graft_utils::Mutex;

use crate::{ALLOC_ALIGN, DebugConsole, PalError, PalProt, RandomSource, VirtualMemory, check_range};

#[derive(Debug, Default)]
struct HostMemoryState {
    /// Committed pages keyed by page address
    pages: BTreeMap<usize, PalProt>,
    /// Maximum number of committed pages, `None` for unbounded
    page_limit: Option<usize>,
    commit_calls: u64,
    decommit_calls: u64,
    fail_next_commit: Option<PalError>,
    fail_next_decommit: Option<PalError>,
}

/// Page-ledger backed virtual memory allocator.
#[derive(Debug, Default)]
pub struct HostMemory {
    state: Mutex<HostMemoryState>,
}

impl HostMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an allocator that refuses to hold more than `pages` committed pages.
    pub fn with_page_limit(pages: usize) -> Self {
        let host = Self::new();
        host.state.lock().page_limit = Some(pages);
        host
    }

    /// Make the next `commit` fail with `err` without touching the ledger.
    pub fn fail_next_commit(&self, err: PalError) {
        self.state.lock().fail_next_commit = Some(err);
    }

    /// Make the next `decommit` fail with `err` without touching the ledger.
    pub fn fail_next_decommit(&self, err: PalError) {
        self.state.lock().fail_next_decommit = Some(err);
    }

    pub fn is_committed(&self, addr: usize) -> bool {
        self.state
            .lock()
            .pages
            .contains_key(&(addr & !(ALLOC_ALIGN - 1)))
    }

    /// Protection of the page containing `addr`, if committed.
    pub fn protection(&self, addr: usize) -> Option<PalProt> {
        self.state
            .lock()
            .pages
            .get(&(addr & !(ALLOC_ALIGN - 1)))
            .copied()
    }

    pub fn committed_pages(&self) -> usize {
        self.state.lock().pages.len()
    }

    /// Committed memory coalesced into `[start, end)` ranges, ascending.
    pub fn committed_ranges(&self) -> Vec<(usize, usize)> {
        let state = self.state.lock();
        let mut ranges: Vec<(usize, usize)> = Vec::new();
        for &page in state.pages.keys() {
            match ranges.last_mut() {
                Some(last) if last.1 == page => last.1 = page + ALLOC_ALIGN,
                _ => ranges.push((page, page + ALLOC_ALIGN)),
            }
        }
        ranges
    }

    pub fn commit_calls(&self) -> u64 {
        self.state.lock().commit_calls
    }

    pub fn decommit_calls(&self) -> u64 {
        self.state.lock().decommit_calls
    }
}

impl VirtualMemory for HostMemory {
    fn commit(&self, addr: usize, size: usize, prot: PalProt) -> Result<(), PalError> {
        let end = check_range(addr, size)?;
        let mut state = self.state.lock();
        state.commit_calls += 1;

        if let Some(err) = state.fail_next_commit.take() {
            return Err(err);
        }

        if let Some(limit) = state.page_limit {
            let new_pages = (addr..end)
                .step_by(ALLOC_ALIGN)
                .filter(|page| !state.pages.contains_key(page))
                .count();
            if state.pages.len() + new_pages > limit {
                return Err(PalError::NoMemory);
            }
        }

        for page in (addr..end).step_by(ALLOC_ALIGN) {
            state.pages.insert(page, prot);
        }
        Ok(())
    }

    fn decommit(&self, addr: usize, size: usize) -> Result<(), PalError> {
        let end = check_range(addr, size)?;
        let mut state = self.state.lock();
        state.decommit_calls += 1;

        if let Some(err) = state.fail_next_decommit.take() {
            return Err(err);
        }

        // Pages that were never committed are skipped, like munmap on a hole
        state.pages.retain(|&page, _| page < addr || page >= end);
        Ok(())
    }
}

/// Deterministic random source.
///
/// Repeats the bytes of a fixed seed; `failing()` builds one that always errors.
#[derive(Debug, Clone, Copy)]
pub struct FixedRandom {
    seed: Option<u64>,
}

impl FixedRandom {
    pub const fn new(seed: u64) -> Self {
        Self { seed: Some(seed) }
    }

    pub const fn failing() -> Self {
        Self { seed: None }
    }
}

impl RandomSource for FixedRandom {
    fn read_random(&self, buf: &mut [u8]) -> Result<(), PalError> {
        let seed = self.seed.ok_or(PalError::RandomUnavailable)?.to_le_bytes();
        for (dst, src) in buf.iter_mut().zip(seed.iter().cycle()) {
            *dst = *src;
        }
        Ok(())
    }
}

/// Debug console collecting everything written to it.
#[derive(Debug, Default)]
pub struct BufferConsole {
    buffer: Mutex<String>,
}

impl BufferConsole {
    pub const fn new() -> Self {
        Self {
            buffer: Mutex::new(String::new()),
        }
    }

    pub fn contents(&self) -> String {
        self.buffer.lock().clone()
    }
}

impl DebugConsole for BufferConsole {
    fn write_str(&self, s: &str) {
        self.buffer.lock().push_str(s);
    }
}
