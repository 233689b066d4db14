//! Platform abstraction layer (PAL) interface.
//!
//! The library OS never touches page tables or host entropy directly. It goes
//! through the narrow, capability-style surface declared here: commit and
//! decommit virtual ranges, read random bits, write debug output. Hosts
//! provide the implementations; [`host`] carries an in-process one that keeps
//! the library OS runnable (and testable) without a real platform underneath.

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

pub mod host;
pub mod random;
pub mod traits;

use bitflags::bitflags;
use graft_error::define_shim_error;
use linux_raw_sys::errno::{EACCES, EINVAL, EIO, ENOMEM};

pub use host::{BufferConsole, FixedRandom, HostMemory};
pub use random::OsRandom;
pub use traits::{DebugConsole, RandomSource, VirtualMemory};

/// Allocation granularity of the platform allocator.
///
/// Every commit and decommit happens in multiples of this size, at addresses
/// aligned to it.
pub const ALLOC_ALIGN: usize = 0x1000;

/// Round `val` up to the allocation granularity (saturating).
#[inline]
pub const fn alloc_align_up(val: usize) -> usize {
    graft_utils::align_up(val, ALLOC_ALIGN)
}

/// Round `val` down to the allocation granularity.
#[inline]
pub const fn alloc_align_down(val: usize) -> usize {
    graft_utils::align_down(val, ALLOC_ALIGN)
}

/// Check whether `val` sits on an allocation granularity boundary.
#[inline]
pub const fn is_alloc_aligned(val: usize) -> bool {
    graft_utils::is_aligned(val, ALLOC_ALIGN)
}

bitflags! {
    /// Protection requested for committed memory.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PalProt: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

define_shim_error! {
    /// Errors reported by the platform.
    pub enum PalError(0x01) {
        /// No physical backing left
        NoMemory = 0x01, ENOMEM => "Platform is out of memory",
        /// Platform refused the operation
        Denied = 0x02, EACCES => "Platform denied the request",
        /// Unaligned or overflowing range
        InvalidArgument = 0x03, EINVAL => "Invalid address or size",
        /// Entropy source failed
        RandomUnavailable = 0x04, EIO => "Random source unavailable",
    }
}

/// The user-visible part of the address space handed to the library OS.
///
/// `[start, end)`; the library OS must never reserve anything outside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserAddressRange {
    pub start: usize,
    pub end: usize,
}

impl UserAddressRange {
    pub const fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    /// Size of the range in bytes.
    pub const fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub const fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    /// Check whether `[addr, addr + len)` lies entirely inside the range.
    pub const fn contains_range(&self, addr: usize, len: usize) -> bool {
        match addr.checked_add(len) {
            Some(end) => addr >= self.start && end <= self.end,
            None => false,
        }
    }
}

/// Validate an `(addr, size)` pair handed to the platform allocator.
pub(crate) fn check_range(addr: usize, size: usize) -> Result<usize, PalError> {
    if !is_alloc_aligned(addr) || !is_alloc_aligned(size) {
        return Err(PalError::InvalidArgument);
    }
    addr.checked_add(size).ok_or(PalError::InvalidArgument)
}
