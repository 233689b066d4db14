//! Platform-independent traits the library OS is written against.

use crate::{PalError, PalProt};

/// Interface for the platform's virtual memory allocator.
///
/// Both operations work on allocation-granularity aligned ranges. The caller
/// owns the range; the platform does not track who reserved what, that is
/// the job of the VMA bookkeeper above it.
pub trait VirtualMemory: Send + Sync {
    /// Back `[addr, addr + size)` with memory using the given protection.
    fn commit(&self, addr: usize, size: usize, prot: PalProt) -> Result<(), PalError>;

    /// Drop the backing of `[addr, addr + size)`.
    fn decommit(&self, addr: usize, size: usize) -> Result<(), PalError>;
}

/// Source of random bits, used for address layout randomization.
pub trait RandomSource: Send + Sync {
    /// Fill `buf` entirely with random bytes.
    fn read_random(&self, buf: &mut [u8]) -> Result<(), PalError>;

    /// Read one pointer-sized random value.
    fn random_usize(&self) -> Result<usize, PalError> {
        let mut bytes = [0u8; core::mem::size_of::<usize>()];
        self.read_random(&mut bytes)?;
        Ok(usize::from_ne_bytes(bytes))
    }
}

/// Debug output channel of the platform.
pub trait DebugConsole: Send + Sync {
    fn write_str(&self, s: &str);
}
