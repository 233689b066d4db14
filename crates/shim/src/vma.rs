//! Virtual Memory Area bookkeeping.
//!
//! The library OS keeps its own ledger of every range it has claimed in the
//! user address space, independent of the platform's page tables, so that
//! two subsystems never silently map over each other. [`Bookkeeper`] is the
//! interface the rest of the shim uses; [`VmaTree`] is the ledger itself.

use alloc::vec::Vec;

use bitflags::bitflags;
use graft_error::define_shim_error;
use graft_pal::{RandomSource, UserAddressRange, alloc_align_down, is_alloc_aligned};
use graft_utils::Mutex;
use linux_raw_sys::errno::{EBUSY, EEXIST, EINVAL, ENOMEM, EPERM};

bitflags! {
    /// VMA permission flags (matches mmap prot flags).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VmaProt: u32 {
        /// Region is readable
        const READ = 1 << 0;
        /// Region is writable
        const WRITE = 1 << 1;
        /// Region is executable
        const EXEC = 1 << 2;
    }
}

bitflags! {
    /// VMA state flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VmaFlags: u32 {
        const PRIVATE = 1 << 0;
        const ANONYMOUS = 1 << 1;
        /// Reserved in the ledger, no physical backing
        const UNMAPPED = 1 << 2;
        /// Owned by the library OS itself, not visible to the application
        const INTERNAL = 1 << 3;
        /// Released, waiting for the platform side to be torn down
        const RELEASING = 1 << 4;
    }
}

/// How `mmap_fixed` treats ranges that are already in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixedMode {
    /// Fail if anything overlaps (`MAP_FIXED_NOREPLACE`)
    NoReplace,
    /// Overwrite whatever overlaps (`MAP_FIXED`)
    Replace,
}

define_shim_error! {
    /// VMA operation errors.
    pub enum VmaError(0x02) {
        /// Attempted to insert overlapping VMA
        Exists = 0x01, EEXIST => "VMA overlaps existing region",
        /// No free range large enough
        NoSpace = 0x02, ENOMEM => "No free address range",
        /// Unaligned, empty or out of the user address range
        InvalidRange = 0x03, EINVAL => "Invalid VMA range",
        /// VMA not found
        NotFound = 0x04, EINVAL => "VMA not found",
        /// Range overlaps memory owned by the library OS
        Denied = 0x05, EPERM => "Range is internal to the library OS",
        /// Range is still being released
        Busy = 0x06, EBUSY => "Range is being released",
    }
}

/// A contiguous virtual memory region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vma {
    /// Start address (allocation-aligned)
    pub start: usize,
    /// End address (exclusive, allocation-aligned)
    pub end: usize,
    pub prot: VmaProt,
    pub flags: VmaFlags,
    /// Short owner tag, e.g. "heap"
    pub comment: &'static str,
}

impl Vma {
    #[must_use]
    pub fn new(start: usize, end: usize, prot: VmaProt, flags: VmaFlags, comment: &'static str) -> Self {
        debug_assert!(start < end, "VMA start must be < end");
        debug_assert!(is_alloc_aligned(start), "VMA start must be aligned");
        debug_assert!(is_alloc_aligned(end), "VMA end must be aligned");
        Self {
            start,
            end,
            prot,
            flags,
            comment,
        }
    }

    /// Length of the VMA in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    /// Check if address is within this VMA.
    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end
    }

    /// Check if this VMA overlaps with a range.
    #[must_use]
    pub fn overlaps(&self, start: usize, end: usize) -> bool {
        self.start < end && start < self.end
    }

    /// Same region with its bounds clipped to `[start, end)`.
    fn clipped(&self, start: usize, end: usize) -> Self {
        Self {
            start,
            end,
            ..self.clone()
        }
    }

    /// True if the application sees this range as backed memory.
    #[must_use]
    pub fn is_mapped(&self) -> bool {
        !self.flags.intersects(VmaFlags::UNMAPPED | VmaFlags::RELEASING)
    }
}

/// Proof that a range was released from the ledger.
///
/// The range stays blocked by a placeholder until the token is handed back
/// through [`Bookkeeper::remove_tmp_vma`], so nobody can claim it while the
/// platform side is still being torn down.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "the released range stays blocked until the token is removed"]
pub struct ReleaseToken {
    start: usize,
    end: usize,
}

impl ReleaseToken {
    pub fn range(&self) -> (usize, usize) {
        (self.start, self.end)
    }
}

/// Interface of the VMA ledger.
pub trait Bookkeeper: Send + Sync {
    /// Record `[addr, addr + len)` at exactly that address.
    fn mmap_fixed(
        &self,
        addr: usize,
        len: usize,
        prot: VmaProt,
        flags: VmaFlags,
        mode: FixedMode,
        comment: &'static str,
    ) -> Result<(), VmaError>;

    /// Find a free range of `len` bytes, record it and return its start.
    ///
    /// With `random`, the search starts below a random ceiling and falls back
    /// to the plain top-down search if nothing fits there.
    fn mmap_any(
        &self,
        len: usize,
        prot: VmaProt,
        flags: VmaFlags,
        random: Option<&dyn RandomSource>,
        comment: &'static str,
    ) -> Result<usize, VmaError>;

    /// Drop `[addr, addr + len)` from the ledger. `is_internal` must be set to
    /// release ranges the library OS reserved for itself.
    fn munmap(&self, addr: usize, len: usize, is_internal: bool) -> Result<ReleaseToken, VmaError>;

    /// Unblock a range released by `munmap`.
    fn remove_tmp_vma(&self, token: ReleaseToken);

    /// VMA containing `addr`, if any.
    fn find(&self, addr: usize) -> Option<Vma>;
}

/// Sorted list of non-overlapping VMAs.
#[derive(Debug, Default)]
struct VmaList {
    /// VMAs sorted by start address
    vmas: Vec<Vma>,
}

impl VmaList {
    /// Insert a new VMA. Returns error if it overlaps existing.
    fn insert(&mut self, vma: Vma) -> Result<(), VmaError> {
        if self.vmas.iter().any(|v| v.overlaps(vma.start, vma.end)) {
            return Err(VmaError::Exists);
        }

        // Insert maintaining sorted order
        let pos = self
            .vmas
            .iter()
            .position(|v| v.start > vma.start)
            .unwrap_or(self.vmas.len());
        self.vmas.insert(pos, vma);
        Ok(())
    }

    /// Cut `[start, end)` out of every VMA, splitting partially covered ones.
    fn carve(&mut self, start: usize, end: usize) {
        let mut i = 0;

        while i < self.vmas.len() {
            if !self.vmas[i].overlaps(start, end) {
                i += 1;
                continue;
            }

            let vma = self.vmas.remove(i);

            // Left remainder
            if vma.start < start {
                self.vmas.insert(i, vma.clipped(vma.start, start));
                i += 1;
            }
            // Right remainder
            if vma.end > end {
                self.vmas.insert(i, vma.clipped(end, vma.end));
                i += 1;
            }
        }
    }

    fn overlapping(&self, start: usize, end: usize) -> impl Iterator<Item = &Vma> {
        self.vmas.iter().filter(move |v| v.overlaps(start, end))
    }

    /// Highest free `[addr, addr + len)` that ends at or below `top`.
    fn find_gap_below(&self, bottom: usize, top: usize, len: usize) -> Option<usize> {
        let mut ceiling = top;

        for vma in self.vmas.iter().rev() {
            if vma.start >= ceiling {
                continue;
            }
            if vma.end > ceiling {
                // Straddles the ceiling
                ceiling = vma.start;
                continue;
            }
            if ceiling - vma.end >= len {
                return Some(ceiling - len);
            }
            ceiling = vma.start;
        }

        ceiling.checked_sub(len).filter(|&addr| addr >= bottom)
    }
}

/// The library OS's VMA ledger.
pub struct VmaTree {
    user_address: UserAddressRange,
    list: Mutex<VmaList>,
}

impl VmaTree {
    pub fn new(user_address: UserAddressRange) -> Self {
        Self {
            user_address,
            list: Mutex::new(VmaList::default()),
        }
    }

    /// Copy of every VMA, ascending.
    pub fn snapshot(&self) -> Vec<Vma> {
        self.list.lock().vmas.clone()
    }

    fn check_range(&self, addr: usize, len: usize) -> Result<usize, VmaError> {
        if len == 0 || !is_alloc_aligned(addr) || !is_alloc_aligned(len) {
            return Err(VmaError::InvalidRange);
        }
        if !self.user_address.contains_range(addr, len) {
            return Err(VmaError::InvalidRange);
        }
        Ok(addr + len)
    }

    /// Random allocation-aligned ceiling in `[bottom + len, top]`.
    fn random_top(&self, random: &dyn RandomSource, len: usize) -> Option<usize> {
        let lowest = self.user_address.start.checked_add(len)?;
        let span = self.user_address.end.checked_sub(lowest)?;
        match random.random_usize() {
            Ok(r) => Some(alloc_align_down(lowest + r % (span + 1))),
            Err(err) => {
                log::debug!("[VMA] randomization unavailable: {}", err);
                None
            }
        }
    }
}

impl Bookkeeper for VmaTree {
    fn mmap_fixed(
        &self,
        addr: usize,
        len: usize,
        prot: VmaProt,
        flags: VmaFlags,
        mode: FixedMode,
        comment: &'static str,
    ) -> Result<(), VmaError> {
        let end = self.check_range(addr, len)?;
        let mut list = self.list.lock();

        match mode {
            FixedMode::NoReplace => {}
            FixedMode::Replace => {
                if list
                    .overlapping(addr, end)
                    .any(|v| v.flags.contains(VmaFlags::RELEASING))
                {
                    return Err(VmaError::Busy);
                }
                list.carve(addr, end);
            }
        }

        list.insert(Vma::new(addr, end, prot, flags, comment))
    }

    fn mmap_any(
        &self,
        len: usize,
        prot: VmaProt,
        flags: VmaFlags,
        random: Option<&dyn RandomSource>,
        comment: &'static str,
    ) -> Result<usize, VmaError> {
        if len == 0 || !is_alloc_aligned(len) || len > self.user_address.len() {
            return Err(VmaError::InvalidRange);
        }

        let mut list = self.list.lock();
        let bottom = self.user_address.start;

        let randomized_hit = random
            .and_then(|random| self.random_top(random, len))
            .and_then(|top| list.find_gap_below(bottom, top, len));

        let addr = randomized_hit
            .or_else(|| list.find_gap_below(bottom, self.user_address.end, len))
            .ok_or(VmaError::NoSpace)?;

        list.insert(Vma::new(addr, addr + len, prot, flags, comment))?;
        Ok(addr)
    }

    fn munmap(&self, addr: usize, len: usize, is_internal: bool) -> Result<ReleaseToken, VmaError> {
        let end = self.check_range(addr, len)?;
        let mut list = self.list.lock();

        for vma in list.overlapping(addr, end) {
            if vma.flags.contains(VmaFlags::RELEASING) {
                return Err(VmaError::Busy);
            }
            if !is_internal && vma.flags.contains(VmaFlags::INTERNAL) {
                return Err(VmaError::Denied);
            }
        }

        list.carve(addr, end);
        list.insert(Vma::new(
            addr,
            end,
            VmaProt::empty(),
            VmaFlags::INTERNAL | VmaFlags::RELEASING,
            "releasing",
        ))?;

        Ok(ReleaseToken { start: addr, end })
    }

    fn remove_tmp_vma(&self, token: ReleaseToken) {
        let mut list = self.list.lock();
        let pos = list.vmas.iter().position(|v| {
            v.start == token.start && v.end == token.end && v.flags.contains(VmaFlags::RELEASING)
        });
        match pos {
            Some(pos) => {
                list.vmas.remove(pos);
            }
            None => log::warn!(
                "[VMA] no releasing placeholder at [{:#x}, {:#x})",
                token.start,
                token.end
            ),
        }
    }

    fn find(&self, addr: usize) -> Option<Vma> {
        self.list.lock().vmas.iter().find(|v| v.contains(addr)).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use graft_pal::FixedRandom;

    const RW: VmaProt = VmaProt::READ.union(VmaProt::WRITE);

    fn tree() -> VmaTree {
        VmaTree::new(UserAddressRange::new(0x1000, 0x10_0000))
    }

    #[test]
    fn test_vma_contains_and_overlaps() {
        let vma = Vma::new(0x2000, 0x4000, VmaProt::READ, VmaFlags::empty(), "t");
        assert!(vma.contains(0x2000));
        assert!(vma.contains(0x3FFF));
        assert!(!vma.contains(0x4000));
        assert!(vma.overlaps(0x1000, 0x3000));
        assert!(vma.overlaps(0x3000, 0x5000));
        assert!(!vma.overlaps(0x0000, 0x2000));
        assert!(!vma.overlaps(0x4000, 0x5000));
        assert_eq!(vma.len(), 0x2000);
    }

    #[test]
    fn test_fixed_noreplace_rejects_overlap() {
        let vmas = tree();
        vmas.mmap_fixed(0x2000, 0x2000, RW, VmaFlags::PRIVATE, FixedMode::NoReplace, "a")
            .unwrap();
        assert_eq!(
            vmas.mmap_fixed(0x3000, 0x2000, RW, VmaFlags::PRIVATE, FixedMode::NoReplace, "b"),
            Err(VmaError::Exists)
        );
        // Adjacent is fine
        assert!(
            vmas.mmap_fixed(0x4000, 0x1000, RW, VmaFlags::PRIVATE, FixedMode::NoReplace, "c")
                .is_ok()
        );
    }

    #[test]
    fn test_fixed_replace_splits() {
        let vmas = tree();
        vmas.mmap_fixed(0x1000, 0x4000, VmaProt::empty(), VmaFlags::UNMAPPED, FixedMode::NoReplace, "heap")
            .unwrap();
        vmas.mmap_fixed(0x2000, 0x1000, RW, VmaFlags::PRIVATE | VmaFlags::ANONYMOUS, FixedMode::Replace, "heap")
            .unwrap();

        let snapshot = vmas.snapshot();
        assert_eq!(snapshot.len(), 3);
        assert_eq!((snapshot[0].start, snapshot[0].end), (0x1000, 0x2000));
        assert!(!snapshot[0].is_mapped());
        assert_eq!((snapshot[1].start, snapshot[1].end), (0x2000, 0x3000));
        assert!(snapshot[1].is_mapped());
        assert_eq!(snapshot[1].prot, RW);
        assert_eq!((snapshot[2].start, snapshot[2].end), (0x3000, 0x5000));
    }

    #[test]
    fn test_invalid_ranges() {
        let vmas = tree();
        let flags = VmaFlags::UNMAPPED;
        let none = VmaProt::empty();
        assert_eq!(
            vmas.mmap_fixed(0x1800, 0x1000, none, flags, FixedMode::NoReplace, "x"),
            Err(VmaError::InvalidRange)
        );
        assert_eq!(
            vmas.mmap_fixed(0x1000, 0, none, flags, FixedMode::NoReplace, "x"),
            Err(VmaError::InvalidRange)
        );
        // Outside the user range
        assert_eq!(
            vmas.mmap_fixed(0x0, 0x1000, none, flags, FixedMode::NoReplace, "x"),
            Err(VmaError::InvalidRange)
        );
        assert_eq!(
            vmas.mmap_fixed(0xFF000, 0x2000, none, flags, FixedMode::NoReplace, "x"),
            Err(VmaError::InvalidRange)
        );
    }

    #[test]
    fn test_mmap_any_top_down() {
        let vmas = tree();
        let a = vmas
            .mmap_any(0x4000, VmaProt::empty(), VmaFlags::UNMAPPED, None, "a")
            .unwrap();
        assert_eq!(a, 0x10_0000 - 0x4000);
        let b = vmas
            .mmap_any(0x1000, VmaProt::empty(), VmaFlags::UNMAPPED, None, "b")
            .unwrap();
        assert_eq!(b, a - 0x1000);
    }

    #[test]
    fn test_mmap_any_fills_hole() {
        let vmas = VmaTree::new(UserAddressRange::new(0x1000, 0x8000));
        vmas.mmap_fixed(0x5000, 0x3000, RW, VmaFlags::PRIVATE, FixedMode::NoReplace, "top")
            .unwrap();
        vmas.mmap_fixed(0x1000, 0x2000, RW, VmaFlags::PRIVATE, FixedMode::NoReplace, "bottom")
            .unwrap();
        // Only [0x3000, 0x5000) is free
        assert_eq!(
            vmas.mmap_any(0x2000, RW, VmaFlags::PRIVATE, None, "mid"),
            Ok(0x3000)
        );
        assert_eq!(
            vmas.mmap_any(0x1000, RW, VmaFlags::PRIVATE, None, "none"),
            Err(VmaError::NoSpace)
        );
    }

    #[test]
    fn test_mmap_any_randomized_stays_in_range() {
        let user = UserAddressRange::new(0x1000, 0x10_0000);
        let vmas = VmaTree::new(user);
        let random: &dyn RandomSource = &FixedRandom::new(0x0123_4567_89AB_CDEF);
        let addr = vmas
            .mmap_any(0x4000, VmaProt::empty(), VmaFlags::UNMAPPED, Some(random), "heap")
            .unwrap();
        assert!(is_alloc_aligned(addr));
        assert!(user.contains_range(addr, 0x4000));
    }

    #[test]
    fn test_mmap_any_randomized_falls_back() {
        let user = UserAddressRange::new(0x1000, 0x10_0000);
        let vmas = VmaTree::new(user);
        let random: &dyn RandomSource = &FixedRandom::failing();
        assert_eq!(
            vmas.mmap_any(
                0x4000,
                VmaProt::empty(),
                VmaFlags::UNMAPPED,
                Some(random),
                "heap"
            ),
            Ok(0x10_0000 - 0x4000)
        );
    }

    #[test]
    fn test_munmap_blocks_until_token_removed() {
        let vmas = tree();
        vmas.mmap_fixed(0x2000, 0x2000, RW, VmaFlags::PRIVATE, FixedMode::NoReplace, "heap")
            .unwrap();

        let token = vmas.munmap(0x2000, 0x2000, false).unwrap();
        assert_eq!(token.range(), (0x2000, 0x4000));
        assert!(vmas.find(0x2000).unwrap().flags.contains(VmaFlags::RELEASING));
        assert_eq!(
            vmas.mmap_fixed(0x2000, 0x1000, RW, VmaFlags::PRIVATE, FixedMode::Replace, "x"),
            Err(VmaError::Busy)
        );

        vmas.remove_tmp_vma(token);
        assert!(vmas.find(0x2000).is_none());
        assert!(vmas.snapshot().is_empty());
    }

    #[test]
    fn test_munmap_internal_needs_flag() {
        let vmas = tree();
        vmas.mmap_fixed(0x2000, 0x1000, RW, VmaFlags::INTERNAL, FixedMode::NoReplace, "shim")
            .unwrap();
        assert_eq!(vmas.munmap(0x2000, 0x1000, false), Err(VmaError::Denied));
        let token = vmas.munmap(0x2000, 0x1000, true).unwrap();
        vmas.remove_tmp_vma(token);
    }

    #[test]
    fn test_munmap_partial_keeps_remainders() {
        let vmas = tree();
        vmas.mmap_fixed(0x1000, 0x4000, RW, VmaFlags::PRIVATE, FixedMode::NoReplace, "a")
            .unwrap();
        let token = vmas.munmap(0x2000, 0x1000, false).unwrap();
        vmas.remove_tmp_vma(token);
        assert!(vmas.find(0x1500).is_some());
        assert!(vmas.find(0x2500).is_none());
        assert!(vmas.find(0x3500).is_some());
    }
}
