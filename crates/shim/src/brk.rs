//! Heap break (`brk`) region management.
//!
//! At process start a fixed window `[start, end)` is reserved in the VMA
//! ledger without physical backing. `brk` requests then move the logical
//! break `current` inside that window; only when the allocation-aligned break
//! crosses a granularity boundary are the ledger and the platform allocator
//! touched:
//!
//! ```text
//!   start          align_up(current)                         end
//!     |=== committed ===|---------- reserved, unmapped ---------|
//!                    ^
//!                 current (exact value last requested)
//! ```
//!
//! Break, ledger and page tables are only ever changed together while the
//! region lock is held, and every failure path leaves the three agreeing.

use alloc::sync::Arc;

use graft_error::define_shim_error;
use graft_pal::{PalError, PalProt, alloc_align_down, alloc_align_up, is_alloc_aligned};
use graft_utils::Mutex;
use linux_raw_sys::errno::{EINVAL, ENOMEM};
use linux_raw_sys::general::RLIMIT_DATA;

use crate::ShimContext;
use crate::checkpoint::{CpError, CpFunc, CpReader, CpStore};
use crate::config::Config;
use crate::shim_bug;
use crate::vma::{FixedMode, VmaError, VmaFlags, VmaProt};

/// Heap window size used when the manifest does not set one (256 KiB).
pub const DEFAULT_BRK_MAX_SIZE: usize = 256 * 1024;

/// Manifest key overriding [`DEFAULT_BRK_MAX_SIZE`].
pub const BRK_MAX_SIZE_KEY: &str = "sys.brk.max_size";

/// Upper bound of the randomized gap between the requested heap start and
/// the actual one, as Linux uses for brk randomization.
pub const BRK_RANDOM_OFFSET_MAX: usize = 0x200_0000;

const HEAP_COMMENT: &str = "heap";

define_shim_error! {
    /// Heap initialization errors. The caller aborts process start on any.
    pub enum InitError(0x06) {
        /// Start address or maximum size not allocation-aligned
        InvalidAlignment = 0x01, EINVAL => "Heap start or size is not aligned",
        /// Layout randomization could not read random bits
        RandomSourceError(PalError) = 0x02 => "Random source failed",
        /// VMA ledger refused the reservation
        BookkeepingFailure(VmaError) = 0x03 => "VMA bookkeeping failed",
        /// No room left for the heap window
        ResourceExhausted = 0x04, ENOMEM => "Out of address space for the heap",
    }
}

define_shim_error! {
    /// Why a break change was refused.
    ///
    /// Never leaves [`Brk::adjust`]; the syscall contract only reports the
    /// unchanged break.
    pub enum BrkReject(0x07) {
        /// Request below the heap start (includes the `brk(0)` query)
        BelowWindow = 0x01, ENOMEM => "Break below heap start",
        /// Request past the reserved window
        AboveWindow = 0x02, ENOMEM => "Break beyond heap window",
        /// Growth would exceed RLIMIT_DATA
        RlimitExceeded = 0x03, ENOMEM => "RLIMIT_DATA exceeded",
        /// Ledger refused to mark the growth committed
        Bookkeeping(VmaError) = 0x04 => "VMA bookkeeping failed",
        /// Platform could not back the growth
        Commit(PalError) = 0x05 => "Platform commit failed",
    }
}

/// The process heap window and its break.
///
/// While live: `start <= current <= end`, `start` and `end` aligned,
/// `[start, align_up(current))` committed and `[align_up(current), end)`
/// reserved-unmapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapRegion {
    pub start: usize,
    /// Logical break, not necessarily aligned
    pub current: usize,
    pub end: usize,
    /// Static data segment size, counted against RLIMIT_DATA with the heap
    pub data_segment_size: usize,
}

impl HeapRegion {
    pub const fn max_size(&self) -> usize {
        self.end - self.start
    }

    /// End of the committed prefix.
    pub const fn committed_end(&self) -> usize {
        alloc_align_up(self.current)
    }

    pub const fn committed_size(&self) -> usize {
        self.committed_end() - self.start
    }
}

/// Transition counters, updated under the region lock.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BrkStats {
    pub grows: u64,
    pub shrinks: u64,
    pub rejections: u64,
    /// Bytes handed to / taken back from the platform allocator
    pub committed_total: u64,
    pub released_total: u64,
    /// Largest committed size reached
    pub peak_committed: usize,
}

/// Outcome of an accepted break change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    /// Only the logical break moved
    Unchanged,
    Shrunk { freed: usize },
    Grown { growth: usize },
}

#[derive(Debug)]
struct BrkState {
    region: HeapRegion,
    stats: BrkStats,
}

/// Snapshot of the heap for migration, in checkpoint order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrkCheckpoint {
    pub start: usize,
    pub used_size: usize,
    pub total_size: usize,
    pub data_segment_size: usize,
}

impl BrkCheckpoint {
    pub fn write(&self, store: &mut CpStore) {
        store.add_func_entry(CpFunc::Brk, self.start);
        store.add_size_entry(self.used_size);
        store.add_size_entry(self.total_size);
        store.add_size_entry(self.data_segment_size);
    }

    /// Read and validate the brk record.
    pub fn read(reader: &mut CpReader<'_>) -> Result<Self, CpError> {
        let checkpoint = Self {
            start: reader.next_func_entry(CpFunc::Brk)?,
            used_size: reader.next_size_entry()?,
            total_size: reader.next_size_entry()?,
            data_segment_size: reader.next_size_entry()?,
        };
        checkpoint.validate()?;
        Ok(checkpoint)
    }

    /// Check that the record describes a window the heap could have had:
    /// aligned bounds, break inside the window, no address wrap-around.
    pub fn validate(&self) -> Result<(), CpError> {
        let well_formed = is_alloc_aligned(self.start)
            && is_alloc_aligned(self.total_size)
            && self.used_size <= self.total_size
            && self.start.checked_add(self.total_size).is_some();
        if !well_formed {
            log::debug!("[BRK] rejecting checkpoint record {:x?}", self);
            return Err(CpError::InvalidRecord);
        }
        Ok(())
    }
}

/// Heap window size from the manifest, or the default.
fn brk_max_size(config: Option<&Config>) -> usize {
    let Some(result) = config.and_then(|c| c.get_size(BRK_MAX_SIZE_KEY)) else {
        return DEFAULT_BRK_MAX_SIZE;
    };
    match result.map(usize::try_from) {
        Ok(Ok(size)) => size,
        Ok(Err(_)) | Err(_) => {
            log::warn!(
                "[BRK] ignoring invalid {} = {:?}, using default",
                BRK_MAX_SIZE_KEY,
                config.and_then(|c| c.get(BRK_MAX_SIZE_KEY))
            );
            DEFAULT_BRK_MAX_SIZE
        }
    }
}

/// The process heap.
///
/// Owns the heap region and the lock guarding it. Created by [`Brk::init`]
/// (or [`Brk::restore`] after migration) and torn down by [`Brk::finalize`].
pub struct Brk {
    ctx: Arc<ShimContext>,
    state: Mutex<BrkState>,
}

impl Brk {
    /// Reserve the heap window.
    ///
    /// Tries `preferred_start` first (shifted by a random offset when ASLR is
    /// on) and falls back to anywhere in the user range if that is taken.
    /// Nothing is committed yet; `RLIMIT_DATA` is set to cover the window plus
    /// the data segment.
    pub fn init(
        ctx: Arc<ShimContext>,
        preferred_start: Option<usize>,
        data_segment_size: usize,
    ) -> Result<Self, InitError> {
        let max_size = brk_max_size(ctx.config.as_deref());
        let data_segment_size = alloc_align_up(data_segment_size);

        if preferred_start.is_some_and(|start| !is_alloc_aligned(start)) {
            log::debug!("[BRK] starting brk address is not aligned");
            return Err(InitError::InvalidAlignment);
        }
        if !is_alloc_aligned(max_size) {
            log::debug!("[BRK] max brk size is not aligned");
            return Err(InitError::InvalidAlignment);
        }

        let fixed = match preferred_start {
            Some(start) => Self::reserve_preferred(&ctx, start, max_size)?,
            None => None,
        };

        let start = match fixed {
            Some(start) => start,
            None => ctx
                .vmas
                .mmap_any(
                    max_size,
                    VmaProt::empty(),
                    VmaFlags::UNMAPPED,
                    ctx.aslr.then_some(&*ctx.random),
                    HEAP_COMMENT,
                )
                .map_err(|err| match err {
                    VmaError::NoSpace => InitError::ResourceExhausted,
                    err => InitError::BookkeepingFailure(err),
                })?,
        };

        let region = HeapRegion {
            start,
            current: start,
            end: start + max_size,
            data_segment_size,
        };

        ctx.rlimits
            .set_cur(RLIMIT_DATA, (max_size + data_segment_size) as u64);

        log::debug!(
            "[BRK] heap window [{:#x}, {:#x}), data segment {:#x}",
            region.start,
            region.end,
            data_segment_size
        );

        Ok(Self {
            ctx,
            state: Mutex::new(BrkState {
                region,
                stats: BrkStats::default(),
            }),
        })
    }

    /// Reserve at (around) the preferred start. `Ok(None)` means the spot is
    /// unusable or taken and the caller should reserve anywhere instead.
    fn reserve_preferred(
        ctx: &ShimContext,
        preferred: usize,
        max_size: usize,
    ) -> Result<Option<usize>, InitError> {
        let user = ctx.user_address;
        let fits = preferred >= user.start
            && max_size <= user.end
            && preferred < user.end - max_size;
        if !fits {
            return Ok(None);
        }

        let mut start = preferred;
        if ctx.aslr {
            let bound = BRK_RANDOM_OFFSET_MAX.min(user.end - max_size - preferred);
            let random = ctx
                .random
                .random_usize()
                .map_err(InitError::RandomSourceError)?;
            start += alloc_align_down(random % bound);
        }

        match ctx.vmas.mmap_fixed(
            start,
            max_size,
            VmaProt::empty(),
            VmaFlags::UNMAPPED,
            FixedMode::NoReplace,
            HEAP_COMMENT,
        ) {
            Ok(()) => Ok(Some(start)),
            Err(VmaError::Exists) => {
                log::debug!("[BRK] {:#x} is taken, placing heap anywhere", start);
                Ok(None)
            }
            Err(err) => Err(InitError::BookkeepingFailure(err)),
        }
    }

    /// Rebuild the heap in a new execution context from a checkpoint.
    ///
    /// Only the logical state is restored; the migration framework re-creates
    /// the mappings themselves. `rebase` is accepted for the framework's
    /// calling convention but the heap must land at the same addresses.
    pub fn restore(
        ctx: Arc<ShimContext>,
        checkpoint: &BrkCheckpoint,
        rebase: &dyn Fn(usize) -> usize,
    ) -> Result<Self, CpError> {
        checkpoint.validate()?;

        if rebase(checkpoint.start) != checkpoint.start {
            log::warn!(
                "[BRK] heap at {:#x} cannot be rebased, restoring in place",
                checkpoint.start
            );
        }

        let region = HeapRegion {
            start: checkpoint.start,
            current: checkpoint.start + checkpoint.used_size,
            end: checkpoint.start + checkpoint.total_size,
            data_segment_size: checkpoint.data_segment_size,
        };

        Ok(Self {
            ctx,
            state: Mutex::new(BrkState {
                region,
                stats: BrkStats::default(),
            }),
        })
    }

    /// Read the brk record from a checkpoint and restore it.
    pub fn restore_from(
        ctx: Arc<ShimContext>,
        reader: &mut CpReader<'_>,
        rebase: &dyn Fn(usize) -> usize,
    ) -> Result<Self, CpError> {
        let checkpoint = BrkCheckpoint::read(reader)?;
        Self::restore(ctx, &checkpoint, rebase)
    }

    /// Snapshot the heap for migration.
    ///
    /// Takes `&mut self`: the process must be quiescent, and exclusive access
    /// proves no `adjust` can be in flight, so the lock is not taken.
    pub fn checkpoint(&mut self) -> BrkCheckpoint {
        let region = self.state.get_mut().region;
        BrkCheckpoint {
            start: region.start,
            used_size: region.current - region.start,
            total_size: region.end - region.start,
            data_segment_size: region.data_segment_size,
        }
    }

    /// Append the brk record to a checkpoint.
    pub fn checkpoint_into(&mut self, store: &mut CpStore) {
        self.checkpoint().write(store);
    }

    /// Move the break to `requested` and return the resulting break.
    ///
    /// Never fails: a refused request returns the unchanged break, which is
    /// also how `brk(0)` queries it.
    pub fn adjust(&self, requested: usize) -> usize {
        let mut state = self.state.lock();
        // Rejections are already logged and counted
        let _ = self.adjust_locked(&mut state, requested);
        state.region.current
    }

    /// Like [`Brk::adjust`], but reports why a request was refused.
    pub fn try_adjust(&self, requested: usize) -> Result<usize, BrkReject> {
        let mut state = self.state.lock();
        self.adjust_locked(&mut state, requested)
            .map(|_| state.region.current)
    }

    fn adjust_locked(&self, state: &mut BrkState, requested: usize) -> Result<Transition, BrkReject> {
        let result = self.transition(&mut state.region, requested);

        match result {
            Ok(Transition::Grown { growth }) => {
                state.stats.grows += 1;
                state.stats.committed_total += growth as u64;
                state.stats.peak_committed = state
                    .stats
                    .peak_committed
                    .max(state.region.committed_size());
            }
            Ok(Transition::Shrunk { freed }) => {
                state.stats.shrinks += 1;
                state.stats.released_total += freed as u64;
            }
            Ok(Transition::Unchanged) => {}
            Err(reject) => {
                state.stats.rejections += 1;
                log::debug!(
                    "[BRK] brk({:#x}) refused: {}, break stays {:#x}",
                    requested,
                    reject,
                    state.region.current
                );
            }
        }

        #[cfg(feature = "verbose-brk")]
        if let Ok(transition) = result {
            log::trace!(
                "[BRK] brk({:#x}) -> {:?}, committed up to {:#x}",
                requested,
                transition,
                state.region.committed_end()
            );
        }

        result
    }

    /// Apply one break change to `region`. On `Err` nothing was changed.
    fn transition(&self, region: &mut HeapRegion, requested: usize) -> Result<Transition, BrkReject> {
        let cur_aligned = region.committed_end();

        if requested < region.start {
            return Err(BrkReject::BelowWindow);
        }

        if requested <= cur_aligned {
            let req_aligned = alloc_align_up(requested);
            let freed = cur_aligned - req_aligned;

            if freed > 0 {
                if let Err(err) = self.ctx.vmas.mmap_fixed(
                    req_aligned,
                    region.end - req_aligned,
                    VmaProt::empty(),
                    VmaFlags::UNMAPPED,
                    FixedMode::Replace,
                    HEAP_COMMENT,
                ) {
                    shim_bug!(
                        "brk: cannot return [{:#x}, {:#x}) to reserved: {}",
                        req_aligned,
                        region.end,
                        err
                    );
                }
                if let Err(err) = self.ctx.vm.decommit(req_aligned, freed) {
                    shim_bug!(
                        "brk: ledger released [{:#x}, {:#x}) but decommit failed: {}",
                        req_aligned,
                        cur_aligned,
                        err
                    );
                }
            }

            region.current = requested;
            return Ok(if freed > 0 {
                Transition::Shrunk { freed }
            } else {
                Transition::Unchanged
            });
        }

        if requested > region.end {
            return Err(BrkReject::AboveWindow);
        }

        let req_aligned = alloc_align_up(requested);
        let size_from_start = (req_aligned - region.start) as u64;
        let data_segment_size = region.data_segment_size as u64;
        let rlim_data = self.ctx.rlimits.get_cur(RLIMIT_DATA);
        if rlim_data < data_segment_size || rlim_data - data_segment_size < size_from_start {
            return Err(BrkReject::RlimitExceeded);
        }

        // req_aligned >= requested > cur_aligned
        let growth = req_aligned - cur_aligned;
        debug_assert!(growth > 0);

        self.ctx
            .vmas
            .mmap_fixed(
                cur_aligned,
                growth,
                VmaProt::READ | VmaProt::WRITE,
                VmaFlags::PRIVATE | VmaFlags::ANONYMOUS,
                FixedMode::Replace,
                HEAP_COMMENT,
            )
            .map_err(BrkReject::Bookkeeping)?;

        if let Err(err) = self
            .ctx
            .vm
            .commit(cur_aligned, growth, PalProt::READ | PalProt::WRITE)
        {
            if let Err(rollback) = self.ctx.vmas.mmap_fixed(
                cur_aligned,
                region.end - cur_aligned,
                VmaProt::empty(),
                VmaFlags::UNMAPPED,
                FixedMode::Replace,
                HEAP_COMMENT,
            ) {
                shim_bug!(
                    "brk: cannot roll back [{:#x}, {:#x}) after failed commit: {}",
                    cur_aligned,
                    region.end,
                    rollback
                );
            }
            return Err(BrkReject::Commit(err));
        }

        region.current = requested;
        Ok(Transition::Grown { growth })
    }

    /// Tear the heap down for good (process exit or exec).
    ///
    /// Releases the whole window from the ledger and the committed prefix
    /// from the platform. Consumes the heap; its lock goes with it.
    pub fn finalize(self) {
        let Self { ctx, state } = self;
        let region = state.into_inner().region;
        let allocated_size = region.committed_size();

        let token = match ctx
            .vmas
            .munmap(region.start, region.max_size(), false)
        {
            Ok(token) => token,
            Err(err) => shim_bug!(
                "brk: cannot release heap window [{:#x}, {:#x}): {}",
                region.start,
                region.end,
                err
            ),
        };

        if allocated_size > 0 {
            if let Err(err) = ctx.vm.decommit(region.start, allocated_size) {
                log::error!(
                    "[BRK] decommit of [{:#x}, {:#x}) failed: {}",
                    region.start,
                    region.start + allocated_size,
                    err
                );
            }
        }

        ctx.vmas.remove_tmp_vma(token);

        log::debug!("[BRK] heap window [{:#x}, {:#x}) released", region.start, region.end);
    }

    /// Current break.
    pub fn current(&self) -> usize {
        self.state.lock().region.current
    }

    pub fn region(&self) -> HeapRegion {
        self.state.lock().region
    }

    pub fn stats(&self) -> BrkStats {
        self.state.lock().stats
    }
}
