//! graft library OS shim core.
//!
//! Re-implements the Unix `brk` heap on top of the capability-style virtual
//! memory primitive of the PAL, while keeping the library OS's own VMA ledger
//! in step with it, and snapshots the heap state for checkpoint/restore.
//!
//! ```text
//!   ShimContext ──┬── Bookkeeper (vma)      ledger of reserved ranges
//!                 ├── VirtualMemory (pal)   physical commit/decommit
//!                 ├── ResourceLimits        RLIMIT_DATA
//!                 ├── Config                sys.brk.max_size
//!                 └── RandomSource (pal)    layout randomization
//!
//!   Brk::init ──> Brk::adjust* ──> Brk::finalize
//!                     │
//!                     └── Brk::checkpoint / Brk::restore (migration)
//! ```
//!
//! The crate is `no_std` + `alloc`; hosts supply the collaborators.

#![no_std]

extern crate alloc;

pub mod brk;
pub mod checkpoint;
pub mod config;
pub mod logger;
pub mod rlimit;
pub mod syscall;
pub mod vma;

use alloc::sync::Arc;

use graft_pal::{RandomSource, UserAddressRange, VirtualMemory};

pub use brk::{Brk, BrkReject, BrkStats, HeapRegion, InitError};
pub use checkpoint::{CpError, CpReader, CpStore};
pub use config::Config;
pub use rlimit::ResourceLimits;
pub use vma::{Bookkeeper, VmaTree};

/// Everything the shim core needs from the rest of the library OS.
///
/// Built once at process start and shared by reference with every subsystem
/// instead of living in ambient globals.
pub struct ShimContext {
    pub vmas: Arc<dyn Bookkeeper>,
    pub vm: Arc<dyn VirtualMemory>,
    pub random: Arc<dyn RandomSource>,
    pub rlimits: Arc<ResourceLimits>,
    /// Root manifest, if one was loaded
    pub config: Option<Arc<Config>>,
    pub user_address: UserAddressRange,
    /// Address space layout randomization
    pub aslr: bool,
}

impl ShimContext {
    pub fn new(
        vmas: Arc<dyn Bookkeeper>,
        vm: Arc<dyn VirtualMemory>,
        random: Arc<dyn RandomSource>,
        user_address: UserAddressRange,
    ) -> Self {
        Self {
            vmas,
            vm,
            random,
            rlimits: Arc::new(ResourceLimits::new()),
            config: None,
            user_address,
            aslr: false,
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: Arc<Config>) -> Self {
        self.config = Some(config);
        self
    }

    #[must_use]
    pub fn with_aslr(mut self, aslr: bool) -> Self {
        self.aslr = aslr;
        self
    }
}

/// Report a broken internal invariant and bring the process down.
///
/// Used where the VMA ledger and the platform's real mappings would otherwise
/// be left disagreeing with no local way to repair them. All profiles build
/// with `panic = "abort"`, so this terminates the process.
#[cold]
#[inline(never)]
#[allow(clippy::panic)]
pub fn bug(args: core::fmt::Arguments<'_>) -> ! {
    log::error!("BUG: {args}");
    panic!("BUG: {args}");
}

/// `format!`-style front end for [`bug`].
#[macro_export]
macro_rules! shim_bug {
    ($($arg:tt)*) => {
        $crate::bug(core::format_args!($($arg)*))
    };
}
