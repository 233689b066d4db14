//! Process resource limits.
//!
//! One `{ cur, max }` pair per `RLIMIT_*` resource. The brk core only reads
//! and writes the soft limit of `RLIMIT_DATA`; the checked setter is what the
//! `setrlimit` family goes through.

use graft_error::define_shim_error;
use graft_utils::Mutex;
use linux_raw_sys::errno::{EINVAL, EPERM};
use linux_raw_sys::general::{RLIMIT_NOFILE, RLIMIT_STACK};

/// Number of resources tracked (`RLIM_NLIMITS` on Linux).
pub const RLIM_NLIMITS: usize = 16;

/// "No limit".
pub const RLIM_INFINITY: u64 = u64::MAX;

define_shim_error! {
    /// Resource limit errors.
    pub enum RlimitError(0x04) {
        /// Resource number out of range
        UnknownResource = 0x01, EINVAL => "Unknown resource",
        /// Soft limit above hard limit
        SoftAboveHard = 0x02, EINVAL => "Soft limit exceeds hard limit",
        /// Raising the hard limit is not allowed
        RaiseHard = 0x03, EPERM => "Cannot raise hard limit",
    }
}

/// rlimit64 pair: { rlim_cur, rlim_max }
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rlimit {
    /// Soft limit
    pub cur: u64,
    /// Hard limit
    pub max: u64,
}

impl Rlimit {
    pub const fn new(cur: u64, max: u64) -> Self {
        Self { cur, max }
    }

    pub const INFINITE: Self = Self::new(RLIM_INFINITY, RLIM_INFINITY);
}

/// Resource limit table of one process.
#[derive(Debug)]
pub struct ResourceLimits {
    limits: Mutex<[Rlimit; RLIM_NLIMITS]>,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceLimits {
    /// Table with Linux default limits.
    pub fn new() -> Self {
        let mut limits = [Rlimit::INFINITE; RLIM_NLIMITS];
        limits[RLIMIT_STACK as usize] = Rlimit::new(8 * 1024 * 1024, RLIM_INFINITY);
        limits[RLIMIT_NOFILE as usize] = Rlimit::new(1024, 4096);
        Self {
            limits: Mutex::new(limits),
        }
    }

    /// Soft limit of `resource`. Unknown resources are unlimited.
    pub fn get_cur(&self, resource: u32) -> u64 {
        self.limits
            .lock()
            .get(resource as usize)
            .map_or(RLIM_INFINITY, |l| l.cur)
    }

    /// Overwrite the soft limit of `resource` without policy checks.
    ///
    /// Internal use only: the library OS sets `RLIMIT_DATA` itself when it
    /// sizes the heap.
    pub fn set_cur(&self, resource: u32, cur: u64) {
        match self.limits.lock().get_mut(resource as usize) {
            Some(limit) => limit.cur = cur,
            None => log::warn!("[RLIMIT] set_cur: unknown resource {}", resource),
        }
    }

    pub fn get(&self, resource: u32) -> Result<Rlimit, RlimitError> {
        self.limits
            .lock()
            .get(resource as usize)
            .copied()
            .ok_or(RlimitError::UnknownResource)
    }

    /// Replace both limits, enforcing `cur <= max` and a non-increasing hard limit.
    pub fn set(&self, resource: u32, new: Rlimit) -> Result<Rlimit, RlimitError> {
        if new.cur > new.max {
            return Err(RlimitError::SoftAboveHard);
        }
        let mut limits = self.limits.lock();
        let limit = limits
            .get_mut(resource as usize)
            .ok_or(RlimitError::UnknownResource)?;
        if new.max > limit.max {
            return Err(RlimitError::RaiseHard);
        }
        let old = *limit;
        *limit = new;
        Ok(old)
    }
}
