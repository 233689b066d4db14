//! Syscall entry points backed by the shim core.
//!
//! Handlers return [`SyscallResult`]: `Ok(value)` for the return register,
//! `Err(errno)` (positive) for failures. The dispatcher negates on the way out.

use linux_raw_sys::errno::ESRCH;

use crate::brk::Brk;
use crate::rlimit::{ResourceLimits, Rlimit};

pub type SyscallResult = Result<i64, u32>;

/// brk(2).
///
/// Never fails: returns the resulting break, which is the unchanged one when
/// the request was refused (and for the `brk(0)` query).
pub fn sys_brk(brk: &Brk, addr: usize) -> SyscallResult {
    Ok(brk.adjust(addr) as i64)
}

/// getrlimit(2), minus the user-memory copy.
pub fn sys_getrlimit(limits: &ResourceLimits, resource: u32) -> Result<Rlimit, u32> {
    limits.get(resource).map_err(|e| {
        log::debug!("[SYSCALL] getrlimit({}): {}", resource, e);
        e.errno()
    })
}

/// setrlimit(2), minus the user-memory copy.
pub fn sys_setrlimit(limits: &ResourceLimits, resource: u32, new: Rlimit) -> SyscallResult {
    match limits.set(resource, new) {
        Ok(_) => Ok(0),
        Err(e) => {
            log::debug!("[SYSCALL] setrlimit({}): {}", resource, e);
            Err(e.errno())
        }
    }
}

/// prlimit64(2) for the calling process: optionally install `new`, and
/// return the limit that was in place before.
pub fn sys_prlimit64(
    limits: &ResourceLimits,
    pid: i32,
    self_pid: i32,
    resource: u32,
    new: Option<Rlimit>,
) -> Result<Rlimit, u32> {
    if pid != 0 && pid != self_pid {
        log::warn!("[SYSCALL] prlimit64: pid {} not supported (only current process)", pid);
        return Err(ESRCH);
    }
    match new {
        Some(new) => limits.set(resource, new),
        None => limits.get(resource),
    }
    .map_err(|e| e.errno())
}

/// Tear the heap down before a new image is loaded by execve.
///
/// The new image gets a fresh heap through [`Brk::init`] once its data
/// segment size is known.
pub fn reset_brk_for_exec(slot: &mut Option<Brk>) {
    match slot.take() {
        Some(brk) => brk.finalize(),
        None => log::trace!("[SYSCALL] exec: no heap to reset"),
    }
}
