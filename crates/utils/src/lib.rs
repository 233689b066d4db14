//! Shared primitives for the graft library OS crates.
//!
//! The lock API is `spin` re-exported under stable names so the rest of the
//! workspace never names the backing crate directly. Alignment helpers work on
//! power-of-two granularities and never silently wrap.

#![cfg_attr(not(feature = "std"), no_std)]

// Note: spin::Mutex is re-exported as Mutex for API compatibility
pub use spin::{Lazy, Once};
pub use spin::{Mutex, MutexGuard};
pub use spin::{RwLock, RwLockReadGuard, RwLockWriteGuard};

pub use hashbrown::{HashMap, HashSet};

/// Round `val` up to the next multiple of `align`.
///
/// `align` must be a power of two. Returns `None` if the result would not fit
/// in a `usize`.
#[inline]
pub const fn checked_align_up(val: usize, align: usize) -> Option<usize> {
    debug_assert!(align.is_power_of_two());
    match val.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

/// Round `val` up to the next multiple of `align`, saturating at the highest
/// aligned `usize`.
#[inline]
pub const fn align_up(val: usize, align: usize) -> usize {
    match checked_align_up(val, align) {
        Some(v) => v,
        None => usize::MAX & !(align - 1),
    }
}

/// Round `val` down to a multiple of `align`.
#[inline]
pub const fn align_down(val: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    val & !(align - 1)
}

/// Check whether `val` is a multiple of `align`.
#[inline]
pub const fn is_aligned(val: usize, align: usize) -> bool {
    debug_assert!(align.is_power_of_two());
    val & (align - 1) == 0
}

// ============================================================================
// Unit Tests
// ============================================================================
