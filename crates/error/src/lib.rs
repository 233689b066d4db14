//! Error handling infrastructure for the graft library OS.
//!
//! Provides the `define_shim_error!` macro so every subsystem declares its
//! errors the same way: a closed `Copy` enum with a subsystem-scoped numeric
//! code, a human readable description and the Linux errno the error maps to
//! when it has to leave the library OS through a syscall return value.
//!
//! ## Usage
//!
//! ### Simple errors (errno given explicitly)
//! ```ignore
//! define_shim_error! {
//!     pub enum PalError(0x01) {
//!         NoMemory = 0x01, ENOMEM => "Platform is out of memory",
//!         Denied = 0x02, EACCES => "Platform denied the request",
//!     }
//! }
//! ```
//!
//! ### Nested errors (errno taken from the inner error)
//! ```ignore
//! define_shim_error! {
//!     pub enum InitError(0x06) {
//!         Bookkeeping(VmaError) = 0x03 => "VMA bookkeeping failed",
//!     }
//! }
//! ```

#![no_std]

/// Macro to define a library OS error type with consistent handling.
///
/// Simple variants must name their errno after the code. Nested variants
/// wrap an inner error type that itself provides `errno()`.
#[macro_export]
macro_rules! define_shim_error {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident($subsystem:literal) {
            $(
                $(#[$variant_meta:meta])*
                $variant:ident $(($inner:ty))? = $code:literal $(, $errno:expr)? => $desc:literal
            ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        $vis enum $name {
            $(
                $(#[$variant_meta])*
                $variant $(($inner))?,
            )*
        }

        impl $name {
            /// Subsystem identifier for this error type.
            pub const SUBSYSTEM: u8 = $subsystem;

            /// Get numeric error code for debugging.
            pub const fn code(&self) -> u16 {
                match self {
                    $(
                        $crate::define_shim_error!(@pattern $variant $(($inner))? _unused) => {
                            (($subsystem as u16) << 8) | $code
                        }
                    )*
                }
            }

            /// Get error name for logging.
            pub const fn name(&self) -> &'static str {
                match self {
                    $(
                        $crate::define_shim_error!(@pattern $variant $(($inner))? _unused) => {
                            $desc
                        }
                    )*
                }
            }

            /// Positive Linux errno reported when this error reaches a syscall boundary.
            pub const fn errno(&self) -> u32 {
                match self {
                    $(
                        $crate::define_shim_error!(@pattern $variant $(($inner))? inner) => {
                            $crate::define_shim_error!(@errno inner $(($inner))? $(, $errno)?)
                        }
                    )*
                }
            }
        }

        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                match self {
                    $(
                        $crate::define_shim_error!(@pattern $variant $(($inner))? inner) => {
                            $crate::define_shim_error!(@display_body self f $desc $(($inner))? inner)
                        }
                    )*
                }
            }
        }

        impl core::error::Error for $name {}
    };

    // Helper to generate patterns
    (@pattern $variant:ident ($inner:ty) $bind:ident) => { Self::$variant($bind) };
    (@pattern $variant:ident $bind:ident) => { Self::$variant };

    // Nested variants report the errno of the wrapped error
    (@errno $bind:ident ($inner:ty)) => { $bind.errno() };
    (@errno $bind:ident , $errno:expr) => { $errno };

    // Helper to generate display bodies
    (@display_body $self:ident $f:ident $desc:literal ($inner:ty) $bind:ident) => {
        write!($f, "E{:04X}: {} ({})", $self.code(), $desc, $bind)
    };
    (@display_body $self:ident $f:ident $desc:literal $bind:ident) => {
        write!($f, "E{:04X}: {}", $self.code(), $desc)
    };
}
