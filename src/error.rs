//! Error types for the allocator.
//!
//! Recoverable failures (the OS refusing a mapping) are returned as
//! [`AllocError`]. Anything that indicates the allocator's own bookkeeping is
//! corrupt — a double free, a type-tag mismatch, an unknown pointer — is
//! fatal and aborts rather than returning an error, matching the source
//! allocator's abort-on-corruption policy.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, AllocError>;

#[derive(Error, Debug)]
pub enum AllocError {
    #[error("out of memory: failed to satisfy request for {requested} bytes")]
    OutOfMemory { requested: usize },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("the OS page primitive reported a failure during {operation}")]
    SysmemFailure { operation: &'static str },
}

/// Aborts the process with a diagnostic. Used for corruption that must never
/// be allowed to unwind through: double frees, overlapping free-block
/// insertion, descriptor type-tag mismatches on release.
#[cold]
#[inline(never)]
pub fn invariant_violation(detail: &str) -> ! {
    tracing::error!(detail, "allocator invariant violated, aborting");
    std::process::abort();
}

/// Unknown pointer passed to `free`/`realloc`. Fatal per the error taxonomy.
#[cold]
#[inline(never)]
pub fn unknown_pointer(addr: usize) -> ! {
    tracing::error!(addr = format!("{addr:#x}"), "free/realloc of unknown pointer");
    std::process::abort();
}
