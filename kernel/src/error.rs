//! Kernel-wide error taxonomy.
//!
//! Every core API returns `Result<T, Error>` instead of the raw negative-int
//! convention common in C kernels; the syscall dispatch boundary is the only
//! place that flattens an `Error` back into a signed return code.

use core::fmt;

/// Error codes returned by core kernel APIs.
///
/// Mirrors the fixed vocabulary of validation, resource-exhaustion,
/// not-found/precondition, permission, and fatal-internal codes that every
/// subsystem (allocator, page mapper, process table, scheduler) shares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Malformed argument that isn't covered by a more specific variant.
    Invalid,
    /// A required pointer/handle argument was null/zero.
    NullParameter,
    /// A numeric argument fell outside its valid range.
    Range,
    /// An index or address fell outside a bounded structure.
    Bounds,
    /// An address or size violated an alignment requirement.
    Align,
    /// Caller lacks the privilege or session to perform this operation.
    Permission,
    /// Out of physical memory / address space.
    Memory,
    /// A fixed-capacity table (block records, processes) has no free slot.
    NoFree,
    /// No process exists with the given id.
    NoSuchProcess,
    /// No matching table entry (block, directory, environment key, ...).
    NoSuchEntry,
    /// Operation found nothing to return (e.g. empty stream).
    NoData,
    /// Subsystem used before its `init()` ran.
    NotInitialized,
    /// Operation is a no-op because the requested state already holds.
    Already,
    /// Broken internal invariant; logged, not a panic.
    Bug,
    /// Target was terminated by an external `kill`.
    Killed,
    NotImplemented,
}

impl Error {
    /// The syscall-ABI encoding: negative codes, grouped by taxonomy, stable
    /// across kernel versions since user-space programs pattern-match on them.
    pub const fn as_i32(self) -> i32 {
        match self {
            Error::Invalid => -1,
            Error::NullParameter => -2,
            Error::Range => -3,
            Error::Bounds => -4,
            Error::Align => -5,
            Error::Permission => -6,
            Error::Memory => -7,
            Error::NoFree => -8,
            Error::NoSuchProcess => -9,
            Error::NoSuchEntry => -10,
            Error::NoData => -11,
            Error::NotInitialized => -12,
            Error::Already => -13,
            Error::Bug => -14,
            Error::Killed => -15,
            Error::NotImplemented => -16,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Error::Invalid => "invalid",
            Error::NullParameter => "nullparameter",
            Error::Range => "range",
            Error::Bounds => "bounds",
            Error::Align => "align",
            Error::Permission => "permission",
            Error::Memory => "memory",
            Error::NoFree => "nofree",
            Error::NoSuchProcess => "nosuchprocess",
            Error::NoSuchEntry => "nosuchentry",
            Error::NoData => "nodata",
            Error::NotInitialized => "notinitialized",
            Error::Already => "already",
            Error::Bug => "bug",
            Error::Killed => "killed",
            Error::NotImplemented => "notimplemented",
        };
        f.write_str(s)
    }
}

/// Shorthand used throughout the core subsystems.
pub type KResult<T> = Result<T, Error>;
