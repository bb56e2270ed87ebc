#![forbid(unsafe_code)]
//! Error types for e2view.
//!
//! # Error Taxonomy
//!
//! e2view uses a two-layer error model:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `e2v-types` | On-disk format violations detected during byte parsing |
//! | Runtime | `E2Error` | `e2v-error` (this crate) | User-facing errors for CLI and API consumers |
//!
//! ## Mapping Policy: ParseError → E2Error
//!
//! `e2v-error` is intentionally independent of `e2v-types` and `e2v-ondisk`
//! to avoid cyclic dependencies. The conversion from `ParseError` to
//! `E2Error` is implemented in `e2v-core`, which depends on both crates:
//!
//! | ParseError Variant | E2Error Variant |
//! |--------------------|-----------------|
//! | `InsufficientData` | `ShortRead` — a record claimed more bytes than the image holds |
//! | `InvalidMagic` | `Format` — wrong filesystem type, not corruption |
//! | `InvalidField` | `Format` — structurally invalid on-disk value |
//! | `IntegerConversion` | `Parse` — arithmetic overflow in parsed values |
//!
//! Every variant maps to exactly one POSIX errno via [`E2Error::to_errno`].
//! The mapping is exhaustive (no wildcard arms) so adding a new variant is a
//! compile error until its errno is assigned.
//!
//! All string payloads are owned (`String`) so errors can cross API
//! boundaries without lifetime entanglement.

use thiserror::Error;

/// Unified error type for all e2view operations.
///
/// This is the canonical error type returned by CLI commands and public API
/// surfaces. Internal crate-specific errors (e.g., `ParseError` from
/// `e2v-types`) are converted into `E2Error` at crate boundaries. Every
/// variant is a recoverable, returned-by-value error; the engine never
/// terminates the process.
#[derive(Debug, Error)]
pub enum E2Error {
    /// Operating system I/O error while opening or reading the image.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid on-disk format (bad magic, structurally invalid field).
    #[error("invalid on-disk format: {0}")]
    Format(String),

    /// Parse-layer error surfaced to the user.
    ///
    /// Carries the string representation of a `ParseError` from `e2v-types`
    /// when no more specific variant applies.
    #[error("parse error: {0}")]
    Parse(String),

    /// A read produced fewer bytes than the record requires.
    ///
    /// Raised when a superblock, descriptor, inode, directory entry, or data
    /// block read would run past the end of the image.
    #[error("short read: need {needed} bytes at offset {offset}")]
    ShortRead { offset: u64, needed: usize },

    /// On-disk geometry is invalid or out of the supported range.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    /// Inode number is zero or exceeds the filesystem's inode count.
    #[error("invalid inode number: {0}")]
    InvalidInode(u32),

    /// A path component matched no directory entry.
    #[error("not found: {0}")]
    NotFound(String),

    /// An intermediate path component is not a directory.
    #[error("not a directory")]
    NotDirectory,

    /// Attempted a file-content operation on a directory.
    #[error("is a directory")]
    IsDirectory,
}

impl E2Error {
    /// Convert this error into a POSIX errno.
    ///
    /// The mapping is exhaustive — every variant has an explicit arm.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::ShortRead { .. } => libc::EIO,
            Self::Format(_) | Self::Parse(_) | Self::InvalidGeometry(_) => libc::EINVAL,
            Self::InvalidInode(_) | Self::NotFound(_) => libc::ENOENT,
            Self::NotDirectory => libc::ENOTDIR,
            Self::IsDirectory => libc::EISDIR,
        }
    }
}

/// Result alias using `E2Error`.
pub type Result<T> = std::result::Result<T, E2Error>;
