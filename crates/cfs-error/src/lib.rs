#![forbid(unsafe_code)]
//! Error types for chainfs.
//!
//! # Error Taxonomy
//!
//! chainfs uses a two-layer error model:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `cfs-types` | Malformed bytes inside a single block |
//! | Runtime | `CfsError` | `cfs-error` (this crate) | Everything an engine operation can report |
//!
//! `cfs-error` does not depend on `cfs-types`. Codec failures are turned into
//! `CfsError::Inconsistent` by `cfs-ondisk`, which knows the block number.
//!
//! ## Propagation
//!
//! Lower layers (cache, allocator) report failures upward without retrying.
//! The inode engine and the file I/O engine abort on the first failure and
//! leave whatever was already written in place; nothing is rolled back.
//!
//! ## errno Mapping
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io`, `Fail`, `Inconsistent` | `EIO` (or the raw OS error) |
//! | `Param`, `Format` | `EINVAL` |
//! | `NotFound` | `ENOENT` |
//! | `Exists` | `EEXIST` |
//! | `NoSpace` | `ENOSPC` |
//! | `TooManyLinks` | `ELOOP` |
//! | `NameTooLong` | `ENAMETOOLONG` |
//! | `NotDirectory` | `ENOTDIR` |
//! | `IsDirectory` | `EISDIR` |
//! | `NotEmpty` | `ENOTEMPTY` |
//! | `PermissionDenied` | `EACCES` |
//! | `Busy` | `EBUSY` |

use thiserror::Error;

/// Unified error type for all chainfs operations.
#[derive(Debug, Error)]
pub enum CfsError {
    /// Operating system I/O error from a device backend.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A lower layer failed (device rejected a transfer, flush failed).
    #[error("operation failed: {0}")]
    Fail(String),

    /// Null, out-of-range, or otherwise invalid argument.
    #[error("invalid argument: {0}")]
    Param(String),

    /// The device does not hold a usable chainfs image.
    #[error("invalid on-disk format: {0}")]
    Format(String),

    /// The inode graph contradicts itself at a known block.
    ///
    /// Raised when a parent chain lacks the entry being freed, when a block
    /// fails to decode, or when a parent walk never reaches the root.
    #[error("inconsistent filesystem at block {block}: {detail}")]
    Inconsistent { block: u32, detail: String },

    /// A path component is missing.
    #[error("not found: {0}")]
    NotFound(String),

    /// Creation target already exists.
    #[error("file exists")]
    Exists,

    /// The inode or data bitmap is exhausted.
    #[error("no space left on device")]
    NoSpace,

    /// Symlink resolution exceeded the hop limit.
    #[error("too many levels of symbolic links")]
    TooManyLinks,

    /// A component or a whole path exceeds the format limits.
    #[error("name too long")]
    NameTooLong,

    /// A non-terminal path component is not a directory.
    #[error("not a directory")]
    NotDirectory,

    /// A file operation was attempted on a directory.
    #[error("is a directory")]
    IsDirectory,

    /// Attempted to free a directory that still has entries.
    #[error("directory not empty")]
    NotEmpty,

    /// Permission bits deny the requested access mode.
    #[error("permission denied")]
    PermissionDenied,

    /// The file is still referenced by hardlinks.
    #[error("resource busy: {0}")]
    Busy(String),
}

impl CfsError {
    /// Convert this error into a POSIX errno for the system-call layer.
    ///
    /// The match is exhaustive so a new variant cannot be added without
    /// choosing its errno.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Fail(_) | Self::Inconsistent { .. } => libc::EIO,
            Self::Param(_) | Self::Format(_) => libc::EINVAL,
            Self::NotFound(_) => libc::ENOENT,
            Self::Exists => libc::EEXIST,
            Self::NoSpace => libc::ENOSPC,
            Self::TooManyLinks => libc::ELOOP,
            Self::NameTooLong => libc::ENAMETOOLONG,
            Self::NotDirectory => libc::ENOTDIR,
            Self::IsDirectory => libc::EISDIR,
            Self::NotEmpty => libc::ENOTEMPTY,
            Self::PermissionDenied => libc::EACCES,
            Self::Busy(_) => libc::EBUSY,
        }
    }

    /// Shorthand for an `Inconsistent` error at `block`.
    #[must_use]
    pub fn inconsistent(block: u32, detail: impl Into<String>) -> Self {
        Self::Inconsistent {
            block,
            detail: detail.into(),
        }
    }
}

/// Result alias using `CfsError`.
pub type Result<T> = std::result::Result<T, CfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_covers_all_variants() {
        let cases: Vec<(CfsError, libc::c_int)> = vec![
            (CfsError::Io(std::io::Error::other("test")), libc::EIO),
            (CfsError::Fail("flush".into()), libc::EIO),
            (CfsError::Param("null".into()), libc::EINVAL),
            (CfsError::Format("bad magic".into()), libc::EINVAL),
            (CfsError::inconsistent(9, "missing entry"), libc::EIO),
            (CfsError::NotFound("x".into()), libc::ENOENT),
            (CfsError::Exists, libc::EEXIST),
            (CfsError::NoSpace, libc::ENOSPC),
            (CfsError::TooManyLinks, libc::ELOOP),
            (CfsError::NameTooLong, libc::ENAMETOOLONG),
            (CfsError::NotDirectory, libc::ENOTDIR),
            (CfsError::IsDirectory, libc::EISDIR),
            (CfsError::NotEmpty, libc::ENOTEMPTY),
            (CfsError::PermissionDenied, libc::EACCES),
            (CfsError::Busy("refcount 1".into()), libc::EBUSY),
        ];

        for (error, expected_errno) in &cases {
            assert_eq!(
                error.to_errno(),
                *expected_errno,
                "wrong errno for {error:?}",
            );
        }
    }

    #[test]
    fn io_error_preserves_raw_os_error() {
        let raw = std::io::Error::from_raw_os_error(libc::EPERM);
        assert_eq!(CfsError::Io(raw).to_errno(), libc::EPERM);
    }

    #[test]
    fn display_formatting() {
        let err = CfsError::inconsistent(42, "parent chain lacks child 77");
        assert_eq!(
            err.to_string(),
            "inconsistent filesystem at block 42: parent chain lacks child 77"
        );
        assert_eq!(CfsError::NoSpace.to_string(), "no space left on device");
        assert_eq!(
            CfsError::NotFound("/bar".into()).to_string(),
            "not found: /bar"
        );
    }
}
