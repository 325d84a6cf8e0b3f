//! Error taxonomy shared by every OptiVFS component (spec §7).
//!
//! The kernel bridge only understands raw errno values. Internally every
//! fallible operation returns an [`OptiError`]; at the boundary it is
//! converted with [`OptiError::raw_os_error`].

use std::fmt;
use std::io;

/// The error taxonomy from spec §7, independent of any particular syscall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptiError {
    /// `ENOENT` — no such underlying path.
    NotFound,
    /// `ENODATA` — no such store/xattr entry.
    NoData,
    /// `EACCES` — permission evaluator denied the request.
    PermissionDenied,
    /// `EBADFD` — an operation required a file handle and none was provided,
    /// or the handle's descriptor was already released.
    BadHandle,
    /// `EINVAL` — malformed argument (e.g. an unknown lock type).
    InvalidArgument,
    /// `EBUSY` — a `RENAME_EXCHANGE` consistency check failed.
    Busy,
    /// `EEXIST` — `XATTR_CREATE` on a key that already exists.
    Exists,
    /// `ERANGE` — xattr list buffer too small.
    Range,
    /// `EIO` — an internal invariant was violated (e.g. a null metadata
    /// handle where one was required).
    Io,
    /// Any other syscall error, passed through unchanged.
    Underlying(i32),
}

impl OptiError {
    /// The errno the kernel bridge should report for this error.
    pub fn raw_os_error(self) -> i32 {
        match self {
            OptiError::NotFound => libc::ENOENT,
            OptiError::NoData => libc::ENODATA,
            OptiError::PermissionDenied => libc::EACCES,
            OptiError::BadHandle => libc::EBADFD,
            OptiError::InvalidArgument => libc::EINVAL,
            OptiError::Busy => libc::EBUSY,
            OptiError::Exists => libc::EEXIST,
            OptiError::Range => libc::ERANGE,
            OptiError::Io => libc::EIO,
            OptiError::Underlying(errno) => errno,
        }
    }
}

impl fmt::Display for OptiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} (errno {})", self, self.raw_os_error())
    }
}

impl std::error::Error for OptiError {}

impl From<io::Error> for OptiError {
    fn from(err: io::Error) -> Self {
        match err.raw_os_error() {
            Some(libc::ENOENT) => OptiError::NotFound,
            Some(libc::EACCES) | Some(libc::EPERM) => OptiError::PermissionDenied,
            Some(libc::EEXIST) => OptiError::Exists,
            Some(libc::EINVAL) => OptiError::InvalidArgument,
            Some(libc::ENODATA) => OptiError::NoData,
            Some(libc::ERANGE) => OptiError::Range,
            Some(errno) => OptiError::Underlying(errno),
            None => OptiError::Io,
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, OptiError>;
