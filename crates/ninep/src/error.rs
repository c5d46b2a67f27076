//! Error type shared by every 9P2000.L operation.
//!
//! A handler returns `Err(Error::No(errno))` to have the connection translate it
//! into an `Rlerror` carrying that errno, per spec §7 ("Error Handling Design").

use std::io;

/// Re-exports of the errno constants handlers match against.
///
/// Kept as plain `i32` constants (rather than `nix::errno::Errno` variants)
/// because the wire value in `Rlerror` is the bare errno number.
pub mod errno {
    pub use nix::libc::{
        EACCES, EBADF, ECANCELED, EEXIST, EINTR, EINVAL, EIO, EISDIR, ELOOP, ENODATA, ENOENT,
        ENOMEM, ENOSYS, ENOTDIR, ENOTEMPTY, ENOTSUP, EOPNOTSUPP, EPERM, EPROTO, EROFS, EXDEV,
    };
}

/// Every error a `Filesystem` method or the connection runtime can produce.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A host I/O error (syscall failure, transport failure). Converted to
    /// `Rlerror` using `io::Error::raw_os_error()` when available, `EIO` otherwise.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// An explicit errno a handler wants to surface to the client, e.g.
    /// `Error::No(errno::ENOENT)`.
    #[error("errno {0}")]
    No(i32),

    /// A protocol-table violation: malformed message, duplicate tag, unknown
    /// fid, and similar conditions spec §7 groups as "protocol table
    /// violations" rather than host syscall failures.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl Error {
    /// The errno to place in `Rlerror::ecode`.
    pub fn errno(&self) -> i32 {
        match self {
            Error::Io(e) => e.raw_os_error().unwrap_or(errno::EIO),
            Error::No(n) => *n,
            Error::Protocol(_) => errno::EPROTO,
        }
    }
}

impl From<nix::Error> for Error {
    fn from(e: nix::Error) -> Self {
        Error::No(e as i32)
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Io(e) => e,
            other => io::Error::from_raw_os_error(other.errno()),
        }
    }
}

/// Shorthand for `Result<T, Error>`, used throughout `ninep`.
pub type Result<T> = std::result::Result<T, Error>;
