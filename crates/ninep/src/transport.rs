//! Listening/connected transports a `Connection` can run over.
//!
//! The teacher's `srv_async_tcp`/`srv_async_unix` each hard-code their own
//! listener type and call `dispatch` directly on the split halves. This
//! generalizes that into one `Transport` enum so `ninep::conn::Connection`
//! doesn't need to be generic over the stream type, and adds the
//! pre-connected-fd case spec.md §6 names (`--rfdno`/`--wfdno`, used when an
//! invoking agent like `diodmount` has already set up the pipe).
#![allow(unsafe_code)]

use std::os::fd::{FromRawFd, OwnedFd, RawFd};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};

use crate::error::Result;

/// Owned read/write halves of a connected transport, erased to trait
/// objects so `Connection` can hold one without a type parameter.
pub struct Halves {
    pub read: Box<dyn AsyncRead + Send + Unpin>,
    pub write: Box<dyn AsyncWrite + Send + Unpin>,
}

/// A connected 9P transport, already split into its read/write halves.
pub enum Transport {
    Tcp(TcpStream),
    Unix(UnixStream),
    /// Pre-connected file descriptors handed in by an invoking agent. RDMA
    /// is a named-but-unimplemented transport per spec.md's Non-goals; no
    /// variant is provided for it.
    PreconnectedFds { rfd: OwnedFd, wfd: OwnedFd },
}

impl Transport {
    /// Wrap a pair of raw fds as a pre-connected transport. `rfd`/`wfd` must
    /// be valid, open, and not otherwise owned — mirrors how `--rfdno`/
    /// `--wfdno` are documented in spec.md §6 (inherited from the parent
    /// process, consumed exactly once).
    ///
    /// # Safety
    /// Caller must guarantee `rfd`/`wfd` are valid open file descriptors
    /// this process exclusively owns from this call forward.
    pub unsafe fn from_raw_fds(rfd: RawFd, wfd: RawFd) -> Transport {
        Transport::PreconnectedFds {
            rfd: unsafe { OwnedFd::from_raw_fd(rfd) },
            wfd: unsafe { OwnedFd::from_raw_fd(wfd) },
        }
    }

    pub fn into_halves(self) -> Result<Halves> {
        match self {
            Transport::Tcp(stream) => {
                let (r, w) = stream.into_split();
                Ok(Halves {
                    read: Box::new(r),
                    write: Box::new(w),
                })
            }
            Transport::Unix(stream) => {
                let (r, w) = stream.into_split();
                Ok(Halves {
                    read: Box::new(r),
                    write: Box::new(w),
                })
            }
            Transport::PreconnectedFds { rfd, wfd } => {
                let rfile = std::fs::File::from(rfd);
                let wfile = std::fs::File::from(wfd);
                Ok(Halves {
                    read: Box::new(tokio::fs::File::from_std(rfile)),
                    write: Box::new(tokio::fs::File::from_std(wfile)),
                })
            }
        }
    }
}
