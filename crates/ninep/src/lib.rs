#![deny(unsafe_code)]
//! Asynchronous 9P2000.L protocol runtime.
//!
//! This crate implements the wire codec, connection state machine, and
//! credential-switching worker dispatch for a 9P2000.L file server; it does
//! not implement a filesystem backend itself. The `diod` crate in this
//! workspace hosts a POSIX backend and a synthetic ctl backend on top of it.
//!
//! # Overview
//!
//! The 9P protocol was originally developed for the Plan 9 distributed
//! operating system. 9P2000.L is an extended variant that adds Linux-specific
//! features like proper permission handling, symbolic links, and other POSIX
//! semantics.
//!
//! # Getting Started
//!
//! To build a 9P2000.L server on top of this crate:
//!
//! 1. Define a type to represent your per-fid backend state (or use `()` for
//!    stateless fids).
//! 2. Implement the [`srv::Filesystem`] trait for your filesystem type.
//! 3. Build a [`srv::Server`] and run its accept loop.
//!
//! # Example
//!
//! ```no_run
//! use ninep::{srv::Filesystem, fidtable::Fid, FCall, QId, QIdType, Result};
//! use async_trait::async_trait;
//!
//! #[derive(Clone)]
//! struct MyFs;
//!
//! #[derive(Default)]
//! struct MyFid;
//!
//! #[async_trait]
//! impl Filesystem for MyFs {
//!     type Fid = MyFid;
//!
//!     async fn rattach(
//!         &self,
//!         fid: &Fid<Self::Fid>,
//!         _afid: Option<&Fid<Self::Fid>>,
//!         _uname: &str,
//!         _aname: &str,
//!         _n_uname: u32,
//!     ) -> Result<FCall> {
//!         let _ = fid;
//!         Ok(FCall::RAttach {
//!             qid: QId { typ: QIdType::DIR, version: 0, path: 0 },
//!         })
//!     }
//!
//!     // Implement other required methods...
//! }
//! ```
//!
//! # Fid Management
//!
//! A "fid" (file identifier) is a 32-bit handle used by the client to
//! reference a file or directory. [`fidtable::FidTable`] tracks the mapping
//! between fids and backend objects for one connection.
//!
//! **Important invariants:**
//! - Each fid is unique per connection.
//! - Fids persist across operations until explicitly clunked.
//! - Walking to a new fid creates a new fid; the old one remains valid.
//! - After `TClunk`, the fid is invalid and removed from the table.
//! - A fid that has been opened (`TlOpen`/`TlCreate`) cannot be walked again.
//!
//! # Error Handling
//!
//! Return errors using the [`error::Error`] type. The connection runtime
//! converts these to `RlError` messages carrying the appropriate errno.
//!
//! # Transport
//!
//! [`transport::Transport`] supports TCP, Unix domain sockets, and
//! pre-connected file descriptors handed in by an invoking agent.
//!
//! # Safety
//!
//! This crate denies unsafe code by default. The one exception is
//! [`credentials`], which calls the Linux-only `setfsuid`/`setfsgid`
//! syscalls raw through `nix::libc` (nix does not provide a safe wrapper for
//! them); that module carries an explicit `#[allow(unsafe_code)]`.
pub mod conn;
pub mod credentials;
pub mod error;
pub mod fcall;
pub mod fidtable;
pub mod ioctx;
pub mod pathpool;
pub mod serialize;
pub mod srv;
pub mod transport;
pub mod userpool;
#[macro_use]
pub mod utils;

pub use crate::error::errno;
pub use crate::error::Error;
pub use crate::error::Result;
pub use crate::fcall::*;
