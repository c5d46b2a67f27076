//! Per-connection fid table.
//!
//! Generalizes the teacher's `srv::FId<T>` (bare fid number + filesystem
//! aux state) by also carrying the owning `ResolvedUser` and open-mode bits
//! spec.md's Fid model requires: `ninep::conn` needs the user to run the
//! handler under the right credentials, and needs the open state to reject
//! a `Twalk` on an already-opened fid without asking the backend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use crate::error::{errno, Error, Result};
use crate::userpool::ResolvedUser;

/// One fid's protocol-runtime state, generic over `T` (the backend's own
/// per-fid data — a `PathEntry` for the POSIX backend, a `CtlFile` handle
/// for the ctl backend).
#[derive(Debug)]
pub struct Fid<T> {
    pub fid: u32,
    pub user: Arc<ResolvedUser>,
    /// Set once `Tlopen`/`Tlcreate` succeeds; a `Twalk` on an opened fid is
    /// rejected (spec.md §4.4) rather than left to the backend to notice.
    opened: AtomicBool,
    pub aux: T,
}

impl<T> Fid<T> {
    pub fn new(fid: u32, user: Arc<ResolvedUser>, aux: T) -> Fid<T> {
        Fid {
            fid,
            user,
            opened: AtomicBool::new(false),
            aux,
        }
    }

    pub fn is_opened(&self) -> bool {
        self.opened.load(Ordering::Acquire)
    }

    pub fn mark_opened(&self) {
        self.opened.store(true, Ordering::Release);
    }
}

/// `RwLock<HashMap<..>>` per spec.md §5 ("one rwlock per connection, not a
/// process-wide lock, so unrelated connections never contend").
pub struct FidTable<T> {
    fids: RwLock<HashMap<u32, Arc<Fid<T>>>>,
}

impl<T> FidTable<T> {
    pub fn new() -> FidTable<T> {
        FidTable {
            fids: RwLock::new(HashMap::new()),
        }
    }

    /// Fails with `EBADF` if `fid` is already in use — a client reusing a
    /// live fid number is a protocol-table violation (spec §7), not silently
    /// overwritten.
    pub fn insert(&self, fid: u32, value: Fid<T>) -> Result<Arc<Fid<T>>> {
        self.insert_arc(fid, Arc::new(value))
    }

    /// Like `insert`, but takes a fid already wrapped in `Arc`. Lets a caller
    /// that ran the fid through a `Filesystem::rattach`/`rwalk`/`rxattrwalk`
    /// call (which populates `aux` through interior mutability) insert the
    /// exact same object the backend just wrote into, rather than a second,
    /// freshly-defaulted copy the backend never touched.
    pub fn insert_arc(&self, fid: u32, value: Arc<Fid<T>>) -> Result<Arc<Fid<T>>> {
        let mut fids = self.fids.write().unwrap();
        if fids.contains_key(&fid) {
            return Err(Error::No(errno::EBADF));
        }
        fids.insert(fid, value.clone());
        Ok(value)
    }

    /// Unconditionally replace (or create) the entry at `fid`, for an
    /// in-place `Twalk` (spec §4.4: "if source == target, the walk mutates
    /// the source in place") where the target fid number already exists and
    /// the duplicate check in `insert`/`insert_arc` would otherwise reject it.
    pub fn replace(&self, fid: u32, value: Arc<Fid<T>>) {
        self.fids.write().unwrap().insert(fid, value);
    }

    pub fn lookup(&self, fid: u32) -> Result<Arc<Fid<T>>> {
        self.fids
            .read()
            .unwrap()
            .get(&fid)
            .cloned()
            .ok_or(Error::No(errno::EBADF))
    }

    pub fn remove(&self, fid: u32) -> Result<Arc<Fid<T>>> {
        self.fids
            .write()
            .unwrap()
            .remove(&fid)
            .ok_or(Error::No(errno::EBADF))
    }

    pub fn foreach(&self, mut f: impl FnMut(u32, &Arc<Fid<T>>)) {
        for (fid, entry) in self.fids.read().unwrap().iter() {
            f(*fid, entry);
        }
    }

    pub fn len(&self) -> usize {
        self.fids.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drain every fid, for connection teardown (spec.md §4.4/§4.5: synthesize
    /// a `Tclunk` per remaining fid on transport EOF).
    pub fn drain(&self) -> Vec<(u32, Arc<Fid<T>>)> {
        self.fids.write().unwrap().drain().collect()
    }
}

impl<T> Default for FidTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> Arc<ResolvedUser> {
        Arc::new(ResolvedUser {
            uid: 1000,
            gid: 1000,
            uname: "alice".into(),
            groups: vec![],
        })
    }

    #[test]
    fn insert_then_lookup_round_trips() {
        let table: FidTable<()> = FidTable::new();
        table.insert(1, Fid::new(1, user(), ())).unwrap();
        assert!(table.lookup(1).is_ok());
    }

    #[test]
    fn inserting_a_duplicate_fid_fails() {
        let table: FidTable<()> = FidTable::new();
        table.insert(1, Fid::new(1, user(), ())).unwrap();
        assert!(table.insert(1, Fid::new(1, user(), ())).is_err());
    }

    #[test]
    fn lookup_of_unknown_fid_is_ebadf() {
        let table: FidTable<()> = FidTable::new();
        match table.lookup(42) {
            Err(Error::No(e)) => assert_eq!(e, errno::EBADF),
            other => panic!("expected EBADF, got {other:?}"),
        }
    }

    #[test]
    fn remove_drops_the_entry() {
        let table: FidTable<()> = FidTable::new();
        table.insert(1, Fid::new(1, user(), ())).unwrap();
        table.remove(1).unwrap();
        assert!(table.lookup(1).is_err());
    }

    #[test]
    fn opened_flag_starts_false_and_latches_true() {
        let fid = Fid::new(1, user(), ());
        assert!(!fid.is_opened());
        fid.mark_opened();
        assert!(fid.is_opened());
    }
}
