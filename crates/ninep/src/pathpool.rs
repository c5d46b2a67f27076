//! Interned host paths shared by every fid that walked to the same place.
//!
//! spec.md's Path/IOCtx data model has no analogue in the teacher: `unpfs`
//! keeps a bare `PathBuf` per fid with no sharing at all. This is new
//! functionality, built the way the teacher builds its other refcounted
//! tables (`Arc`/`Weak` instead of a C refcount + manual destroy).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};

/// A single interned path. Cheap to clone (`Arc`); dropped once every
/// `Fid` that walked here has clunked or walked elsewhere.
#[derive(Debug)]
pub struct PathEntry {
    pub path: PathBuf,
    pub ioctx: super::ioctx::IOCtxPool,
}

/// Process-wide (when `sharepath` is enabled) or per-connection interning
/// table, keyed by the canonicalized host path.
///
/// Because every `Fid` holding a `PathEntry` keeps an `Arc`, two fids walked
/// to the same file share one `IOCtxPool`, which is what makes `sharefd`
/// (module E) possible: open-file reuse is keyed off the `PathEntry`, not
/// off the fid.
pub struct PathPool {
    entries: Mutex<HashMap<PathBuf, Weak<PathEntry>>>,
}

impl PathPool {
    pub fn new() -> PathPool {
        PathPool {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Intern `path`, returning the shared entry. Two calls with the same
    /// path return the same `Arc` as long as something else still holds it.
    pub fn intern(&self, path: &Path) -> Arc<PathEntry> {
        let mut entries = self.entries.lock().unwrap();
        if let Some(weak) = entries.get(path) {
            if let Some(strong) = weak.upgrade() {
                return strong;
            }
        }
        let entry = Arc::new(PathEntry {
            path: path.to_path_buf(),
            ioctx: super::ioctx::IOCtxPool::new(),
        });
        entries.insert(path.to_path_buf(), Arc::downgrade(&entry));
        entry
    }

    /// Drop interning-table entries with no remaining `Fid` reference.
    /// Purely a bookkeeping pass; `Arc`'s own refcounting already releases
    /// the `PathEntry` itself the moment the last strong ref is dropped.
    pub fn flush(&self) {
        self.entries
            .lock()
            .unwrap()
            .retain(|_, weak| weak.strong_count() > 0);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PathPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_the_same_path_twice_shares_one_entry() {
        let pool = PathPool::new();
        let a = pool.intern(Path::new("/exports/a"));
        let b = pool.intern(Path::new("/exports/a"));
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn distinct_paths_get_distinct_entries() {
        let pool = PathPool::new();
        let a = pool.intern(Path::new("/exports/a"));
        let b = pool.intern(Path::new("/exports/b"));
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn flush_drops_unreferenced_paths() {
        let pool = PathPool::new();
        let kept = pool.intern(Path::new("/exports/kept"));
        drop(pool.intern(Path::new("/exports/released")));
        pool.flush();
        assert_eq!(pool.len(), 1);
        drop(kept);
    }
}
