//! User/group resolution and a refcounted cache of resolved identities.
//!
//! Mirrors the no-caching-of-`/etc/passwd`-but-cache-the-resolved-struct
//! design of `diod_upool.c`: a `ResolvedUser` is looked up once at `Tattach`
//! and shared (via `Arc`) by every fid cloned from that attach through
//! `Twalk`; it's dropped once the last fid referencing it is clunked. Rust's
//! `Arc`/`Weak` give us the refcounting for free instead of `Npuser::refcount`
//! plus a manual destroy callback.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use crate::error::{errno, Error, Result};

/// The squash identity used when a connection's export maps all remote
/// users to a single local one (`diod_conf.c`'s `squashuser`/`squashgid`).
pub const SQUASH_UID: u32 = 65534;
pub const SQUASH_GID: u32 = 65534;

/// A resolved local identity: uid, primary gid, and the full supplementary
/// group list `credentials::assume` hands to `setgroups()`.
///
/// Equivalent to `diod_upool.c`'s `Npuser` + its private `Duser` aux struct,
/// collapsed into one value since Rust doesn't need the split the C code
/// used to hide non-public fields behind `void *aux`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedUser {
    pub uid: u32,
    pub gid: u32,
    pub uname: String,
    /// Supplementary gids, as would be passed to `setgroups(2)`. Does not
    /// include `gid` itself unless the user is also a member of that group
    /// under a different entry (matches `_getsg`'s dedup-by-primary-gid rule).
    pub groups: Vec<u32>,
}

impl ResolvedUser {
    pub fn squash() -> ResolvedUser {
        ResolvedUser {
            uid: SQUASH_UID,
            gid: SQUASH_GID,
            uname: "nobody".to_owned(),
            groups: Vec::new(),
        }
    }
}

enum Key {
    Uid(u32),
    Uname(String),
}

/// Looks up users/groups on demand and caches the result for as long as any
/// fid still references it.
///
/// `diod_upool.c` never caches across attaches: every `Tattach` calls back
/// into `getpwnam`/`getpwuid`. We keep that semantic (every miss re-resolves
/// from the host's user database via `nix`) but additionally let concurrent
/// attaches/walks for the *same* uid share one `Arc<ResolvedUser>`, pruned by
/// `flush()` once nothing references it — a direct analogue of `Npuser`'s
/// refcount reaching zero.
pub struct UserPool {
    by_uid: Mutex<HashMap<u32, Weak<ResolvedUser>>>,
    /// When `Some`, every resolution is replaced with this identity
    /// regardless of the uname/uid requested — diod's `squashuser` export
    /// option.
    squash: Option<ResolvedUser>,
    /// When true, uid/uname lookups that miss the host user database are
    /// fabricated rather than rejected (diod's `--no-userdb` flag, useful in
    /// containers with no `/etc/passwd`).
    no_userdb: bool,
}

impl UserPool {
    pub fn new() -> UserPool {
        UserPool {
            by_uid: Mutex::new(HashMap::new()),
            squash: None,
            no_userdb: false,
        }
    }

    pub fn with_squash(mut self, user: ResolvedUser) -> UserPool {
        self.squash = Some(user);
        self
    }

    pub fn with_no_userdb(mut self, enabled: bool) -> UserPool {
        self.no_userdb = enabled;
        self
    }

    /// Resolve by the numeric uid carried in `Tattach.n_uname`.
    pub fn by_uid(&self, uid: u32) -> Result<Arc<ResolvedUser>> {
        self.resolve(Key::Uid(uid))
    }

    /// Resolve by the `uname` string carried in `Tattach.uname`, used when
    /// the client didn't supply `n_uname` (it was `NONUNAME`).
    pub fn by_uname(&self, uname: &str) -> Result<Arc<ResolvedUser>> {
        self.resolve(Key::Uname(uname.to_owned()))
    }

    fn resolve(&self, key: Key) -> Result<Arc<ResolvedUser>> {
        if let Some(squashed) = &self.squash {
            return Ok(Arc::new(squashed.clone()));
        }

        let uid = match &key {
            Key::Uid(uid) => *uid,
            Key::Uname(uname) => {
                let user = nix::unistd::User::from_name(uname)
                    .map_err(Error::from)?
                    .ok_or(Error::No(errno::EINVAL))?;
                user.uid.as_raw()
            }
        };

        {
            let cache = self.by_uid.lock().unwrap();
            if let Some(weak) = cache.get(&uid) {
                if let Some(strong) = weak.upgrade() {
                    return Ok(strong);
                }
            }
        }

        let resolved = self.lookup(uid)?;
        let arc = Arc::new(resolved);
        self.by_uid.lock().unwrap().insert(uid, Arc::downgrade(&arc));
        Ok(arc)
    }

    fn lookup(&self, uid: u32) -> Result<ResolvedUser> {
        let user = nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(uid))
            .map_err(Error::from)?;

        let user = match user {
            Some(u) => u,
            None if self.no_userdb => {
                return Ok(ResolvedUser {
                    uid,
                    gid: uid,
                    uname: format!("u{uid}"),
                    groups: Vec::new(),
                });
            }
            None => return Err(Error::No(errno::EINVAL)),
        };

        let groups = nix::unistd::getgrouplist(
            &std::ffi::CString::new(user.name.clone()).map_err(|_| Error::No(errno::EINVAL))?,
            user.gid,
        )
        .map_err(Error::from)?
        .into_iter()
        .map(|g| g.as_raw())
        .filter(|&g| g != user.gid.as_raw())
        .collect();

        Ok(ResolvedUser {
            uid: user.uid.as_raw(),
            gid: user.gid.as_raw(),
            uname: user.name,
            groups,
        })
    }

    /// Drop cache entries no fid currently holds a strong reference to.
    /// Called on SIGHUP; matches diod's best-effort invalidation (spec.md §9
    /// leaves live entries alone since tearing down active fids to force a
    /// re-resolution isn't worth the complexity).
    pub fn flush(&self) {
        self.by_uid.lock().unwrap().retain(|_, weak| weak.strong_count() > 0);
    }

    pub fn len(&self) -> usize {
        self.by_uid.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for UserPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn squash_pool_always_returns_the_configured_identity() {
        let pool = UserPool::new().with_squash(ResolvedUser::squash());
        let a = pool.by_uid(1000).unwrap();
        let b = pool.by_uname("whoever").unwrap();
        assert_eq!(a.uid, SQUASH_UID);
        assert_eq!(b.uid, SQUASH_UID);
    }

    #[test]
    fn no_userdb_fabricates_an_identity_for_unknown_uid() {
        let pool = UserPool::new().with_no_userdb(true);
        let u = pool.by_uid(999_999).unwrap();
        assert_eq!(u.uid, 999_999);
        assert_eq!(u.gid, 999_999);
    }

    #[test]
    fn flush_drops_only_unreferenced_entries() {
        let pool = UserPool::new().with_no_userdb(true);
        let kept = pool.by_uid(1).unwrap();
        let _dropped = pool.by_uid(2).unwrap();
        drop(_dropped);
        pool.flush();
        assert_eq!(pool.len(), 1);
        drop(kept);
    }
}
