//! Per-thread credential switching.
//!
//! Grounded on `diod_upool.c`'s `diod_switch_user`: set the supplementary
//! group list, then `setfsgid`, then `setfsuid`, in that order, so a
//! permission check racing the switch never sees a broader set of
//! credentials than the target user actually has. `setfsuid`/`setfsgid`
//! affect only the calling thread's filesystem UID/GID, which is exactly
//! the scope `ninep::conn` wants: a `tokio::task::spawn_blocking` closure
//! runs to completion on one OS thread, so the switch-then-restore below
//! brackets that one thread's view of the filesystem for that one request.
#![allow(unsafe_code)]

use std::io;

use crate::error::Result;
use crate::userpool::ResolvedUser;
use nix::libc::{self, gid_t, setfsgid, setfsuid};
use nix::unistd::getgroups;

/// Held for the duration of one filesystem operation. Restores the calling
/// thread's fsuid/fsgid/groups to root on drop.
///
/// Must be created and dropped on the same OS thread — `setfsuid`/`setfsgid`
/// are per-thread, so moving this guard across an `.await` that resumes on a
/// different thread would restore the wrong thread's credentials. Only
/// construct this inside a `tokio::task::spawn_blocking` closure, never
/// across an `.await` point.
pub struct CredentialGuard {
    prev_uid: u32,
    prev_gid: u32,
    groups_switched: bool,
}

/// Call the raw `SYS_setgroups` syscall directly instead of going through
/// glibc's `setgroups()` wrapper. glibc's NPTL implementation broadcasts
/// `setgroups`/`setuid`-class changes to every thread in the process via an
/// internal signal, which would race two concurrent `spawn_blocking` workers
/// switching credentials for different requests at once; the underlying
/// Linux syscall is genuinely per-thread, like `setfsuid`/`setfsgid`.
fn raw_setgroups(gids: &[gid_t]) -> Result<()> {
    let ret = unsafe { libc::syscall(libc::SYS_setgroups, gids.len(), gids.as_ptr()) };
    if ret == -1 {
        return Err(io::Error::last_os_error().into());
    }
    Ok(())
}

/// Probe whether `setgroups` applies per-thread or to the whole process on
/// this kernel, mirroring `diod.c`'s `_test_setgroups`: on RHEL6-era kernels
/// it's per-thread and safe to use from `spawn_blocking` workers; on older
/// Ubuntu kernels it's process-wide and would let concurrent requests
/// clobber each other's supplementary groups.
///
/// Clears this thread's groups, sets a throwaway group list on a spawned
/// thread, and checks whether this thread's groups changed too. Returns
/// `true` only if they didn't (true per-thread semantics). Restores this
/// thread's original groups before returning either way.
pub fn probe_per_thread_setgroups() -> bool {
    let saved: Vec<gid_t> = match getgroups() {
        Ok(g) => g.into_iter().map(|gid| gid.as_raw()).collect(),
        Err(_) => return false,
    };

    if raw_setgroups(&[]).is_err() {
        return false;
    }

    let child_ok = std::thread::spawn(|| raw_setgroups(&[42, 37, 63]).is_ok())
        .join()
        .unwrap_or(false);

    let unaffected = getgroups()
        .map(|g| g.is_empty())
        .unwrap_or(false);

    let _ = raw_setgroups(&saved);

    child_ok && unaffected
}

impl CredentialGuard {
    /// Switch the calling thread's fsuid/fsgid/groups to `user`.
    ///
    /// If `run_as_uid` is `Some`, the switch is skipped entirely and the
    /// thread keeps running as that fixed uid — diod's `runasuid` option,
    /// for deployments that already run the whole server unprivileged.
    ///
    /// If `enforce_supplementary_groups` is `false` (the startup probe found
    /// this kernel's `setgroups` isn't per-thread), the group-list switch is
    /// skipped; only fsuid/fsgid are set.
    pub fn assume(
        user: &ResolvedUser,
        run_as_uid: Option<u32>,
        enforce_supplementary_groups: bool,
    ) -> Result<CredentialGuard> {
        if run_as_uid.is_some() {
            return Ok(CredentialGuard {
                prev_uid: u32::MAX,
                prev_gid: u32::MAX,
                groups_switched: false,
            });
        }

        if enforce_supplementary_groups {
            let gids: Vec<gid_t> = user.groups.clone();
            raw_setgroups(&gids)?;
        }

        // setfsuid/setfsgid return the *previous* value and never fail in
        // the sense of returning -1 for a permission error; they silently
        // no-op if the caller lacks CAP_SETUID/CAP_SETGID, which is the
        // state diod's tests run in without root. There's nothing more to
        // check here than what `diod_switch_user` checks.
        let prev_gid = unsafe { setfsgid(user.gid) } as u32;
        let prev_uid = unsafe { setfsuid(user.uid) } as u32;

        Ok(CredentialGuard {
            prev_uid,
            prev_gid,
            groups_switched: enforce_supplementary_groups,
        })
    }
}

impl Drop for CredentialGuard {
    fn drop(&mut self) {
        if self.prev_uid == u32::MAX && self.prev_gid == u32::MAX {
            return;
        }
        unsafe {
            setfsuid(self.prev_uid);
            setfsgid(self.prev_gid);
        }
        if self.groups_switched {
            let _ = raw_setgroups(&[]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::userpool::ResolvedUser;

    #[test]
    fn run_as_uid_skips_the_switch() {
        let user = ResolvedUser {
            uid: 1000,
            gid: 1000,
            uname: "alice".into(),
            groups: vec![],
        };
        let guard = CredentialGuard::assume(&user, Some(1000), true).unwrap();
        drop(guard);
    }
}
