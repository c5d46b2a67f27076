//! POSIX directory-tree backend.
//!
//! Grounded on the teacher's `unpfs` `Filesystem` impl (`main.rs`, before this
//! transformation): same qid/readdir/getattr/setattr shape, generalized from a
//! bare per-fid `PathBuf`/`Option<File>` onto `ninep::pathpool`/`ninep::ioctx`
//! so fids that walked to the same file share one interned path and, when the
//! export's `sharefd` option is set, one open descriptor. Depth tracking
//! (`max_depth`/`ELOOP`) is kept verbatim from `unpfs`.

use std::os::unix::fs::PermissionsExt;
use std::os::unix::prelude::*;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use filetime::FileTime;
use ninep::fidtable::Fid;
use ninep::ioctx::{check_xattr_write_offset, IOCtx, OFlagsKey};
use ninep::pathpool::{PathEntry, PathPool};
use ninep::srv::Filesystem;
use ninep::{errno::*, Error, Result, *};
use tokio::fs;
use tokio::sync::{Mutex, RwLock};

use crate::export::ExportList;
use crate::utils::*;

/// Flags the 9P client might set that don't translate to a sane local open
/// (e.g. Linux's v9fs client propagating `O_DIRECT` from a caller that only
/// wanted to bypass its own page cache, not the host's). Kept from `unpfs`.
const UNIX_FLAGS: u32 = (nix::libc::O_WRONLY
    | nix::libc::O_RDONLY
    | nix::libc::O_RDWR
    | nix::libc::O_CREAT
    | nix::libc::O_TRUNC) as u32;

#[derive(Default)]
pub struct PosixFid {
    path: RwLock<Option<Arc<PathEntry>>>,
    file: Mutex<Option<Arc<IOCtx>>>,
    depth: AtomicUsize,
    xattr: Mutex<Option<XattrState>>,
    /// Whether this fid's export shares descriptors across fids resolving
    /// to the same path (set once at `Tattach`, inherited through `Twalk`).
    sharefd: std::sync::atomic::AtomicBool,
}

#[derive(Clone)]
struct XattrState {
    name: String,
    buf: Arc<Mutex<Vec<u8>>>,
    /// Size declared by Txattrcreate; writes past it are rejected outright
    /// rather than silently growing the attribute.
    declared_len: u64,
}

impl PosixFid {
    async fn path(&self) -> Arc<PathEntry> {
        self.path
            .read()
            .await
            .clone()
            .expect("fid used before rattach/rwalk resolved its path")
    }

    async fn set_path(&self, entry: Arc<PathEntry>) {
        *self.path.write().await = Some(entry);
    }
}

#[derive(Clone)]
pub struct PosixFs {
    exports: Arc<ExportList>,
    paths: Arc<PathPool>,
    max_depth: usize,
}

impl PosixFs {
    pub fn new(exports: Arc<ExportList>, max_depth: usize) -> PosixFs {
        PosixFs {
            exports,
            paths: Arc::new(PathPool::new()),
            max_depth,
        }
    }

    fn open_ctx(&self, path: &Arc<PathEntry>, oflags: i32, sharefd: bool) -> Result<Arc<IOCtx>> {
        let key = OFlagsKey::from_raw_oflags(oflags & UNIX_FLAGS as i32);
        let target = path.path.clone();
        let do_open = || -> Result<std::os::fd::OwnedFd> {
            let bits = nix::fcntl::OFlag::from_bits_truncate(oflags & UNIX_FLAGS as i32);
            let mode = nix::sys::stat::Mode::from_bits_truncate(0);
            Ok(nix::fcntl::open(&target, bits, mode)?)
        };
        if sharefd {
            path.ioctx.get_or_open(key, do_open)
        } else {
            Ok(Arc::new(IOCtx::new(do_open()?, key)))
        }
    }
}

#[async_trait]
impl Filesystem for PosixFs {
    type Fid = PosixFid;

    async fn rattach(
        &self,
        fid: &Fid<Self::Fid>,
        _afid: Option<&Fid<Self::Fid>>,
        _uname: &str,
        aname: &str,
        _n_uname: u32,
    ) -> Result<FCall> {
        let (root, options) = self.exports.resolve(aname)?;
        fid.aux.set_path(self.paths.intern(&root)).await;
        fid.aux.depth.store(0, Ordering::Release);
        fid.aux.sharefd.store(options.sharefd, Ordering::Release);
        Ok(FCall::RAttach {
            qid: get_qid(&root).await?,
        })
    }

    async fn rwalk(
        &self,
        fid: &Fid<Self::Fid>,
        newfid: &Fid<Self::Fid>,
        wnames: &[String],
    ) -> Result<FCall> {
        let mut wqids = Vec::new();
        let mut path = fid.aux.path().await.path.clone();
        let mut depth = fid.aux.depth.load(Ordering::Acquire);

        for (i, name) in wnames.iter().enumerate() {
            if name == ".." {
                depth = depth.saturating_sub(1);
            } else if name != "." {
                depth += 1;
                if depth > self.max_depth {
                    return Err(Error::No(ELOOP));
                }
            }
            path.push(name);

            match get_qid(&path).await {
                Ok(qid) => wqids.push(qid),
                Err(e) if i == 0 => return Err(e),
                Err(_) => break,
            }
        }

        newfid.aux.set_path(self.paths.intern(&path)).await;
        newfid.aux.depth.store(depth, Ordering::Release);
        newfid
            .aux
            .sharefd
            .store(fid.aux.sharefd.load(Ordering::Acquire), Ordering::Release);
        Ok(FCall::RWalk { wqids })
    }

    async fn rgetattr(&self, fid: &Fid<Self::Fid>, req_mask: GetAttrMask) -> Result<FCall> {
        let path = fid.aux.path().await.path.clone();
        let attr = fs::symlink_metadata(&path).await?;
        Ok(FCall::RGetAttr {
            valid: req_mask,
            qid: qid_from_attr(&attr),
            stat: From::from(attr),
        })
    }

    async fn rsetattr(
        &self,
        fid: &Fid<Self::Fid>,
        valid: SetAttrMask,
        stat: &SetAttr,
    ) -> Result<FCall> {
        let path = fid.aux.path().await.path.clone();

        if valid.contains(SetAttrMask::MODE) {
            fs::set_permissions(&path, PermissionsExt::from_mode(stat.mode)).await?;
        }

        if valid.intersects(SetAttrMask::UID | SetAttrMask::GID) {
            let uid = valid
                .contains(SetAttrMask::UID)
                .then(|| nix::unistd::Uid::from_raw(stat.uid));
            let gid = valid
                .contains(SetAttrMask::GID)
                .then(|| nix::unistd::Gid::from_raw(stat.gid));
            nix::unistd::chown(&path, uid, gid)?;
        }

        if valid.contains(SetAttrMask::SIZE) {
            fs::OpenOptions::new()
                .write(true)
                .open(&path)
                .await?
                .set_len(stat.size)
                .await?;
        }

        if valid.intersects(SetAttrMask::ATIME_SET | SetAttrMask::MTIME_SET) {
            let attr = fs::metadata(&path).await?;
            let atime = if valid.contains(SetAttrMask::ATIME_SET) {
                FileTime::from_unix_time(stat.atime.sec as i64, stat.atime.nsec as u32)
            } else {
                FileTime::from_last_access_time(&attr)
            };
            let mtime = if valid.contains(SetAttrMask::MTIME_SET) {
                FileTime::from_unix_time(stat.mtime.sec as i64, stat.mtime.nsec as u32)
            } else {
                FileTime::from_last_modification_time(&attr)
            };
            let _ = tokio::task::spawn_blocking(move || filetime::set_file_times(path, atime, mtime)).await;
        }

        Ok(FCall::RSetAttr)
    }

    async fn rreadlink(&self, fid: &Fid<Self::Fid>) -> Result<FCall> {
        let path = fid.aux.path().await.path.clone();
        let target = fs::read_link(&path).await?;
        Ok(FCall::RReadLink {
            target: target.to_string_lossy().into_owned(),
        })
    }

    async fn rreaddir(&self, fid: &Fid<Self::Fid>, off: u64, count: u32) -> Result<FCall> {
        use tokio_stream::{wrappers::ReadDirStream, StreamExt};

        let mut dirents = DirEntryData::new();
        let offset = if off == 0 {
            dirents.push(get_dirent_from(".", 0).await?);
            dirents.push(get_dirent_from("..", 1).await?);
            off
        } else {
            off - 1
        } as usize;

        let path = fid.aux.path().await.path.clone();
        let mut entries = ReadDirStream::new(fs::read_dir(&path).await?).skip(offset);

        let mut i = offset;
        while let Some(entry) = entries.next().await {
            let dirent = get_dirent(&entry?, 2 + i as u64).await?;
            if dirents.size() + dirent.size() > count {
                break;
            }
            dirents.push(dirent);
            i += 1;
        }

        Ok(FCall::RReadDir { data: dirents })
    }

    async fn rlopen(&self, fid: &Fid<Self::Fid>, flags: u32) -> Result<FCall> {
        let path = fid.aux.path().await;
        let qid = get_qid(&path.path).await?;
        if !qid.typ.contains(QIdType::DIR) {
            let sharefd = fid.aux.sharefd.load(Ordering::Acquire);
            let ctx = self.open_ctx(&path, flags as i32, sharefd)?;
            *fid.aux.file.lock().await = Some(ctx);
        }
        Ok(FCall::RlOpen { qid, iounit: 0 })
    }

    async fn rlcreate(
        &self,
        fid: &Fid<Self::Fid>,
        name: &str,
        flags: u32,
        mode: u32,
        _gid: u32,
    ) -> Result<FCall> {
        let target = fid.aux.path().await.path.join(name);
        let bits = nix::fcntl::OFlag::from_bits_truncate((flags & UNIX_FLAGS) as i32);
        let perm = nix::sys::stat::Mode::from_bits_truncate(mode);
        let owned = nix::fcntl::open(&target, bits, perm)?;

        let qid = get_qid(&target).await?;
        let entry = self.paths.intern(&target);
        fid.aux.set_path(entry.clone()).await;
        let ctx = if fid.aux.sharefd.load(Ordering::Acquire) {
            let key = OFlagsKey::from_raw_oflags(flags as i32 & UNIX_FLAGS as i32);
            entry.ioctx.get_or_open(key, || Ok(owned))?
        } else {
            Arc::new(IOCtx::new(owned, OFlagsKey::from_raw_oflags(flags as i32)))
        };
        *fid.aux.file.lock().await = Some(ctx);

        Ok(FCall::RlCreate { qid, iounit: 0 })
    }

    async fn rmknod(
        &self,
        fid: &Fid<Self::Fid>,
        name: &str,
        mode: u32,
        major: u32,
        minor: u32,
        _gid: u32,
    ) -> Result<FCall> {
        let target = fid.aux.path().await.path.join(name);
        nix::sys::stat::mknod(
            &target,
            nix::sys::stat::SFlag::from_bits_truncate(mode),
            nix::sys::stat::Mode::from_bits_truncate(mode),
            nix::sys::stat::makedev(major as u64, minor as u64),
        )?;
        Ok(FCall::RMkNod {
            qid: get_qid(&target).await?,
        })
    }

    async fn rsymlink(
        &self,
        fid: &Fid<Self::Fid>,
        name: &str,
        sym: &str,
        _gid: u32,
    ) -> Result<FCall> {
        let target = fid.aux.path().await.path.join(name);
        nix::unistd::symlinkat(sym, None, &target)?;
        Ok(FCall::RSymlink {
            qid: get_qid(&target).await?,
        })
    }

    async fn rlink(
        &self,
        dfid: &Fid<Self::Fid>,
        fid: &Fid<Self::Fid>,
        name: &str,
    ) -> Result<FCall> {
        let newpath = dfid.aux.path().await.path.join(name);
        let oldpath = fid.aux.path().await.path.clone();
        nix::unistd::linkat(
            None,
            &oldpath,
            None,
            &newpath,
            nix::unistd::LinkatFlags::NoSymlinkFollow,
        )?;
        Ok(FCall::RLink)
    }

    async fn rrename(
        &self,
        fid: &Fid<Self::Fid>,
        dfid: &Fid<Self::Fid>,
        name: &str,
    ) -> Result<FCall> {
        let oldpath = fid.aux.path().await.path.clone();
        let newpath = dfid.aux.path().await.path.join(name);
        fs::rename(&oldpath, &newpath).await?;
        fid.aux.set_path(self.paths.intern(&newpath)).await;
        Ok(FCall::RRename)
    }

    async fn rread(&self, fid: &Fid<Self::Fid>, offset: u64, count: u32) -> Result<FCall> {
        if let Some(state) = fid.aux.xattr.lock().await.clone() {
            let buf = state.buf.lock().await;
            let start = (offset as usize).min(buf.len());
            let end = (start + count as usize).min(buf.len());
            return Ok(FCall::RRead {
                data: Data(buf[start..end].to_vec()),
            });
        }
        let file = fid.aux.file.lock().await;
        let ctx = file.as_ref().ok_or(Error::No(EBADF))?;
        let mut buf = vec![0u8; count as usize];
        let n = ctx.read_at(&mut buf, offset)?;
        buf.truncate(n);
        Ok(FCall::RRead { data: Data(buf) })
    }

    async fn rwrite(&self, fid: &Fid<Self::Fid>, offset: u64, data: &Data) -> Result<FCall> {
        if let Some(state) = fid.aux.xattr.lock().await.clone() {
            // Writes to an attribute fid (opened via Txattrcreate) fill an
            // in-memory buffer that's flushed to the real xattr on clunk;
            // offset must stay contiguous with what's been written so far
            // (closes the gap-write CVE class: a client can't pad with
            // garbage bytes by seeking past the end).
            check_xattr_write_offset(offset, state.declared_len)?;
            let mut buf = state.buf.lock().await;
            let start = offset as usize;
            if start + data.0.len() > buf.len() {
                buf.resize(start + data.0.len(), 0);
            }
            buf[start..start + data.0.len()].copy_from_slice(&data.0);
            let path = fid.aux.path().await.path.clone();
            let name = state.name.clone();
            let snapshot = buf.clone();
            drop(buf);
            tokio::task::spawn_blocking(move || xattr::set(&path, &name, &snapshot))
                .await
                .map_err(|e| Error::Io(std::io::Error::other(e)))??;
            return Ok(FCall::RWrite {
                count: data.0.len() as u32,
            });
        }
        let file = fid.aux.file.lock().await;
        let ctx = file.as_ref().ok_or(Error::No(EBADF))?;
        let n = ctx.write_at(&data.0, offset)?;
        Ok(FCall::RWrite { count: n as u32 })
    }

    async fn rmkdir(
        &self,
        dfid: &Fid<Self::Fid>,
        name: &str,
        _mode: u32,
        _gid: u32,
    ) -> Result<FCall> {
        let target = dfid.aux.path().await.path.join(name);
        fs::create_dir(&target).await?;
        Ok(FCall::RMkDir {
            qid: get_qid(&target).await?,
        })
    }

    async fn rrenameat(
        &self,
        olddir: &Fid<Self::Fid>,
        oldname: &str,
        newdir: &Fid<Self::Fid>,
        newname: &str,
    ) -> Result<FCall> {
        let oldpath = olddir.aux.path().await.path.join(oldname);
        let newpath = newdir.aux.path().await.path.join(newname);
        fs::rename(&oldpath, &newpath).await?;
        Ok(FCall::RRenameAt)
    }

    async fn runlinkat(&self, dfid: &Fid<Self::Fid>, name: &str, _flags: u32) -> Result<FCall> {
        let target = dfid.aux.path().await.path.join(name);
        match fs::symlink_metadata(&target).await? {
            ref attr if attr.is_dir() => fs::remove_dir(&target).await?,
            _ => fs::remove_file(&target).await?,
        }
        Ok(FCall::RUnlinkAt)
    }

    async fn rfsync(&self, fid: &Fid<Self::Fid>) -> Result<FCall> {
        let file = fid.aux.file.lock().await;
        file.as_ref().ok_or(Error::No(EBADF))?.sync()?;
        Ok(FCall::RFSync)
    }

    async fn rclunk(&self, _: &Fid<Self::Fid>) -> Result<FCall> {
        Ok(FCall::RClunk)
    }

    async fn rremove(&self, fid: &Fid<Self::Fid>) -> Result<FCall> {
        let path = fid.aux.path().await.path.clone();
        match fs::symlink_metadata(&path).await? {
            ref attr if attr.is_dir() => fs::remove_dir(&path).await?,
            _ => fs::remove_file(&path).await?,
        }
        Ok(FCall::RRemove)
    }

    async fn rstatfs(&self, fid: &Fid<Self::Fid>) -> Result<FCall> {
        let path = fid.aux.path().await.path.clone();
        let statfs = tokio::task::spawn_blocking(move || nix::sys::statvfs::statvfs(&path))
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e)))??;
        Ok(FCall::RStatFs {
            statfs: From::from(statfs),
        })
    }

    async fn rxattrwalk(
        &self,
        fid: &Fid<Self::Fid>,
        newfid: &Fid<Self::Fid>,
        name: &str,
    ) -> Result<FCall> {
        let path = fid.aux.path().await.path.clone();
        let name_owned = name.to_owned();
        let value = tokio::task::spawn_blocking({
            let path = path.clone();
            let name = name_owned.clone();
            move || xattr::get(&path, &name)
        })
        .await
        .map_err(|e| Error::Io(std::io::Error::other(e)))??
        .ok_or(Error::No(ENODATA))?;
        let size = value.len() as u64;
        newfid.aux.set_path(fid.aux.path().await).await;
        *newfid.aux.xattr.lock().await = Some(XattrState {
            name: name_owned,
            declared_len: size,
            buf: Arc::new(Mutex::new(value)),
        });
        Ok(FCall::RxAttrWalk { size })
    }

    async fn rxattrcreate(
        &self,
        fid: &Fid<Self::Fid>,
        name: &str,
        attr_size: u64,
        _flags: u32,
    ) -> Result<FCall> {
        *fid.aux.xattr.lock().await = Some(XattrState {
            name: name.to_owned(),
            declared_len: attr_size,
            buf: Arc::new(Mutex::new(Vec::with_capacity(attr_size as usize))),
        });
        Ok(FCall::RxAttrCreate)
    }

    async fn rlock(&self, fid: &Fid<Self::Fid>, lock: &Flock) -> Result<FCall> {
        // Whole-file locks only (spec.md's Open Question resolved in favor of
        // explicit rejection over silently widening a range request).
        if lock.start != 0 || lock.length != 0 {
            return Err(Error::No(ENOSYS));
        }
        let file = fid.aux.file.lock().await;
        let ctx = file.as_ref().ok_or(Error::No(EBADF))?;
        let op = if lock.typ.contains(LockType::UNLOCK) {
            nix::fcntl::FlockArg::Unlock
        } else if lock.typ.contains(LockType::WRLOCK) {
            if lock.flags.contains(LockFlag::BLOCK) {
                nix::fcntl::FlockArg::LockExclusive
            } else {
                nix::fcntl::FlockArg::LockExclusiveNonblock
            }
        } else if lock.flags.contains(LockFlag::BLOCK) {
            nix::fcntl::FlockArg::LockShared
        } else {
            nix::fcntl::FlockArg::LockSharedNonblock
        };
        match nix::fcntl::flock(ctx.as_fd(), op) {
            Ok(()) => Ok(FCall::RLock {
                status: LockStatus::SUCCESS,
            }),
            Err(nix::errno::Errno::EWOULDBLOCK) => Ok(FCall::RLock {
                status: LockStatus::BLOCKED,
            }),
            Err(e) => Err(Error::from(e)),
        }
    }

    async fn rgetlock(&self, _fid: &Fid<Self::Fid>, lock: &Getlock) -> Result<FCall> {
        // No cross-process whole-file lock registry is kept; report the
        // caller's own request back as unlocked (consistent with the
        // whole-file-only lock model above, which never tracks a holder list
        // this call could otherwise consult).
        Ok(FCall::RGetLock {
            flock: Getlock {
                typ: LockType::UNLOCK,
                ..lock.clone()
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::{ExportList, ExportOptions};
    use ninep::userpool::ResolvedUser;

    fn user() -> Arc<ResolvedUser> {
        Arc::new(ResolvedUser {
            uid: 1000,
            gid: 1000,
            uname: "alice".into(),
            groups: vec![],
        })
    }

    #[tokio::test]
    async fn attach_with_empty_aname_picks_the_first_export() {
        let dir = tempfile::tempdir().unwrap();
        let mut exports = ExportList::new();
        exports.add(dir.path(), ExportOptions::default());
        let fs = PosixFs::new(Arc::new(exports), 200);

        let fid = Fid::new(1, user(), PosixFid::default());
        fs.rattach(&fid, None, "alice", "", NONUNAME).await.unwrap();

        assert_eq!(fid.aux.path().await.path, dir.path().to_path_buf());
    }

    #[tokio::test]
    async fn attach_routes_to_the_export_matching_aname() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        std::fs::write(dir_b.path().join("marker"), b"hi").unwrap();

        let mut exports = ExportList::new();
        exports.add(dir_a.path(), ExportOptions::default());
        exports.add(dir_b.path(), ExportOptions::default());
        let fs = PosixFs::new(Arc::new(exports), 200);

        let fid = Fid::new(1, user(), PosixFid::default());
        let aname = dir_b.path().to_string_lossy().into_owned();
        fs.rattach(&fid, None, "alice", &aname, NONUNAME)
            .await
            .unwrap();

        let newfid = Fid::new(2, user(), PosixFid::default());
        fs.rwalk(&fid, &newfid, &["marker".to_owned()])
            .await
            .unwrap();
        assert_eq!(newfid.aux.path().await.path, dir_b.path().join("marker"));
    }

    #[tokio::test]
    async fn rlopen_shares_one_descriptor_when_the_export_enables_sharefd() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), b"data").unwrap();
        let mut exports = ExportList::new();
        exports.add(
            dir.path(),
            ExportOptions {
                sharefd: true,
                ..Default::default()
            },
        );
        let fs = PosixFs::new(Arc::new(exports), 200);

        let root = Fid::new(1, user(), PosixFid::default());
        fs.rattach(&root, None, "alice", "", NONUNAME).await.unwrap();

        let fid_a = Fid::new(2, user(), PosixFid::default());
        let fid_b = Fid::new(3, user(), PosixFid::default());
        fs.rwalk(&root, &fid_a, &["f".to_owned()]).await.unwrap();
        fs.rwalk(&root, &fid_b, &["f".to_owned()]).await.unwrap();

        fs.rlopen(&fid_a, nix::libc::O_RDONLY as u32).await.unwrap();
        fs.rlopen(&fid_b, nix::libc::O_RDONLY as u32).await.unwrap();

        let ctx_a = fid_a.aux.file.lock().await.clone().unwrap();
        let ctx_b = fid_b.aux.file.lock().await.clone().unwrap();
        assert!(Arc::ptr_eq(&ctx_a, &ctx_b));
    }

    #[tokio::test]
    async fn rlopen_opens_independent_descriptors_without_sharefd() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), b"data").unwrap();
        let mut exports = ExportList::new();
        exports.add(dir.path(), ExportOptions::default());
        let fs = PosixFs::new(Arc::new(exports), 200);

        let root = Fid::new(1, user(), PosixFid::default());
        fs.rattach(&root, None, "alice", "", NONUNAME).await.unwrap();

        let fid_a = Fid::new(2, user(), PosixFid::default());
        let fid_b = Fid::new(3, user(), PosixFid::default());
        fs.rwalk(&root, &fid_a, &["f".to_owned()]).await.unwrap();
        fs.rwalk(&root, &fid_b, &["f".to_owned()]).await.unwrap();

        fs.rlopen(&fid_a, nix::libc::O_RDONLY as u32).await.unwrap();
        fs.rlopen(&fid_b, nix::libc::O_RDONLY as u32).await.unwrap();

        let ctx_a = fid_a.aux.file.lock().await.clone().unwrap();
        let ctx_b = fid_b.aux.file.lock().await.clone().unwrap();
        assert!(!Arc::ptr_eq(&ctx_a, &ctx_b));
    }

    #[tokio::test]
    async fn walk_beyond_max_depth_is_rejected_with_eloop() {
        let dir = tempfile::tempdir().unwrap();
        let mut cur = dir.path().to_path_buf();
        for name in ["a", "b", "c"] {
            cur.push(name);
            std::fs::create_dir(&cur).unwrap();
        }

        let mut exports = ExportList::new();
        exports.add(dir.path(), ExportOptions::default());
        let fs = PosixFs::new(Arc::new(exports), 2);

        let root = Fid::new(1, user(), PosixFid::default());
        fs.rattach(&root, None, "alice", "", NONUNAME).await.unwrap();

        let newfid = Fid::new(2, user(), PosixFid::default());
        let wnames = ["a".to_owned(), "b".to_owned(), "c".to_owned()];
        match fs.rwalk(&root, &newfid, &wnames).await {
            Err(Error::No(e)) => assert_eq!(e, ELOOP),
            other => panic!("expected ELOOP, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn rwrite_past_the_declared_xattr_length_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut exports = ExportList::new();
        exports.add(dir.path(), ExportOptions::default());
        let fs = PosixFs::new(Arc::new(exports), 200);

        let fid = Fid::new(1, user(), PosixFid::default());
        fs.rattach(&fid, None, "alice", "", NONUNAME).await.unwrap();
        fs.rxattrcreate(&fid, "user.test", 4, 0).await.unwrap();

        match fs.rwrite(&fid, 10, &Data(vec![1u8, 2, 3])).await {
            Err(Error::No(e)) => assert_eq!(e, EINVAL),
            other => panic!("expected EINVAL, got {other:?}"),
        }
    }
}
