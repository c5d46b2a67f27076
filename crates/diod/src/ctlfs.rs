//! Synthetic control filesystem.
//!
//! Grounded on spec.md §4.10's description of a small read-mostly file tree
//! (`version`, `connections`, `exports`, `null`, `zero`, `date`) and on the
//! shape of `diodctl`'s per-file vtable (`diodctl/ops.c`): each file is a
//! `read: fn(&CtlFs) -> Vec<u8>` callback rather than a real inode, so the
//! whole tree lives in this one module with no on-disk backing.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use ninep::fidtable::Fid;
use ninep::srv::Filesystem;
use ninep::{errno::*, Error, Result, *};

/// One synthetic file's content producer. Root-relative name only; this
/// tree is flat (no subdirectories), matching what spec.md names.
struct CtlFile {
    name: &'static str,
    read: fn(&CtlFs) -> Vec<u8>,
}

const FILES: &[CtlFile] = &[
    CtlFile {
        name: "version",
        read: |_| format!("{}\n", env!("CARGO_PKG_VERSION")).into_bytes(),
    },
    CtlFile {
        name: "connections",
        read: |fs| format!("{}\n", fs.connections.load(Ordering::Relaxed)).into_bytes(),
    },
    CtlFile {
        name: "exports",
        read: |fs| fs.exports_listing.lock().unwrap().clone().into_bytes(),
    },
    CtlFile {
        name: "null",
        read: |_| Vec::new(),
    },
    CtlFile {
        name: "zero",
        read: |_| vec![0u8; 4096],
    },
    CtlFile {
        name: "date",
        read: |_| {
            let secs = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            format!("{secs}\n").into_bytes()
        },
    },
];

#[derive(Default)]
pub enum CtlNode {
    #[default]
    Root,
    File(usize),
}

#[derive(Default)]
pub struct CtlFid {
    node: Mutex<CtlNode>,
}

/// Backend serving `diodctl`'s synthetic file tree. `connections` and
/// `exports_listing` are updated by the host binary as connections come and
/// go and as the export list is (re)loaded; this module only renders them.
#[derive(Clone, Default)]
pub struct CtlFs {
    pub connections: Arc<AtomicUsize>,
    pub exports_listing: Arc<Mutex<String>>,
}

impl CtlFs {
    pub fn new() -> CtlFs {
        CtlFs::default()
    }

    fn root_qid() -> QId {
        QId {
            typ: QIdType::DIR,
            version: 0,
            path: 1,
        }
    }

    fn file_qid(idx: usize) -> QId {
        QId {
            typ: QIdType::FILE,
            version: 0,
            path: 2 + idx as u64,
        }
    }
}

#[async_trait]
impl Filesystem for CtlFs {
    type Fid = CtlFid;

    async fn rattach(
        &self,
        fid: &Fid<Self::Fid>,
        _afid: Option<&Fid<Self::Fid>>,
        _uname: &str,
        _aname: &str,
        _n_uname: u32,
    ) -> Result<FCall> {
        *fid.aux.node.lock().unwrap() = CtlNode::Root;
        Ok(FCall::RAttach { qid: CtlFs::root_qid() })
    }

    async fn rwalk(
        &self,
        fid: &Fid<Self::Fid>,
        newfid: &Fid<Self::Fid>,
        wnames: &[String],
    ) -> Result<FCall> {
        if wnames.is_empty() {
            *newfid.aux.node.lock().unwrap() = CtlNode::Root;
            return Ok(FCall::RWalk { wqids: Vec::new() });
        }
        if wnames.len() > 1 {
            return Err(Error::No(ENOTDIR));
        }
        let idx = FILES
            .iter()
            .position(|f| f.name == wnames[0])
            .ok_or(Error::No(ENOENT))?;
        *newfid.aux.node.lock().unwrap() = CtlNode::File(idx);
        Ok(FCall::RWalk {
            wqids: vec![CtlFs::file_qid(idx)],
        })
    }

    async fn rgetattr(&self, fid: &Fid<Self::Fid>, req_mask: GetAttrMask) -> Result<FCall> {
        let (qid, size, mode) = match *fid.aux.node.lock().unwrap() {
            CtlNode::Root => (CtlFs::root_qid(), 0u64, 0o040555u32),
            CtlNode::File(idx) => {
                let content = (FILES[idx].read)(self);
                (CtlFs::file_qid(idx), content.len() as u64, 0o100444)
            }
        };
        Ok(FCall::RGetAttr {
            valid: req_mask,
            qid,
            stat: Stat {
                mode,
                uid: 0,
                gid: 0,
                nlink: 1,
                rdev: 0,
                size,
                blksize: 4096,
                blocks: 0,
                atime: Time { sec: 0, nsec: 0 },
                mtime: Time { sec: 0, nsec: 0 },
                ctime: Time { sec: 0, nsec: 0 },
            },
        })
    }

    async fn rreaddir(&self, fid: &Fid<Self::Fid>, off: u64, count: u32) -> Result<FCall> {
        if !matches!(*fid.aux.node.lock().unwrap(), CtlNode::Root) {
            return Err(Error::No(ENOTDIR));
        }
        let mut dirents = DirEntryData::new();
        let offset = off as usize;
        for (i, file) in FILES.iter().enumerate().skip(offset) {
            let entry = DirEntry {
                qid: CtlFs::file_qid(i),
                offset: (i + 1) as u64,
                typ: 0,
                name: file.name.to_owned(),
            };
            if dirents.size() + entry.size() > count {
                break;
            }
            dirents.push(entry);
        }
        Ok(FCall::RReadDir { data: dirents })
    }

    async fn rlopen(&self, fid: &Fid<Self::Fid>, _flags: u32) -> Result<FCall> {
        let qid = match *fid.aux.node.lock().unwrap() {
            CtlNode::Root => CtlFs::root_qid(),
            CtlNode::File(idx) => CtlFs::file_qid(idx),
        };
        Ok(FCall::RlOpen { qid, iounit: 0 })
    }

    async fn rread(&self, fid: &Fid<Self::Fid>, offset: u64, count: u32) -> Result<FCall> {
        let idx = match *fid.aux.node.lock().unwrap() {
            CtlNode::File(idx) => idx,
            CtlNode::Root => return Err(Error::No(EISDIR)),
        };
        let content = (FILES[idx].read)(self);
        let start = (offset as usize).min(content.len());
        let end = (start + count as usize).min(content.len());
        Ok(FCall::RRead {
            data: Data(content[start..end].to_vec()),
        })
    }

    async fn rclunk(&self, _: &Fid<Self::Fid>) -> Result<FCall> {
        Ok(FCall::RClunk)
    }
}
