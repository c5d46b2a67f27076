//! Connection state machine: tag map, fid table, reader loop, and the
//! worker dispatch that runs every handler under the right credentials.
//!
//! Generalizes the teacher's `srv::dispatch`/`dispatch_once` (a single
//! `HashMap<u32, FId>` plus an unconditional bare `tokio::spawn` per
//! request) into the state machine spec.md §4.5/§4.6 describes, and routes
//! each handler through `tokio::task::spawn_blocking` so it runs on a real,
//! dedicated OS thread for the credential switch in [`crate::credentials`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use bytes::buf::Buf;
use log::{debug, error, info};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex as AsyncMutex;
use tokio_stream::StreamExt;
use tokio_util::codec::length_delimited::LengthDelimitedCodec;
use tokio_util::sync::CancellationToken;

use crate::credentials::CredentialGuard;
use crate::error::{errno::*, Error, Result};
use crate::fcall::*;
use crate::fidtable::{Fid, FidTable};
use crate::serialize;
use crate::srv::Filesystem;
use crate::userpool::ResolvedUser;

/// Resolves the identity (and authorization) a `Tattach` is allowed to
/// attach as. The core runtime only knows how to carry a `uname`/`n_uname`
/// pair to *something*; what "something" means (a `UserPool` lookup, an
/// export allowlist, a privileged-port requirement) is deployment policy,
/// so it's a hook a `Server` composes in rather than a fixed dependency.
pub trait AttachHook: Send + Sync {
    fn resolve(
        &self,
        uname: &str,
        n_uname: u32,
        aname: &str,
        privileged_source_port: bool,
    ) -> Result<Arc<ResolvedUser>>;
}

/// Baseline `AttachHook`: resolve the caller through a `UserPool`, no export
/// allowlist or privileged-port check. Deployments that need those compose
/// their own hook (e.g. `diod`'s, which layers an `ExportList` on top).
pub struct UserPoolHook(pub Arc<crate::userpool::UserPool>);

impl AttachHook for UserPoolHook {
    fn resolve(
        &self,
        uname: &str,
        n_uname: u32,
        _aname: &str,
        _privileged_source_port: bool,
    ) -> Result<Arc<ResolvedUser>> {
        if n_uname != NONUNAME {
            self.0.by_uid(n_uname)
        } else {
            self.0.by_uname(uname)
        }
    }
}

/// Smallest msize this runtime will negotiate down to; below this, 9P2000.L's
/// own fixed-size headers don't leave room for any payload.
pub const MIN_MSIZE: u32 = 4096;

/// Connection lifecycle, matching spec.md §4.6's transition table.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnState {
    /// No `Tversion` seen yet; only `Tversion` is accepted.
    Negotiating = 0,
    /// Version negotiated; normal operation.
    Active = 1,
    /// Shutting down: no new requests accepted, waiting for in-flight ones.
    Draining = 2,
    Dead = 3,
}

impl From<u8> for ConnState {
    fn from(v: u8) -> ConnState {
        match v {
            0 => ConnState::Negotiating,
            1 => ConnState::Active,
            2 => ConnState::Draining,
            _ => ConnState::Dead,
        }
    }
}

/// One in-flight request's cancellation handle, keyed by tag.
struct TagEntry {
    cancel: CancellationToken,
}

/// Per-request context threaded in from `Connection::dispatch_once` down to
/// the `Filesystem` call, bundling the pieces a handler needs besides its
/// 9P arguments: the resolved caller identity and a way to notice a Tflush.
pub struct RequestContext {
    pub user: Arc<ResolvedUser>,
    pub cancel: CancellationToken,
}

/// Shared policy every connection on a `Server` applies before running a
/// handler: which uid to switch to (or skip switching, under `runas_uid`)
/// and whether all callers are squashed to one identity.
#[derive(Clone)]
pub struct CredentialPolicy {
    pub run_as_uid: Option<u32>,
    /// Whether the host kernel was confirmed (spec.md §5's startup probe) to
    /// apply `setgroups` per-thread. If `false`, supplementary-group
    /// enforcement is skipped entirely rather than raced across concurrent
    /// `spawn_blocking` workers.
    pub enforce_supplementary_groups: bool,
}

impl CredentialPolicy {
    pub fn none() -> CredentialPolicy {
        CredentialPolicy {
            run_as_uid: None,
            enforce_supplementary_groups: true,
        }
    }
}

/// One client connection: reader loop, tag map, fid table, msize.
pub struct Connection<Fs: Filesystem> {
    pub conn_id: u64,
    state: AtomicU8,
    msize: AtomicU32,
    pub fids: FidTable<Fs::Fid>,
    tags: Mutex<HashMap<u16, TagEntry>>,
    write_half: Arc<AsyncMutex<tokio_util::codec::FramedWrite<Box<dyn AsyncWrite + Send + Unpin>, LengthDelimitedCodec>>>,
    fs: Arc<Fs>,
    credentials: CredentialPolicy,
    attach_hook: Arc<dyn AttachHook>,
    /// Whether the peer connected from a privileged (<1024) source port,
    /// consulted by `Tattach` when an export requires it (spec.md §9).
    pub privileged_source_port: bool,
}

fn framed_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_offset(0)
        .length_field_length(4)
        .length_adjustment(-4)
        .little_endian()
        .new_codec()
}

impl<Fs: Filesystem + Send + Sync + 'static> Connection<Fs> {
    pub fn new(
        conn_id: u64,
        fs: Arc<Fs>,
        credentials: CredentialPolicy,
        attach_hook: Arc<dyn AttachHook>,
        privileged_source_port: bool,
        write: Box<dyn AsyncWrite + Send + Unpin>,
        server_max_msize: u32,
    ) -> Connection<Fs> {
        let write_half = tokio_util::codec::FramedWrite::new(write, framed_codec());
        Connection {
            conn_id,
            state: AtomicU8::new(ConnState::Negotiating as u8),
            msize: AtomicU32::new(server_max_msize),
            fids: FidTable::new(),
            tags: Mutex::new(HashMap::new()),
            write_half: Arc::new(AsyncMutex::new(write_half)),
            fs,
            credentials,
            attach_hook,
            privileged_source_port,
        }
    }

    pub fn state(&self) -> ConnState {
        ConnState::from(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, s: ConnState) {
        self.state.store(s as u8, Ordering::Release);
    }

    pub fn msize(&self) -> u32 {
        self.msize.load(Ordering::Acquire)
    }

    /// Drive the reader loop until the transport closes or a protocol error
    /// forces the connection down. Synthesizes teardown (spec.md §4.4/§4.5:
    /// flush every outstanding tag, then clunk every remaining fid) before
    /// returning.
    pub async fn run(self: Arc<Self>, read: Box<dyn AsyncRead + Send + Unpin>) -> Result<()> {
        let mut framed_read = tokio_util::codec::FramedRead::new(read, framed_codec());

        while let Some(bytes) = framed_read.next().await {
            let bytes = bytes?;
            let msg = match serialize::read_msg(&mut bytes.reader()) {
                Ok(msg) => msg,
                Err(e) => {
                    error!("conn {}: malformed message: {:?}", self.conn_id, e);
                    break;
                }
            };
            debug!("conn {}: ← {:?}", self.conn_id, msg);

            if self.state() == ConnState::Negotiating && !matches!(msg.body, FCall::TVersion { .. })
            {
                // Out-of-sequence request, not a malformed one: the protocol
                // table rejects it, so it's an EBADF-class violation per
                // spec §7 rather than the codec-level EPROTO.
                self.reply(msg.tag, FCall::RlError { ecode: EBADF as u32 })
                    .await;
                continue;
            }

            if matches!(msg.body, FCall::TFlush { .. }) {
                self.handle_flush(msg).await;
                continue;
            }

            let cancel = CancellationToken::new();
            {
                let mut tags = self.tags.lock().unwrap();
                if tags.contains_key(&msg.tag) {
                    drop(tags);
                    self.reply(
                        msg.tag,
                        FCall::RlError {
                            ecode: EBADF as u32,
                        },
                    )
                    .await;
                    continue;
                }
                tags.insert(
                    msg.tag,
                    TagEntry {
                        cancel: cancel.clone(),
                    },
                );
            }

            let this = self.clone();
            tokio::spawn(async move {
                let tag = msg.tag;
                let response = this.dispatch_once(msg, cancel).await;
                this.tags.lock().unwrap().remove(&tag);
                match response {
                    Some(body) => this.reply(tag, body).await,
                    None => {}
                }
            });
        }

        self.teardown().await;
        Ok(())
    }

    async fn handle_flush(&self, msg: Msg) {
        let FCall::TFlush { oldtag } = msg.body else {
            unreachable!()
        };
        if let Some(entry) = self.tags.lock().unwrap().get(&oldtag) {
            entry.cancel.cancel();
        }
        // The in-flight task still removes its own tag entry and sends its
        // (possibly late) reply; Rflush itself is sent unconditionally once
        // requested, per spec.md §4.5.
        self.reply(msg.tag, FCall::RFlush).await;
    }

    /// Resolve fids, switch credentials, run the handler, and update the
    /// fid table on success — equivalent to the teacher's `dispatch_once`
    /// but fid-credential-aware and cancellation-aware. Returns `None` for
    /// `Tflush` (no reply body; handled by `handle_flush`) or when the
    /// request was superseded.
    async fn dispatch_once(&self, msg: Msg, cancel: CancellationToken) -> Option<FCall> {
        use crate::FCall::*;

        if let TVersion { msize, ref version } = msg.body {
            return Some(self.handle_version(msize, version).await);
        }

        if self.state() != ConnState::Active && self.state() != ConnState::Negotiating {
            return Some(FCall::RlError {
                ecode: ECANCELED as u32,
            });
        }

        let result = self.run_body(&msg.body, cancel).await;

        Some(result.unwrap_or_else(|e| {
            error!(
                "conn {} tag {}: {:?}: {}",
                self.conn_id,
                msg.tag,
                MsgType::from(&msg.body),
                e
            );
            FCall::RlError { ecode: e.errno() as u32 }
        }))
    }

    async fn handle_version(&self, msize: u32, version: &str) -> FCall {
        // Tversion resets fids/tags regardless of prior state (spec.md §4.6,
        // Testable Property 8): a client renegotiating mid-session gets a
        // clean slate rather than an error.
        for (_, entry) in self.tags.lock().unwrap().drain() {
            entry.cancel.cancel();
        }
        self.fids.drain();

        let negotiated = msize.min(self.msize()).max(MIN_MSIZE);
        self.msize.store(negotiated, Ordering::Release);
        self.set_state(ConnState::Active);

        FCall::RVersion {
            msize: negotiated,
            version: match version {
                P92000L => version.to_owned(),
                _ => VERSION_UNKNOWN.to_owned(),
            },
        }
    }

    async fn run_body(&self, body: &FCall, cancel: CancellationToken) -> Result<FCall> {
        use crate::FCall::*;

        if cancel.is_cancelled() {
            return Err(Error::No(ECANCELED));
        }

        let get_fid = |fid: u32| self.fids.lookup(fid);

        // Every handler below runs through `run_with_credentials`, which
        // bridges the async `Filesystem` trait into a `spawn_blocking`
        // closure hosting the real fsuid/fsgid switch — see module docs.
        let response = match *body {
            TStatFs { fid } => {
                let f = get_fid(fid)?;
                self.run_with_credentials(f.user.clone(), move |fs| {
                    futures::executor::block_on(fs.rstatfs(&f))
                })
                .await?
            }
            TlOpen { fid, flags } => {
                let f = get_fid(fid)?;
                let f_marker = f.clone();
                let r = self
                    .run_with_credentials(f.user.clone(), move |fs| {
                        futures::executor::block_on(fs.rlopen(&f, flags))
                    })
                    .await?;
                f_marker.mark_opened();
                r
            }
            TReadDir { fid, offset, count } => {
                let f = get_fid(fid)?;
                self.run_with_credentials(f.user.clone(), move |fs| {
                    futures::executor::block_on(fs.rreaddir(&f, offset, count))
                })
                .await?
            }
            TRead { fid, offset, count } => {
                let f = get_fid(fid)?;
                self.run_with_credentials(f.user.clone(), move |fs| {
                    futures::executor::block_on(fs.rread(&f, offset, count))
                })
                .await?
            }
            TWrite { fid, offset, ref data } => {
                let f = get_fid(fid)?;
                let data = data.clone();
                self.run_with_credentials(f.user.clone(), move |fs| {
                    futures::executor::block_on(fs.rwrite(&f, offset, &data))
                })
                .await?
            }
            TGetAttr { fid, req_mask } => {
                let f = get_fid(fid)?;
                self.run_with_credentials(f.user.clone(), move |fs| {
                    futures::executor::block_on(fs.rgetattr(&f, req_mask))
                })
                .await?
            }
            TClunk { fid } => {
                let f = self.fids.remove(fid)?;
                self.run_with_credentials(f.user.clone(), move |fs| {
                    futures::executor::block_on(fs.rclunk(&f))
                })
                .await?
            }
            TFSync { fid } => {
                let f = get_fid(fid)?;
                self.run_with_credentials(f.user.clone(), move |fs| {
                    futures::executor::block_on(fs.rfsync(&f))
                })
                .await?
            }
            TAttach {
                fid,
                ref uname,
                ref aname,
                n_uname,
                ..
            } => {
                let user = self.resolve_attach_user(uname, n_uname, aname)?;
                let placeholder = Arc::new(Fid::new(fid, user.clone(), Default::default()));
                let placeholder_for_call = placeholder.clone();
                let uname_owned = uname.clone();
                let aname_owned = aname.clone();
                let response = self
                    .run_with_credentials(user, move |fs| {
                        futures::executor::block_on(fs.rattach(
                            &placeholder_for_call,
                            None,
                            &uname_owned,
                            &aname_owned,
                            n_uname,
                        ))
                    })
                    .await?;
                self.fids.insert_arc(fid, placeholder)?;
                response
            }
            TWalk {
                fid,
                newfid: nf,
                ref wnames,
            } => {
                let f = get_fid(fid)?;
                if f.is_opened() {
                    return Err(Error::Protocol(format!("walk on opened fid {fid}")));
                }
                let new = Arc::new(Fid::new(nf, f.user.clone(), Default::default()));
                let new_for_call = new.clone();
                let wnames = wnames.clone();
                let nwnames = wnames.len();
                let user = f.user.clone();
                let result = self
                    .run_with_credentials(user, move |fs| {
                        futures::executor::block_on(fs.rwalk(&f, &new_for_call, &wnames))
                    })
                    .await?;
                // Only a full-length walk attaches the target fid (spec.md
                // §4.4): a partial walk returns a short `wqids` and leaves
                // `nf` untouched.
                let full_walk = matches!(&result, FCall::RWalk { wqids } if wqids.len() == nwnames);
                if full_walk {
                    if nf == fid {
                        self.fids.replace(nf, new);
                    } else {
                        self.fids.insert_arc(nf, new)?;
                    }
                }
                result
            }
            TRemove { fid } => {
                let f = self.fids.remove(fid)?;
                self.run_with_credentials(f.user.clone(), move |fs| {
                    futures::executor::block_on(fs.rremove(&f))
                })
                .await?
            }
            TlCreate {
                fid,
                ref name,
                flags,
                mode,
                gid,
            } => {
                let f = get_fid(fid)?;
                let name = name.clone();
                let r = self
                    .run_with_credentials(f.user.clone(), move |fs| {
                        futures::executor::block_on(fs.rlcreate(&f, &name, flags, mode, gid))
                    })
                    .await?;
                get_fid(fid)?.mark_opened();
                r
            }
            TSymlink {
                fid,
                ref name,
                ref symtgt,
                gid,
            } => {
                let f = get_fid(fid)?;
                let name = name.clone();
                let symtgt = symtgt.clone();
                self.run_with_credentials(f.user.clone(), move |fs| {
                    futures::executor::block_on(fs.rsymlink(&f, &name, &symtgt, gid))
                })
                .await?
            }
            TMkNod {
                dfid,
                ref name,
                mode,
                major,
                minor,
                gid,
            } => {
                let f = get_fid(dfid)?;
                let name = name.clone();
                self.run_with_credentials(f.user.clone(), move |fs| {
                    futures::executor::block_on(fs.rmknod(&f, &name, mode, major, minor, gid))
                })
                .await?
            }
            TRename {
                fid,
                dfid,
                ref name,
            } => {
                let f = get_fid(fid)?;
                let df = get_fid(dfid)?;
                let name = name.clone();
                let user = f.user.clone();
                self.run_with_credentials(user, move |fs| {
                    futures::executor::block_on(fs.rrename(&f, &df, &name))
                })
                .await?
            }
            TReadLink { fid } => {
                let f = get_fid(fid)?;
                self.run_with_credentials(f.user.clone(), move |fs| {
                    futures::executor::block_on(fs.rreadlink(&f))
                })
                .await?
            }
            TxAttrWalk {
                fid,
                newfid: nf,
                ref name,
            } => {
                let f = get_fid(fid)?;
                let new = Arc::new(Fid::new(nf, f.user.clone(), Default::default()));
                let new_for_call = new.clone();
                let name = name.clone();
                let user = f.user.clone();
                let result = self
                    .run_with_credentials(user, move |fs| {
                        futures::executor::block_on(fs.rxattrwalk(&f, &new_for_call, &name))
                    })
                    .await?;
                if nf == fid {
                    self.fids.replace(nf, new);
                } else {
                    self.fids.insert_arc(nf, new)?;
                }
                result
            }
            TxAttrCreate {
                fid,
                ref name,
                attr_size,
                flags,
            } => {
                let f = get_fid(fid)?;
                let name = name.clone();
                self.run_with_credentials(f.user.clone(), move |fs| {
                    futures::executor::block_on(fs.rxattrcreate(&f, &name, attr_size, flags))
                })
                .await?
            }
            TLock { fid, ref flock } => {
                let f = get_fid(fid)?;
                let flock = flock.clone();
                self.run_with_credentials(f.user.clone(), move |fs| {
                    futures::executor::block_on(fs.rlock(&f, &flock))
                })
                .await?
            }
            TGetLock { fid, ref flock } => {
                let f = get_fid(fid)?;
                let flock = flock.clone();
                self.run_with_credentials(f.user.clone(), move |fs| {
                    futures::executor::block_on(fs.rgetlock(&f, &flock))
                })
                .await?
            }
            TLink {
                dfid,
                fid,
                ref name,
            } => {
                let df = get_fid(dfid)?;
                let f = get_fid(fid)?;
                let name = name.clone();
                let user = df.user.clone();
                self.run_with_credentials(user, move |fs| {
                    futures::executor::block_on(fs.rlink(&df, &f, &name))
                })
                .await?
            }
            TMkDir {
                dfid,
                ref name,
                mode,
                gid,
            } => {
                let f = get_fid(dfid)?;
                let name = name.clone();
                self.run_with_credentials(f.user.clone(), move |fs| {
                    futures::executor::block_on(fs.rmkdir(&f, &name, mode, gid))
                })
                .await?
            }
            TRenameAt {
                olddirfid,
                ref oldname,
                newdirfid,
                ref newname,
            } => {
                let oldf = get_fid(olddirfid)?;
                let newf = get_fid(newdirfid)?;
                let oldname = oldname.clone();
                let newname = newname.clone();
                let user = oldf.user.clone();
                self.run_with_credentials(user, move |fs| {
                    futures::executor::block_on(fs.rrenameat(&oldf, &oldname, &newf, &newname))
                })
                .await?
            }
            TUnlinkAt {
                dirfd,
                ref name,
                flags,
            } => {
                let f = get_fid(dirfd)?;
                let name = name.clone();
                self.run_with_credentials(f.user.clone(), move |fs| {
                    futures::executor::block_on(fs.runlinkat(&f, &name, flags))
                })
                .await?
            }
            _ => return Err(Error::No(EOPNOTSUPP)),
        };

        Ok(response)
    }

    fn resolve_attach_user(&self, uname: &str, n_uname: u32, aname: &str) -> Result<Arc<ResolvedUser>> {
        self.attach_hook
            .resolve(uname, n_uname, aname, self.privileged_source_port)
    }

    /// Run `f` on the blocking pool with the calling user's fsuid/fsgid/
    /// groups set for the duration. `f` receives `&self.fs` and is expected
    /// to drive the async `Filesystem` method to completion itself (see
    /// module docs for why this bridges via `futures::executor::block_on`
    /// instead of `.await`ing directly).
    async fn run_with_credentials<F>(&self, user: Arc<ResolvedUser>, f: F) -> Result<FCall>
    where
        F: FnOnce(&Fs) -> Result<FCall> + Send + 'static,
    {
        let fs = self.fs.clone();
        let policy = self.credentials.clone();
        tokio::task::spawn_blocking(move || {
            let _guard = CredentialGuard::assume(
                &user,
                policy.run_as_uid,
                policy.enforce_supplementary_groups,
            )?;
            f(&fs)
        })
        .await
        .map_err(|_| Error::No(ECANCELED))?
    }

    async fn reply(&self, tag: u16, body: FCall) {
        if !MsgType::from(&body).is_r() {
            return;
        }
        let msg = Msg { tag, body };
        debug!("conn {}: → {:?}", self.conn_id, msg);

        let max = self.msize();
        let framed = match serialize::encode_bounded(&msg, max) {
            Ok(b) => b,
            Err(e) => {
                error!("conn {}: failed to encode reply: {:?}", self.conn_id, e);
                return;
            }
        };

        // encode_bounded already wrote the 4-byte size prefix; the codec
        // adds its own, so hand it just the body.
        let body_only = bytes::Bytes::copy_from_slice(&framed[4..]);
        let mut write_half = self.write_half.lock().await;
        use futures::SinkExt;
        if let Err(e) = write_half.send(body_only).await {
            error!("conn {}: write failed: {:?}", self.conn_id, e);
        }
    }

    /// On transport EOF: synthesize a flush for every outstanding tag, then
    /// a clunk for every remaining fid (spec.md §4.4/§4.5).
    async fn teardown(&self) {
        self.set_state(ConnState::Draining);
        for (_, entry) in self.tags.lock().unwrap().drain() {
            entry.cancel.cancel();
        }
        for (_, fid) in self.fids.drain() {
            let fs = self.fs.clone();
            let _ = tokio::task::spawn_blocking(move || {
                futures::executor::block_on(fs.rclunk(&fid))
            })
            .await;
        }
        self.set_state(ConnState::Dead);
        info!("conn {}: closed", self.conn_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::srv::Filesystem;
    use crate::userpool::UserPool;
    use async_trait::async_trait;
    use std::sync::RwLock as StdRwLock;

    struct NullFs;

    #[async_trait]
    impl Filesystem for NullFs {
        type Fid = ();
    }

    fn test_connection() -> Connection<NullFs> {
        Connection::new(
            0,
            Arc::new(NullFs),
            CredentialPolicy::none(),
            Arc::new(UserPoolHook(Arc::new(UserPool::new()))),
            false,
            Box::new(tokio::io::sink()),
            64 * 1024,
        )
    }

    /// Fid aux carrying a settable path, standing in for `diod::posixfs`'s
    /// `PosixFid` — populated by `rattach`/`rwalk` through interior
    /// mutability, exactly the shape the fid-population bug hid behind.
    #[derive(Default)]
    struct RecordingFid {
        path: StdRwLock<Option<String>>,
    }

    struct RecordingFs;

    #[async_trait]
    impl Filesystem for RecordingFs {
        type Fid = RecordingFid;

        async fn rattach(
            &self,
            fid: &Fid<Self::Fid>,
            _afid: Option<&Fid<Self::Fid>>,
            _uname: &str,
            aname: &str,
            _n_uname: u32,
        ) -> Result<FCall> {
            *fid.aux.path.write().unwrap() = Some(aname.to_owned());
            Ok(FCall::RAttach { qid: QId::default() })
        }

        async fn rwalk(
            &self,
            fid: &Fid<Self::Fid>,
            new: &Fid<Self::Fid>,
            wnames: &[String],
        ) -> Result<FCall> {
            let base = fid.aux.path.read().unwrap().clone().unwrap_or_default();
            *new.aux.path.write().unwrap() = Some(format!("{base}/{}", wnames.join("/")));
            if wnames.first().map(String::as_str) == Some("missing") {
                return Ok(FCall::RWalk { wqids: vec![] });
            }
            let wqids = wnames.iter().map(|_| QId::default()).collect();
            Ok(FCall::RWalk { wqids })
        }
    }

    fn recording_connection() -> Connection<RecordingFs> {
        let users = Arc::new(UserPool::new().with_no_userdb(true));
        Connection::new(
            0,
            Arc::new(RecordingFs),
            CredentialPolicy::none(),
            Arc::new(UserPoolHook(users)),
            false,
            Box::new(tokio::io::sink()),
            64 * 1024,
        )
    }

    #[tokio::test]
    async fn tattach_inserts_the_same_fid_rattach_populated() {
        let conn = recording_connection();
        let body = FCall::TAttach {
            fid: 1,
            afid: NOFID,
            uname: "ignored".into(),
            aname: "myexport".into(),
            n_uname: 1000,
        };
        conn.run_body(&body, CancellationToken::new()).await.unwrap();

        let fid = conn.fids.lookup(1).unwrap();
        assert_eq!(fid.aux.path.read().unwrap().as_deref(), Some("myexport"));
    }

    #[tokio::test]
    async fn twalk_inserts_the_same_fid_rwalk_populated() {
        let conn = recording_connection();
        conn.run_body(
            &FCall::TAttach {
                fid: 1,
                afid: NOFID,
                uname: "ignored".into(),
                aname: "root".into(),
                n_uname: 1000,
            },
            CancellationToken::new(),
        )
        .await
        .unwrap();

        conn.run_body(
            &FCall::TWalk {
                fid: 1,
                newfid: 2,
                wnames: vec!["sub".to_owned()],
            },
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let fid = conn.fids.lookup(2).unwrap();
        assert_eq!(fid.aux.path.read().unwrap().as_deref(), Some("root/sub"));
    }

    #[tokio::test]
    async fn twalk_in_place_on_the_same_fid_succeeds_and_overwrites() {
        let conn = recording_connection();
        conn.run_body(
            &FCall::TAttach {
                fid: 1,
                afid: NOFID,
                uname: "ignored".into(),
                aname: "root".into(),
                n_uname: 1000,
            },
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let result = conn
            .run_body(
                &FCall::TWalk {
                    fid: 1,
                    newfid: 1,
                    wnames: vec![],
                },
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(matches!(result, FCall::RWalk { wqids } if wqids.is_empty()));
        let fid = conn.fids.lookup(1).unwrap();
        assert_eq!(fid.aux.path.read().unwrap().as_deref(), Some("root/"));
    }

    #[tokio::test]
    async fn twalk_partial_success_does_not_attach_the_target_fid() {
        let conn = recording_connection();
        conn.run_body(
            &FCall::TAttach {
                fid: 1,
                afid: NOFID,
                uname: "ignored".into(),
                aname: "root".into(),
                n_uname: 1000,
            },
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let result = conn
            .run_body(
                &FCall::TWalk {
                    fid: 1,
                    newfid: 2,
                    wnames: vec!["missing".to_owned(), "child".to_owned()],
                },
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(matches!(result, FCall::RWalk { wqids } if wqids.is_empty()));
        assert!(conn.fids.lookup(2).is_err());
    }

    #[tokio::test]
    async fn tversion_clamps_msize_to_the_server_max() {
        let conn = test_connection();
        let FCall::RVersion { msize, .. } = conn.handle_version(1_000_000, P92000L).await else {
            panic!("expected RVersion");
        };
        assert_eq!(msize, 64 * 1024);
        assert_eq!(conn.msize(), 64 * 1024);
    }

    #[tokio::test]
    async fn tversion_never_negotiates_below_the_protocol_minimum() {
        let conn = test_connection();
        let FCall::RVersion { msize, .. } = conn.handle_version(100, P92000L).await else {
            panic!("expected RVersion");
        };
        assert_eq!(msize, MIN_MSIZE);
    }

    #[tokio::test]
    async fn tversion_reports_unknown_for_an_unrecognized_version_string() {
        let conn = test_connection();
        let FCall::RVersion { version, .. } = conn.handle_version(8192, "9P3000").await else {
            panic!("expected RVersion");
        };
        assert_eq!(version, VERSION_UNKNOWN);
    }

    #[tokio::test]
    async fn tversion_moves_the_connection_into_active_state() {
        let conn = test_connection();
        assert_eq!(conn.state(), ConnState::Negotiating);
        conn.handle_version(8192, P92000L).await;
        assert_eq!(conn.state(), ConnState::Active);
    }

    #[tokio::test]
    async fn tversion_cancels_every_outstanding_tag() {
        let conn = test_connection();
        let cancel = CancellationToken::new();
        conn.tags.lock().unwrap().insert(
            7,
            TagEntry {
                cancel: cancel.clone(),
            },
        );
        conn.handle_version(8192, P92000L).await;
        assert!(cancel.is_cancelled());
        assert!(conn.tags.lock().unwrap().is_empty());
    }
}
