//! Export list matching and per-export options.
//!
//! Grounded on `diod_conf.c`'s `diod_conf_match_export`: reject any requested
//! path containing `/..`, treat a bare `/` entry as "export everything", and
//! otherwise match the requested path against each export either exactly
//! (ignoring a trailing slash) or as an ancestor directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use ninep::conn::AttachHook;
use ninep::error::{errno, Error, Result};
use ninep::fcall::NONUNAME;
use ninep::userpool::{ResolvedUser, UserPool};

/// Options attached to one `--export`/config-file export entry
/// (`diod_conf.c`'s per-export flag set, trimmed to what this scope covers).
#[derive(Clone, Debug, Default)]
pub struct ExportOptions {
    /// Reuse one open descriptor across fids opened with compatible flags.
    pub sharefd: bool,
    /// Intern paths process-wide rather than per-connection.
    pub sharepath: bool,
    /// Require the client to have connected from a privileged (<1024) source
    /// port before attaching to this export.
    pub privport: bool,
    /// Reject any write-intent open/create against this export.
    pub read_only: bool,
    /// If non-empty, only these unames may attach to this export (checked
    /// only when the server's `allsquash` policy is active).
    pub users: Vec<String>,
}

struct Export {
    path: PathBuf,
    options: ExportOptions,
}

/// The set of directories this server is willing to attach clients into.
#[derive(Default)]
pub struct ExportList {
    entries: Vec<Export>,
}

impl ExportList {
    pub fn new() -> ExportList {
        ExportList { entries: Vec::new() }
    }

    pub fn add(&mut self, path: impl Into<PathBuf>, options: ExportOptions) {
        self.entries.push(Export {
            path: path.into(),
            options,
        });
    }

    /// Find the export covering `requested`, applying the same matching
    /// rule as `diod_conf_match_export`: an export of `/` covers everything;
    /// otherwise `requested` must equal the export path (trailing slash
    /// insensitive) or be a strict descendant of it.
    pub fn matching(&self, requested: &Path) -> Result<&ExportOptions> {
        let requested_str = requested.to_string_lossy();
        if requested_str.contains("/..") {
            return Err(Error::No(errno::EPERM));
        }

        for export in &self.entries {
            let el = export.path.to_string_lossy();
            if el == "/" {
                return Ok(&export.options);
            }
            let trimmed = el.trim_end_matches('/');
            if requested_str == trimmed {
                return Ok(&export.options);
            }
            if requested_str.len() > trimmed.len()
                && requested_str.starts_with(trimmed)
                && requested_str.as_bytes()[trimmed.len()] == b'/'
            {
                return Ok(&export.options);
            }
        }

        Err(Error::No(errno::EPERM))
    }

    /// Whether `uname` may attach under this export's `users=` allowlist.
    /// Only consulted when the server squashes all callers to one identity
    /// (spec.md: the allowlist is otherwise meaningless since real identity
    /// already gates access via host permissions).
    pub fn allowed(options: &ExportOptions, uname: &str) -> bool {
        options.users.is_empty() || options.users.iter().any(|u| u == uname)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolve an attach's `aname` to a concrete root path and its export's
    /// options. An empty `aname` (9P's "no preference") picks the first
    /// configured export, matching `diod_conf.c`'s default-export behavior.
    pub fn resolve(&self, aname: &str) -> Result<(PathBuf, &ExportOptions)> {
        if aname.is_empty() {
            let first = self.entries.first().ok_or(Error::No(errno::EPERM))?;
            return Ok((first.path.clone(), &first.options));
        }
        let options = self.matching(Path::new(aname))?;
        Ok((PathBuf::from(aname), options))
    }
}

/// `Tattach`-time policy: resolve the caller through `users`, find the export
/// the client is attaching into (`aname`), and enforce its `privport`/`users`
/// restrictions before handing back the resolved identity.
pub struct DiodAttachHook {
    pub users: Arc<UserPool>,
    pub exports: Arc<ExportList>,
}

impl AttachHook for DiodAttachHook {
    fn resolve(
        &self,
        uname: &str,
        n_uname: u32,
        aname: &str,
        privileged_source_port: bool,
    ) -> Result<Arc<ResolvedUser>> {
        let (_, options) = self.exports.resolve(aname)?;

        if options.privport && !privileged_source_port {
            return Err(Error::No(errno::EPERM));
        }

        let user = if n_uname != NONUNAME {
            self.users.by_uid(n_uname)?
        } else {
            self.users.by_uname(uname)?
        };

        if !ExportList::allowed(options, &user.uname) {
            return Err(Error::No(errno::EPERM));
        }

        Ok(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list() -> ExportList {
        let mut l = ExportList::new();
        l.add("/srv/data", ExportOptions::default());
        l
    }

    #[test]
    fn exact_match_succeeds() {
        assert!(list().matching(Path::new("/srv/data")).is_ok());
    }

    #[test]
    fn descendant_path_succeeds() {
        assert!(list().matching(Path::new("/srv/data/sub/file")).is_ok());
    }

    #[test]
    fn sibling_path_is_rejected() {
        assert!(list().matching(Path::new("/srv/database")).is_err());
    }

    #[test]
    fn dotdot_is_rejected_even_under_an_export() {
        assert!(list()
            .matching(Path::new("/srv/data/../secret"))
            .is_err());
    }

    #[test]
    fn root_export_matches_anything() {
        let mut l = ExportList::new();
        l.add("/", ExportOptions::default());
        assert!(l.matching(Path::new("/anywhere/at/all")).is_ok());
    }

    #[test]
    fn resolve_with_empty_aname_picks_the_first_export() {
        let mut l = ExportList::new();
        l.add("/srv/data", ExportOptions::default());
        l.add("/srv/other", ExportOptions::default());
        let (root, _) = l.resolve("").unwrap();
        assert_eq!(root, PathBuf::from("/srv/data"));
    }

    #[test]
    fn resolve_with_aname_routes_to_the_matching_export() {
        let mut l = ExportList::new();
        l.add("/srv/data", ExportOptions::default());
        l.add("/srv/other", ExportOptions::default());
        let (root, _) = l.resolve("/srv/other").unwrap();
        assert_eq!(root, PathBuf::from("/srv/other"));
    }

    #[test]
    fn allowlist_restricts_users_when_consulted() {
        let opts = ExportOptions {
            users: vec!["alice".to_owned()],
            ..Default::default()
        };
        assert!(ExportList::allowed(&opts, "alice"));
        assert!(!ExportList::allowed(&opts, "mallory"));
    }
}
