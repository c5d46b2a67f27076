//! TOML config file + CLI flags, CLI-overrides-file precedence.
//!
//! Grounded on `diod_conf.c`'s settable field set (`nwthreads`, `diodlisten`,
//! exports, `runasuid`, squash policy). The C implementation parses its own
//! lex/yacc grammar from `/etc/diod.conf`; this scope uses TOML (`serde` +
//! `toml`, as the rest of the pack does for config files) and keeps only the
//! subset of fields this implementation actually consults, matching
//! `diod_conf.c`'s precedence rule: a flag given on the command line always
//! wins over the same key in the config file.

use std::path::PathBuf;

use serde::Deserialize;

use crate::export::ExportOptions;

#[derive(Debug, Deserialize, Default)]
pub struct ExportEntry {
    pub path: PathBuf,
    #[serde(default)]
    pub sharefd: bool,
    #[serde(default)]
    pub sharepath: bool,
    #[serde(default)]
    pub privport: bool,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub users: Vec<String>,
}

impl From<&ExportEntry> for ExportOptions {
    fn from(e: &ExportEntry) -> ExportOptions {
        ExportOptions {
            sharefd: e.sharefd,
            sharepath: e.sharepath,
            privport: e.privport,
            read_only: e.read_only,
            users: e.users.clone(),
        }
    }
}

/// On-disk config file shape (`diod_conf.c`'s settable fields, trimmed to
/// this scope). Every field is optional so a config file can set only what
/// it cares about; CLI flags fill in the rest (see `Settings::merge`).
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFile {
    pub nwthreads: Option<usize>,
    pub listen: Option<String>,
    pub ctl_listen: Option<String>,
    pub allsquash: Option<bool>,
    pub squashuser: Option<String>,
    pub runas_uid: Option<u32>,
    pub no_userdb: Option<bool>,
    #[serde(default)]
    pub exports: Vec<ExportEntry>,
}

impl ConfigFile {
    pub fn load(path: &std::path::Path) -> ninep::Result<ConfigFile> {
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text)
            .map_err(|e| ninep::Error::Protocol(format!("{}: {e}", path.display())))
    }
}

/// Fully resolved server configuration: config file values with CLI flags
/// overlaid (`diod_conf.c`'s "command line wins" precedence).
#[derive(Debug)]
pub struct Settings {
    pub nwthreads: usize,
    pub listen: String,
    pub ctl_listen: Option<String>,
    pub allsquash: bool,
    pub squashuser: Option<String>,
    pub runas_uid: Option<u32>,
    pub no_userdb: bool,
    pub exports: Vec<ExportEntry>,
}

impl Settings {
    pub fn merge(file: ConfigFile, cli: &crate::Cli) -> Settings {
        Settings {
            nwthreads: cli.nwthreads.or(file.nwthreads).unwrap_or(16),
            listen: cli
                .listen
                .clone()
                .or(file.listen)
                .unwrap_or_else(|| "tcp:0.0.0.0:564".to_owned()),
            ctl_listen: cli.ctl_listen.clone().or(file.ctl_listen),
            allsquash: cli.allsquash || file.allsquash.unwrap_or(false),
            squashuser: cli.squashuser.clone().or(file.squashuser),
            runas_uid: cli.runas_uid.or(file.runas_uid),
            no_userdb: cli.no_userdb || file.no_userdb.unwrap_or(false),
            exports: if cli.export.is_empty() {
                file.exports
            } else {
                cli.export
                    .iter()
                    .map(|p| ExportEntry {
                        path: p.clone(),
                        ..Default::default()
                    })
                    .collect()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_minimal_config_file() {
        let toml = r#"
            nwthreads = 8
            listen = "tcp:0.0.0.0:10000"

            [[exports]]
            path = "/srv/data"
            sharefd = true
        "#;
        let cfg: ConfigFile = toml::from_str(toml).unwrap();
        assert_eq!(cfg.nwthreads, Some(8));
        assert_eq!(cfg.exports.len(), 1);
        assert!(cfg.exports[0].sharefd);
    }
}
