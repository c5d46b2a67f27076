use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use log::{error, info};
use ninep::conn::CredentialPolicy;
use ninep::srv::Server;
use ninep::userpool::{ResolvedUser, UserPool};
use ninep::utils::{parse_endpoint, Endpoint};

mod config;
mod ctlfs;
mod export;
mod posixfs;
mod utils;

use config::Settings;
use ctlfs::CtlFs;
use export::{DiodAttachHook, ExportList, ExportOptions};
use ninep::conn::UserPoolHook;
use posixfs::PosixFs;

/// diod: a 9P2000.L file server exporting host directories to remote
/// v9fs clients under per-client credentials.
///
/// CLI flags override the same key in `--config-file`, matching
/// `diod_conf.c`'s command-line-wins precedence.
#[derive(Debug, clap::Parser)]
#[command(name = "diod")]
struct Cli {
    /// Add a listen endpoint (tcp:host:port or an absolute unix path); may repeat.
    #[arg(long = "listen")]
    listen: Option<String>,

    /// Listen endpoint for the synthetic control filesystem (diodctl's
    /// `version`/`connections`/`exports` tree); disabled unless set.
    #[arg(long)]
    ctl_listen: Option<String>,

    /// Worker pool size (tokio blocking-pool thread cap).
    #[arg(long)]
    nwthreads: Option<usize>,

    /// Permit exporting PATH; may repeat.
    #[arg(long = "export")]
    export: Vec<PathBuf>,

    /// Bypass passwd/group lookup; fabricate identities from the numeric uid.
    #[arg(long)]
    no_userdb: bool,

    /// Map every attaching user to the squash identity.
    #[arg(long)]
    allsquash: bool,

    /// Squash identity name (default "nobody").
    #[arg(long)]
    squashuser: Option<String>,

    /// Skip per-thread credential switching; run every request as this uid.
    #[arg(long)]
    runas_uid: Option<u32>,

    /// Load settings from a TOML config file; CLI flags still win.
    #[arg(long)]
    config_file: Option<PathBuf>,

    /// Maximum directory depth a Twalk may traverse before ELOOP
    /// (guards against an export mounted inside itself).
    #[arg(long, default_value_t = 200)]
    max_depth: usize,
}

async fn diod_main(cli: Cli) -> ninep::Result<i32> {
    let file = match &cli.config_file {
        Some(path) => config::ConfigFile::load(path)?,
        None => config::ConfigFile::default(),
    };
    let settings = Settings::merge(file, &cli);

    let mut exports = ExportList::new();
    for entry in &settings.exports {
        exports.add(&entry.path, ExportOptions::from(entry));
    }
    if exports.is_empty() {
        error!("no exports configured; nothing to serve");
        return Ok(1);
    }
    let exports = Arc::new(exports);

    let mut users = UserPool::new().with_no_userdb(settings.no_userdb);
    if settings.allsquash {
        let mut squash = ResolvedUser::squash();
        if let Some(name) = &settings.squashuser {
            squash.uname = name.clone();
        }
        users = users.with_squash(squash);
    }
    let users = Arc::new(users);

    // spec.md §5: confirm this kernel's setgroups is per-thread before
    // trusting it from concurrent spawn_blocking workers (mirrors diod.c's
    // _test_setgroups). Skip the probe under runas_uid, where groups are
    // never switched at all.
    let enforce_supplementary_groups = if settings.runas_uid.is_some() {
        true
    } else {
        let per_thread = ninep::credentials::probe_per_thread_setgroups();
        if !per_thread {
            log::warn!(
                "setgroups appears to apply process-wide on this kernel; \
                 disabling supplementary-group enforcement"
            );
        }
        per_thread
    };

    let credentials = CredentialPolicy {
        run_as_uid: settings.runas_uid,
        enforce_supplementary_groups,
    };
    let attach_hook = Arc::new(DiodAttachHook {
        users: users.clone(),
        exports: exports.clone(),
    });

    if parse_endpoint(&settings.listen).is_none() {
        error!("invalid --listen value: {}", settings.listen);
        return Ok(1);
    }
    if let Some(ctl) = &settings.ctl_listen {
        if parse_endpoint(ctl).is_none() {
            error!("invalid --ctl-listen value: {}", ctl);
            return Ok(1);
        }
    }

    let ctl_server = match &settings.ctl_listen {
        Some(listen) => {
            let ctl_fs = CtlFs::new();
            *ctl_fs.exports_listing.lock().unwrap() = render_exports(&settings.exports);
            let connections = ctl_fs.connections.clone();
            let ctl_hook = Arc::new(UserPoolHook(users.clone()));
            Some((
                Server::new(ctl_fs, Arc::new(UserPool::new()), CredentialPolicy::none(), ctl_hook, 64 * 1024),
                listen.clone(),
                connections,
            ))
        }
        None => None,
    };

    let fs = PosixFs::new(exports.clone(), cli.max_depth);
    let connection_counter = ctl_server.as_ref().map(|(_, _, counter)| counter.clone());
    let server = Server::with_connection_counter(
        fs,
        users,
        credentials,
        attach_hook,
        64 * 1024,
        connection_counter,
    );

    info!("nwthreads = {}", settings.nwthreads);
    info!("listen = {}", settings.listen);

    let serve_main = serve_endpoint(&server, &settings.listen);
    match ctl_server {
        Some((ctl_server, ctl_listen, _connections)) => {
            let serve_ctl = serve_endpoint(&ctl_server, &ctl_listen);
            let (main_result, ctl_result) = tokio::join!(serve_main, serve_ctl);
            main_result?;
            ctl_result?;
        }
        None => serve_main.await?,
    }

    Ok(0)
}

fn render_exports(exports: &[config::ExportEntry]) -> String {
    exports
        .iter()
        .map(|e| format!("{}\n", e.path.display()))
        .collect()
}

async fn serve_endpoint<Fs: ninep::srv::Filesystem + Send + Sync + 'static>(
    server: &std::sync::Arc<Server<Fs>>,
    listen: &str,
) -> ninep::Result<()> {
    match parse_endpoint(listen) {
        Some(Endpoint::Tcp(addr)) => server.serve_tcp(&addr).await,
        Some(Endpoint::Unix(path)) => server.serve_unix(&path).await,
        None => {
            error!("invalid listen value: {}", listen);
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let exit_code = diod_main(Cli::parse()).await.unwrap_or_else(|e| {
        eprintln!("Error: {:?}", e);
        1
    });

    std::process::exit(exit_code);
}
