use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

mod backends;
mod delivery;
mod diagnostic_logging;
mod lmtp_server;
mod payload;
mod proxy;
mod router;
mod settings;
mod tls;
mod trace_headers;

use backends::{MaildirDelivery, SimpleStorage, SocketRegistry, StaticDirectory};
use diagnostic_logging::{DiagnosticFormat, LoggingConfig};
use lmtp_server::{Backends, LmtpServer, SessionMeta};
use settings::Settings;

/// LMTP delivery front-end.
#[derive(Clone, Debug, Parser)]
#[command(about)]
struct Opt {
    /// Settings file to load.
    #[arg(long, default_value = "/etc/lmtpd/lmtpd.toml")]
    config: PathBuf,

    /// Override the listen address from the settings file.
    #[arg(long)]
    listen: Option<String>,

    /// Directory where diagnostic log files will be placed.
    ///
    /// If omitted, diagnostics will be printed to stderr.
    #[arg(long)]
    diag_log_dir: Option<PathBuf>,

    /// How diagnostic logs render. full, compact and pretty are
    /// intended for human consumption; json outputs machine readable
    /// records.
    #[arg(long, default_value = "full")]
    diag_format: DiagnosticFormat,

    /// Required if started as root; specifies which user to run as
    /// once privileges have been dropped. Local delivery temporarily
    /// re-acquires root to switch to target users.
    #[arg(long)]
    user: Option<String>,
}

impl Opt {
    fn drop_privs(&self) -> anyhow::Result<()> {
        let uid = nix::unistd::Uid::effective();
        if !uid.is_root() {
            if let Some(user_name) = &self.user {
                let user = nix::unistd::User::from_name(user_name)?
                    .ok_or_else(|| anyhow::anyhow!("Invalid user {user_name}"))?;
                if user.uid != uid {
                    anyhow::bail!(
                        "--user '{user_name}' resolves to uid {} \
                         which doesn't match your uid {uid}, and you are not root",
                        user.uid
                    );
                }
            }
            return Ok(());
        }

        let user_name = self.user.as_ref().ok_or_else(|| {
            anyhow::anyhow!("When running as root, you must set --user to the user to run as")
        })?;
        let user = nix::unistd::User::from_name(user_name)?
            .ok_or_else(|| anyhow::anyhow!("Invalid user {user_name}"))?;

        nix::unistd::setgid(user.gid).context("setgid")?;
        // Only the euid changes, so that delivery can seteuid to the
        // target user and back; CAP_NET_BIND_SERVICE is retained for
        // the privileged LMTP port.
        nix::unistd::seteuid(user.uid).context("seteuid")?;

        #[cfg(target_os = "linux")]
        {
            use caps::{CapSet, Capability, CapsHashSet};
            let mut target_set = CapsHashSet::new();
            target_set.insert(Capability::CAP_NET_BIND_SERVICE);
            target_set.insert(Capability::CAP_SETUID);

            caps::set(None, CapSet::Effective, &target_set)
                .with_context(|| format!("setting effective caps to {target_set:?}"))?;
            caps::set(None, CapSet::Permitted, &target_set)
                .with_context(|| format!("setting permitted caps to {target_set:?}"))?;
        }

        Ok(())
    }
}

fn main() -> anyhow::Result<()> {
    let opts = Opt::parse();

    opts.drop_privs().context("drop_privs")?;

    LoggingConfig {
        log_dir: opts.diag_log_dir.clone(),
        diag_format: opts.diag_format,
        filter_env_var: "LMTPD_LOG",
        default_filter: "lmtpd=info,rfc2033=info",
    }
    .init()
    .context("initialize logging")?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?
        .block_on(run(opts))
}

async fn run(opts: Opt) -> anyhow::Result<()> {
    let mut settings = if opts.config.exists() {
        Settings::load(&opts.config)?
    } else {
        tracing::warn!(
            "settings file {} not found, using defaults",
            opts.config.display()
        );
        Settings::default()
    };
    if let Some(listen) = opts.listen {
        settings.listen = listen;
    }
    let settings = Arc::new(settings);

    let tls_acceptor = match &settings.tls {
        Some(tls) => Some(tls::make_tls_acceptor(&settings.hostname, tls)?),
        None => None,
    };

    let registry: Arc<dyn backends::ConcurrencyRegistry> = match &settings.concurrency_socket {
        Some(path) => Arc::new(SocketRegistry::new(
            path.clone(),
            settings.user_concurrency_limit,
        )),
        None => Arc::new(UnavailableRegistry),
    };
    let backends = Backends {
        directory: Arc::new(StaticDirectory::new(&settings.passdb)),
        storage: Arc::new(SimpleStorage::new(
            settings.temp_dir.clone(),
            settings.users.clone(),
            settings.hdr_delivery_address,
        )),
        registry,
        delivery: Arc::new(MaildirDelivery::new(settings.mail_root.clone())),
    };

    if settings.listen.starts_with('/') {
        let listener = tokio::net::UnixListener::bind(&settings.listen)
            .with_context(|| format!("binding unix listener at {}", settings.listen))?;
        tracing::info!("listening on {}", settings.listen);
        loop {
            let (socket, _) = listener.accept().await.context("accepting connection")?;
            spawn_session(socket, SessionMeta::default(), &settings, &backends, &tls_acceptor);
        }
    } else {
        let listener = tokio::net::TcpListener::bind(&settings.listen)
            .await
            .with_context(|| format!("binding tcp listener at {}", settings.listen))?;
        tracing::info!("listening on {}", settings.listen);
        loop {
            let (socket, peer) = listener.accept().await.context("accepting connection")?;
            socket.set_nodelay(true).ok();
            let local = socket.local_addr().context("resolving local address")?;
            let meta = SessionMeta {
                local_ip: Some(local.ip()),
                remote_ip: Some(peer.ip()),
                local_port: local.port(),
                remote_port: peer.port(),
            };
            spawn_session(socket, meta, &settings, &backends, &tls_acceptor);
        }
    }
}

fn spawn_session<S: rfc2033::AsyncReadAndWrite + 'static>(
    socket: S,
    meta: SessionMeta,
    settings: &Arc<Settings>,
    backends: &Backends,
    tls_acceptor: &Option<tokio_rustls::TlsAcceptor>,
) {
    let settings = settings.clone();
    let backends = backends.clone();
    let tls_acceptor = tls_acceptor.clone();
    tokio::spawn(async move {
        if let Err(err) = LmtpServer::run(socket, settings, backends, tls_acceptor, meta).await {
            tracing::debug!("session ended with error: {err:#}");
        }
    });
}

/// Stands in when no registry socket is configured; a configured
/// concurrency limit then temp-fails recipients rather than silently
/// admitting them.
struct UnavailableRegistry;

#[async_trait::async_trait]
impl backends::ConcurrencyRegistry for UnavailableRegistry {
    async fn query(&self, _query: &str) -> anyhow::Result<bool> {
        anyhow::bail!("no concurrency registry socket configured")
    }
}
