//! CLI entry point and process-role dispatch (§4.12, §5), grounded on
//! `ando-server/src/main.rs`'s `Cli`/`main` shape: parse flags, load
//! config, init tracing, then hand off to whichever role was asked for.
//! Unlike the teacher (one process, one `monoio` thread pool), each role
//! here gets its own single-threaded `tokio` runtime, matching §5's
//! "single-threaded cooperative event loop per process."

use std::collections::HashSet;
use std::os::fd::AsRawFd;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use sqlx::PgPool;
use tokio::net::UnixStream as TokioUnixStream;
use tokio::process::{Child, Command as TokioCommand};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, Notify};
use tracing::{error, info, warn};

use ucollect_core::config::Config;
use ucollect_core::ids::ClientId;
use ucollect_gatekeeper::authenticator::AuthenticatorClient;
use ucollect_gatekeeper::worker_pool::{WorkerHandle, WorkerPool};
use ucollect_plugin::{ClientRouter, PluginRegistry};
use ucollect_store::allowlist::RELOAD_INTERVAL;
use ucollect_store::{AuditQueue, PluginAllowlist};

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum Role {
    /// The parent process: authenticates clients, forks/execs the worker
    /// pool, hands off logged-in sessions (§4.11, §4.12).
    Gatekeeper,
    /// Internal: re-exec'd by the gatekeeper with FD 3/FD 4 pre-wired.
    /// Never invoked directly by an operator.
    Worker,
    /// Runs gatekeeper and every worker in one process, wired by
    /// in-process `UnixStream` pairs instead of a real fork/exec — for
    /// local development and testing without process-spawn privileges.
    Standalone,
}

#[derive(Parser, Debug)]
#[command(name = "ucollectd", version, about = "ucollect-master central aggregation server")]
struct Cli {
    /// Path to the single INI configuration file (§6).
    #[arg(short, long, default_value = "/etc/ucollect/ucollect.conf")]
    config: PathBuf,

    #[arg(long, value_enum, default_value_t = Role::Gatekeeper)]
    role: Role,

    /// Internal: which worker shard this process is (only meaningful with
    /// `--role worker`).
    #[arg(long)]
    worker_index: Option<usize>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;
    ucollect_observability::init_tracing(&config.log_severity, config.log_file.as_deref())?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        match cli.role {
            Role::Gatekeeper => run_gatekeeper(config, cli.config).await,
            Role::Worker => {
                let index = cli
                    .worker_index
                    .ok_or_else(|| anyhow::anyhow!("--role worker requires --worker-index"))?;
                run_worker_process(config, index).await
            }
            Role::Standalone => run_standalone(config).await,
        }
    })
}

async fn connect_db(config: &Config) -> anyhow::Result<PgPool> {
    let url = format!(
        "postgres://{}:{}@127.0.0.1/{}",
        config.db_user, config.db_password, config.db_name
    );
    Ok(PgPool::connect(&url).await?)
}

/// Spawn the external TLS/compression terminator sidecar (§4.12, out of
/// scope per spec.md §1 beyond the interface it's invoked with) pointed at
/// the gatekeeper's internal TCP port, in one of its two modes. Grounded on
/// `collect-gatekeeper.py`'s `reactor.spawnProcess('./soxy/soxy', [cert,
/// key, port, '127.0.0.1:'+port_proxy_master, mode])`.
async fn spawn_terminator(config: &Config, public_facing_port: u16, mode: &str) -> anyhow::Result<Child> {
    let child = TokioCommand::new(&config.tls_terminator_path)
        .arg(&config.tls_cert)
        .arg(&config.tls_key)
        .arg(public_facing_port.to_string())
        .arg(format!("127.0.0.1:{}", config.proxy_master_port))
        .arg(mode)
        .kill_on_drop(true)
        .spawn()?;
    Ok(child)
}

/// Ask a terminator child to shut down gracefully (§4.12: "signal the
/// terminator" on SIGTERM, as opposed to the `kill_on_drop` hard-kill that
/// only applies if we exit without reaching this point).
fn signal_terminator(child: &Child) {
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
}

/// Wait for the first of SIGTERM or Ctrl+C (§4.12).
async fn wait_for_shutdown_signal() {
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(err) => {
            warn!(%err, "failed to install SIGTERM handler, only Ctrl+C will be honored");
            std::future::pending().await
        }
    };
    tokio::select! {
        _ = term.recv() => info!("received SIGTERM"),
        _ = tokio::signal::ctrl_c() => info!("received Ctrl+C"),
    }
}

/// The gatekeeper/supervisor role (§4.12): reconcile startup plugin state,
/// fork/exec the worker pool (each worker's FD 3/FD 4 pre-wired to one
/// half of a pair of socketpairs via `pre_exec`), then run the public
/// accept loop until a worker dies, the DB is unreachable, or a shutdown
/// signal arrives.
async fn run_gatekeeper(config: Config, config_path: PathBuf) -> anyhow::Result<()> {
    let pool = connect_db(&config).await?;
    ucollect_store::reconcile::reconcile_startup_plugin_state(&pool).await?;

    let (timer_tx, timer_rx) = mpsc::unbounded_channel();
    let worker_exited = Arc::new(Notify::new());
    let mut handles = Vec::with_capacity(config.worker_count);

    let exe = std::env::current_exe()?;
    for index in 0..config.worker_count {
        let (control_parent, control_child) = std::os::unix::net::UnixStream::pair()?;
        let (fd_parent, fd_child) = std::os::unix::net::UnixStream::pair()?;

        let control_child_fd = control_child.as_raw_fd();
        let fd_child_fd = fd_child.as_raw_fd();
        let mut cmd = Command::new(&exe);
        cmd.arg("--config")
            .arg(&config_path)
            .arg("--role")
            .arg("worker")
            .arg("--worker-index")
            .arg(index.to_string());
        unsafe {
            cmd.pre_exec(move || {
                if libc::dup2(control_child_fd, 3) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                if libc::dup2(fd_child_fd, 4) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
        let child = cmd.spawn()?;
        info!(index, pid = child.id(), "spawned worker process");

        let worker_exited = worker_exited.clone();
        tokio::task::spawn_blocking(move || {
            let mut child = child;
            match child.wait() {
                Ok(status) => error!(index, %status, "worker process exited"),
                Err(err) => error!(index, %err, "failed waiting on worker process"),
            }
            worker_exited.notify_one();
        });

        // The child now owns `control_child`/`fd_child` across its own
        // `fork`; drop our copies so a dead worker is observable as EOF
        // on our end instead of the fd staying open via our extra ref.
        drop(control_child);
        drop(fd_child);

        control_parent.set_nonblocking(true)?;
        fd_parent.set_nonblocking(true)?;
        let control_tokio = TokioUnixStream::from_std(control_parent)?;
        let fd_tokio = TokioUnixStream::from_std(fd_parent)?;
        handles.push(WorkerHandle::spawn(index, control_tokio, fd_tokio, timer_tx.clone()));
    }

    let pool_handle = WorkerPool::new(handles, timer_rx);
    let authenticator = Arc::new(AuthenticatorClient::spawn(config.authenticator_addr.clone()));
    // The gatekeeper itself only ever listens on its internal, loopback-only
    // port; `public_port`/`compression_port` are where the TLS terminator
    // sidecars accept real client connections (§4.12, §6).
    let addr = format!("127.0.0.1:{}", config.proxy_master_port);

    let mut terminator_plain = spawn_terminator(&config, config.public_port, "plain").await?;
    let mut terminator_compress = spawn_terminator(&config, config.compression_port, "compress").await?;

    let result = tokio::select! {
        res = ucollect_gatekeeper::accept_loop(&addr, authenticator, pool_handle) => res,
        _ = wait_for_shutdown_signal() => {
            info!("shutting down gatekeeper");
            signal_terminator(&terminator_plain);
            signal_terminator(&terminator_compress);
            Ok(())
        }
        _ = worker_exited.notified() => {
            Err(anyhow::anyhow!("a worker process exited, stopping gatekeeper"))
        }
        status = terminator_plain.wait() => {
            error!(?status, "lost the plain TLS terminator, stopping gatekeeper");
            Err(anyhow::anyhow!("TLS terminator (plain) exited"))
        }
        status = terminator_compress.wait() => {
            error!(?status, "lost the compression TLS terminator, stopping gatekeeper");
            Err(anyhow::anyhow!("TLS terminator (compression) exited"))
        }
    };
    pool.close().await;
    result
}

/// Common setup for hosting plugins in a worker process: connect its own
/// DB pool, build the plugin registry/router, start the audit queue, and
/// keep the plugin allow-list refreshed (§4.13's 5-minute periodic path).
struct WorkerContext {
    router: Arc<ClientRouter>,
    plugins: Arc<PluginRegistry>,
    allowlist: Arc<PluginAllowlist>,
    audit: AuditQueue,
    audit_task: tokio::task::JoinHandle<()>,
}

/// Enqueue the audit-queue shutdown sentinel and wait for it to drain
/// (§4.12's "On SIGTERM ... enqueue the audit-queue shutdown sentinel, and
/// wait for it to drain", applied here to every worker's own exit path
/// rather than just a SIGTERM, since a worker can also exit by losing its
/// gatekeeper control connection).
async fn drain_audit_queue(ctx_audit: AuditQueue, audit_task: tokio::task::JoinHandle<()>) {
    ctx_audit.shutdown();
    if let Err(err) = audit_task.await {
        error!(%err, "audit queue task panicked while draining");
    }
}

async fn build_worker_context(config: &Config) -> anyhow::Result<WorkerContext> {
    let pool = connect_db(config).await?;

    let mut registry = PluginRegistry::new();
    ucollect_plugins::register_all(&mut registry);
    let plugins = Arc::new(registry);
    let router = Arc::new(ClientRouter::new(plugins.clone()));

    let allowlist = PluginAllowlist::new(pool.clone());
    let reload_allowlist = allowlist.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(RELOAD_INTERVAL);
        ticker.tick().await; // first tick is immediate; skip it
        loop {
            ticker.tick().await;
            reload_allowlist.periodic_reload().await;
        }
    });

    let (audit, audit_task) = AuditQueue::spawn(pool);

    Ok(WorkerContext {
        router,
        plugins,
        allowlist,
        audit,
        audit_task,
    })
}

/// The real worker-process entry point (§4.12): adopt FD 3/FD 4 as
/// inherited from the gatekeeper's `pre_exec` wiring.
async fn run_worker_process(config: Config, index: usize) -> anyhow::Result<()> {
    info!(index, "worker process starting");
    let fast_pings = config.fast_pings.clone();
    let ctx = build_worker_context(&config).await?;
    let audit = ctx.audit.clone();
    let result =
        ucollect_worker::run_from_inherited_fds(ctx.router, ctx.plugins, ctx.allowlist, ctx.audit, fast_pings)
            .await;
    drain_audit_queue(audit, ctx.audit_task).await;
    result
}

/// Run gatekeeper and every worker in this one process, each worker wired
/// to the gatekeeper over an in-process `UnixStream::pair()` instead of a
/// forked child (§5's dev/test convenience role).
async fn run_standalone(config: Config) -> anyhow::Result<()> {
    let pool = connect_db(&config).await?;
    ucollect_store::reconcile::reconcile_startup_plugin_state(&pool).await?;

    let (timer_tx, timer_rx) = mpsc::unbounded_channel();
    let mut handles = Vec::with_capacity(config.worker_count);
    let fast_pings: HashSet<ClientId> = config.fast_pings.clone();

    for index in 0..config.worker_count {
        let (control_gatekeeper, control_worker) = TokioUnixStream::pair()?;
        let (fd_gatekeeper, fd_worker) = TokioUnixStream::pair()?;
        handles.push(WorkerHandle::spawn(index, control_gatekeeper, fd_gatekeeper, timer_tx.clone()));

        let ctx = build_worker_context(&config).await?;
        let fast_pings = fast_pings.clone();
        tokio::spawn(async move {
            let audit = ctx.audit.clone();
            if let Err(err) =
                ucollect_worker::run(control_worker, fd_worker, ctx.router, ctx.plugins, ctx.allowlist, ctx.audit, fast_pings)
                    .await
            {
                error!(index, %err, "standalone worker task ended");
            }
            drain_audit_queue(audit, ctx.audit_task).await;
        });
    }

    let pool_handle = WorkerPool::new(handles, timer_rx);
    let authenticator = Arc::new(AuthenticatorClient::spawn(config.authenticator_addr.clone()));
    // No TLS terminator sidecar here: standalone mode trades away the real
    // public-facing ports for a plain listener on the gatekeeper's own
    // internal port, so local testing doesn't also need a `soxy` binary and
    // certs on hand.
    let addr = format!("127.0.0.1:{}", config.proxy_master_port);

    let result = tokio::select! {
        res = ucollect_gatekeeper::accept_loop(&addr, authenticator, pool_handle) => res,
        _ = wait_for_shutdown_signal() => {
            info!("shutting down standalone process");
            Ok(())
        }
    };
    pool.close().await;
    result
}
