//! Worker process body (§4.8, §4.11, §4.12): read the gatekeeper⇄worker
//! control stream, adopt handed-off client sockets, and drive each one
//! through [`session::run`]. Structured after
//! `ucollect-gatekeeper`'s `accept_loop` — bind/adopt once, loop reading
//! frames, spawn a task per unit of work — adapted to this crate's two
//! inherited file descriptors instead of a single `TcpListener`.

pub mod control;
pub mod session;
pub mod timers;
pub mod versions;

use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, Mutex};
use tokio_util::codec::Framed;

use ucollect_core::ids::ClientId;
use ucollect_core::protocol::{opcode, FrameCodec};
use ucollect_plugin::{ClientRouter, PluginRegistry};
use ucollect_store::{AuditQueue, PluginAllowlist};

use timers::GlobalTimerRegistry;

/// Adopt FD 3/FD 4 (the real worker-process entry point — §4.12) and drive
/// them via [`run`]. The supervisor contractually pre-wires these before
/// exec, per `control::adopt_inherited_fds`'s safety note.
pub async fn run_from_inherited_fds(
    router: Arc<ClientRouter>,
    plugins: Arc<PluginRegistry>,
    allowlist: Arc<PluginAllowlist>,
    audit: AuditQueue,
    fast_pings: HashSet<ClientId>,
) -> anyhow::Result<()> {
    let (control, fd_channel) = unsafe { control::adopt_inherited_fds()? };
    run(control, fd_channel, router, plugins, allowlist, audit, fast_pings).await
}

/// Loop forever reading `control`'s frames: `'l'` handoffs spawn a
/// [`session::run`] task each (adopting the handed-off client fd from
/// `fd_channel`), `'t'` ticks are dispatched to whichever plugin
/// registered that global timer. Returns once the control stream closes —
/// mirrors `worker2gatekeeper.py`'s `connectionLost` stopping the reactor:
/// losing the gatekeeper is fatal to a worker, the supervisor is
/// responsible for respawning it.
///
/// Split out from [`run_from_inherited_fds`] so a standalone, single
/// process test/dev harness can drive a worker over an in-process
/// `UnixStream::pair()` instead of real inherited file descriptors.
pub async fn run(
    control: UnixStream,
    fd_channel: UnixStream,
    router: Arc<ClientRouter>,
    plugins: Arc<PluginRegistry>,
    allowlist: Arc<PluginAllowlist>,
    audit: AuditQueue,
    fast_pings: HashSet<ClientId>,
) -> anyhow::Result<()> {
    let fd_channel = Arc::new(Mutex::new(fd_channel));

    let framed = Framed::new(control, FrameCodec::gatekeeper());
    let (mut control_sink, mut control_stream) = framed.split();

    let (timer_tx, mut timer_rx) = mpsc::unbounded_channel::<Bytes>();
    let timers = GlobalTimerRegistry::new(timer_tx);

    tokio::spawn(async move {
        while let Some(frame) = timer_rx.recv().await {
            if let Err(err) = control_sink.send(frame).await {
                tracing::error!(%err, "control stream write failed");
                break;
            }
        }
    });

    while let Some(frame) = control_stream.next().await {
        let frame = frame?;
        let Some(&op) = frame.first() else {
            tracing::warn!("empty control frame, ignoring");
            continue;
        };
        let body = frame.slice(1..);

        match op {
            opcode::HANDOFF => {
                let handoff = match control::parse_handoff(&body) {
                    Ok(handoff) => handoff,
                    Err(err) => {
                        tracing::error!(%err, "malformed handoff envelope");
                        continue;
                    }
                };
                let fd_channel = fd_channel.clone();
                let router = router.clone();
                let plugins = plugins.clone();
                let allowlist = allowlist.clone();
                let audit = audit.clone();
                let fast_ping = fast_pings.contains(&handoff.cid);
                tokio::spawn(async move {
                    match control::recv_client_socket(&fd_channel).await {
                        Ok(stream) => {
                            session::run(
                                stream,
                                handoff.leftover,
                                handoff.replay,
                                handoff.cid,
                                fast_ping,
                                router,
                                plugins,
                                allowlist,
                                audit,
                            )
                            .await;
                        }
                        Err(err) => {
                            tracing::error!(cid = %handoff.cid, %err, "failed to adopt handed-off client socket");
                        }
                    }
                });
            }
            opcode::TIMER_TICK => match timers::parse_tick(&body) {
                Ok(timer_id) => {
                    let timers = timers.clone();
                    tokio::spawn(async move {
                        timers.dispatch_tick(&timer_id).await;
                    });
                }
                Err(err) => tracing::error!(%err, "malformed timer tick"),
            },
            _ => tracing::warn!(opcode = op, "unknown control frame"),
        }
    }

    tracing::error!("control stream closed, worker exiting");
    anyhow::bail!("lost connection to gatekeeper")
}
