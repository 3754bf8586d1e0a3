//! Worker-side logged-in session (§4.8), grounded on `client_worker.py`'s
//! `ClientWorkerConn`. This is the other half of the pre-auth/post-auth
//! dispatch split described in §4.8: this dispatcher never sees `'L'`, the
//! gatekeeper's `GatekeeperSession` never sees `'P'`/`'R'`/`'V'`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, FramedParts};

use ucollect_core::error::CoreError;
use ucollect_core::ids::ClientId;
use ucollect_core::protocol::{extract_string, opcode, FrameCodec};
use ucollect_observability::Activity;
use ucollect_plugin::{ClientInfo, ClientRouter, PluginRegistry, SessionHandle};
use ucollect_store::allowlist::Recheckable;
use ucollect_store::schema::{ACTIVE_PLUGINS, PLUGIN_HISTORY};
use ucollect_store::{AuditQueue, PluginAllowlist};

use crate::versions::{self, PluginRecord};

/// Three consecutive un-ponged pings aborts the connection (§4.8).
const MAX_PING_MISSES: u32 = 3;

/// A live, logged-in client session, as seen both by the dispatch loop in
/// [`run`] and by plugin code through the [`SessionHandle`] contract.
///
/// Split into two pieces of interior state for different concurrency
/// needs: `available_plugins`/`last_pong` are read synchronously by
/// arbitrary plugin/router callers (`SessionHandle` methods are not
/// async), so they use `std::sync::RwLock`/`Mutex` rather than `tokio`'s;
/// `negotiated` is only ever touched from the session's own dispatch loop
/// or its own spawned recheck task, so a plain `std::sync::Mutex` is
/// likewise sufficient (never held across an `.await`).
pub struct WorkerSession {
    cid: ClientId,
    proto_version: AtomicU8,
    outbound_tx: mpsc::UnboundedSender<Bytes>,
    available_plugins: std::sync::RwLock<HashMap<String, u16>>,
    negotiated: std::sync::Mutex<HashMap<String, PluginRecord>>,
    last_pong: std::sync::Mutex<Instant>,
    /// Pre-login `'S'` session cookie (§3's Data Model, §2b): stored as
    /// inert state, never otherwise consulted by this crate.
    session_cookie: std::sync::Mutex<Option<u32>>,
    ping_misses: AtomicU32,
    alive: AtomicBool,
    self_weak: Weak<WorkerSession>,
    router: Arc<ClientRouter>,
    plugins: Arc<PluginRegistry>,
    allowlist: Arc<PluginAllowlist>,
    audit: AuditQueue,
}

impl SessionHandle for WorkerSession {
    fn cid(&self) -> &ClientId {
        &self.cid
    }

    fn protocol_version(&self) -> u8 {
        self.proto_version.load(Ordering::SeqCst)
    }

    fn plugin_version(&self, plugin_name: &str) -> Option<u16> {
        self.available_plugins.read().unwrap().get(plugin_name).copied()
    }

    fn send_frame(&self, payload: Bytes) -> bool {
        self.alive.load(Ordering::SeqCst) && self.outbound_tx.send(payload).is_ok()
    }

    fn last_pong(&self) -> Instant {
        *self.last_pong.lock().unwrap()
    }
}

impl Recheckable for WorkerSession {
    /// The allow-list changed; re-run negotiation against the plugin
    /// records the client last advertised, without waiting for it to send
    /// a fresh `'V'` frame (§4.13). Spawned as its own task since this
    /// trait method is sync (subscribers are plain `Weak` pointers, not
    /// tied to any particular executor context) but the recompute needs
    /// to call async plugin hooks and write a reply frame.
    fn recheck_versions(&self) {
        let Some(session) = self.self_weak.upgrade() else {
            return;
        };
        if !session.alive.load(Ordering::SeqCst) {
            return;
        }
        tokio::spawn(async move {
            let previous = session.negotiated.lock().unwrap().clone();
            let advertised: Vec<PluginRecord> = previous.values().cloned().collect();
            session.apply_negotiation(advertised).await;
        });
    }
}

impl WorkerSession {
    async fn apply_negotiation(self: &Arc<Self>, advertised: Vec<PluginRecord>) {
        let previous = self.negotiated.lock().unwrap().clone();
        let allowlist = self.allowlist.clone();
        let outcome = versions::negotiate(&advertised, &previous, |name, version, hash| {
            allowlist.is_allowed(name, version, hash)
        });

        let info = ClientInfo {
            cid: self.cid.clone(),
            protocol_version: self.proto_version.load(Ordering::SeqCst),
        };
        for name in &outcome.to_deactivate {
            if let Some(plugin) = self.plugins.get(name) {
                plugin.client_disconnected(info.clone()).await;
            }
        }
        for name in &outcome.to_activate {
            if let Some(plugin) = self.plugins.get(name) {
                let handle: Arc<dyn SessionHandle> = self.clone();
                plugin.client_connected(info.clone(), handle).await;
            }
        }

        {
            let mut available = self.available_plugins.write().unwrap();
            available.clear();
            for (name, rec) in &outcome.next_state {
                if rec.active {
                    available.insert(name.clone(), rec.version);
                }
            }
        }
        *self.negotiated.lock().unwrap() = outcome.next_state.clone();

        if let Some(reply) = outcome.reply {
            self.send_frame(reply);
        }

        self.persist_plugin_state(outcome.next_state);
    }

    /// Overwrite `active_plugins` and append to `plugin_history` for this
    /// cid (§4.9 step 7), via the audit queue so the dispatch loop never
    /// blocks on a DB round trip.
    fn persist_plugin_state(&self, next_state: HashMap<String, PluginRecord>) {
        let cid = self.cid.as_str().to_string();
        self.audit.push_txn(move |conn| {
            let cid = cid.clone();
            let records: Vec<PluginRecord> = next_state.into_values().collect();
            Box::pin(async move {
                if let Err(err) = sqlx::query(&format!("DELETE FROM {ACTIVE_PLUGINS} WHERE cid = $1"))
                    .bind(&cid)
                    .execute(&mut *conn)
                    .await
                {
                    tracing::error!(%err, "failed to clear active_plugins");
                    return;
                }
                for rec in &records {
                    let hash_hex = hex::encode(rec.md5);
                    if let Err(err) = sqlx::query(&format!(
                        "INSERT INTO {ACTIVE_PLUGINS} (cid, name, version, hash, libname, active, updated) \
                         VALUES ($1, $2, $3, $4, $5, $6, CURRENT_TIMESTAMP AT TIME ZONE 'UTC')"
                    ))
                    .bind(&cid)
                    .bind(&rec.name)
                    .bind(rec.version as i32)
                    .bind(&hash_hex)
                    .bind(&rec.libname)
                    .bind(rec.active)
                    .execute(&mut *conn)
                    .await
                    {
                        tracing::error!(%err, plugin = %rec.name, "failed to insert active_plugins row");
                    }
                    if let Err(err) = sqlx::query(&format!(
                        "INSERT INTO {PLUGIN_HISTORY} (cid, name, version, hash, active, changed_at) \
                         VALUES ($1, $2, $3, $4, $5, CURRENT_TIMESTAMP AT TIME ZONE 'UTC')"
                    ))
                    .bind(&cid)
                    .bind(&rec.name)
                    .bind(rec.version as i32)
                    .bind(&hash_hex)
                    .bind(rec.active)
                    .execute(&mut *conn)
                    .await
                    {
                        tracing::error!(%err, plugin = %rec.name, "failed to insert plugin_history row");
                    }
                }
            })
        });
    }
}

/// Parse the payload following an `'S'` opcode byte: a 4-byte session
/// cookie (§4.8). Stored as inert state on `WorkerSession` (§2b, §3's Data
/// Model) — nothing in this crate ever reads it back — kept as its own
/// tiny parser rather than importing `ucollect-gatekeeper` so the two
/// pre-login dispatch tables stay genuinely independent (§4.8's "not one
/// shared pre-auth matcher").
fn parse_session_cookie(body: &[u8]) -> Result<u32, CoreError> {
    let bytes: [u8; 4] = body
        .try_into()
        .map_err(|_| CoreError::ProtocolViolation("session cookie must be 4 bytes".into()))?;
    Ok(u32::from_be_bytes(bytes))
}

/// Dispatch one frame. Returns `false` if the connection should be torn
/// down as a result (bad/unsupported protocol version, duplicate live
/// session for this cid).
async fn handle_frame(session: &Arc<WorkerSession>, frame: Bytes, logged_in: &mut bool) -> bool {
    let Some(&op) = frame.first() else {
        tracing::warn!(cid = %session.cid, "empty frame, ignoring");
        return true;
    };
    let body = frame.slice(1..);

    if !*logged_in {
        match op {
            opcode::HELLO => {
                let proto_version = body.first().copied().unwrap_or(0);
                session.proto_version.store(proto_version, Ordering::SeqCst);
                if proto_version >= 1 {
                    session.available_plugins.write().unwrap().clear();
                } else {
                    let mut available = session.available_plugins.write().unwrap();
                    for (name, version) in versions::LEGACY_PROTO0_PLUGINS {
                        available.insert((*name).to_string(), *version);
                    }
                }

                let handle: Arc<dyn SessionHandle> = session.clone();
                if !session.router.register_client(handle).await {
                    tracing::warn!(cid = %session.cid, "duplicate live session for cid, dropping");
                    return false;
                }

                if proto_version == 1 {
                    let weak: Weak<dyn Recheckable> = session.self_weak.clone();
                    session.allowlist.subscribe(weak).await;
                } else if proto_version != 0 {
                    tracing::error!(cid = %session.cid, proto_version, "unsupported protocol version");
                    return false;
                }

                *logged_in = true;
                session.audit.push_activity(session.cid.as_str(), Activity::Login.as_str());
                tracing::info!(cid = %session.cid, proto_version, "client logged in");
            }
            opcode::SESSION_COOKIE => match parse_session_cookie(&body) {
                Ok(cookie) => *session.session_cookie.lock().unwrap() = Some(cookie),
                Err(err) => tracing::warn!(cid = %session.cid, %err, "malformed session cookie"),
            },
            _ => {
                tracing::warn!(cid = %session.cid, opcode = op, "unexpected pre-login frame");
            }
        }
        return true;
    }

    match op {
        opcode::PING => {
            let mut reply = vec![opcode::PONG];
            reply.extend_from_slice(&body);
            session.send_frame(Bytes::from(reply));
        }
        opcode::PONG => {
            session.ping_misses.store(0, Ordering::SeqCst);
            *session.last_pong.lock().unwrap() = Instant::now();
        }
        opcode::ROUTED => match extract_string(&body) {
            Ok((name, payload)) => {
                let name = String::from_utf8_lossy(name).into_owned();
                let payload = Bytes::copy_from_slice(payload);
                session.router.route_to_plugin(&name, payload, &session.cid).await;
            }
            Err(err) => tracing::warn!(cid = %session.cid, %err, "malformed routed frame"),
        },
        opcode::VERSIONS => {
            if session.proto_version.load(Ordering::SeqCst) == 0 {
                match versions::parse_versions_v0(&body) {
                    Ok(map) => *session.available_plugins.write().unwrap() = map,
                    Err(err) => tracing::warn!(cid = %session.cid, %err, "malformed legacy version list"),
                }
            } else {
                match versions::parse_versions_v1(&body) {
                    Ok(advertised) => session.apply_negotiation(advertised).await,
                    Err(err) => tracing::warn!(cid = %session.cid, %err, "malformed version negotiation frame"),
                }
            }
        }
        _ => tracing::warn!(cid = %session.cid, opcode = op, "unknown post-login frame"),
    }
    true
}

/// Run the disconnect path once (§4.8): unregister from every plugin,
/// archive `active_plugins` into `plugin_history`, log `logout`.
async fn disconnect(session: &Arc<WorkerSession>, logged_in: bool) {
    session.alive.store(false, Ordering::SeqCst);
    if !logged_in {
        return;
    }
    let handle: Arc<dyn SessionHandle> = session.clone();
    session.router.unregister_client(&handle).await;

    let cid = session.cid.as_str().to_string();
    session.audit.push_txn(move |conn| {
        let cid = cid.clone();
        Box::pin(async move {
            if let Err(err) = sqlx::query(&format!(
                "INSERT INTO {PLUGIN_HISTORY} (cid, name, version, hash, active, changed_at) \
                 SELECT cid, name, version, hash, false, CURRENT_TIMESTAMP AT TIME ZONE 'UTC' \
                 FROM {ACTIVE_PLUGINS} WHERE cid = $1"
            ))
            .bind(&cid)
            .execute(&mut *conn)
            .await
            {
                tracing::error!(%err, "failed to archive active_plugins on disconnect");
                return;
            }
            if let Err(err) = sqlx::query(&format!("DELETE FROM {ACTIVE_PLUGINS} WHERE cid = $1"))
                .bind(&cid)
                .execute(&mut *conn)
                .await
            {
                tracing::error!(%err, "failed to clear active_plugins on disconnect");
            }
        })
    });
    session.audit.push_activity(session.cid.as_str(), Activity::Logout.as_str());
    tracing::info!(cid = %session.cid, "client logged out");
}

/// Drive one adopted client socket from its replay buffer through to
/// disconnect (§4.8). `leftover` seeds the codec's read buffer with bytes
/// the gatekeeper had already pulled off the wire but not yet decoded.
pub async fn run(
    stream: TcpStream,
    leftover: Bytes,
    replay: Vec<Bytes>,
    cid: ClientId,
    fast_ping: bool,
    router: Arc<ClientRouter>,
    plugins: Arc<PluginRegistry>,
    allowlist: Arc<PluginAllowlist>,
    audit: AuditQueue,
) {
    let mut parts = FramedParts::new(stream, FrameCodec::worker());
    parts.read_buf = BytesMut::from(&leftover[..]);
    let mut framed = Framed::from_parts(parts);

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
    let session = Arc::new_cyclic(|weak| WorkerSession {
        cid,
        proto_version: AtomicU8::new(0),
        outbound_tx,
        available_plugins: std::sync::RwLock::new(HashMap::new()),
        negotiated: std::sync::Mutex::new(HashMap::new()),
        last_pong: std::sync::Mutex::new(Instant::now()),
        session_cookie: std::sync::Mutex::new(None),
        ping_misses: AtomicU32::new(0),
        alive: AtomicBool::new(true),
        self_weak: weak.clone(),
        router,
        plugins,
        allowlist,
        audit,
    });

    let mut logged_in = false;
    for frame in replay {
        if !handle_frame(&session, frame, &mut logged_in).await {
            disconnect(&session, logged_in).await;
            return;
        }
    }

    let ping_period = if fast_ping { Duration::from_secs(45) } else { Duration::from_secs(120) };
    let mut ping_interval = tokio::time::interval(ping_period);
    ping_interval.tick().await; // first tick fires immediately; a fresh login shouldn't be pinged right away

    loop {
        tokio::select! {
            frame = framed.next() => {
                match frame {
                    Some(Ok(frame)) => {
                        if !handle_frame(&session, frame, &mut logged_in).await {
                            break;
                        }
                    }
                    Some(Err(err)) => {
                        tracing::warn!(cid = %session.cid, %err, "worker transport error");
                        break;
                    }
                    None => break,
                }
            }
            maybe_frame = outbound_rx.recv() => {
                let Some(frame) = maybe_frame else { break; };
                if let Err(err) = framed.send(frame).await {
                    tracing::warn!(cid = %session.cid, %err, "failed writing to client");
                    break;
                }
            }
            _ = ping_interval.tick(), if logged_in => {
                let already_outstanding = session.ping_misses.load(Ordering::SeqCst);
                if already_outstanding >= MAX_PING_MISSES {
                    tracing::warn!(cid = %session.cid, "client missed too many pings, aborting");
                    break;
                }
                session.ping_misses.fetch_add(1, Ordering::SeqCst);
                session.send_frame(Bytes::from_static(&[opcode::PING]));
            }
        }
    }

    disconnect(&session, logged_in).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_cookie_parses_four_big_endian_bytes() {
        assert_eq!(parse_session_cookie(&[0, 0, 1, 0]).unwrap(), 256);
    }

    #[test]
    fn session_cookie_rejects_wrong_length() {
        assert!(parse_session_cookie(&[1, 2, 3]).is_err());
        assert!(parse_session_cookie(&[1, 2, 3, 4, 5]).is_err());
    }
}
